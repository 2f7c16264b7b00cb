// src/ingest/providers/mod.rs
//! Fetch strategies, one per `FetchMethod`.
//!
//! A strategy never fails as a call: every outcome (including total
//! failure) is a `FetchResult`. URLs of one descriptor are fetched in
//! declaration order; the source succeeds when at least one URL does.

pub mod http;
pub mod rendered;
pub mod rpa;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::ingest::types::{FetchMethod, FetchResult, PayloadPart, SourceDescriptor};

pub use http::HttpFetcher;
pub use rendered::{default_renderer, ChromeRenderer, RenderCapability, RenderedFetcher, UnavailableRenderer};
pub use rpa::{default_automation, AppleScriptAutomation, AutomationScript, DesktopAutomation, RpaFetcher, UnsupportedAutomation};

#[async_trait]
pub trait FetchStrategy: Send + Sync {
    async fn fetch(&self, desc: &SourceDescriptor) -> FetchResult;
    fn name(&self) -> &'static str;
}

/// One strategy per method. Dispatch is a plain match on the closed enum.
#[derive(Clone)]
pub struct Fetchers {
    pub http: Arc<dyn FetchStrategy>,
    pub rendered: Arc<dyn FetchStrategy>,
    pub rpa: Arc<dyn FetchStrategy>,
}

impl Fetchers {
    pub fn new(
        http: Arc<dyn FetchStrategy>,
        rendered: Arc<dyn FetchStrategy>,
        rpa: Arc<dyn FetchStrategy>,
    ) -> Self {
        Self { http, rendered, rpa }
    }

    /// Production wiring: reqwest, headless Chrome when available, and the
    /// platform's desktop automation.
    pub fn with_defaults() -> Self {
        Self {
            http: Arc::new(HttpFetcher::new()),
            rendered: Arc::new(RenderedFetcher::new(default_renderer())),
            rpa: Arc::new(RpaFetcher::new(default_automation())),
        }
    }

    /// Same strategy for every method.
    pub fn uniform(strategy: Arc<dyn FetchStrategy>) -> Self {
        Self {
            http: strategy.clone(),
            rendered: strategy.clone(),
            rpa: strategy,
        }
    }

    pub fn for_method(&self, method: FetchMethod) -> &Arc<dyn FetchStrategy> {
        match method {
            FetchMethod::Http => &self.http,
            FetchMethod::RenderedPage => &self.rendered,
            FetchMethod::Rpa => &self.rpa,
        }
    }

    pub async fn fetch(&self, desc: &SourceDescriptor) -> FetchResult {
        self.for_method(desc.method).fetch(desc).await
    }
}

/// Fold per-URL outcomes into one result: successes kept in URL order,
/// failures kept as partial errors, or folded into the result error when
/// nothing succeeded.
pub(crate) fn assemble(
    source: &str,
    outcomes: Vec<Result<PayloadPart, FetchError>>,
    started: Instant,
) -> FetchResult {
    let mut parts = Vec::new();
    let mut errors = Vec::new();
    for o in outcomes {
        match o {
            Ok(p) => parts.push(p),
            Err(e) => errors.push(e),
        }
    }
    let elapsed = started.elapsed();

    if !parts.is_empty() {
        if !errors.is_empty() {
            tracing::info!(
                target: "ingest",
                source,
                ok = parts.len(),
                failed = errors.len(),
                "partial success"
            );
        }
        return FetchResult::ok(source, parts, elapsed).with_partial_errors(errors);
    }

    let failed = errors.len();
    let mut iter = errors.into_iter();
    let error = match (iter.next(), failed) {
        (Some(only), 1) => only,
        (Some(first), n) => FetchError::AllUrlsFailed {
            first: Box::new(first),
            failed: n,
        },
        (None, _) => FetchError::Unexpected,
    };
    FetchResult::failed(source, error, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(u: &str) -> Result<PayloadPart, FetchError> {
        Ok(PayloadPart {
            url: u.into(),
            body: "{}".into(),
        })
    }

    fn status(u: &str, s: u16) -> Result<PayloadPart, FetchError> {
        Err(FetchError::Status {
            url: u.into(),
            status: s,
        })
    }

    #[test]
    fn partial_success_keeps_successes_in_order() {
        let r = assemble("s", vec![part("a"), status("b", 500), part("c")], Instant::now());
        assert!(r.success());
        let urls: Vec<_> = r.parts().iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["a", "c"]);
        assert_eq!(r.partial_errors.len(), 1);
    }

    #[test]
    fn all_failed_reports_first_and_count() {
        let r = assemble("s", vec![status("a", 404), status("b", 500)], Instant::now());
        assert!(!r.success());
        match r.error.unwrap() {
            FetchError::AllUrlsFailed { first, failed } => {
                assert_eq!(failed, 2);
                assert_eq!(*first, FetchError::Status { url: "a".into(), status: 404 });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn single_url_failure_is_reported_as_is() {
        let r = assemble("s", vec![status("a", 503)], Instant::now());
        assert_eq!(r.error.unwrap().to_string(), "a: HTTP 503");
    }
}
