// src/ingest/providers/rendered.rs
//! Browser-rendered pages.
//!
//! Rendering is an external capability behind `RenderCapability`; the
//! strategy only bounds each call with a timeout so a hung browser can not
//! stall the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};

use super::{assemble, FetchStrategy};
use crate::error::FetchError;
use crate::ingest::types::{FetchResult, PayloadPart, SourceDescriptor};

pub const ENV_CHROME_PATH: &str = "CHROME_PATH";
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait RenderCapability: Send + Sync {
    /// Load `url`, let it settle for `wait`, return the resulting DOM.
    async fn render(&self, url: &str, wait: Duration) -> Result<String>;
    fn name(&self) -> &'static str;
}

/// Headless Chrome/Chromium via `--dump-dom`. The settle time is passed as a
/// virtual time budget so scripts get to run before the DOM is dumped.
#[derive(Debug, Clone)]
pub struct ChromeRenderer {
    binary: PathBuf,
}

impl ChromeRenderer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `$CHROME_PATH`, then the usual binary names on `$PATH`.
    pub fn discover() -> Option<Self> {
        if let Ok(p) = std::env::var(ENV_CHROME_PATH) {
            let p = PathBuf::from(p);
            return p.exists().then(|| Self::new(p));
        }
        let path = std::env::var_os("PATH")?;
        ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"]
            .iter()
            .flat_map(|bin| std::env::split_paths(&path).map(move |dir| dir.join(bin)))
            .find(|candidate| is_file(candidate))
            .map(Self::new)
    }
}

fn is_file(p: &Path) -> bool {
    p.metadata().map(|m| m.is_file()).unwrap_or(false)
}

#[async_trait]
impl RenderCapability for ChromeRenderer {
    async fn render(&self, url: &str, wait: Duration) -> Result<String> {
        let out = tokio::process::Command::new(&self.binary)
            .args([
                "--headless=new",
                "--disable-gpu",
                "--no-sandbox",
                "--hide-scrollbars",
            ])
            .arg(format!("--virtual-time-budget={}", wait.as_millis()))
            .arg("--dump-dom")
            .arg(url)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.binary.display()))?;

        if !out.status.success() {
            bail!(
                "chrome exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        let dom = String::from_utf8_lossy(&out.stdout).into_owned();
        if dom.trim().is_empty() {
            bail!("chrome returned an empty document");
        }
        Ok(dom)
    }

    fn name(&self) -> &'static str {
        "chrome"
    }
}

/// Used when no browser is installed; every render fails fast.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableRenderer;

#[async_trait]
impl RenderCapability for UnavailableRenderer {
    async fn render(&self, _url: &str, _wait: Duration) -> Result<String> {
        bail!("no browser available (set {ENV_CHROME_PATH})")
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

pub fn default_renderer() -> Arc<dyn RenderCapability> {
    match ChromeRenderer::discover() {
        Some(c) => {
            tracing::info!(target: "ingest", binary = %c.binary.display(), "rendered pages via headless chrome");
            Arc::new(c)
        }
        None => {
            tracing::warn!(target: "ingest", "no chrome binary found; rendered sources will fail");
            Arc::new(UnavailableRenderer)
        }
    }
}

pub struct RenderedFetcher {
    renderer: Arc<dyn RenderCapability>,
}

impl RenderedFetcher {
    pub fn new(renderer: Arc<dyn RenderCapability>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl FetchStrategy for RenderedFetcher {
    async fn fetch(&self, desc: &SourceDescriptor) -> FetchResult {
        let t0 = Instant::now();
        let wait = desc.wait_time.unwrap_or(DEFAULT_WAIT);
        // settle time plus the per-request timeout as grace
        let budget = wait.saturating_add(desc.timeout);

        let mut outcomes = Vec::with_capacity(desc.urls.len());
        for url in &desc.urls {
            let o = match tokio::time::timeout(budget, self.renderer.render(url, wait)).await {
                Ok(Ok(body)) => Ok(PayloadPart {
                    url: url.clone(),
                    body,
                }),
                Ok(Err(e)) => Err(FetchError::Render {
                    url: url.clone(),
                    message: format!("{e:#}"),
                }),
                Err(_) => Err(FetchError::Timeout { after: budget }),
            };
            if let Err(e) = &o {
                tracing::warn!(target: "ingest", source = %desc.name, url = %url, renderer = self.renderer.name(), error = %e, "render failed");
                counter!("ingest_fetch_errors_total", "method" => "rendered_page").increment(1);
            }
            outcomes.push(o);
        }
        histogram!("ingest_fetch_ms", "method" => "rendered_page").record(t0.elapsed().as_secs_f64() * 1_000.0);
        assemble(&desc.name, outcomes, t0)
    }

    fn name(&self) -> &'static str {
        "rendered_page"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::FetchMethod;

    struct Sleepy(Duration);

    #[async_trait]
    impl RenderCapability for Sleepy {
        async fn render(&self, _url: &str, _wait: Duration) -> Result<String> {
            tokio::time::sleep(self.0).await;
            Ok("<html></html>".into())
        }
        fn name(&self) -> &'static str {
            "sleepy"
        }
    }

    fn desc(wait: u64, timeout: u64) -> SourceDescriptor {
        let mut d = SourceDescriptor::http("page", vec!["https://page.test".into()]);
        d.method = FetchMethod::RenderedPage;
        d.wait_time = Some(Duration::from_secs(wait));
        d.timeout = Duration::from_secs(timeout);
        d
    }

    #[tokio::test(start_paused = true)]
    async fn hung_renderer_times_out() {
        let f = RenderedFetcher::new(Arc::new(Sleepy(Duration::from_secs(600))));
        let r = f.fetch(&desc(2, 3)).await;
        assert!(!r.success());
        let err = r.error.unwrap();
        assert!(err.is_timeout());
        assert_eq!(err, FetchError::Timeout { after: Duration::from_secs(5) });
    }

    #[tokio::test(start_paused = true)]
    async fn renderer_within_budget_succeeds() {
        let f = RenderedFetcher::new(Arc::new(Sleepy(Duration::from_secs(1))));
        let r = f.fetch(&desc(2, 3)).await;
        assert!(r.success());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_settle_time_does_not_overflow_the_budget() {
        let f = RenderedFetcher::new(Arc::new(Sleepy(Duration::from_secs(1))));
        let mut d = desc(0, 3);
        d.wait_time = Some(Duration::MAX);
        assert!(f.fetch(&d).await.success());
    }

    #[tokio::test]
    async fn unavailable_renderer_fails_with_render_error() {
        let f = RenderedFetcher::new(Arc::new(UnavailableRenderer));
        let r = f.fetch(&desc(0, 1)).await;
        assert!(matches!(r.error, Some(FetchError::Render { .. })));
    }
}
