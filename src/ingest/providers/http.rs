// src/ingest/providers/http.rs
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::Client;

use super::{assemble, FetchStrategy};
use crate::error::FetchError;
use crate::ingest::types::{FetchResult, PayloadPart, SourceDescriptor};

const USER_AGENT: &str = concat!("market-feed/", env!("CARGO_PKG_VERSION"));

/// Plain GET per URL. `file://` URLs are read from disk, which keeps
/// fixtures and offline snapshots on the same path as live sources.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    backoff: Duration,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Base delay of the retry backoff (`base << (attempt - 1)`).
    pub fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff = base;
        self
    }

    async fn get(&self, url: &str, desc: &SourceDescriptor) -> Result<String, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read_to_string(path)
                .await
                .map_err(|e| FetchError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                });
        }

        let max_attempts = desc.retries.saturating_add(1);
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match self.get_once(url, desc).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt < max_attempts && retryable(&e) => {
                    tracing::debug!(target: "ingest", source = %desc.name, url, attempt, error = %e, "retrying");
                    tokio::time::sleep(backoff_delay(self.backoff, attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, url: &str, desc: &SourceDescriptor) -> Result<String, FetchError> {
        let mut req = self.client.get(url).timeout(desc.timeout);
        for (k, v) in &desc.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let rsp = req.send().await.map_err(|e| transport(url, &e, desc))?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        rsp.text().await.map_err(|e| transport(url, &e, desc))
    }
}

fn transport(url: &str, e: &reqwest::Error, desc: &SourceDescriptor) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout { after: desc.timeout }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

/// `base << (attempt - 1)`, saturating instead of overflowing.
fn backoff_delay(base: Duration, attempt: u8) -> Duration {
    let factor = 1u32.checked_shl(u32::from(attempt.saturating_sub(1))).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

fn retryable(e: &FetchError) -> bool {
    match e {
        FetchError::Status { status, .. } => *status >= 500 || *status == 429,
        FetchError::Transport { .. } | FetchError::Timeout { .. } => true,
        _ => false,
    }
}

#[async_trait]
impl FetchStrategy for HttpFetcher {
    async fn fetch(&self, desc: &SourceDescriptor) -> FetchResult {
        let t0 = Instant::now();
        let mut outcomes = Vec::with_capacity(desc.urls.len());
        for url in &desc.urls {
            let o = self.get(url, desc).await.map(|body| PayloadPart {
                url: url.clone(),
                body,
            });
            if let Err(e) = &o {
                tracing::warn!(target: "ingest", source = %desc.name, url = %url, error = %e, "url failed");
                counter!("ingest_fetch_errors_total", "method" => "http").increment(1);
            }
            outcomes.push(o);
        }
        histogram!("ingest_fetch_ms", "method" => "http").record(t0.elapsed().as_secs_f64() * 1_000.0);
        assemble(&desc.name, outcomes, t0)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn retry_only_transient_failures() {
        assert!(retryable(&FetchError::Status { url: "u".into(), status: 503 }));
        assert!(retryable(&FetchError::Status { url: "u".into(), status: 429 }));
        assert!(!retryable(&FetchError::Status { url: "u".into(), status: 404 }));
        assert!(!retryable(&FetchError::Unexpected));
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 40), base.saturating_mul(u32::MAX));
        assert_eq!(backoff_delay(Duration::MAX, 200), Duration::MAX);
    }

    #[tokio::test]
    async fn file_urls_are_read_from_disk() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"[{{"name":"gold","price":1}}]"#).unwrap();
        let url = format!("file://{}", f.path().display());
        let missing = "file:///definitely/not/here.json".to_string();

        let d = SourceDescriptor::http("disk", vec![missing, url.clone()]);
        let r = HttpFetcher::new().fetch(&d).await;
        assert!(r.success());
        assert_eq!(r.parts().len(), 1);
        assert_eq!(r.parts()[0].url, url);
        assert_eq!(r.partial_errors.len(), 1);
    }
}
