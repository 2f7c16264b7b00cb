// src/ingest/providers/rpa.rs
//! Desktop automation: drive a real browser window and read back the page.
//!
//! Only macOS has an implementation (`osascript` + Google Chrome). Elsewhere
//! `UnsupportedAutomation` reports a per-source failure and the run goes on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};

use super::{assemble, FetchStrategy};
use crate::error::FetchError;
use crate::ingest::types::{FetchResult, PayloadPart, SourceDescriptor};

/// What the automation should do for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationScript {
    pub url: String,
    pub wait: Duration,
    /// Viewport-height scrolls before reading, for lazily loaded tables.
    pub scrolls: u8,
}

impl AutomationScript {
    const SCROLL_PAUSE: Duration = Duration::from_secs(1);

    pub fn new(url: impl Into<String>, wait: Duration) -> Self {
        Self {
            url: url.into(),
            wait,
            scrolls: 3,
        }
    }

    /// Settle time plus the pauses between scrolls.
    pub fn expected_duration(&self) -> Duration {
        self.wait
            .saturating_add(Self::SCROLL_PAUSE.saturating_mul(u32::from(self.scrolls)))
    }

    /// AppleScript that opens the URL in Chrome, waits, scrolls and returns
    /// the outer HTML of the active tab.
    pub fn to_applescript(&self) -> String {
        let url = self.url.replace('\\', "\\\\").replace('"', "\\\"");
        let mut s = String::new();
        s.push_str("tell application \"Google Chrome\"\n");
        s.push_str("  activate\n");
        s.push_str(&format!("  open location \"{url}\"\n"));
        s.push_str(&format!("  delay {:.1}\n", self.wait.as_secs_f64()));
        for _ in 0..self.scrolls {
            s.push_str("  execute active tab of front window javascript \"window.scrollBy(0, window.innerHeight);\"\n");
            s.push_str(&format!("  delay {}\n", Self::SCROLL_PAUSE.as_secs()));
        }
        s.push_str(
            "  set pageSource to execute active tab of front window javascript \"document.documentElement.outerHTML\"\n",
        );
        s.push_str("end tell\n");
        s.push_str("return pageSource\n");
        s
    }
}

#[async_trait]
pub trait DesktopAutomation: Send + Sync {
    async fn drive(&self, script: &AutomationScript) -> Result<String>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct AppleScriptAutomation {
    osascript: String,
}

impl Default for AppleScriptAutomation {
    fn default() -> Self {
        Self {
            osascript: "osascript".to_string(),
        }
    }
}

#[async_trait]
impl DesktopAutomation for AppleScriptAutomation {
    async fn drive(&self, script: &AutomationScript) -> Result<String> {
        let out = tokio::process::Command::new(&self.osascript)
            .arg("-e")
            .arg(script.to_applescript())
            .kill_on_drop(true)
            .output()
            .await
            .context("running osascript")?;
        if !out.status.success() {
            bail!("osascript failed: {}", String::from_utf8_lossy(&out.stderr).trim());
        }
        let html = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if html.is_empty() {
            bail!("automation returned an empty page");
        }
        Ok(html)
    }

    fn name(&self) -> &'static str {
        "applescript"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedAutomation;

#[async_trait]
impl DesktopAutomation for UnsupportedAutomation {
    async fn drive(&self, _script: &AutomationScript) -> Result<String> {
        bail!("desktop automation is not supported on {}", std::env::consts::OS)
    }

    fn name(&self) -> &'static str {
        "unsupported"
    }
}

pub fn default_automation() -> Arc<dyn DesktopAutomation> {
    if cfg!(target_os = "macos") {
        Arc::new(AppleScriptAutomation::default())
    } else {
        Arc::new(UnsupportedAutomation)
    }
}

pub struct RpaFetcher {
    automation: Arc<dyn DesktopAutomation>,
}

impl RpaFetcher {
    pub fn new(automation: Arc<dyn DesktopAutomation>) -> Self {
        Self { automation }
    }
}

#[async_trait]
impl FetchStrategy for RpaFetcher {
    async fn fetch(&self, desc: &SourceDescriptor) -> FetchResult {
        let t0 = Instant::now();
        let wait = desc.wait_time.unwrap_or(super::rendered::DEFAULT_WAIT);
        let mut outcomes = Vec::with_capacity(desc.urls.len());
        // one browser window: URLs are driven strictly one after another
        for url in &desc.urls {
            let script = AutomationScript::new(url.clone(), wait);
            let budget = script.expected_duration().saturating_add(desc.timeout);
            let o = match tokio::time::timeout(budget, self.automation.drive(&script)).await {
                Ok(Ok(body)) => Ok(PayloadPart {
                    url: url.clone(),
                    body,
                }),
                Ok(Err(e)) => Err(FetchError::Automation {
                    url: url.clone(),
                    message: format!("{e:#}"),
                }),
                Err(_) => Err(FetchError::Timeout { after: budget }),
            };
            if let Err(e) = &o {
                tracing::warn!(target: "ingest", source = %desc.name, automation = self.automation.name(), error = %e, "automation failed");
                counter!("ingest_fetch_errors_total", "method" => "rpa").increment(1);
            }
            outcomes.push(o);
        }
        histogram!("ingest_fetch_ms", "method" => "rpa").record(t0.elapsed().as_secs_f64() * 1_000.0);
        assemble(&desc.name, outcomes, t0)
    }

    fn name(&self) -> &'static str {
        "rpa"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applescript_quotes_url_and_reads_outer_html() {
        let s = AutomationScript::new("https://x.test/?q=\"a\"", Duration::from_secs(4)).to_applescript();
        assert!(s.contains("open location \"https://x.test/?q=\\\"a\\\"\""));
        assert!(s.contains("delay 4.0"));
        assert!(s.contains("document.documentElement.outerHTML"));
        assert_eq!(s.matches("scrollBy").count(), 3);
    }

    struct Hung;

    #[async_trait]
    impl DesktopAutomation for Hung {
        async fn drive(&self, _script: &AutomationScript) -> Result<String> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "hung"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_automation_times_out() {
        let mut d = SourceDescriptor::http("desk", vec!["https://x.test".into()]);
        d.method = crate::ingest::types::FetchMethod::Rpa;
        d.wait_time = Some(Duration::from_secs(2));
        d.timeout = Duration::from_secs(10);

        let r = RpaFetcher::new(Arc::new(Hung)).fetch(&d).await;
        // 2s settle, three 1s scroll pauses, 10s grace
        assert_eq!(r.error, Some(FetchError::Timeout { after: Duration::from_secs(15) }));
    }

    #[tokio::test]
    async fn unsupported_automation_is_a_source_failure() {
        let mut d = SourceDescriptor::http("desk", vec!["https://x.test".into()]);
        d.method = crate::ingest::types::FetchMethod::Rpa;
        let r = RpaFetcher::new(Arc::new(UnsupportedAutomation)).fetch(&d).await;
        assert!(matches!(r.error, Some(FetchError::Automation { .. })));
    }
}
