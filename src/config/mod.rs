// src/config/mod.rs
//! Runtime settings for the binary and the HTTP surface.
//!
//! Precedence: environment, then the sources document's `[settings]`
//! table, then built-in defaults. Bad env values are ignored with a warning
//! rather than aborting startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::ingest::config::RunSettings;
use crate::ingest::scheduler::SchedulerCfg;
use crate::report::ReportFormat;

pub const ENV_REPORTS_DIR: &str = "REPORTS_DIR";
pub const ENV_REPORT_FORMATS: &str = "REPORT_FORMATS";
pub const ENV_MAX_CONCURRENCY: &str = "MAX_CONCURRENCY";
pub const ENV_RUN_DEADLINE_SECS: &str = "RUN_DEADLINE_SECS";
pub const ENV_RUN_INTERVAL_SECS: &str = "RUN_INTERVAL_SECS";
pub const ENV_RUN_ONCE: &str = "RUN_ONCE";
pub const ENV_BIND_ADDR: &str = "BIND_ADDR";

pub const DEFAULT_REPORTS_DIR: &str = "reports";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub scheduler: SchedulerCfg,
    pub reports_dir: PathBuf,
    pub formats: Vec<ReportFormat>,
    /// `Some` → periodic runs in the background of the server.
    pub run_interval: Option<Duration>,
    pub run_once: bool,
    pub bind_addr: String,
}

impl AppConfig {
    pub fn resolve(settings: &RunSettings) -> Self {
        let max_concurrency = env_parse::<usize>(ENV_MAX_CONCURRENCY)
            .or(settings.max_concurrency)
            .unwrap_or(SchedulerCfg::DEFAULT_MAX_CONCURRENCY)
            .max(1);

        // 0 disables the deadline
        let run_deadline = match env_parse::<u64>(ENV_RUN_DEADLINE_SECS).or(settings.run_deadline_secs) {
            Some(0) => None,
            Some(s) => Some(Duration::from_secs(s)),
            None => Some(SchedulerCfg::DEFAULT_RUN_DEADLINE),
        };

        let formats = env::var(ENV_REPORT_FORMATS)
            .ok()
            .map(|s| ReportFormat::parse_list(&s))
            .or_else(|| {
                settings
                    .formats
                    .as_ref()
                    .map(|v| ReportFormat::parse_list(&v.join(",")))
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec![ReportFormat::Csv, ReportFormat::Markdown]);

        Self {
            scheduler: SchedulerCfg {
                max_concurrency,
                run_deadline,
            },
            reports_dir: env::var(ENV_REPORTS_DIR)
                .ok()
                .or_else(|| settings.reports_dir.clone())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORTS_DIR)),
            formats,
            run_interval: env_parse::<u64>(ENV_RUN_INTERVAL_SECS)
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
            run_once: env::var(ENV_RUN_ONCE).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            bind_addr: env::var(ENV_BIND_ADDR).unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable env value");
            None
        }
    }
}
