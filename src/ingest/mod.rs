// src/ingest/mod.rs
pub mod config;
pub mod dedup;
pub mod normalize;
pub mod providers;
pub mod registry;
pub mod scheduler;
pub mod tables;
pub mod types;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;

use crate::error::PipelineError;
use crate::ingest::providers::Fetchers;
use crate::ingest::registry::Registry;
use crate::ingest::scheduler::Scheduler;
use crate::ingest::tables::NormalizeTables;
use crate::report::{RunReport, SourceOutcome};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_runs_total", "Pipeline runs started.");
        describe_counter!(
            "ingest_fetch_errors_total",
            "Failed URL fetches, renders and automations, plus deadline timeouts."
        );
        describe_counter!(
            "ingest_records_total",
            "Canonical records kept after dedup."
        );
        describe_counter!(
            "ingest_validation_drops_total",
            "Raw items dropped by validation."
        );
        describe_counter!("ingest_dedup_total", "Records merged away by dedup.");
        describe_histogram!("ingest_fetch_ms", "Per-source fetch time in milliseconds.");
        describe_histogram!("ingest_run_ms", "Whole-run time in milliseconds.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when ingest pipeline last ran."
        );
    });
}

/// Normalize scraped text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // non-breaking and thin spaces show up between digits on price pages
    out = out.replace(['\u{00A0}', '\u{2009}', '\u{202F}'], " ");

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > 500 {
        out = out.chars().take(500).collect();
    }
    out
}

/// Collection instant for a run, whole seconds.
pub fn run_instant(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

/// Everything one run needs. Cheap to share: the registry and tables are
/// read-only, the scheduler keeps the rate limiter across runs.
#[derive(Clone)]
pub struct Pipeline {
    pub registry: Arc<Registry>,
    pub fetchers: Fetchers,
    pub tables: Arc<NormalizeTables>,
    pub scheduler: Arc<Scheduler>,
}

impl Pipeline {
    pub fn new(registry: Registry, fetchers: Fetchers, tables: NormalizeTables, scheduler: Scheduler) -> Self {
        Self {
            registry: Arc::new(registry),
            fetchers,
            tables: Arc::new(tables),
            scheduler: Arc::new(scheduler),
        }
    }

    pub async fn run(&self, selection: Option<&[String]>) -> Result<RunReport, PipelineError> {
        run_pipeline(&self.registry, selection, &self.fetchers, &self.tables, &self.scheduler).await
    }
}

/// One full run: select → fetch → normalize → dedup → report.
///
/// Only an unknown selection fails; everything that goes wrong per source or
/// per item ends up in the report.
pub async fn run_pipeline(
    registry: &Registry,
    selection: Option<&[String]>,
    fetchers: &Fetchers,
    tables: &NormalizeTables,
    scheduler: &Scheduler,
) -> Result<RunReport, PipelineError> {
    ensure_metrics_described();

    let selected = registry.select(selection)?;
    let started_at = Utc::now();
    let observed_at = run_instant(started_at);
    let mut report = RunReport::new(started_at);
    counter!("ingest_runs_total").increment(1);
    tracing::info!(target: "ingest", run_id = %report.run_id, sources = selected.len(), "run started");

    let t0 = std::time::Instant::now();
    let results = scheduler.run(&selected, fetchers).await;

    let mut records = Vec::new();
    for (desc, result) in selected.iter().zip(&results) {
        let n = normalize::normalize(result, desc, tables, observed_at);
        report.outcomes.push(SourceOutcome::from_result(
            result,
            desc.method,
            n.records.len(),
            n.dropped.len(),
        ));
        report.validation_drops += n.dropped.len();
        report.validation_errors.extend(n.dropped);
        records.extend(n.records);

        match &result.error {
            Some(e) => tracing::warn!(target: "ingest", source = %desc.name, error = %e, "source failed"),
            None => tracing::debug!(target: "ingest", source = %desc.name, "source ok"),
        }
    }
    report
        .outcomes
        .sort_by_key(|o| registry.position(&o.source).unwrap_or(usize::MAX));

    let (records, collisions) = dedup::dedup(records, registry);
    report.dedup_collisions = collisions;
    report.finalize(records, Utc::now());

    counter!("ingest_records_total").increment(report.records.len() as u64);
    counter!("ingest_validation_drops_total").increment(report.validation_drops as u64);
    counter!("ingest_dedup_total").increment(collisions as u64);
    histogram!("ingest_run_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    gauge!("ingest_pipeline_last_run_ts").set(report.finished_at.timestamp() as f64);

    tracing::info!(
        target: "ingest",
        run_id = %report.run_id,
        records = report.records.len(),
        dropped = report.validation_drops,
        dedup = collisions,
        outcome = ?report.outcome(),
        "run finished"
    );
    Ok(report)
}
