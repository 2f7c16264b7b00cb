//! market-feed binary.
//!
//! Modes (env-driven, no CLI flags):
//! - `RUN_ONCE=1`: one run, reports written, exit code from the run outcome
//! - otherwise: HTTP server (`/health`, `/sources`, `/run`, `/metrics`),
//!   plus periodic runs when `RUN_INTERVAL_SECS` is set

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_feed::api::{self, AppState};
use market_feed::config::AppConfig;
use market_feed::ingest::config::{default_document_path, load_document_from};
use market_feed::ingest::providers::Fetchers;
use market_feed::ingest::registry::Registry;
use market_feed::ingest::scheduler::{spawn_periodic, Scheduler};
use market_feed::ingest::tables::NormalizeTables;
use market_feed::ingest::Pipeline;
use market_feed::metrics::Metrics;
use market_feed::report::ReportEmitter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("market_feed=info,ingest=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "startup failed");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let path = default_document_path().context("locating sources document")?;
    let doc = load_document_from(&path).context("loading sources document")?;
    let cfg = AppConfig::resolve(&doc.settings);

    let (registry, warnings) = Registry::load(doc).context("building source registry")?;
    for w in &warnings {
        tracing::warn!(source = %w.source, reason = %w.reason, "source skipped at load");
    }
    tracing::info!(
        path = %path.display(),
        sources = registry.len(),
        skipped = warnings.len(),
        max_concurrency = cfg.scheduler.max_concurrency,
        "registry loaded"
    );

    let pipeline = Arc::new(Pipeline::new(
        registry,
        Fetchers::with_defaults(),
        NormalizeTables::load_default(),
        Scheduler::new(cfg.scheduler),
    ));
    let emitter = ReportEmitter::new(&cfg.reports_dir);

    if cfg.run_once {
        let report = pipeline.run(None).await.context("running pipeline")?;
        let paths = emitter
            .emit_all(&report, &cfg.formats)
            .context("writing reports")?;
        for o in report.failed_sources() {
            if let Some(e) = &o.error {
                tracing::warn!(source = %o.source, error = %e, "source failed");
            }
        }
        tracing::info!(
            run_id = %report.run_id,
            records = report.records.len(),
            artifacts = paths.len(),
            outcome = ?report.outcome(),
            "run complete"
        );
        return Ok(report.outcome().exit_code());
    }

    let metrics = Metrics::init(&cfg.scheduler)?;

    if let Some(interval) = cfg.run_interval {
        tracing::info!(interval_secs = interval.as_secs(), "periodic runs enabled");
        spawn_periodic(pipeline.clone(), interval, emitter.clone(), cfg.formats.clone());
    }

    let app = api::router(AppState::new(pipeline, emitter, cfg.formats.clone())).merge(metrics.router());
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "listening");
    axum::serve(listener, app).await.context("serving http")?;
    Ok(0)
}
