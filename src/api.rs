use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::error::PipelineError;
use crate::ingest::types::FetchMethod;
use crate::ingest::Pipeline;
use crate::report::{ReportEmitter, ReportFormat, RunOutcome, SourceOutcome, Summary};

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    emitter: ReportEmitter,
    formats: Vec<ReportFormat>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, emitter: ReportEmitter, formats: Vec<ReportFormat>) -> Self {
        Self {
            pipeline,
            emitter,
            formats,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/sources", get(list_sources))
        .route("/run", post(run))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct SourceInfo {
    name: String,
    display_name: Option<String>,
    method: FetchMethod,
    enabled: bool,
    urls: usize,
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<SourceInfo>> {
    let out = state
        .pipeline
        .registry
        .descriptors()
        .iter()
        .map(|d| SourceInfo {
            name: d.name.clone(),
            display_name: d.display_name.clone(),
            method: d.method,
            enabled: d.enabled,
            urls: d.urls.len(),
        })
        .collect();
    Json(out)
}

#[derive(Deserialize, Default)]
struct RunReq {
    #[serde(default)]
    sources: Option<Vec<String>>,
    /// Overrides the configured report formats; `[]` writes nothing.
    #[serde(default)]
    formats: Option<Vec<String>>,
}

#[derive(Serialize)]
struct RunResp {
    run_id: String,
    outcome: RunOutcome,
    records: usize,
    validation_drops: usize,
    dedup_collisions: usize,
    summary: Summary,
    outcomes: Vec<SourceOutcome>,
    artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    emit_error: Option<String>,
}

fn bad_request(body: serde_json::Value) -> Response {
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Body is optional: an empty POST runs every enabled source.
async fn run(State(state): State<AppState>, body: Bytes) -> Response {
    let req: RunReq = if body.iter().all(u8::is_ascii_whitespace) {
        RunReq::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return bad_request(serde_json::json!({ "error": format!("invalid body: {e}") })),
        }
    };

    let report = match state.pipeline.run(req.sources.as_deref()).await {
        Ok(r) => r,
        Err(PipelineError::UnknownSource(e)) => {
            return bad_request(serde_json::json!({
                "error": e.to_string(),
                "unknown": e.unknown,
                "suggestions": e.suggestions,
            }))
        }
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let formats = match &req.formats {
        Some(f) => f.iter().filter_map(|s| ReportFormat::parse(s)).collect(),
        None => state.formats.clone(),
    };
    let (artifacts, emit_error) = match state.emitter.emit_all(&report, &formats) {
        Ok(paths) => (paths.iter().map(|p| p.display().to_string()).collect(), None),
        Err(e) => {
            tracing::error!(error = %e, "report emission failed");
            (Vec::new(), Some(e.to_string()))
        }
    };

    Json(RunResp {
        run_id: report.run_id.clone(),
        outcome: report.outcome(),
        records: report.records.len(),
        validation_drops: report.validation_drops,
        dedup_collisions: report.dedup_collisions,
        summary: report.summary,
        outcomes: report.outcomes,
        artifacts,
        emit_error,
    })
    .into_response()
}
