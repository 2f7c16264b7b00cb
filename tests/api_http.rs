// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - GET /sources
// - POST /run (empty body, explicit selection, unknown names, bad JSON)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value as Json};
use tower::ServiceExt as _; // for `oneshot`

use market_feed::api::{self, AppState};
use market_feed::ingest::providers::{FetchStrategy, Fetchers};
use market_feed::ingest::registry::Registry;
use market_feed::ingest::scheduler::{Scheduler, SchedulerCfg};
use market_feed::ingest::tables::NormalizeTables;
use market_feed::ingest::types::{FetchResult, PayloadPart, SourceDescriptor};
use market_feed::ingest::Pipeline;
use market_feed::report::{ReportEmitter, ReportFormat};

const BODY_LIMIT: usize = 1024 * 1024;

struct Fixed;

#[async_trait]
impl FetchStrategy for Fixed {
    async fn fetch(&self, desc: &SourceDescriptor) -> FetchResult {
        FetchResult::ok(
            &desc.name,
            vec![PayloadPart {
                url: desc.urls[0].clone(),
                body: format!(r#"[{{"name":"gold","price":"2000","source_tag":"{}"}}]"#, desc.name),
            }],
            Duration::from_millis(3),
        )
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

fn test_router(reports: &std::path::Path) -> Router {
    let mut off = SourceDescriptor::http("off_site", vec!["https://off.test".into()]);
    off.enabled = false;
    let registry = Registry::from_descriptors(vec![
        SourceDescriptor::http("gold_api", vec!["https://gold.test".into()]),
        off,
        SourceDescriptor::http("metals_live", vec!["https://metals.test".into()]),
    ]);
    let pipeline = Pipeline::new(
        registry,
        Fetchers::uniform(Arc::new(Fixed)),
        NormalizeTables::default_seed(),
        Scheduler::new(SchedulerCfg {
            max_concurrency: 2,
            run_deadline: Some(Duration::from_secs(5)),
        }),
    );
    api::router(AppState::new(
        Arc::new(pipeline),
        ReportEmitter::new(reports),
        vec![ReportFormat::Json],
    ))
}

async fn json_body(resp: axum::response::Response) -> Json {
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_run(body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/run")
        .header("content-type", "application/json")
        .body(body)
        .expect("build POST /run")
}

#[tokio::test]
async fn health_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = test_router(dir.path()).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn sources_lists_everything_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let req = Request::builder().uri("/sources").body(Body::empty()).unwrap();
    let resp = test_router(dir.path()).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let v = json_body(resp).await;
    let names: Vec<_> = v.as_array().unwrap().iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["gold_api", "off_site", "metals_live"]);
    assert_eq!(v[1]["enabled"], json!(false));
    assert_eq!(v[0]["method"], json!("http"));
}

#[tokio::test]
async fn run_with_empty_body_runs_enabled_sources_and_writes_reports() {
    let dir = tempfile::tempdir().unwrap();
    let resp = test_router(dir.path()).oneshot(post_run(Body::empty())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let v = json_body(resp).await;
    assert_eq!(v["outcome"], json!("all_succeeded"));
    assert_eq!(v["outcomes"].as_array().unwrap().len(), 2);
    assert_eq!(v["records"], json!(2));
    assert_eq!(v["summary"]["count"], json!(2));

    let artifacts = v["artifacts"].as_array().unwrap();
    assert_eq!(artifacts.len(), 1);
    let path = artifacts[0].as_str().unwrap();
    assert!(path.ends_with(".json"));
    assert!(std::path::Path::new(path).exists());
}

#[tokio::test]
async fn run_with_selection_and_no_formats() {
    let dir = tempfile::tempdir().unwrap();
    let body = json!({ "sources": ["metals_live"], "formats": [] }).to_string();
    let resp = test_router(dir.path()).oneshot(post_run(Body::from(body))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let v = json_body(resp).await;
    assert_eq!(v["outcomes"][0]["source"], json!("metals_live"));
    assert_eq!(v["outcomes"].as_array().unwrap().len(), 1);
    assert!(v["artifacts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn run_with_unknown_source_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let body = json!({ "sources": ["gold_apj"] }).to_string();
    let resp = test_router(dir.path()).oneshot(post_run(Body::from(body))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let v = json_body(resp).await;
    assert_eq!(v["unknown"], json!(["gold_apj"]));
    assert_eq!(v["suggestions"][0], json!(["gold_apj", "gold_api"]));
}

#[tokio::test]
async fn run_with_malformed_body_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let resp = test_router(dir.path())
        .oneshot(post_run(Body::from("{ not json")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
