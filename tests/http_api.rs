//! HTTP API tests driving the router in-process.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use incident_harness::config::Config;
use incident_harness::harness::Harness;
use incident_harness::server::{build_router, AppState};
use incident_harness::telemetry::MemorySink;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot`

const UIPATH_LOG: &str = r#"{"message":"Execution started","level":"Information","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c","fileName":"Main.xaml"}
{"message":"UiPath.Core.Activities.Click: Cannot find the UI element corresponding to this selector","level":"Error","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c"}
"#;

async fn setup_app(tmp: &TempDir) -> Router {
    let mut config = Config::with_db_path(tmp.path().join("ihx.sqlite"));
    config.embedding.provider = "hash".to_string();
    config.embedding.dims = Some(64);
    config.fingerprint.min_relevance = 0.0;
    config.fingerprint.relevance_threshold = 0.0;
    config
        .authz
        .grants
        .insert("ana".to_string(), vec!["acme".to_string(), "globex".to_string()]);
    let harness = Harness::open_with_sink(&config, Arc::new(MemorySink::default()))
        .await
        .unwrap();
    build_router(AppState::new(Arc::new(harness)))
}

fn request(method: &str, uri: &str, tenant: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-analyst-id", "ana");
    if let Some(t) = tenant {
        builder = builder.header("x-tenant-id", t);
    }
    builder.body(body).unwrap()
}

fn json_request(uri: &str, tenant: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-tenant-id", tenant)
        .header("x-analyst-id", "ana")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

async fn upload(app: &Router, tenant: &str) -> Value {
    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/jobs?filename=Robot_execution.log",
            Some(tenant),
            Body::from(UIPATH_LOG),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    extract_json(response.into_body()).await
}

#[tokio::test]
async fn test_health_endpoint() {
    let tmp = TempDir::new().unwrap();
    let app = setup_app(&tmp).await;

    let response = app
        .oneshot(request("GET", "/health", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_upload_then_fetch_job() {
    let tmp = TempDir::new().unwrap();
    let app = setup_app(&tmp).await;

    let report = upload(&app, "acme").await;
    assert_eq!(report["status"], "completed");
    assert_eq!(report["detection"]["platform"], "uipath");
    assert_eq!(report["archive"]["status"], "passed");
    let job_id = report["job_id"].as_str().unwrap().to_string();

    let uri = format!("/jobs/{}", job_id);
    let response = app
        .clone()
        .oneshot(request("GET", &uri, Some("acme"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = extract_json(response.into_body()).await;
    assert_eq!(job["id"], job_id.as_str());
    assert_eq!(job["detection"]["parser_executed"], true);

    // another tenant cannot see the job
    let response = app
        .oneshot(request("GET", &uri, Some("globex"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_missing_tenant_header_is_bad_request() {
    let tmp = TempDir::new().unwrap();
    let app = setup_app(&tmp).await;

    let response = app
        .oneshot(request("GET", "/jobs/abc", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_retrieve_returns_citations() {
    let tmp = TempDir::new().unwrap();
    let app = setup_app(&tmp).await;
    upload(&app, "acme").await;

    let response = app
        .oneshot(json_request(
            "/retrieve",
            "acme",
            json!({ "query": "UI element selector", "limit": 5 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["mode"], "hybrid");
    let first = &body["results"][0];
    assert_eq!(first["line_range"]["start"], 1);
    assert!(first["lexical_score"].is_number());
}

#[tokio::test]
async fn test_unauthorized_cross_workspace_search_is_forbidden() {
    let tmp = TempDir::new().unwrap();
    let app = setup_app(&tmp).await;

    let response = app
        .oneshot(json_request(
            "/incidents/search",
            "acme",
            json!({ "query": "selector", "scope": "multi_tenant", "workspaces": ["initech"] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "INSUFFICIENT_PERMISSIONS");
}

#[tokio::test]
async fn test_search_within_workspace() {
    let tmp = TempDir::new().unwrap();
    let app = setup_app(&tmp).await;
    let report = upload(&app, "acme").await;
    let job_id = report["job_id"].as_str().unwrap();

    // fingerprinting runs after the response; wait for it to land
    let mut found = Value::Null;
    for _ in 0..50 {
        let response = app
            .clone()
            .oneshot(json_request(
                "/incidents/search",
                "acme",
                json!({ "query": "UiPath Cannot find the UI element selector" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = extract_json(response.into_body()).await;
        if body["results"].as_array().is_some_and(|r| !r.is_empty()) {
            found = body;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(found["results"][0]["session_id"], job_id);
    assert!(found["audit_token"].is_null());
}

#[tokio::test]
async fn test_hybrid_enable_and_metrics() {
    let tmp = TempDir::new().unwrap();
    let app = setup_app(&tmp).await;
    upload(&app, "acme").await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/tenants/acme/hybrid/enable",
            None,
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["state"], "enabled");

    let response = app
        .oneshot(request("GET", "/metrics", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("detection_total"));
    assert!(text.contains("archive_guardrail_total"));
}
