//! JSON HTTP API.
//!
//! Exposes ingestion, job lookup, incident search and chunk retrieval over
//! HTTP. Callers identify themselves with two headers: `x-tenant-id` (the
//! workspace the request acts in) and `x-analyst-id` (required for
//! incident search).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/jobs?filename=&type=` | Ingest the raw request body |
//! | `GET`  | `/jobs/{job_id}` | Job with archive audit and detection |
//! | `POST` | `/incidents/search` | Rank similar incidents for a query |
//! | `GET`  | `/incidents/{session_id}/related` | Incidents related to a session |
//! | `POST` | `/retrieve` | Hybrid chunk retrieval with citations |
//! | `POST` | `/tenants/{tenant_id}/hybrid/enable` | Re-enable hybrid retrieval |
//! | `GET`  | `/metrics` | Prometheus text exposition |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "INSUFFICIENT_PERMISSIONS", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `INSUFFICIENT_PERMISSIONS` (403),
//! `cross_tenant_audit_inactive` (403), `not_found` (404), `internal` (500).

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use incident_harness_core::breaker::HybridState;
use incident_harness_core::models::{ArchiveType, Platform, VisibilityScope};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::HarnessError;
use crate::fingerprint::{SearchRequest, SearchResponse};
use crate::harness::Harness;
use crate::ingest::{ingest, IngestReport};
use crate::jobs::{get_job, JobView};
use crate::retrieval::RetrievalResponse;

const TENANT_HEADER: &str = "x-tenant-id";
const ANALYST_HEADER: &str = "x-analyst-id";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    harness: Arc<Harness>,
}

impl AppState {
    pub fn new(harness: Arc<Harness>) -> Self {
        Self { harness }
    }
}

/// Build the router without binding, so tests can drive it directly.
pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.harness.config.archive.max_total_bytes as usize;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", post(handle_upload))
        .route("/jobs/{job_id}", get(handle_job))
        .route("/incidents/search", post(handle_search))
        .route("/incidents/{session_id}/related", get(handle_related))
        .route("/retrieve", post(handle_retrieve))
        .route("/tenants/{tenant_id}/hybrid/enable", post(handle_hybrid_enable))
        .route("/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` together with the cache
/// eviction scheduler. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let harness = Arc::new(Harness::open(config).await?);
    let scheduler = harness.spawn_eviction();

    let bind_addr = config.server.bind.clone();
    let app = build_router(AppState::new(harness));

    println!("incident harness listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let served = axum::serve(listener, app).await;
    scheduler.abort();
    served?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<HarnessError> for AppError {
    fn from(err: HarnessError) -> Self {
        let status = match &err {
            HarnessError::InsufficientPermissions { .. } | HarnessError::CrossTenantAuditInactive => {
                StatusCode::FORBIDDEN
            }
            HarnessError::NotFound(_) => StatusCode::NOT_FOUND,
            HarnessError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            HarnessError::Database(_) | HarnessError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        HarnessError::Internal(err).into()
    }
}

// ============ Identity ============

fn header_value(headers: &HeaderMap, name: &str) -> Result<String, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| bad_request(format!("missing {} header", name)))
}

fn tenant(headers: &HeaderMap) -> Result<String, AppError> {
    header_value(headers, TENANT_HEADER)
}

fn analyst(headers: &HeaderMap) -> Result<(String, String), AppError> {
    Ok((tenant(headers)?, header_value(headers, ANALYST_HEADER)?))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /metrics ============

async fn handle_metrics(State(state): State<AppState>) -> Result<Response, AppError> {
    let text = state.harness.telemetry.metrics.encode_text()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

// ============ POST /jobs ============

#[derive(Deserialize)]
struct UploadParams {
    filename: String,
    #[serde(rename = "type")]
    archive_type: Option<ArchiveType>,
}

async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<IngestReport>, AppError> {
    let tenant_id = tenant(&headers)?;
    if params.filename.trim().is_empty() {
        return Err(bad_request("filename must not be empty"));
    }
    let size = body.len() as u64;
    // fingerprinting continues in the background after the response
    let (report, _fingerprint) = ingest(
        &state.harness,
        &tenant_id,
        &params.filename,
        params.archive_type,
        Cursor::new(body),
        size,
    )
    .await?;
    Ok(Json(report))
}

// ============ GET /jobs/{job_id} ============

async fn handle_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    let tenant_id = tenant(&headers)?;
    let job = get_job(&state.harness, &job_id, Some(&tenant_id)).await?;
    Ok(Json(job))
}

// ============ Incident search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    scope: VisibilityScope,
    #[serde(default)]
    workspaces: Vec<String>,
    platform: Option<Platform>,
    min_relevance: Option<f64>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    let (tenant_id, analyst_id) = analyst(&headers)?;
    let request = SearchRequest {
        scope: body.scope,
        workspaces: body.workspaces,
        platform: body.platform,
        min_relevance: body.min_relevance,
        limit: body.limit,
        offset: body.offset,
        ..SearchRequest::text(&tenant_id, &analyst_id, &body.query)
    };
    Ok(Json(state.harness.search.search(&request).await?))
}

/// Query-string form of the search filters; `workspaces` is comma-separated.
#[derive(Deserialize, Default)]
struct RelatedParams {
    #[serde(default)]
    scope: VisibilityScope,
    workspaces: Option<String>,
    platform: Option<Platform>,
    min_relevance: Option<f64>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

async fn handle_related(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<RelatedParams>,
) -> Result<Json<SearchResponse>, AppError> {
    let (tenant_id, analyst_id) = analyst(&headers)?;
    let workspaces = params
        .workspaces
        .as_deref()
        .map(|w| {
            w.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let request = SearchRequest {
        scope: params.scope,
        workspaces,
        platform: params.platform,
        min_relevance: params.min_relevance,
        limit: params.limit,
        offset: params.offset,
        ..SearchRequest::related(&tenant_id, &analyst_id, &session_id)
    };
    Ok(Json(state.harness.search.search(&request).await?))
}

// ============ POST /retrieve ============

#[derive(Deserialize)]
struct RetrieveBody {
    query: String,
    limit: Option<usize>,
}

async fn handle_retrieve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RetrieveBody>,
) -> Result<Json<RetrievalResponse>, AppError> {
    let tenant_id = tenant(&headers)?;
    let response = state
        .harness
        .retrieval
        .retrieve(&tenant_id, &body.query, body.limit)
        .await?;
    Ok(Json(response))
}

// ============ POST /tenants/{tenant_id}/hybrid/enable ============

#[derive(Serialize)]
struct HybridResponse {
    tenant_id: String,
    state: HybridState,
}

async fn handle_hybrid_enable(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<HybridResponse>, AppError> {
    let hybrid = state.harness.retrieval.reenable(&tenant_id).await?;
    Ok(Json(HybridResponse {
        tenant_id,
        state: hybrid,
    }))
}
