//! Incident fingerprints and similar-incident search.
//!
//! A fingerprint is one embedding per completed session, built from a
//! bounded summary of its detection result and error lines. Search ranks
//! stored `available` fingerprints by cosine similarity to either a query
//! text or another session's fingerprint.
//!
//! Two layers implement [`IncidentSearch`]:
//!
//! - [`FingerprintSearch`] ranks fingerprints inside the workspaces it is
//!   handed and trusts them as already authorized.
//! - [`AuditedSearch`] wraps it for callers: it resolves and authorizes the
//!   workspaces of a `multi_tenant` request and writes one
//!   `analyst_audit_events` row per cross-workspace result before any result
//!   is returned.

use anyhow::Result;
use async_trait::async_trait;
use incident_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use incident_harness_core::models::{FingerprintStatus, Platform, VisibilityScope};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{AuthzConfig, FingerprintConfig};
use crate::db;
use crate::detect::DetectionRecord;
use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::{HarnessError, HarnessResult};

/// Upper bound on `limit` for one search page.
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Fingerprint {
    pub session_id: String,
    pub tenant_id: String,
    pub summary: String,
    pub relevance_threshold: f64,
    pub visibility: VisibilityScope,
    pub status: FingerprintStatus,
    pub safeguard_notes: Vec<String>,
    pub platform: Platform,
    pub created_at: i64,
    pub updated_at: i64,
}

fn is_error_entity(entity_type: &str) -> bool {
    let t = entity_type.to_ascii_lowercase();
    t.contains("error") || t.contains("exception")
}

fn is_error_line(line: &str) -> bool {
    let l = line.to_ascii_lowercase();
    ["error", "exception", "fatal", "failed", "unreachable"]
        .iter()
        .any(|k| l.contains(k))
}

/// Summary text embedded for a session; empty when there is nothing to say.
///
/// Platform label first, then entity values with error entities leading,
/// then error lines of the content. Content without entities or error
/// lines contributes its leading lines instead.
pub fn build_summary(detection: &DetectionRecord, content: &str, max_chars: usize) -> String {
    let mut body: Vec<String> = Vec::new();

    let (errors, others): (Vec<_>, Vec<_>) = detection
        .entities
        .iter()
        .partition(|e| is_error_entity(&e.entity_type));
    for e in errors.into_iter().chain(others) {
        body.push(format!("{}: {}", e.entity_type, e.value));
    }

    let error_lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && is_error_line(l))
        .collect();
    if error_lines.is_empty() && body.is_empty() {
        body.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .take(20)
                .map(str::to_string),
        );
    } else {
        body.extend(error_lines.into_iter().map(str::to_string));
    }

    if body.is_empty() {
        return String::new();
    }

    let mut summary = format!("platform: {}\n{}", detection.platform, body.join("\n"));
    if summary.len() > max_chars {
        let mut end = max_chars;
        while !summary.is_char_boundary(end) {
            end -= 1;
        }
        summary.truncate(end);
    }
    summary
}

pub struct FingerprintService {
    pool: SqlitePool,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: FingerprintConfig,
}

impl FingerprintService {
    pub fn new(
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: FingerprintConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            settings,
        }
    }

    /// Compute and store the fingerprint of a completed session.
    pub async fn index(
        &self,
        session_id: &str,
        tenant_id: &str,
        detection: &DetectionRecord,
        content: &str,
    ) -> Result<Fingerprint> {
        let mut notes = Vec::new();
        let mut visibility = self.settings.visibility;
        if visibility == VisibilityScope::MultiTenant && !self.settings.cross_tenant_audit {
            visibility = VisibilityScope::TenantOnly;
            notes.push(
                "multi_tenant visibility requires cross-tenant audit; downgraded to tenant_only"
                    .to_string(),
            );
        }

        let had_vector: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM incident_fingerprints WHERE session_id = ? AND vector IS NOT NULL",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;

        let summary = build_summary(detection, content, self.settings.summary_max_chars);
        let (status, vector) = if summary.is_empty() {
            notes.push("no embeddable summary".to_string());
            (FingerprintStatus::Missing, None)
        } else if !self.embedder.is_enabled() {
            notes.push("embeddings disabled".to_string());
            (FingerprintStatus::Missing, None)
        } else {
            match embed_one(self.embedder.as_ref(), &summary).await {
                Ok(v) => (FingerprintStatus::Available, Some(v)),
                Err(e) => {
                    let status = if had_vector {
                        FingerprintStatus::Degraded
                    } else {
                        FingerprintStatus::Missing
                    };
                    tracing::warn!(session_id, status = status.as_str(), error = %e, "fingerprint embedding failed");
                    notes.push(format!("embedding failed: {:#}", e));
                    (status, None)
                }
            }
        };

        let now = db::now_ts();
        sqlx::query(
            r#"
            INSERT INTO incident_fingerprints
                (session_id, tenant_id, vector, summary, relevance_threshold, visibility,
                 status, safeguard_notes, platform, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                vector = excluded.vector,
                summary = excluded.summary,
                relevance_threshold = excluded.relevance_threshold,
                visibility = excluded.visibility,
                status = excluded.status,
                safeguard_notes = excluded.safeguard_notes,
                platform = excluded.platform,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(tenant_id)
        .bind(vector.as_deref().map(vec_to_blob))
        .bind(&summary)
        .bind(self.settings.relevance_threshold)
        .bind(visibility.as_str())
        .bind(status.as_str())
        .bind(serde_json::to_string(&notes)?)
        .bind(detection.platform.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(session_id, status = status.as_str(), "fingerprint indexed");

        self.get(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("fingerprint {} vanished after write", session_id))
    }

    /// Index in the background; failures are logged, never surfaced.
    pub fn spawn_index(
        self: &Arc<Self>,
        session_id: String,
        tenant_id: String,
        detection: DetectionRecord,
        content: Arc<str>,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service
                .index(&session_id, &tenant_id, &detection, &content)
                .await
            {
                tracing::warn!(session_id = %session_id, error = %e, "fingerprint indexing failed");
            }
        })
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Fingerprint>> {
        let row = sqlx::query(
            "SELECT session_id, tenant_id, summary, relevance_threshold, visibility, status, \
             safeguard_notes, platform, created_at, updated_at \
             FROM incident_fingerprints WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let visibility: String = row.get("visibility");
        let status: String = row.get("status");
        let notes: String = row.get("safeguard_notes");
        let platform: String = row.get("platform");

        Ok(Some(Fingerprint {
            session_id: row.get("session_id"),
            tenant_id: row.get("tenant_id"),
            summary: row.get("summary"),
            relevance_threshold: row.get("relevance_threshold"),
            visibility: visibility.parse()?,
            status: status.parse()?,
            safeguard_notes: serde_json::from_str(&notes)?,
            platform: platform.parse()?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }
}

// ============ Search ============

#[derive(Debug, Clone)]
pub enum SearchSource {
    Text(String),
    /// Find incidents related to an existing session.
    Session(String),
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub tenant_id: String,
    pub analyst_id: String,
    pub source: SearchSource,
    pub scope: VisibilityScope,
    /// Other workspaces to include; empty means every granted workspace.
    pub workspaces: Vec<String>,
    pub platform: Option<Platform>,
    pub min_relevance: Option<f64>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SearchRequest {
    pub fn text(tenant_id: &str, analyst_id: &str, query: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            analyst_id: analyst_id.to_string(),
            source: SearchSource::Text(query.to_string()),
            scope: VisibilityScope::TenantOnly,
            workspaces: Vec::new(),
            platform: None,
            min_relevance: None,
            limit: None,
            offset: 0,
        }
    }

    pub fn related(tenant_id: &str, analyst_id: &str, session_id: &str) -> Self {
        Self {
            source: SearchSource::Session(session_id.to_string()),
            ..Self::text(tenant_id, analyst_id, "")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentMatch {
    pub session_id: String,
    pub workspace: String,
    pub platform: Platform,
    pub score: f64,
    pub summary: String,
    pub created_at: i64,
    pub cross_workspace: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<IncidentMatch>,
    /// Set when the request crossed workspaces.
    pub audit_token: Option<String>,
}

#[async_trait]
pub trait IncidentSearch: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> HarnessResult<SearchResponse>;
}

/// Ranks fingerprints in the caller's workspace plus `request.workspaces`.
pub struct FingerprintSearch {
    pool: SqlitePool,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: FingerprintConfig,
}

impl FingerprintSearch {
    pub fn new(
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: FingerprintConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            settings,
        }
    }

    async fn query_vector(&self, request: &SearchRequest) -> HarnessResult<Option<Vec<f32>>> {
        match &request.source {
            SearchSource::Text(q) => {
                if q.trim().is_empty() {
                    return Err(HarnessError::InvalidInput("query must not be empty".into()));
                }
                if !self.embedder.is_enabled() {
                    return Err(HarnessError::InvalidInput(
                        "incident search requires an embedding provider".into(),
                    ));
                }
                Ok(Some(embed_one(self.embedder.as_ref(), q).await?))
            }
            SearchSource::Session(session_id) => {
                let row = sqlx::query(
                    "SELECT vector FROM incident_fingerprints WHERE session_id = ? AND tenant_id = ?",
                )
                .bind(session_id)
                .bind(&request.tenant_id)
                .fetch_optional(&self.pool)
                .await?;
                match row {
                    None => Err(HarnessError::NotFound(format!(
                        "fingerprint for session {}",
                        session_id
                    ))),
                    Some(row) => {
                        let blob: Option<Vec<u8>> = row.get("vector");
                        Ok(blob.map(|b| blob_to_vec(&b)))
                    }
                }
            }
        }
    }
}

#[async_trait]
impl IncidentSearch for FingerprintSearch {
    async fn search(&self, request: &SearchRequest) -> HarnessResult<SearchResponse> {
        let Some(query) = self.query_vector(request).await? else {
            return Ok(SearchResponse {
                results: Vec::new(),
                audit_token: None,
            });
        };

        let others: BTreeSet<&str> = match request.scope {
            VisibilityScope::TenantOnly => BTreeSet::new(),
            VisibilityScope::MultiTenant => request
                .workspaces
                .iter()
                .map(String::as_str)
                .filter(|w| *w != request.tenant_id)
                .collect(),
        };
        let exclude = match &request.source {
            SearchSource::Session(id) => Some(id.as_str()),
            SearchSource::Text(_) => None,
        };
        let floor = request.min_relevance.unwrap_or(self.settings.min_relevance);

        let rows = sqlx::query(
            "SELECT session_id, tenant_id, vector, summary, platform, relevance_threshold, \
             visibility, created_at FROM incident_fingerprints \
             WHERE status = 'available' AND (tenant_id = ? OR visibility = 'multi_tenant')",
        )
        .bind(&request.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::new();
        for row in rows {
            let session_id: String = row.get("session_id");
            let workspace: String = row.get("tenant_id");
            if Some(session_id.as_str()) == exclude {
                continue;
            }
            if workspace != request.tenant_id && !others.contains(workspace.as_str()) {
                continue;
            }
            let platform: String = row.get("platform");
            let platform: Platform = platform.parse().unwrap_or(Platform::Unknown);
            if request.platform.is_some_and(|p| p != platform) {
                continue;
            }

            let blob: Vec<u8> = row.get("vector");
            let score = cosine_similarity(&query, &blob_to_vec(&blob)) as f64;
            let threshold: f64 = row.get("relevance_threshold");
            if score < floor.max(threshold) {
                continue;
            }

            matches.push(IncidentMatch {
                cross_workspace: workspace != request.tenant_id,
                session_id,
                workspace,
                platform,
                score,
                summary: row.get("summary"),
                created_at: row.get("created_at"),
            });
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.session_id.cmp(&b.session_id))
        });

        let limit = request
            .limit
            .unwrap_or(self.settings.default_limit)
            .clamp(1, MAX_LIMIT);
        let results = matches
            .into_iter()
            .skip(request.offset)
            .take(limit)
            .collect();

        Ok(SearchResponse {
            results,
            audit_token: None,
        })
    }
}

// ============ Authorization + audit ============

pub trait Authorizer: Send + Sync {
    fn can_access(&self, analyst_id: &str, workspace: &str) -> bool;
    /// Every workspace the analyst is granted.
    fn workspaces(&self, analyst_id: &str) -> Vec<String>;
}

/// Grants read from `[authz.grants]`.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    grants: HashMap<String, Vec<String>>,
}

impl StaticAuthorizer {
    pub fn new(config: &AuthzConfig) -> Self {
        Self {
            grants: config.grants.clone(),
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn can_access(&self, analyst_id: &str, workspace: &str) -> bool {
        self.grants
            .get(analyst_id)
            .is_some_and(|ws| ws.iter().any(|w| w == workspace))
    }

    fn workspaces(&self, analyst_id: &str) -> Vec<String> {
        self.grants.get(analyst_id).cloned().unwrap_or_default()
    }
}

/// Authorizes cross-workspace requests and audits what they surface.
pub struct AuditedSearch {
    inner: Arc<dyn IncidentSearch>,
    pool: SqlitePool,
    authorizer: Arc<dyn Authorizer>,
    cross_tenant_audit: bool,
}

impl AuditedSearch {
    pub fn new(
        inner: Arc<dyn IncidentSearch>,
        pool: SqlitePool,
        authorizer: Arc<dyn Authorizer>,
        cross_tenant_audit: bool,
    ) -> Self {
        Self {
            inner,
            pool,
            authorizer,
            cross_tenant_audit,
        }
    }

    async fn write_audit(
        &self,
        request: &SearchRequest,
        results: &[IncidentMatch],
        token: &str,
    ) -> Result<()> {
        let (action, source_session) = match &request.source {
            SearchSource::Text(_) => ("search_view", None),
            SearchSource::Session(id) => ("related_view", Some(id.as_str())),
        };
        let now = db::now_ts();

        let mut tx = self.pool.begin().await?;
        for m in results.iter().filter(|m| m.cross_workspace) {
            sqlx::query(
                "INSERT INTO analyst_audit_events (id, analyst_id, source_workspace, \
                 related_workspace, source_session_id, related_session_id, action, audit_token, \
                 created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&request.analyst_id)
            .bind(&request.tenant_id)
            .bind(&m.workspace)
            .bind(source_session)
            .bind(&m.session_id)
            .bind(action)
            .bind(token)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl IncidentSearch for AuditedSearch {
    async fn search(&self, request: &SearchRequest) -> HarnessResult<SearchResponse> {
        if request.scope == VisibilityScope::TenantOnly {
            return self.inner.search(request).await;
        }
        if !self.cross_tenant_audit {
            return Err(HarnessError::CrossTenantAuditInactive);
        }

        let requested = if request.workspaces.is_empty() {
            self.authorizer.workspaces(&request.analyst_id)
        } else {
            request.workspaces.clone()
        };
        let mut workspaces = Vec::new();
        for ws in requested {
            if ws == request.tenant_id || workspaces.contains(&ws) {
                continue;
            }
            if !self.authorizer.can_access(&request.analyst_id, &ws) {
                tracing::warn!(
                    analyst = %request.analyst_id,
                    workspace = %ws,
                    "cross-workspace search denied"
                );
                return Err(HarnessError::InsufficientPermissions {
                    analyst_id: request.analyst_id.clone(),
                    workspace: ws,
                });
            }
            workspaces.push(ws);
        }

        let resolved = SearchRequest {
            workspaces,
            ..request.clone()
        };
        let mut response = self.inner.search(&resolved).await?;

        let token = Uuid::new_v4().to_string();
        if let Err(e) = self.write_audit(request, &response.results, &token).await {
            tracing::warn!(analyst = %request.analyst_id, error = %e, "audit write failed; withholding results");
            return Err(HarnessError::Internal(e.context("audit write failed")));
        }
        let audited = response.results.iter().filter(|m| m.cross_workspace).count();
        tracing::info!(analyst = %request.analyst_id, audited, token = %token, "cross-workspace search");

        response.audit_token = Some(token);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::HashProvider;
    use crate::migrate;
    use incident_harness_core::models::{Entity, FlagSnapshot};
    use tempfile::TempDir;

    fn detection(platform: Platform, entities: Vec<Entity>) -> DetectionRecord {
        DetectionRecord {
            job_id: "j".into(),
            tenant_id: "t".into(),
            platform,
            confidence: 0.9,
            method: "signature_v1".into(),
            parser_executed: true,
            parser_version: None,
            entities,
            warnings: vec![],
            flags: FlagSnapshot::default(),
            scores: serde_json::json!([]),
            created_at: 0,
        }
    }

    struct Env {
        _tmp: TempDir,
        pool: SqlitePool,
        service: Arc<FingerprintService>,
        plain: Arc<FingerprintSearch>,
    }

    async fn env(settings: FingerprintConfig) -> Env {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("ihx.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashProvider::new(128));
        Env {
            service: Arc::new(FingerprintService::new(
                pool.clone(),
                embedder.clone(),
                settings.clone(),
            )),
            plain: Arc::new(FingerprintSearch::new(pool.clone(), embedder, settings)),
            pool,
            _tmp: tmp,
        }
    }

    fn multi_tenant() -> FingerprintConfig {
        FingerprintConfig {
            visibility: VisibilityScope::MultiTenant,
            min_relevance: 0.3,
            relevance_threshold: 0.3,
            ..FingerprintConfig::default()
        }
    }

    const SELECTOR_ERR: &str =
        "ERROR Click: Cannot find the UI element corresponding to this selector in InvoiceBot\n";

    #[test]
    fn summary_puts_errors_first_and_is_bounded() {
        let d = detection(
            Platform::UiPath,
            vec![
                Entity::new("process", "InvoiceBot", 1),
                Entity::new("error_message", "selector not found", 2),
            ],
        );
        let s = build_summary(&d, "INFO ok\nERROR boom\n", 2000);
        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(lines[0], "platform: uipath");
        assert_eq!(lines[1], "error_message: selector not found");
        assert_eq!(lines[2], "process: InvoiceBot");
        assert!(s.contains("ERROR boom"));
        assert!(!s.contains("INFO ok"));

        let short = build_summary(&d, "INFO ok\nERROR boom\n", 20);
        assert!(short.len() <= 20);
    }

    #[test]
    fn blank_content_has_no_summary() {
        let d = detection(Platform::Unknown, vec![]);
        assert!(build_summary(&d, "  \n\n", 2000).is_empty());
    }

    #[tokio::test]
    async fn index_stores_available_vector() {
        let e = env(FingerprintConfig::default()).await;
        let fp = e
            .service
            .index("s1", "acme", &detection(Platform::UiPath, vec![]), SELECTOR_ERR)
            .await
            .unwrap();
        assert_eq!(fp.status, FingerprintStatus::Available);
        assert_eq!(fp.visibility, VisibilityScope::TenantOnly);
    }

    #[tokio::test]
    async fn multi_tenant_without_audit_is_downgraded() {
        let e = env(FingerprintConfig {
            cross_tenant_audit: false,
            ..multi_tenant()
        })
        .await;
        let fp = e
            .service
            .index("s1", "acme", &detection(Platform::UiPath, vec![]), SELECTOR_ERR)
            .await
            .unwrap();
        assert_eq!(fp.visibility, VisibilityScope::TenantOnly);
        assert!(fp.safeguard_notes[0].contains("downgraded"));
    }

    #[tokio::test]
    async fn related_search_excludes_source_and_other_tenants() {
        let e = env(FingerprintConfig::default()).await;
        let d = detection(Platform::UiPath, vec![]);
        for (s, t) in [("s1", "acme"), ("s2", "acme"), ("s3", "globex")] {
            e.service.index(s, t, &d, SELECTOR_ERR).await.unwrap();
        }
        let resp = e
            .plain
            .search(&SearchRequest::related("acme", "a1", "s1"))
            .await
            .unwrap();
        let ids: Vec<_> = resp.results.iter().map(|m| m.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s2"]);
        assert!(resp.results[0].score > 0.99);
    }

    #[tokio::test]
    async fn unknown_source_session_is_not_found() {
        let e = env(FingerprintConfig::default()).await;
        let err = e
            .plain
            .search(&SearchRequest::related("acme", "a1", "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn cross_workspace_results_are_audited_once_each() {
        let e = env(multi_tenant()).await;
        let d = detection(Platform::UiPath, vec![]);
        for (s, t) in [("s1", "acme"), ("s2", "globex"), ("s3", "globex"), ("s4", "initech")] {
            e.service.index(s, t, &d, SELECTOR_ERR).await.unwrap();
        }
        let authz = StaticAuthorizer::new(&AuthzConfig {
            grants: HashMap::from([("a1".to_string(), vec!["globex".to_string()])]),
        });
        let audited = AuditedSearch::new(e.plain.clone(), e.pool.clone(), Arc::new(authz), true);

        let mut req = SearchRequest::text("acme", "a1", SELECTOR_ERR);
        req.scope = VisibilityScope::MultiTenant;
        let resp = audited.search(&req).await.unwrap();

        let token = resp.audit_token.clone().unwrap();
        let workspaces: BTreeSet<_> = resp.results.iter().map(|m| m.workspace.as_str()).collect();
        assert_eq!(workspaces, BTreeSet::from(["acme", "globex"]));

        let events: Vec<String> = sqlx::query_scalar(
            "SELECT related_session_id FROM analyst_audit_events WHERE audit_token = ? ORDER BY related_session_id",
        )
        .bind(&token)
        .fetch_all(&e.pool)
        .await
        .unwrap();
        assert_eq!(events, vec!["s2", "s3"]);
    }

    #[tokio::test]
    async fn unauthorized_workspace_is_rejected() {
        let e = env(multi_tenant()).await;
        let audited = AuditedSearch::new(
            e.plain.clone(),
            e.pool.clone(),
            Arc::new(StaticAuthorizer::default()),
            true,
        );
        let mut req = SearchRequest::text("acme", "a1", "selector");
        req.scope = VisibilityScope::MultiTenant;
        req.workspaces = vec!["globex".into()];
        match audited.search(&req).await {
            Err(HarnessError::InsufficientPermissions { workspace, .. }) => {
                assert_eq!(workspace, "globex")
            }
            other => panic!("expected permission error, got {:?}", other.map(|r| r.results)),
        }
    }

    #[tokio::test]
    async fn multi_tenant_requires_active_audit() {
        let e = env(multi_tenant()).await;
        let audited = AuditedSearch::new(
            e.plain.clone(),
            e.pool.clone(),
            Arc::new(StaticAuthorizer::default()),
            false,
        );
        let mut req = SearchRequest::text("acme", "a1", "selector");
        req.scope = VisibilityScope::MultiTenant;
        let err = audited.search(&req).await.unwrap_err();
        assert_eq!(err.code(), "cross_tenant_audit_inactive");
    }

    #[tokio::test]
    async fn tenant_only_fingerprints_stay_private() {
        let e = env(FingerprintConfig {
            min_relevance: 0.3,
            relevance_threshold: 0.3,
            ..FingerprintConfig::default()
        })
        .await;
        e.service
            .index("s2", "globex", &detection(Platform::UiPath, vec![]), SELECTOR_ERR)
            .await
            .unwrap();
        let authz = StaticAuthorizer::new(&AuthzConfig {
            grants: HashMap::from([("a1".to_string(), vec!["globex".to_string()])]),
        });
        let audited = AuditedSearch::new(e.plain.clone(), e.pool.clone(), Arc::new(authz), true);
        let mut req = SearchRequest::text("acme", "a1", SELECTOR_ERR);
        req.scope = VisibilityScope::MultiTenant;
        let resp = audited.search(&req).await.unwrap();
        assert!(resp.results.is_empty());
    }
}
