//! Chunk-level retrieval: vector similarity fused with FTS5 ranking.
//!
//! # Pipeline
//!
//! 1. Embed the query and rank the tenant's `chunk_vectors` by cosine
//!    similarity (top `candidate_k`).
//! 2. Unless hybrid is off for the tenant, rank the tenant's chunks with
//!    `bm25(chunks_fts)` over the sanitized query terms (top `candidate_k`).
//! 3. Min-max normalize each channel and fuse with the configured weights
//!    (`incident_harness_core::scoring::fuse`).
//! 4. Return the top `limit` chunks with `session_id` and line range.
//!
//! Each hybrid query's latency feeds the tenant's
//! [`HybridBreaker`]; transitions are persisted to `retrieval_tenant_state`
//! and reloaded by [`RetrievalEngine::load_state`]. A failing lexical
//! channel degrades that one query to vector-only and leaves the breaker
//! alone.

use anyhow::Result;
use incident_harness_core::breaker::{BreakerSettings, HybridBreaker, HybridState, Transition};
use incident_harness_core::embedding::{blob_to_vec, cosine_similarity, tokenize};
use incident_harness_core::models::LineRange;
use incident_harness_core::scoring::{fuse, normalize_channel, FusionWeights};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::RetrievalConfig;
use crate::db;
use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::{HarnessError, HarnessResult};
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Serialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub session_id: String,
    pub line_range: LineRange,
    pub text: String,
    pub score: f64,
    pub vector_score: f64,
    /// Absent when the query ran vector-only.
    pub lexical_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResponse {
    /// `hybrid` or `vector_only`.
    pub mode: &'static str,
    pub hybrid_state: HybridState,
    /// The lexical channel failed and this query fell back to vector-only.
    pub lexical_fallback: bool,
    pub results: Vec<ChunkMatch>,
}

/// Quote each query term and OR them together, so user input can never be
/// read as FTS5 syntax.
pub fn sanitize_fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = tokenize(query)
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

pub struct RetrievalEngine {
    pool: SqlitePool,
    embedder: Arc<dyn EmbeddingProvider>,
    telemetry: Arc<Telemetry>,
    settings: RetrievalConfig,
    breaker_settings: BreakerSettings,
    weights: FusionWeights,
    breakers: Mutex<HashMap<String, HybridBreaker>>,
}

impl RetrievalEngine {
    pub fn new(
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        telemetry: Arc<Telemetry>,
        settings: RetrievalConfig,
        breaker_settings: BreakerSettings,
        weights: FusionWeights,
    ) -> Self {
        Self {
            pool,
            embedder,
            telemetry,
            settings,
            breaker_settings,
            weights,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Restore persisted per-tenant breaker states. Returns how many.
    pub async fn load_state(&self) -> Result<usize> {
        let rows = sqlx::query("SELECT tenant_id, state FROM retrieval_tenant_state")
            .fetch_all(&self.pool)
            .await?;

        let mut restored = Vec::with_capacity(rows.len());
        for row in rows {
            let tenant: String = row.get("tenant_id");
            let state: String = row.get("state");
            match state.parse::<HybridState>() {
                Ok(state) => restored.push((tenant, state)),
                Err(e) => tracing::warn!(tenant = %tenant, error = %e, "ignoring stored hybrid state"),
            }
        }

        let count = restored.len();
        let mut breakers = self
            .breakers
            .lock()
            .map_err(|_| anyhow::anyhow!("breaker map poisoned"))?;
        for (tenant, state) in restored {
            breakers.insert(tenant, HybridBreaker::restored(self.breaker_settings, state));
        }
        Ok(count)
    }

    pub fn state(&self, tenant: &str) -> HybridState {
        self.breakers
            .lock()
            .ok()
            .and_then(|b| b.get(tenant).map(|br| br.state()))
            .unwrap_or(HybridState::Enabled)
    }

    /// Embed `query` and retrieve the tenant's best-matching chunks.
    pub async fn retrieve(
        &self,
        tenant: &str,
        query: &str,
        limit: Option<usize>,
    ) -> HarnessResult<RetrievalResponse> {
        if query.trim().is_empty() {
            return Err(HarnessError::InvalidInput("query must not be empty".into()));
        }
        if !self.embedder.is_enabled() {
            return Err(HarnessError::InvalidInput(
                "retrieval requires an embedding provider".into(),
            ));
        }
        let query_vec = embed_one(self.embedder.as_ref(), query).await?;
        self.retrieve_with_vector(tenant, query, &query_vec, limit)
            .await
    }

    pub async fn retrieve_with_vector(
        &self,
        tenant: &str,
        query: &str,
        query_vec: &[f32],
        limit: Option<usize>,
    ) -> HarnessResult<RetrievalResponse> {
        let limit = limit.unwrap_or(self.settings.final_limit).max(1);
        let hybrid = self.settings.hybrid_enabled && self.state(tenant) != HybridState::AutoDisabled;

        let start = Instant::now();
        let vector_raw = self.vector_channel(tenant, query_vec).await?;
        let mut lexical_fallback = false;
        let lexical_raw = if hybrid {
            match self.lexical_channel(tenant, query).await {
                Ok(raw) => Some(raw),
                Err(e) => {
                    tracing::warn!(tenant, error = %e, "lexical channel failed; vector-only for this query");
                    lexical_fallback = true;
                    None
                }
            }
        } else {
            None
        };
        let elapsed = start.elapsed();

        let mode = if lexical_raw.is_some() {
            "hybrid"
        } else {
            "vector_only"
        };
        if lexical_raw.is_some() {
            // breaker bookkeeping never fails the query
            if let Err(e) = self
                .record_latency(tenant, elapsed.as_secs_f64() * 1000.0)
                .await
            {
                tracing::warn!(tenant, error = %e, "failed to record hybrid latency");
            }
        }

        let vector_map = normalize_channel(&vector_raw);
        let lexical_map = lexical_raw.as_deref().map(normalize_channel);
        let fused = fuse(&vector_map, lexical_map.as_ref(), self.weights);

        let mut results = Vec::with_capacity(limit.min(fused.len()));
        for f in fused.into_iter().take(limit) {
            let row = sqlx::query(
                "SELECT session_id, text, line_start, line_end FROM chunks WHERE id = ? AND tenant_id = ?",
            )
            .bind(&f.id)
            .bind(tenant)
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else { continue };
            results.push(ChunkMatch {
                session_id: row.get("session_id"),
                line_range: LineRange {
                    start: row.get::<i64, _>("line_start") as usize,
                    end: row.get::<i64, _>("line_end") as usize,
                },
                text: row.get("text"),
                chunk_id: f.id,
                score: f.combined,
                vector_score: f.vector,
                lexical_score: f.lexical,
            });
        }

        self.telemetry.retrieval(tenant, mode, start.elapsed());
        Ok(RetrievalResponse {
            mode,
            hybrid_state: self.state(tenant),
            lexical_fallback,
            results,
        })
    }

    async fn vector_channel(&self, tenant: &str, query_vec: &[f32]) -> Result<Vec<(String, f64)>> {
        let rows = sqlx::query(
            "SELECT chunk_id, vector FROM chunk_vectors WHERE tenant_id = ? AND model = ?",
        )
        .bind(tenant)
        .bind(self.embedder.model_name())
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<(String, f64)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let sim = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                (row.get("chunk_id"), sim)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(self.settings.candidate_k as usize);
        Ok(scored)
    }

    async fn lexical_channel(&self, tenant: &str, query: &str) -> Result<Vec<(String, f64)>> {
        let Some(fts_query) = sanitize_fts_query(query) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, bm25(chunks_fts) AS rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ? AND tenant_id = ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&fts_query)
        .bind(tenant)
        .bind(self.settings.candidate_k)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                // bm25: lower is better
                (row.get("chunk_id"), -rank)
            })
            .collect())
    }

    /// Feed one hybrid latency sample to the tenant's breaker.
    pub async fn record_latency(&self, tenant: &str, latency_ms: f64) -> Result<Option<Transition>> {
        let transition = {
            let mut breakers = self
                .breakers
                .lock()
                .map_err(|_| anyhow::anyhow!("breaker map poisoned"))?;
            breakers
                .entry(tenant.to_string())
                .or_insert_with(|| HybridBreaker::new(self.breaker_settings))
                .record(latency_ms)
        };

        if let Some(t) = transition {
            self.persist(tenant, t.to).await?;
            if t.to == HybridState::Enabled {
                tracing::info!(tenant, from = %t.from, to = %t.to, latency_ms, "hybrid retrieval recovered");
            } else {
                tracing::warn!(tenant, from = %t.from, to = %t.to, latency_ms, "hybrid retrieval degraded");
            }
        }
        Ok(transition)
    }

    /// Operator override back to hybrid mode.
    pub async fn reenable(&self, tenant: &str) -> Result<HybridState> {
        let transition = {
            let mut breakers = self
                .breakers
                .lock()
                .map_err(|_| anyhow::anyhow!("breaker map poisoned"))?;
            breakers
                .entry(tenant.to_string())
                .or_insert_with(|| HybridBreaker::new(self.breaker_settings))
                .reenable()
        };
        self.persist(tenant, HybridState::Enabled).await?;
        if let Some(t) = transition {
            tracing::info!(tenant, from = %t.from, "hybrid retrieval re-enabled by operator");
        }
        Ok(HybridState::Enabled)
    }

    async fn persist(&self, tenant: &str, state: HybridState) -> Result<()> {
        sqlx::query(
            "INSERT INTO retrieval_tenant_state (tenant_id, state, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(tenant_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(tenant)
        .bind(state.as_str())
        .bind(db::now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
