//! Content-addressed embedding cache with queued, lock-guarded eviction.
//!
//! Entries are keyed by `(tenant_id, content_hash, model)`. The key is the
//! primary key of `embedding_cache`, so concurrent writers cannot create
//! duplicates: the first insert wins, later ones hit `ON CONFLICT DO NOTHING`
//! and reuse the winner's embedding.
//!
//! # Eviction
//!
//! Each lookup feeds a per-tenant rolling hit-rate window. When a tenant's
//! hit rate crosses the configured threshold (after a minimum number of
//! samples) the tenant is written to `eviction_queue`. A scheduled pass
//! drains the queue one tenant at a time under an `eviction_locks` row:
//!
//! 1. take the tenant lock (or a stale one whose expiry has passed),
//! 2. mark entries not accessed within the staleness window `evicting`,
//! 3. delete them and their embeddings in one transaction,
//! 4. release the lock and dequeue the tenant.
//!
//! A failed pass leaves the queue row in place with the error recorded.

use anyhow::{bail, Result};
use incident_harness_core::embedding::{blob_to_vec, vec_to_blob};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{CacheConfig, Config};
use crate::db;
use crate::telemetry::{Telemetry, TracingSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Another writer stored the key first; its embedding was reused.
    LostRace,
    /// Computed but not cached (the key was mid-eviction).
    Uncached,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::LostRace => "lost_race",
            CacheOutcome::Uncached => "uncached",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedEmbedding {
    pub embedding_id: Option<String>,
    pub vector: Vec<f32>,
    pub outcome: CacheOutcome,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EvictionReport {
    pub tenants: usize,
    pub evicted: u64,
    pub skipped_locked: usize,
    pub failed: usize,
}

#[derive(Default)]
struct HitWindow {
    samples: VecDeque<bool>,
    hits: usize,
    above: bool,
}

impl HitWindow {
    fn push(&mut self, hit: bool, capacity: usize) {
        if self.samples.len() == capacity {
            if let Some(true) = self.samples.pop_front() {
                self.hits -= 1;
            }
        }
        self.samples.push_back(hit);
        if hit {
            self.hits += 1;
        }
    }

    fn rate(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.hits as f64 / self.samples.len() as f64
        }
    }
}

pub struct EmbeddingCache {
    pool: SqlitePool,
    settings: CacheConfig,
    windows: Mutex<HashMap<String, HitWindow>>,
    telemetry: Arc<Telemetry>,
}

impl EmbeddingCache {
    pub fn new(pool: SqlitePool, settings: CacheConfig, telemetry: Arc<Telemetry>) -> Self {
        Self {
            pool,
            settings,
            windows: Mutex::new(HashMap::new()),
            telemetry,
        }
    }

    /// Return the cached embedding for the key, or run `compute` and cache
    /// its result.
    pub async fn get_or_compute<F, Fut>(
        &self,
        tenant: &str,
        content_hash: &str,
        model: &str,
        compute: F,
    ) -> Result<CachedEmbedding>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>>>,
    {
        self.get_or_compute_at(db::now_ts(), tenant, content_hash, model, compute)
            .await
    }

    pub async fn get_or_compute_at<F, Fut>(
        &self,
        now: i64,
        tenant: &str,
        content_hash: &str,
        model: &str,
        compute: F,
    ) -> Result<CachedEmbedding>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>>>,
    {
        let start = Instant::now();

        if let Some(hit) = self.lookup(tenant, content_hash, model, now).await? {
            self.record_lookup(tenant, true, now).await;
            self.telemetry
                .cache_lookup(tenant, CacheOutcome::Hit.as_str(), start.elapsed());
            return Ok(hit);
        }
        self.record_lookup(tenant, false, now).await;

        self.clear_expired(tenant, content_hash, model, now).await?;
        let vector = compute().await?;
        let stored = self
            .store(tenant, content_hash, model, vector, now)
            .await?;
        self.telemetry
            .cache_lookup(tenant, stored.outcome.as_str(), start.elapsed());
        Ok(stored)
    }

    async fn lookup(
        &self,
        tenant: &str,
        content_hash: &str,
        model: &str,
        now: i64,
    ) -> Result<Option<CachedEmbedding>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            r#"
            UPDATE embedding_cache
            SET hit_count = hit_count + 1, last_accessed_at = ?
            WHERE tenant_id = ? AND content_hash = ? AND model = ?
              AND state = 'active'
              AND (expires_at IS NULL OR expires_at > ?)
            RETURNING embedding_id, hit_count
            "#,
        )
        .bind(now)
        .bind(tenant)
        .bind(content_hash)
        .bind(model)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some((embedding_id, _hits)) = row else {
            return Ok(None);
        };

        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT vector FROM embeddings WHERE id = ?")
                .bind(&embedding_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(blob.map(|b| CachedEmbedding {
            embedding_id: Some(embedding_id),
            vector: blob_to_vec(&b),
            outcome: CacheOutcome::Hit,
        }))
    }

    async fn clear_expired(
        &self,
        tenant: &str,
        content_hash: &str,
        model: &str,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let expired: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM embedding_cache
            WHERE tenant_id = ? AND content_hash = ? AND model = ?
              AND expires_at IS NOT NULL AND expires_at <= ?
            RETURNING embedding_id
            "#,
        )
        .bind(tenant)
        .bind(content_hash)
        .bind(model)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for id in &expired {
            sqlx::query("DELETE FROM embeddings WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn store(
        &self,
        tenant: &str,
        content_hash: &str,
        model: &str,
        vector: Vec<f32>,
        now: i64,
    ) -> Result<CachedEmbedding> {
        let id = Uuid::new_v4().to_string();
        let expires_at = self.settings.ttl_secs.map(|ttl| now + ttl);

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO embedding_cache
                (tenant_id, content_hash, model, embedding_id, hit_count,
                 last_accessed_at, created_at, expires_at, state)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?, 'active')
            ON CONFLICT(tenant_id, content_hash, model) DO NOTHING
            "#,
        )
        .bind(tenant)
        .bind(content_hash)
        .bind(model)
        .bind(&id)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            sqlx::query(
                "INSERT INTO embeddings (id, tenant_id, model, dims, vector, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(tenant)
            .bind(model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(&vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(CachedEmbedding {
                embedding_id: Some(id),
                vector,
                outcome: CacheOutcome::Miss,
            });
        }

        let winner: Option<(String, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT c.embedding_id, e.vector
            FROM embedding_cache c
            JOIN embeddings e ON e.id = c.embedding_id
            WHERE c.tenant_id = ? AND c.content_hash = ? AND c.model = ?
              AND c.state = 'active'
            "#,
        )
        .bind(tenant)
        .bind(content_hash)
        .bind(model)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(match winner {
            Some((winner_id, blob)) => CachedEmbedding {
                embedding_id: Some(winner_id),
                vector: blob_to_vec(&blob),
                outcome: CacheOutcome::LostRace,
            },
            None => CachedEmbedding {
                embedding_id: None,
                vector,
                outcome: CacheOutcome::Uncached,
            },
        })
    }

    /// Feed the tenant's hit-rate window; enqueue the tenant when its rate
    /// crosses the threshold. Queue failures are logged, never returned.
    async fn record_lookup(&self, tenant: &str, hit: bool, now: i64) {
        let crossed = match self.windows.lock() {
            Ok(mut windows) => {
                let w = windows.entry(tenant.to_string()).or_default();
                w.push(hit, self.settings.hit_rate_window);
                let rate = w.rate();
                let above = w.samples.len() >= self.settings.min_samples
                    && rate >= self.settings.hit_rate_threshold;
                let crossed = above && !w.above;
                w.above = above;
                crossed.then_some(rate)
            }
            Err(_) => None,
        };

        if let Some(rate) = crossed {
            let res = sqlx::query(
                "INSERT INTO eviction_queue (tenant_id, hit_rate, enqueued_at) VALUES (?, ?, ?) \
                 ON CONFLICT(tenant_id) DO NOTHING",
            )
            .bind(tenant)
            .bind(rate)
            .bind(now)
            .execute(&self.pool)
            .await;
            match res {
                Ok(_) => tracing::info!(tenant, hit_rate = rate, "tenant queued for eviction"),
                Err(e) => tracing::warn!(tenant, error = %e, "failed to queue tenant for eviction"),
            }
        }
    }

    pub async fn queued_tenants(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT tenant_id FROM eviction_queue ORDER BY enqueued_at, tenant_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn run_eviction_pass(&self) -> Result<EvictionReport> {
        self.run_eviction_pass_at(db::now_ts()).await
    }

    /// Drain the eviction queue once.
    pub async fn run_eviction_pass_at(&self, now: i64) -> Result<EvictionReport> {
        let holder = Uuid::new_v4().to_string();
        let mut report = EvictionReport::default();

        for tenant in self.queued_tenants().await? {
            report.tenants += 1;

            if !self.try_lock(&tenant, &holder, now).await? {
                tracing::info!(tenant = %tenant, "eviction already running; skipping");
                report.skipped_locked += 1;
                continue;
            }

            let result = self.evict_stale(&tenant, &holder, now).await;
            if let Err(e) = self.unlock(&tenant, &holder).await {
                tracing::warn!(tenant = %tenant, error = %e, "failed to release eviction lock");
            }

            match result {
                Ok(evicted) => {
                    report.evicted += evicted;
                    sqlx::query("DELETE FROM eviction_queue WHERE tenant_id = ?")
                        .bind(&tenant)
                        .execute(&self.pool)
                        .await?;
                    tracing::info!(tenant = %tenant, evicted, "eviction pass complete");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(tenant = %tenant, error = %e, "eviction failed; will retry");
                    let res = sqlx::query(
                        "UPDATE eviction_queue SET attempts = attempts + 1, last_error = ? \
                         WHERE tenant_id = ?",
                    )
                    .bind(format!("{:#}", e))
                    .bind(&tenant)
                    .execute(&self.pool)
                    .await;
                    if let Err(e) = res {
                        tracing::warn!(tenant = %tenant, error = %e, "failed to record eviction attempt");
                    }
                }
            }
        }

        Ok(report)
    }

    /// Take the tenant's eviction lock, or a stale one.
    pub async fn try_lock(&self, tenant: &str, holder: &str, now: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO eviction_locks (tenant_id, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE
                SET holder = excluded.holder, expires_at = excluded.expires_at
                WHERE eviction_locks.expires_at <= ?
            "#,
        )
        .bind(tenant)
        .bind(holder)
        .bind(now + self.settings.lock_ttl_secs)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn unlock(&self, tenant: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM eviction_locks WHERE tenant_id = ? AND holder = ?")
            .bind(tenant)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Extend `holder`'s lease. Fails once another pass has taken it over.
    async fn renew_lock(
        &self,
        conn: &mut SqliteConnection,
        tenant: &str,
        holder: &str,
        now: i64,
    ) -> Result<()> {
        let renewed = sqlx::query(
            "UPDATE eviction_locks SET expires_at = ? WHERE tenant_id = ? AND holder = ?",
        )
        .bind(now.max(db::now_ts()) + self.settings.lock_ttl_secs)
        .bind(tenant)
        .bind(holder)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        if renewed == 0 {
            bail!("eviction lock for tenant {} was lost", tenant);
        }
        Ok(())
    }

    async fn evict_stale(&self, tenant: &str, holder: &str, now: i64) -> Result<u64> {
        let cutoff = now - self.settings.stale_after_secs;

        let mut tx = self.pool.begin().await?;
        self.renew_lock(&mut tx, tenant, holder, now).await?;
        sqlx::query(
            "UPDATE embedding_cache SET state = 'evicting' \
             WHERE tenant_id = ? AND state = 'active' AND last_accessed_at < ?",
        )
        .bind(tenant)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut tx = self.pool.begin().await?;
        self.renew_lock(&mut tx, tenant, holder, now).await?;
        sqlx::query(
            "DELETE FROM embeddings WHERE id IN \
             (SELECT embedding_id FROM embedding_cache WHERE tenant_id = ? AND state = 'evicting')",
        )
        .bind(tenant)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query(
            "DELETE FROM embedding_cache WHERE tenant_id = ? AND state = 'evicting'",
        )
        .bind(tenant)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        Ok(deleted)
    }
}

/// Run an eviction pass every `interval` until the task is dropped.
pub fn spawn_eviction_scheduler(cache: Arc<EmbeddingCache>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match cache.run_eviction_pass().await {
                Ok(r) if r.tenants > 0 => {
                    tracing::info!(tenants = r.tenants, evicted = r.evicted, "scheduled eviction")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "scheduled eviction failed"),
            }
        }
    })
}

/// `ihx cache evict`: drain the queue once and print the report.
pub async fn run_evict(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let telemetry = Arc::new(Telemetry::new(Arc::new(TracingSink))?);
    let cache = EmbeddingCache::new(pool.clone(), config.cache.clone(), telemetry);

    let report = cache.run_eviction_pass().await?;
    println!("tenants processed: {}", report.tenants);
    println!("entries evicted: {}", report.evicted);
    println!("skipped (locked): {}", report.skipped_locked);
    println!("failed: {}", report.failed);

    pool.close().await;
    Ok(())
}
