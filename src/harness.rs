//! Wiring: one [`Harness`] owns the pool and every component built on it.
//!
//! The CLI opens one per command; the server opens one at startup and
//! shares it across handlers behind an `Arc`.

use anyhow::Result;
use incident_harness_core::parsers::ParserRegistry;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::archive::{ArchiveExtractor, ArchiveLimits};
use crate::cache::{spawn_eviction_scheduler, EmbeddingCache};
use crate::config::Config;
use crate::db;
use crate::detect::PlatformDetector;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::fingerprint::{
    AuditedSearch, FingerprintSearch, FingerprintService, IncidentSearch, StaticAuthorizer,
};
use crate::migrate;
use crate::retrieval::RetrievalEngine;
use crate::telemetry::{Telemetry, TelemetrySink, TracingSink};

pub struct Harness {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub telemetry: Arc<Telemetry>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub extractor: ArchiveExtractor,
    pub detector: PlatformDetector,
    pub cache: Arc<EmbeddingCache>,
    pub fingerprints: Arc<FingerprintService>,
    /// Caller-facing search: authorization and audit around fingerprint ranking.
    pub search: Arc<dyn IncidentSearch>,
    pub retrieval: RetrievalEngine,
}

impl Harness {
    pub async fn open(config: &Config) -> Result<Self> {
        Self::open_with_sink(config, Arc::new(TracingSink)).await
    }

    /// Connect, ensure the schema, and build every component.
    pub async fn open_with_sink(config: &Config, sink: Arc<dyn TelemetrySink>) -> Result<Self> {
        let config = Arc::new(config.clone());
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;

        let telemetry = Arc::new(Telemetry::new(sink)?);
        let embedder = create_provider(&config.embedding)?;

        let extractor = ArchiveExtractor::new(
            pool.clone(),
            ArchiveLimits::from_config(&config.archive)?,
            telemetry.clone(),
        );
        let detector = PlatformDetector::new(
            pool.clone(),
            Arc::new(ParserRegistry::with_builtins()),
            telemetry.clone(),
            config.parser_timeout(),
        );
        let cache = Arc::new(EmbeddingCache::new(
            pool.clone(),
            config.cache.clone(),
            telemetry.clone(),
        ));
        let fingerprints = Arc::new(FingerprintService::new(
            pool.clone(),
            embedder.clone(),
            config.fingerprint.clone(),
        ));
        let search: Arc<dyn IncidentSearch> = Arc::new(AuditedSearch::new(
            Arc::new(FingerprintSearch::new(
                pool.clone(),
                embedder.clone(),
                config.fingerprint.clone(),
            )),
            pool.clone(),
            Arc::new(StaticAuthorizer::new(&config.authz)),
            config.fingerprint.cross_tenant_audit,
        ));
        let retrieval = RetrievalEngine::new(
            pool.clone(),
            embedder.clone(),
            telemetry.clone(),
            config.retrieval.clone(),
            config.breaker_settings(),
            config.fusion_weights(),
        );
        let restored = retrieval.load_state().await?;
        if restored > 0 {
            tracing::debug!(tenants = restored, "restored hybrid retrieval state");
        }

        Ok(Self {
            config,
            pool,
            telemetry,
            embedder,
            extractor,
            detector,
            cache,
            fingerprints,
            search,
            retrieval,
        })
    }

    /// Start the periodic cache eviction task.
    pub fn spawn_eviction(&self) -> JoinHandle<()> {
        spawn_eviction_scheduler(
            self.cache.clone(),
            Duration::from_secs(self.config.cache.eviction_interval_secs),
        )
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
