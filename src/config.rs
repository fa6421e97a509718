//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//! [`load_config`] validates thresholds up front so a bad value fails at
//! startup rather than in the middle of an ingestion.
//!
//! ```toml
//! [db]
//! path = "./data/ihx.sqlite"
//!
//! [archive]
//! max_ratio = 100.0
//! max_members = 10000
//!
//! [detection]
//! rollout_threshold = 0.70
//!
//! [embedding]
//! provider = "hash"
//! dims = 256
//!
//! [authz.grants]
//! "analyst-7" = ["acme", "globex"]
//! ```

use anyhow::{Context, Result};
use incident_harness_core::breaker::BreakerSettings;
use incident_harness_core::models::{FlagSnapshot, Platform, VisibilityScope};
use incident_harness_core::scoring::FusionWeights;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub authz: AuthzConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

/// Guardrails applied while decompressing uploads.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ArchiveConfig {
    pub max_ratio: f64,
    pub max_members: u64,
    pub max_total_bytes: u64,
    pub timeout_secs: u64,
    /// Keep every supported member instead of only the first.
    pub multi_extraction: bool,
    pub supported_extensions: Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_ratio: 100.0,
            max_members: 10_000,
            max_total_bytes: 100 * 1024 * 1024,
            timeout_secs: 30,
            multi_extraction: false,
            supported_extensions: [
                "log", "txt", "json", "xml", "xaml", "yaml", "yml", "csv", "out", "trace", "har",
                "ndjson",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    pub parsers_enabled: bool,
    pub min_confidence: f64,
    pub rollout_threshold: f64,
    pub disabled_platforms: Vec<Platform>,
    pub parser_timeout_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            parsers_enabled: true,
            min_confidence: 0.15,
            rollout_threshold: 0.70,
            disabled_platforms: Vec::new(),
            parser_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_tokens: 700 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `hash`, or `openai`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries older than this are misses; `None` keeps entries until evicted.
    pub ttl_secs: Option<i64>,
    pub hit_rate_window: usize,
    pub min_samples: usize,
    pub hit_rate_threshold: f64,
    pub stale_after_secs: i64,
    pub eviction_interval_secs: u64,
    pub lock_ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: None,
            hit_rate_window: 200,
            min_samples: 20,
            hit_rate_threshold: 0.30,
            stale_after_secs: 7 * 24 * 3600,
            eviction_interval_secs: 300,
            lock_ttl_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FingerprintConfig {
    pub summary_max_chars: usize,
    pub min_relevance: f64,
    pub relevance_threshold: f64,
    pub visibility: VisibilityScope,
    /// Required for any `multi_tenant` visibility or search.
    pub cross_tenant_audit: bool,
    pub default_limit: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: 2000,
            min_relevance: 0.55,
            relevance_threshold: 0.5,
            visibility: VisibilityScope::TenantOnly,
            cross_tenant_audit: true,
            default_limit: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Global switch; `false` forces vector-only for every tenant.
    pub hybrid_enabled: bool,
    pub vector_weight: f64,
    pub lexical_weight: f64,
    pub candidate_k: i64,
    pub final_limit: usize,
    pub latency_multiplier: f64,
    pub sustained_window: u32,
    pub baseline_window: usize,
    pub min_baseline_samples: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let breaker = BreakerSettings::default();
        let weights = FusionWeights::default();
        Self {
            hybrid_enabled: true,
            vector_weight: weights.vector,
            lexical_weight: weights.lexical,
            candidate_k: 80,
            final_limit: 12,
            latency_multiplier: breaker.latency_multiplier,
            sustained_window: breaker.sustained_window,
            baseline_window: breaker.baseline_window,
            min_baseline_samples: breaker.min_baseline_samples,
        }
    }
}

/// Static analyst → workspace grants used by the built-in authorizer.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthzConfig {
    pub grants: HashMap<String, Vec<String>>,
}

impl Config {
    /// Defaults everywhere except the database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            server: ServerConfig::default(),
            archive: ArchiveConfig::default(),
            detection: DetectionConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            fingerprint: FingerprintConfig::default(),
            retrieval: RetrievalConfig::default(),
            authz: AuthzConfig::default(),
        }
    }

    /// Capture the feature flags in effect right now.
    pub fn flags(&self) -> FlagSnapshot {
        FlagSnapshot {
            parsers_enabled: self.detection.parsers_enabled,
            min_confidence: self.detection.min_confidence,
            rollout_threshold: self.detection.rollout_threshold,
            disabled_platforms: self.detection.disabled_platforms.clone(),
            multi_extraction: self.archive.multi_extraction,
            hybrid_enabled: self.retrieval.hybrid_enabled,
            cross_tenant_audit: self.fingerprint.cross_tenant_audit,
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            latency_multiplier: self.retrieval.latency_multiplier,
            sustained_window: self.retrieval.sustained_window,
            baseline_window: self.retrieval.baseline_window,
            min_baseline_samples: self.retrieval.min_baseline_samples,
        }
    }

    pub fn fusion_weights(&self) -> FusionWeights {
        FusionWeights {
            vector: self.retrieval.vector_weight,
            lexical: self.retrieval.lexical_weight,
        }
    }

    pub fn parser_timeout(&self) -> Duration {
        Duration::from_secs(self.detection.parser_timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let a = &config.archive;
    if a.max_ratio <= 0.0 {
        anyhow::bail!("archive.max_ratio must be > 0");
    }
    if a.max_members == 0 || a.max_total_bytes == 0 || a.timeout_secs == 0 {
        anyhow::bail!("archive.max_members, max_total_bytes and timeout_secs must be > 0");
    }
    if a.supported_extensions.is_empty() {
        anyhow::bail!("archive.supported_extensions must not be empty");
    }

    let d = &config.detection;
    if !(0.0..1.0).contains(&d.min_confidence) {
        anyhow::bail!("detection.min_confidence must be in [0.0, 1.0)");
    }
    if d.rollout_threshold <= d.min_confidence || d.rollout_threshold > 1.0 {
        anyhow::bail!("detection.rollout_threshold must be in (min_confidence, 1.0]");
    }
    if d.parser_timeout_secs == 0 {
        anyhow::bail!("detection.parser_timeout_secs must be > 0");
    }

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() && matches!(config.embedding.dims, None | Some(0)) {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    let c = &config.cache;
    if c.hit_rate_window == 0 || c.min_samples > c.hit_rate_window {
        anyhow::bail!("cache.min_samples must be <= cache.hit_rate_window (and the window > 0)");
    }
    if !(0.0..=1.0).contains(&c.hit_rate_threshold) {
        anyhow::bail!("cache.hit_rate_threshold must be in [0.0, 1.0]");
    }
    if c.stale_after_secs <= 0 || c.lock_ttl_secs <= 0 || c.eviction_interval_secs == 0 {
        anyhow::bail!("cache.stale_after_secs, lock_ttl_secs and eviction_interval_secs must be > 0");
    }

    let f = &config.fingerprint;
    if f.summary_max_chars == 0 {
        anyhow::bail!("fingerprint.summary_max_chars must be > 0");
    }
    for (name, v) in [
        ("min_relevance", f.min_relevance),
        ("relevance_threshold", f.relevance_threshold),
    ] {
        if !(0.0..=1.0).contains(&v) {
            anyhow::bail!("fingerprint.{} must be in [0.0, 1.0]", name);
        }
    }

    let r = &config.retrieval;
    if r.vector_weight < 0.0 || r.lexical_weight < 0.0 || r.vector_weight + r.lexical_weight <= 0.0
    {
        anyhow::bail!("retrieval weights must be >= 0 and not both zero");
    }
    if r.final_limit == 0 || r.candidate_k < 1 {
        anyhow::bail!("retrieval.final_limit and candidate_k must be >= 1");
    }
    if r.latency_multiplier <= 1.0 {
        anyhow::bail!("retrieval.latency_multiplier must be > 1.0");
    }
    if r.sustained_window == 0 || r.baseline_window == 0 {
        anyhow::bail!("retrieval.sustained_window and baseline_window must be > 0");
    }

    Ok(())
}
