//! Outcome records and Prometheus metrics for the ingestion and query paths.
//!
//! Every extraction, detection, cache lookup and retrieval produces an
//! [`OutcomeRecord`] that goes to a [`TelemetrySink`] and updates the
//! matching [`PipelineMetrics`] family.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `detection_total` | Counter | `tenant`, `platform`, `outcome` |
//! | `archive_guardrail_total` | Counter | `tenant`, `archive_type`, `status` |
//! | `cache_lookups_total` | Counter | `tenant`, `outcome` |
//! | `retrieval_queries_total` | Counter | `tenant`, `mode` |
//! | `detection_duration_seconds` | Histogram | `platform` |
//! | `parser_duration_seconds` | Histogram | `platform` |
//! | `decompression_ratio` | Histogram | `archive_type` |
//! | `member_count` | Histogram | `archive_type` |

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Longest label value kept; longer values are cut at a char boundary.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

const RATIO_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 1000.0];
const MEMBER_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 100.0, 1000.0, 10_000.0];

/// Structured outcome of one pipeline operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub stage: &'static str,
    pub status: String,
    pub duration: Duration,
    pub labels: BTreeMap<&'static str, String>,
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, outcome: &OutcomeRecord);
}

/// Logs every outcome through `tracing`.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, outcome: &OutcomeRecord) {
        tracing::debug!(
            stage = outcome.stage,
            status = %outcome.status,
            duration_ms = outcome.duration.as_millis() as u64,
            labels = ?outcome.labels,
            "outcome"
        );
    }
}

/// Keeps outcomes in memory; used by tests to assert on what was emitted.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<OutcomeRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<OutcomeRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, outcome: &OutcomeRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(outcome.clone());
        }
    }
}

#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    detection_total: CounterVec,
    archive_guardrail_total: CounterVec,
    cache_lookups_total: CounterVec,
    retrieval_queries_total: CounterVec,
    detection_duration: HistogramVec,
    parser_duration: HistogramVec,
    decompression_ratio: HistogramVec,
    member_count: HistogramVec,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let detection_total = CounterVec::new(
            Opts::new("detection_total", "Platform detections by outcome"),
            &["tenant", "platform", "outcome"],
        )?;
        registry.register(Box::new(detection_total.clone()))?;

        let archive_guardrail_total = CounterVec::new(
            Opts::new("archive_guardrail_total", "Archive extractions by guardrail status"),
            &["tenant", "archive_type", "status"],
        )?;
        registry.register(Box::new(archive_guardrail_total.clone()))?;

        let cache_lookups_total = CounterVec::new(
            Opts::new("cache_lookups_total", "Embedding cache lookups by outcome"),
            &["tenant", "outcome"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let retrieval_queries_total = CounterVec::new(
            Opts::new("retrieval_queries_total", "Chunk retrieval queries by mode"),
            &["tenant", "mode"],
        )?;
        registry.register(Box::new(retrieval_queries_total.clone()))?;

        let detection_duration = HistogramVec::new(
            HistogramOpts::new(
                "detection_duration_seconds",
                "Detection plus parser time per upload",
            ),
            &["platform"],
        )?;
        registry.register(Box::new(detection_duration.clone()))?;

        let parser_duration = HistogramVec::new(
            HistogramOpts::new("parser_duration_seconds", "Parser time per upload"),
            &["platform"],
        )?;
        registry.register(Box::new(parser_duration.clone()))?;

        let decompression_ratio = HistogramVec::new(
            HistogramOpts::new("decompression_ratio", "Uncompressed / compressed size")
                .buckets(RATIO_BUCKETS.to_vec()),
            &["archive_type"],
        )?;
        registry.register(Box::new(decompression_ratio.clone()))?;

        let member_count = HistogramVec::new(
            HistogramOpts::new("member_count", "Archive members seen per upload")
                .buckets(MEMBER_BUCKETS.to_vec()),
            &["archive_type"],
        )?;
        registry.register(Box::new(member_count.clone()))?;

        Ok(Self {
            registry,
            detection_total,
            archive_guardrail_total,
            cache_lookups_total,
            retrieval_queries_total,
            detection_duration,
            parser_duration,
            decompression_ratio,
            member_count,
        })
    }

    /// Prometheus text exposition of every family.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn detection_count(&self, tenant: &str, platform: &str, outcome: &str) -> f64 {
        self.detection_total
            .with_label_values(&[truncate_label(tenant), platform, outcome])
            .get()
    }

    pub fn parser_observations(&self, platform: &str) -> u64 {
        self.parser_duration
            .with_label_values(&[platform])
            .get_sample_count()
    }

    pub fn guardrail_count(&self, tenant: &str, archive_type: &str, status: &str) -> f64 {
        self.archive_guardrail_total
            .with_label_values(&[truncate_label(tenant), archive_type, status])
            .get()
    }

    pub fn cache_lookup_count(&self, tenant: &str, outcome: &str) -> f64 {
        self.cache_lookups_total
            .with_label_values(&[truncate_label(tenant), outcome])
            .get()
    }

    pub fn retrieval_count(&self, tenant: &str, mode: &str) -> f64 {
        self.retrieval_queries_total
            .with_label_values(&[truncate_label(tenant), mode])
            .get()
    }
}

/// Metrics plus the sink, shared by every component.
pub struct Telemetry {
    pub metrics: PipelineMetrics,
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Result<Self> {
        Ok(Self {
            metrics: PipelineMetrics::new()?,
            sink,
        })
    }

    pub fn archive(
        &self,
        tenant: &str,
        archive_type: &str,
        status: &str,
        ratio: f64,
        members: u64,
        duration: Duration,
    ) {
        let tenant = truncate_label(tenant);
        self.metrics
            .archive_guardrail_total
            .with_label_values(&[tenant, archive_type, status])
            .inc();
        self.metrics
            .decompression_ratio
            .with_label_values(&[archive_type])
            .observe(ratio);
        self.metrics
            .member_count
            .with_label_values(&[archive_type])
            .observe(members as f64);
        self.emit(
            "archive",
            status,
            duration,
            [("tenant", tenant), ("archive_type", archive_type)],
        );
    }

    /// `duration` covers scoring plus parsing; `parser` is the parser's own
    /// share when it ran to completion.
    pub fn detection(
        &self,
        tenant: &str,
        platform: &str,
        outcome: &str,
        duration: Duration,
        parser: Option<Duration>,
    ) {
        let tenant = truncate_label(tenant);
        self.metrics
            .detection_total
            .with_label_values(&[tenant, platform, outcome])
            .inc();
        self.metrics
            .detection_duration
            .with_label_values(&[platform])
            .observe(duration.as_secs_f64());
        match parser {
            Some(parser) => {
                self.metrics
                    .parser_duration
                    .with_label_values(&[platform])
                    .observe(parser.as_secs_f64());
                let parser_ms = parser.as_millis().to_string();
                self.emit(
                    "detection",
                    outcome,
                    duration,
                    [
                        ("tenant", tenant),
                        ("platform", platform),
                        ("parser_ms", parser_ms.as_str()),
                    ],
                );
            }
            None => self.emit(
                "detection",
                outcome,
                duration,
                [("tenant", tenant), ("platform", platform)],
            ),
        }
    }

    pub fn cache_lookup(&self, tenant: &str, outcome: &str, duration: Duration) {
        let tenant = truncate_label(tenant);
        self.metrics
            .cache_lookups_total
            .with_label_values(&[tenant, outcome])
            .inc();
        self.emit("cache", outcome, duration, [("tenant", tenant)]);
    }

    pub fn retrieval(&self, tenant: &str, mode: &str, duration: Duration) {
        let tenant = truncate_label(tenant);
        self.metrics
            .retrieval_queries_total
            .with_label_values(&[tenant, mode])
            .inc();
        self.emit("retrieval", mode, duration, [("tenant", tenant)]);
    }

    fn emit<const N: usize>(
        &self,
        stage: &'static str,
        status: &str,
        duration: Duration,
        labels: [(&'static str, &str); N],
    ) {
        self.sink.record(&OutcomeRecord {
            stage,
            status: status.to_string(),
            duration,
            labels: labels
                .into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
        });
    }
}

fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let mut end = MAX_LABEL_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_reach_sink_and_counters() {
        let sink = Arc::new(MemorySink::default());
        let telemetry = Telemetry::new(sink.clone()).unwrap();
        telemetry.archive("acme", "zip", "blocked_ratio", 250.0, 3, Duration::from_millis(4));
        telemetry.cache_lookup("acme", "hit", Duration::ZERO);

        assert_eq!(
            telemetry.metrics.guardrail_count("acme", "zip", "blocked_ratio"),
            1.0
        );
        assert_eq!(telemetry.metrics.cache_lookup_count("acme", "hit"), 1.0);

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, "archive");
        assert_eq!(records[0].status, "blocked_ratio");
        assert_eq!(records[0].labels["archive_type"], "zip");
    }

    #[test]
    fn encodes_all_families() {
        let telemetry = Telemetry::new(Arc::new(TracingSink)).unwrap();
        telemetry.detection(
            "acme",
            "uipath",
            "parsed",
            Duration::from_millis(12),
            Some(Duration::from_millis(9)),
        );
        telemetry.retrieval("acme", "hybrid", Duration::from_millis(3));
        let text = telemetry.metrics.encode_text().unwrap();
        assert!(text.contains("detection_total"));
        assert!(text.contains("detection_duration_seconds"));
        assert!(text.contains("parser_duration_seconds"));
        assert!(text.contains("retrieval_queries_total"));
    }

    #[test]
    fn parser_time_is_kept_apart_from_detection_time() {
        let sink = Arc::new(MemorySink::default());
        let telemetry = Telemetry::new(sink.clone()).unwrap();
        telemetry.detection("acme", "ansible", "label_only", Duration::from_millis(2), None);
        telemetry.detection(
            "acme",
            "uipath",
            "parsed",
            Duration::from_millis(40),
            Some(Duration::from_millis(31)),
        );

        assert_eq!(telemetry.metrics.parser_observations("ansible"), 0);
        assert_eq!(telemetry.metrics.parser_observations("uipath"), 1);
        let records = sink.records();
        assert!(!records[0].labels.contains_key("parser_ms"));
        assert_eq!(records[1].labels["parser_ms"], "31");
        assert_eq!(records[1].duration, Duration::from_millis(40));
    }

    #[test]
    fn long_labels_are_truncated() {
        let long = "é".repeat(40);
        let cut = truncate_label(&long);
        assert!(cut.len() <= MAX_LABEL_VALUE_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
