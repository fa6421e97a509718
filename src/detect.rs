//! Detection orchestration: score, gate, parse, persist.
//!
//! Scoring lives in `incident_harness_core::detection`; this module runs the
//! chosen parser on the blocking pool under a timeout and writes the
//! immutable `detection_results` row together with the flag snapshot that
//! produced it.

use anyhow::Result;
use incident_harness_core::detection::{detect, Decision, DETECTION_METHOD};
use incident_harness_core::models::{Entity, FlagSnapshot, Platform};
use incident_harness_core::parsers::ParserRegistry;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db;
use crate::telemetry::Telemetry;

/// A stored `detection_results` row.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub job_id: String,
    pub tenant_id: String,
    pub platform: Platform,
    pub confidence: f64,
    pub method: String,
    pub parser_executed: bool,
    pub parser_version: Option<String>,
    pub entities: Vec<Entity>,
    pub warnings: Vec<String>,
    pub flags: FlagSnapshot,
    pub scores: serde_json::Value,
    pub created_at: i64,
}

impl DetectionRecord {
    pub async fn for_job(pool: &SqlitePool, job_id: &str) -> Result<Option<DetectionRecord>> {
        let row = sqlx::query(
            "SELECT job_id, tenant_id, platform, confidence, method, parser_executed, \
             parser_version, entities_json, warnings_json, flags_json, scores_json, created_at \
             FROM detection_results WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let platform: String = row.get("platform");
        let entities_json: String = row.get("entities_json");
        let warnings_json: String = row.get("warnings_json");
        let flags_json: String = row.get("flags_json");
        let scores_json: String = row.get("scores_json");

        Ok(Some(DetectionRecord {
            job_id: row.get("job_id"),
            tenant_id: row.get("tenant_id"),
            platform: platform.parse()?,
            confidence: row.get("confidence"),
            method: row.get("method"),
            parser_executed: row.get::<i64, _>("parser_executed") != 0,
            parser_version: row.get("parser_version"),
            entities: serde_json::from_str(&entities_json)?,
            warnings: serde_json::from_str(&warnings_json)?,
            flags: serde_json::from_str(&flags_json)?,
            scores: serde_json::from_str(&scores_json)?,
            created_at: row.get("created_at"),
        }))
    }
}

/// Whether [`PlatformDetector::run`] wrote a new row or found one.
#[derive(Debug, Clone)]
pub struct DetectionRun {
    pub record: DetectionRecord,
    pub inserted: bool,
}

pub struct PlatformDetector {
    pool: SqlitePool,
    parsers: Arc<ParserRegistry>,
    telemetry: Arc<Telemetry>,
    parser_timeout: Duration,
}

impl PlatformDetector {
    pub fn new(
        pool: SqlitePool,
        parsers: Arc<ParserRegistry>,
        telemetry: Arc<Telemetry>,
        parser_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            parsers,
            telemetry,
            parser_timeout,
        }
    }

    /// Detect the platform of `content`, run its parser when the decision
    /// allows, and store the result. Parser failures become warnings.
    pub async fn run(
        &self,
        job_id: &str,
        tenant_id: &str,
        filename: &str,
        content: Arc<str>,
        flags: &FlagSnapshot,
    ) -> Result<DetectionRun> {
        let start = Instant::now();
        let detection = detect(filename, &content, flags);
        let platform = detection.platform;

        let mut entities = Vec::new();
        let mut warnings = Vec::new();
        let mut parser_version = None;
        let mut parser_executed = false;
        let mut parser_duration = None;

        let outcome = match detection.decision {
            Decision::Unknown => "unknown",
            Decision::LabelOnly => "label_only",
            Decision::RunParser => match self.parsers.get(platform).map(|p| p.version()) {
                None => {
                    warnings.push(format!("no parser registered for {}", platform));
                    "no_parser"
                }
                Some(version) => {
                    let parsers = self.parsers.clone();
                    let input = content.clone();
                    let task = tokio::task::spawn_blocking(move || {
                        parsers.get(platform).map(|p| p.parse(&input))
                    });
                    // a timed-out parser thread cannot be stopped; its result is dropped
                    match tokio::time::timeout(self.parser_timeout, task).await {
                        Ok(Ok(Some(result))) => {
                            parser_duration = Some(result.duration);
                            match result.error {
                                None => {
                                    entities = result.entities;
                                    warnings.extend(result.warnings);
                                    parser_version = Some(version.to_string());
                                    parser_executed = true;
                                    "parsed"
                                }
                                Some(err) => {
                                    tracing::warn!(job_id, %platform, error = %err, "parser failed");
                                    warnings.push(format!("parser error: {}", err));
                                    "parser_error"
                                }
                            }
                        }
                        Ok(Ok(None)) => {
                            warnings.push(format!("no parser registered for {}", platform));
                            "no_parser"
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(job_id, %platform, error = %e, "parser panicked");
                            warnings.push(format!("parser error: {}", e));
                            "parser_error"
                        }
                        Err(_) => {
                            tracing::warn!(
                                job_id,
                                %platform,
                                timeout_secs = self.parser_timeout.as_secs(),
                                "parser timed out"
                            );
                            warnings.push(format!(
                                "parser timed out after {}s",
                                self.parser_timeout.as_secs()
                            ));
                            "parser_timeout"
                        }
                    }
                }
            },
        };

        let parser_executed = parser_executed && detection.confidence >= flags.rollout_threshold;
        let record = DetectionRecord {
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            platform,
            confidence: detection.confidence,
            method: DETECTION_METHOD.to_string(),
            parser_executed,
            parser_version,
            entities,
            warnings,
            flags: flags.clone(),
            scores: serde_json::to_value(&detection.scores)?,
            created_at: db::now_ts(),
        };

        let inserted = self.insert(&record).await?;
        self.telemetry.detection(
            tenant_id,
            platform.as_str(),
            outcome,
            start.elapsed(),
            parser_duration,
        );
        tracing::info!(
            job_id,
            %platform,
            confidence = detection.confidence,
            outcome,
            parser_ms = parser_duration.map(|d| d.as_millis() as u64),
            entities = record.entities.len(),
            "detection complete"
        );

        if inserted {
            Ok(DetectionRun {
                record,
                inserted: true,
            })
        } else {
            let existing = DetectionRecord::for_job(&self.pool, job_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("detection result for {} vanished", job_id))?;
            Ok(DetectionRun {
                record: existing,
                inserted: false,
            })
        }
    }

    async fn insert(&self, r: &DetectionRecord) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO detection_results
                (job_id, tenant_id, platform, confidence, method, parser_executed,
                 parser_version, entities_json, warnings_json, flags_json,
                 rollout_threshold, scores_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO NOTHING
            "#,
        )
        .bind(&r.job_id)
        .bind(&r.tenant_id)
        .bind(r.platform.as_str())
        .bind(r.confidence)
        .bind(&r.method)
        .bind(r.parser_executed as i64)
        .bind(&r.parser_version)
        .bind(serde_json::to_string(&r.entities)?)
        .bind(serde_json::to_string(&r.warnings)?)
        .bind(serde_json::to_string(&r.flags)?)
        .bind(r.flags.rollout_threshold)
        .bind(serde_json::to_string(&r.scores)?)
        .bind(r.created_at)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::migrate;
    use crate::telemetry::MemorySink;
    use incident_harness_core::parsers::{Extraction, PlatformParser};
    use tempfile::TempDir;

    const UIPATH_LOG: &str = r#"{"message":"Execution started","level":"Information","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c","fileName":"Main.xaml"}
{"message":"UiPath.Core.Activities.Click: Cannot find the UI element corresponding to this selector","level":"Error","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c"}
"#;

    struct Stuck;

    impl PlatformParser for Stuck {
        fn platform(&self) -> Platform {
            Platform::UiPath
        }
        fn version(&self) -> &'static str {
            "stuck-0"
        }
        fn extract(&self, _content: &str) -> Result<Extraction> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Extraction::default())
        }
    }

    struct Broken;

    impl PlatformParser for Broken {
        fn platform(&self) -> Platform {
            Platform::UiPath
        }
        fn version(&self) -> &'static str {
            "broken-0"
        }
        fn extract(&self, _content: &str) -> Result<Extraction> {
            anyhow::bail!("unexpected token at line 1")
        }
    }

    async fn setup(
        parsers: ParserRegistry,
        timeout: Duration,
    ) -> (TempDir, PlatformDetector, Arc<Telemetry>, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("ihx.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        let telemetry = Arc::new(Telemetry::new(Arc::new(MemorySink::default())).unwrap());
        let detector =
            PlatformDetector::new(pool.clone(), Arc::new(parsers), telemetry.clone(), timeout);
        (tmp, detector, telemetry, pool)
    }

    #[tokio::test]
    async fn confident_uipath_runs_parser_with_entities() {
        let (_tmp, detector, telemetry, pool) =
            setup(ParserRegistry::with_builtins(), Duration::from_secs(5)).await;
        let run = detector
            .run("job-1", "acme", "Robot.log", Arc::from(UIPATH_LOG), &FlagSnapshot::default())
            .await
            .unwrap();
        assert!(run.inserted);
        let r = &run.record;
        assert_eq!(r.platform, Platform::UiPath);
        assert!(r.confidence >= 0.70);
        assert!(r.parser_executed);
        assert!(r.parser_version.is_some());
        assert!(!r.entities.is_empty());

        let stored = DetectionRecord::for_job(&pool, "job-1").await.unwrap().unwrap();
        assert_eq!(stored.entities, r.entities);
        assert_eq!(stored.flags, FlagSnapshot::default());
        assert_eq!(
            telemetry.metrics.detection_count("acme", "uipath", "parsed"),
            1.0
        );
        assert_eq!(telemetry.metrics.parser_observations("uipath"), 1);
    }

    #[tokio::test]
    async fn raised_threshold_labels_without_parsing() {
        let (_tmp, detector, _t, _pool) =
            setup(ParserRegistry::with_builtins(), Duration::from_secs(5)).await;
        let flags = FlagSnapshot {
            rollout_threshold: 1.0,
            ..FlagSnapshot::default()
        };
        let run = detector
            .run("job-2", "acme", "Robot.log", Arc::from(UIPATH_LOG), &flags)
            .await
            .unwrap();
        assert_eq!(run.record.platform, Platform::UiPath);
        assert!(!run.record.parser_executed);
        assert!(run.record.entities.is_empty());
    }

    #[tokio::test]
    async fn parser_error_becomes_warning() {
        let mut parsers = ParserRegistry::new();
        parsers.register(Box::new(Broken));
        let (_tmp, detector, _t, _pool) = setup(parsers, Duration::from_secs(5)).await;
        let run = detector
            .run("job-3", "acme", "Robot.log", Arc::from(UIPATH_LOG), &FlagSnapshot::default())
            .await
            .unwrap();
        assert!(!run.record.parser_executed);
        assert!(run.record.warnings[0].contains("unexpected token"));
    }

    #[tokio::test]
    async fn parser_timeout_becomes_warning() {
        let mut parsers = ParserRegistry::new();
        parsers.register(Box::new(Stuck));
        let (_tmp, detector, telemetry, _pool) = setup(parsers, Duration::from_millis(50)).await;
        let run = detector
            .run("job-4", "acme", "Robot.log", Arc::from(UIPATH_LOG), &FlagSnapshot::default())
            .await
            .unwrap();
        assert!(!run.record.parser_executed);
        assert!(run.record.warnings[0].contains("timed out"));
        assert_eq!(
            telemetry
                .metrics
                .detection_count("acme", "uipath", "parser_timeout"),
            1.0
        );
        assert_eq!(telemetry.metrics.parser_observations("uipath"), 0);
    }

    #[tokio::test]
    async fn results_are_written_once() {
        let (_tmp, detector, _t, _pool) =
            setup(ParserRegistry::with_builtins(), Duration::from_secs(5)).await;
        let first = detector
            .run("job-5", "acme", "notes.txt", Arc::from("nothing here"), &FlagSnapshot::default())
            .await
            .unwrap();
        assert!(first.inserted);
        assert_eq!(first.record.platform, Platform::Unknown);

        let second = detector
            .run("job-5", "acme", "Robot.log", Arc::from(UIPATH_LOG), &FlagSnapshot::default())
            .await
            .unwrap();
        assert!(!second.inserted);
        assert_eq!(second.record.platform, Platform::Unknown);
    }
}
