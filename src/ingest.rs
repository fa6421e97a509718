//! Upload ingestion pipeline.
//!
//! One upload becomes one ingestion job (the job id doubles as the analysis
//! session id):
//!
//! ```text
//! upload ──► extract (guardrails) ──► detect + parse ──► chunk ──► embed (cached)
//!                  │                                                    │
//!                  └── blocked/error: job needs_review/failed           └──► fingerprint (async)
//! ```
//!
//! Guardrail trips end the job early with a recorded reason; detection,
//! embedding and fingerprint failures degrade the result but never fail it.

use anyhow::{Context, Result};
use incident_harness_core::chunk::chunk_lines;
use incident_harness_core::embedding::vec_to_blob;
use incident_harness_core::models::{ArchiveType, Chunk, GuardrailStatus, JobStatus};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::archive::{ArchiveAudit, ExtractedMember};
use crate::cache::CacheOutcome;
use crate::config::Config;
use crate::db;
use crate::detect::DetectionRecord;
use crate::embedding::embed_one;
use crate::error::{HarnessError, HarnessResult};
use crate::harness::Harness;

/// Review reason for a passed extraction that kept nothing.
pub const NO_SUPPORTED_MEMBERS: &str = "no_supported_members";

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub job_id: String,
    pub tenant_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub review_reason: Option<String>,
    pub archive: ArchiveAudit,
    pub detection: Option<DetectionRecord>,
    pub chunks: usize,
    pub embedded: usize,
    pub cache_hits: usize,
}

/// Run one upload through the pipeline.
///
/// Returns the report and, for completed jobs, the handle of the background
/// fingerprint task. Callers that exit right away (the CLI) should await it.
pub async fn ingest<R>(
    h: &Harness,
    tenant_id: &str,
    filename: &str,
    declared: Option<ArchiveType>,
    reader: R,
    compressed_size: u64,
) -> Result<(IngestReport, Option<JoinHandle<()>>)>
where
    R: Read + Send + 'static,
{
    let flags = h.config.flags();
    let job_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO ingestion_jobs (id, tenant_id, filename, status, created_at) \
         VALUES (?, ?, ?, 'running', ?)",
    )
    .bind(&job_id)
    .bind(tenant_id)
    .bind(filename)
    .bind(db::now_ts())
    .execute(&h.pool)
    .await?;

    let outcome = h
        .extractor
        .extract(&job_id, tenant_id, filename, declared, reader, compressed_size)
        .await?;

    let mut report = IngestReport {
        job_id: job_id.clone(),
        tenant_id: tenant_id.to_string(),
        filename: filename.to_string(),
        status: JobStatus::Running,
        review_reason: None,
        archive: outcome.audit,
        detection: None,
        chunks: 0,
        embedded: 0,
        cache_hits: 0,
    };

    if report.archive.status != GuardrailStatus::Passed || outcome.members.is_empty() {
        let (status, reason) = match report.archive.status {
            GuardrailStatus::Error => (
                JobStatus::Failed,
                report
                    .archive
                    .blocked_reason
                    .clone()
                    .unwrap_or_else(|| "error".to_string()),
            ),
            GuardrailStatus::Passed => (JobStatus::NeedsReview, NO_SUPPORTED_MEMBERS.to_string()),
            other => (
                JobStatus::NeedsReview,
                report
                    .archive
                    .blocked_reason
                    .clone()
                    .unwrap_or_else(|| other.as_str().to_string()),
            ),
        };
        finish_job(&h.pool, &job_id, status, Some(&reason), None).await?;
        tracing::warn!(
            job_id = %job_id,
            tenant_id,
            status = status.as_str(),
            reason = %reason,
            "ingestion stopped before detection"
        );
        report.status = status;
        report.review_reason = Some(reason);
        return Ok((report, None));
    }

    let detect_name = outcome
        .members
        .first()
        .map(|m| m.name.clone())
        .unwrap_or_else(|| filename.to_string());
    let content: Arc<str> = Arc::from(combine_members(&outcome.members));

    let detection = h
        .detector
        .run(&job_id, tenant_id, &detect_name, content.clone(), &flags)
        .await?
        .record;

    let chunks = chunk_lines(&job_id, &content, h.config.chunking.max_tokens);
    store_chunks(&h.pool, tenant_id, &chunks).await?;
    let (embedded, cache_hits) = embed_chunks(h, tenant_id, &chunks).await;

    let raw = (!detection.parser_executed).then_some(&*content);
    finish_job(&h.pool, &job_id, JobStatus::Completed, None, raw).await?;

    tracing::info!(
        job_id = %job_id,
        tenant_id,
        platform = %detection.platform,
        chunks = chunks.len(),
        embedded,
        "ingestion completed"
    );

    let handle = h.fingerprints.spawn_index(
        job_id.clone(),
        tenant_id.to_string(),
        detection.clone(),
        content,
    );

    report.status = JobStatus::Completed;
    report.detection = Some(detection);
    report.chunks = chunks.len();
    report.embedded = embedded;
    report.cache_hits = cache_hits;
    Ok((report, Some(handle)))
}

/// Join kept members, with a `==> name <==` header per member when there
/// are several.
fn combine_members(members: &[ExtractedMember]) -> String {
    if let [only] = members {
        return only.content.clone();
    }
    let mut out = String::new();
    for member in members {
        out.push_str("==> ");
        out.push_str(&member.name);
        out.push_str(" <==\n");
        out.push_str(&member.content);
        if !member.content.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

async fn finish_job(
    pool: &SqlitePool,
    job_id: &str,
    status: JobStatus,
    review_reason: Option<&str>,
    raw_content: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE ingestion_jobs SET status = ?, review_reason = ?, raw_content = ?, \
         completed_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(review_reason)
    .bind(raw_content)
    .bind(db::now_ts())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn store_chunks(pool: &SqlitePool, tenant_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, tenant_id, session_id, chunk_index, text, line_start, \
             line_end, hash) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(tenant_id)
        .bind(&chunk.session_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.lines.start as i64)
        .bind(chunk.lines.end as i64)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO chunks_fts (chunk_id, tenant_id, session_id, text) VALUES (?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(tenant_id)
        .bind(&chunk.session_id)
        .bind(&chunk.text)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Embed every chunk through the cache. Failures are logged and skipped;
/// returns `(embedded, cache_hits)`.
async fn embed_chunks(h: &Harness, tenant_id: &str, chunks: &[Chunk]) -> (usize, usize) {
    if !h.embedder.is_enabled() {
        return (0, 0);
    }
    let model = h.embedder.model_name().to_string();
    let mut embedded = 0;
    let mut hits = 0;

    for chunk in chunks {
        let cached = h
            .cache
            .get_or_compute(tenant_id, &chunk.hash, &model, || {
                embed_one(h.embedder.as_ref(), &chunk.text)
            })
            .await;
        let cached = match cached {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(chunk_id = %chunk.id, error = %e, "chunk embedding failed");
                continue;
            }
        };

        let res = sqlx::query(
            "INSERT OR REPLACE INTO chunk_vectors (chunk_id, tenant_id, model, vector) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(tenant_id)
        .bind(&model)
        .bind(vec_to_blob(&cached.vector))
        .execute(&h.pool)
        .await;
        match res {
            Ok(_) => {
                embedded += 1;
                if cached.outcome == CacheOutcome::Hit {
                    hits += 1;
                }
            }
            Err(e) => tracing::warn!(chunk_id = %chunk.id, error = %e, "storing chunk vector failed"),
        }
    }
    (embedded, hits)
}

/// Outcome of re-running detection over a stored job.
#[derive(Debug, Clone, Serialize)]
pub struct ReprocessReport {
    pub job_id: String,
    /// `false` when a detection result already existed and was kept.
    pub inserted: bool,
    pub detection: DetectionRecord,
}

/// Re-run detection for a job from its preserved raw content. Detection
/// results are immutable, so an existing row is returned unchanged.
pub async fn reprocess(h: &Harness, job_id: &str) -> HarnessResult<ReprocessReport> {
    let row = sqlx::query(
        "SELECT tenant_id, filename, status, raw_content FROM ingestion_jobs WHERE id = ?",
    )
    .bind(job_id)
    .fetch_optional(&h.pool)
    .await?
    .ok_or_else(|| HarnessError::NotFound(format!("job {}", job_id)))?;

    let tenant_id: String = row.get("tenant_id");
    let filename: String = row.get("filename");
    let status: String = row.get("status");
    let raw: Option<String> = row.get("raw_content");
    let Some(raw) = raw else {
        return Err(HarnessError::InvalidInput(format!(
            "job {} ({}) has no preserved raw content",
            job_id, status
        )));
    };

    let content: Arc<str> = Arc::from(raw);
    let run = h
        .detector
        .run(job_id, &tenant_id, &filename, content.clone(), &h.config.flags())
        .await?;

    if run.inserted && h.fingerprints.get(job_id).await?.is_none() {
        h.fingerprints
            .index(job_id, &tenant_id, &run.record, &content)
            .await?;
    }

    Ok(ReprocessReport {
        job_id: job_id.to_string(),
        inserted: run.inserted,
        detection: run.record,
    })
}

/// `ihx ingest <path>`: run one file through the pipeline and print the report.
pub async fn run_ingest(
    config: &Config,
    path: &Path,
    tenant_id: &str,
    declared: Option<ArchiveType>,
) -> Result<()> {
    let h = Harness::open(config).await?;
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open upload: {}", path.display()))?;
    let size = file.metadata()?.len();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let (report, handle) = ingest(&h, tenant_id, &filename, declared, file, size).await?;
    if let Some(handle) = handle {
        let _ = handle.await;
    }

    println!("job {}", report.job_id);
    println!("  status: {}", report.status.as_str());
    if let Some(reason) = &report.review_reason {
        println!("  review reason: {}", reason);
    }
    println!(
        "  archive: {} ({}), {} member(s), ratio {:.1}",
        report
            .archive
            .archive_type
            .map(|t| t.as_str())
            .unwrap_or("unknown"),
        report.archive.status,
        report.archive.member_count,
        report.archive.decompression_ratio
    );
    if let Some(d) = &report.detection {
        println!(
            "  platform: {} (confidence {:.2}, parser {})",
            d.platform,
            d.confidence,
            if d.parser_executed { "ran" } else { "skipped" }
        );
        println!("  entities: {}", d.entities.len());
        for w in &d.warnings {
            println!("  warning: {}", w);
        }
    }
    println!("  chunks: {}", report.chunks);
    if h.embedder.is_enabled() {
        println!("  embedded: {} ({} cache hits)", report.embedded, report.cache_hits);
    }

    h.close().await;
    Ok(())
}

/// `ihx reprocess <job-id>`.
pub async fn run_reprocess(config: &Config, job_id: &str) -> Result<()> {
    let h = Harness::open(config).await?;
    let report = reprocess(&h, job_id).await?;

    println!("job {}", report.job_id);
    println!(
        "  detection: {} (confidence {:.2})",
        report.detection.platform, report.detection.confidence
    );
    if report.inserted {
        println!("  result: new detection result written");
    } else {
        println!("  result: existing detection result kept");
    }

    h.close().await;
    Ok(())
}
