//! Job lookup by ID.
//!
//! Assembles one ingestion job with its archive audit, detection result and
//! fingerprint. Used by both `ihx job` and `GET /jobs/{job_id}`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::archive::ArchiveAudit;
use crate::config::Config;
use crate::detect::DetectionRecord;
use crate::error::{HarnessError, HarnessResult};
use crate::fingerprint::Fingerprint;
use crate::harness::Harness;

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub tenant_id: String,
    pub filename: String,
    pub status: String,
    pub review_reason: Option<String>,
    /// Whether raw content is preserved for `reprocess`.
    pub raw_preserved: bool,
    pub created_at: String, // ISO8601
    pub completed_at: Option<String>,
    pub archive: Option<ArchiveAudit>,
    pub detection: Option<DetectionRecord>,
    pub chunks: i64,
    pub fingerprint: Option<Fingerprint>,
}

/// Load a job. With `tenant` set, jobs of other tenants read as missing.
pub async fn get_job(h: &Harness, job_id: &str, tenant: Option<&str>) -> HarnessResult<JobView> {
    let pool = &h.pool;
    let row = sqlx::query(
        "SELECT id, tenant_id, filename, status, review_reason, raw_content IS NOT NULL AS raw_preserved, \
         created_at, completed_at FROM ingestion_jobs WHERE id = ?",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(row) => row,
        None => return Err(HarnessError::NotFound(format!("job {}", job_id))),
    };
    let tenant_id: String = row.get("tenant_id");
    if tenant.is_some_and(|t| t != tenant_id) {
        return Err(HarnessError::NotFound(format!("job {}", job_id)));
    }

    let created_at: i64 = row.get("created_at");
    let completed_at: Option<i64> = row.get("completed_at");

    Ok(JobView {
        id: row.get("id"),
        tenant_id,
        filename: row.get("filename"),
        status: row.get("status"),
        review_reason: row.get("review_reason"),
        raw_preserved: row.get::<i64, _>("raw_preserved") != 0,
        created_at: format_ts_iso(created_at),
        completed_at: completed_at.map(format_ts_iso),
        archive: ArchiveAudit::for_job(pool, job_id).await?,
        detection: DetectionRecord::for_job(pool, job_id).await?,
        chunks: chunk_count(pool, job_id).await?,
        fingerprint: h.fingerprints.get(job_id).await?,
    })
}

async fn chunk_count(pool: &SqlitePool, session_id: &str) -> Result<i64> {
    let n = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE session_id = ?")
        .bind(session_id)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// CLI entry point: calls get_job and prints to stdout.
pub async fn run_job(config: &Config, job_id: &str) -> Result<()> {
    let h = Harness::open(config).await?;
    let job = match get_job(&h, job_id, None).await {
        Ok(j) => j,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("--- Job ---");
    println!("id:           {}", job.id);
    println!("tenant:       {}", job.tenant_id);
    println!("filename:     {}", job.filename);
    println!("status:       {}", job.status);
    if let Some(ref reason) = job.review_reason {
        println!("review:       {}", reason);
    }
    println!("created_at:   {}", job.created_at);
    if let Some(ref done) = job.completed_at {
        println!("completed_at: {}", done);
    }
    println!("raw content:  {}", if job.raw_preserved { "preserved" } else { "-" });

    if let Some(ref a) = job.archive {
        println!();
        println!("--- Archive ---");
        println!(
            "type:         {}",
            a.archive_type.map(|t| t.as_str()).unwrap_or("-")
        );
        println!("status:       {}", a.status);
        if let Some(ref reason) = a.blocked_reason {
            println!("reason:       {}", reason);
        }
        println!("members:      {}", a.member_count);
        println!(
            "size:         {} -> {} bytes (ratio {:.1})",
            a.compressed_size, a.uncompressed_size, a.decompression_ratio
        );
    }

    if let Some(ref d) = job.detection {
        println!();
        println!("--- Detection ---");
        println!("platform:     {}", d.platform);
        println!("confidence:   {:.2} ({})", d.confidence, d.method);
        println!(
            "parser:       {}",
            match (&d.parser_version, d.parser_executed) {
                (Some(v), true) => v.as_str(),
                _ => "not executed",
            }
        );
        for e in &d.entities {
            println!("  [{}] {} ({})", e.entity_type, e.value, e.source);
        }
        for w in &d.warnings {
            println!("  warning: {}", w);
        }
    }

    println!();
    println!("chunks:       {}", job.chunks);
    match job.fingerprint {
        Some(ref fp) => println!(
            "fingerprint:  {} ({})",
            fp.status.as_str(),
            fp.visibility.as_str()
        ),
        None => println!("fingerprint:  -"),
    }

    h.close().await;
    Ok(())
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ingest;
    use crate::telemetry::MemorySink;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn job_view_is_tenant_scoped() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("ihx.sqlite"));
        let h = Harness::open_with_sink(&config, Arc::new(MemorySink::default()))
            .await
            .unwrap();
        let body = b"PLAY [web] ***\nTASK [ping] ***\nfatal: [web2]: UNREACHABLE!\n".to_vec();
        let size = body.len() as u64;
        let (report, handle) = ingest(&h, "acme", "deploy.log", None, Cursor::new(body), size)
            .await
            .unwrap();
        if let Some(handle) = handle {
            handle.await.unwrap();
        }

        let job = get_job(&h, &report.job_id, Some("acme")).await.unwrap();
        assert_eq!(job.status, "completed");
        assert!(job.archive.is_some());
        assert!(job.detection.is_some());
        assert!(job.chunks >= 1);

        let err = get_job(&h, &report.job_id, Some("globex")).await.unwrap_err();
        assert!(matches!(err, HarnessError::NotFound(_)));
    }

    #[test]
    fn iso_timestamps() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
    }
}
