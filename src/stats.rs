//! Database statistics and pipeline health overview.
//!
//! Summarizes jobs by status, guardrail outcomes, detected platforms,
//! embedding coverage, cache state and fingerprint status. Used by
//! `ihx stats` to confirm uploads flow through every stage.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Per-tenant breakdown of jobs, chunks and embeddings.
struct TenantStats {
    tenant_id: String,
    job_count: i64,
    chunk_count: i64,
    embedded_count: i64,
    last_job_ts: Option<i64>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingestion_jobs")
        .fetch_one(&pool)
        .await?;
    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;
    let total_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(&pool)
        .await?;
    let cache_entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
        .fetch_one(&pool)
        .await?;
    let queue_depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM eviction_queue")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Incident Harness: Database Stats");
    println!("================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Jobs:        {}", total_jobs);
    print_counts(&pool, "SELECT status AS k, COUNT(*) AS n FROM ingestion_jobs GROUP BY status ORDER BY n DESC").await?;
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );
    println!(
        "  Cache:       {} entries, {} tenant(s) queued for eviction",
        cache_entries, queue_depth
    );

    println!();
    println!("  Guardrails:");
    print_counts(&pool, "SELECT status AS k, COUNT(*) AS n FROM archive_audits GROUP BY status ORDER BY n DESC").await?;
    println!("  Platforms:");
    print_counts(&pool, "SELECT platform AS k, COUNT(*) AS n FROM detection_results GROUP BY platform ORDER BY n DESC").await?;
    println!("  Fingerprints:");
    print_counts(&pool, "SELECT status AS k, COUNT(*) AS n FROM incident_fingerprints GROUP BY status ORDER BY n DESC").await?;

    // Per-tenant breakdown
    let tenant_rows = sqlx::query(
        r#"
        SELECT
            j.tenant_id,
            COUNT(DISTINCT j.id) AS job_count,
            COUNT(DISTINCT c.id) AS chunk_count,
            COUNT(DISTINCT cv.chunk_id) AS embedded_count,
            MAX(j.created_at) AS last_job_ts
        FROM ingestion_jobs j
        LEFT JOIN chunks c ON c.session_id = j.id
        LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
        GROUP BY j.tenant_id
        ORDER BY job_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let tenant_stats: Vec<TenantStats> = tenant_rows
        .iter()
        .map(|row| TenantStats {
            tenant_id: row.get("tenant_id"),
            job_count: row.get("job_count"),
            chunk_count: row.get("chunk_count"),
            embedded_count: row.get("embedded_count"),
            last_job_ts: row.get("last_job_ts"),
        })
        .collect();

    if !tenant_stats.is_empty() {
        println!();
        println!("  By tenant:");
        println!(
            "  {:<24} {:>6} {:>8} {:>10}   {}",
            "TENANT", "JOBS", "CHUNKS", "EMBEDDED", "LAST UPLOAD"
        );
        println!("  {}", "-".repeat(76));

        for s in &tenant_stats {
            let last = match s.last_job_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>6} {:>8} {:>10}   {}",
                s.tenant_id, s.job_count, s.chunk_count, s.embedded_count, last
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Print `k: n` rows of a two-column grouping query, indented.
async fn print_counts(pool: &SqlitePool, sql: &str) -> Result<()> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    if rows.is_empty() {
        println!("    (none)");
    }
    for row in &rows {
        let key: String = row.get("k");
        let n: i64 = row.get("n");
        println!("    {:<20} {}", key, n);
    }
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now ("3 hours ago"); older than a
/// month falls back to a calendar date.
fn format_ts_relative(ts: i64) -> String {
    relative_to(chrono::Utc::now().timestamp(), ts)
}

fn relative_to(now: i64, ts: i64) -> String {
    let delta = now - ts;
    let plural = |n: i64, unit: &str| format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" });

    match delta {
        d if d < 0 || d >= 86400 * 30 => chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| ts.to_string()),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => plural(d / 60, "min"),
        d if d < 86400 => plural(d / 3600, "hour"),
        d => plural(d / 86400, "day"),
    }
}
