use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for stmt in TABLES {
        sqlx::query(stmt).execute(pool).await?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                tenant_id UNINDEXED,
                session_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for stmt in INDEXES {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ingestion_jobs (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        status TEXT NOT NULL
            CHECK (status IN ('running', 'completed', 'needs_review', 'failed')),
        review_reason TEXT,
        raw_content TEXT,
        created_at INTEGER NOT NULL,
        completed_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS archive_audits (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        source_filename TEXT NOT NULL,
        archive_type TEXT,
        member_count INTEGER NOT NULL DEFAULT 0,
        compressed_size INTEGER NOT NULL,
        uncompressed_size INTEGER NOT NULL DEFAULT 0,
        decompression_ratio REAL NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        blocked_reason TEXT,
        members_json TEXT NOT NULL DEFAULT '[]',
        started_at INTEGER NOT NULL,
        finished_at INTEGER,
        CHECK (status NOT LIKE 'blocked_%' OR blocked_reason IS NOT NULL)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS detection_results (
        job_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        platform TEXT NOT NULL,
        confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
        method TEXT NOT NULL,
        parser_executed INTEGER NOT NULL,
        parser_version TEXT,
        entities_json TEXT NOT NULL DEFAULT '[]',
        warnings_json TEXT NOT NULL DEFAULT '[]',
        flags_json TEXT NOT NULL,
        rollout_threshold REAL NOT NULL,
        scores_json TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        CHECK (parser_executed = 0 OR confidence >= rollout_threshold)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        model TEXT NOT NULL,
        dims INTEGER NOT NULL,
        vector BLOB NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embedding_cache (
        tenant_id TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        model TEXT NOT NULL,
        embedding_id TEXT NOT NULL,
        hit_count INTEGER NOT NULL DEFAULT 0,
        last_accessed_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER,
        state TEXT NOT NULL DEFAULT 'active' CHECK (state IN ('active', 'evicting')),
        PRIMARY KEY (tenant_id, content_hash, model)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS eviction_queue (
        tenant_id TEXT PRIMARY KEY,
        hit_rate REAL NOT NULL,
        enqueued_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS eviction_locks (
        tenant_id TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        text TEXT NOT NULL,
        line_start INTEGER NOT NULL,
        line_end INTEGER NOT NULL,
        hash TEXT NOT NULL,
        UNIQUE (session_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunk_vectors (
        chunk_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        model TEXT NOT NULL,
        vector BLOB NOT NULL,
        FOREIGN KEY (chunk_id) REFERENCES chunks(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS incident_fingerprints (
        session_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        vector BLOB,
        summary TEXT NOT NULL,
        relevance_threshold REAL NOT NULL,
        visibility TEXT NOT NULL CHECK (visibility IN ('tenant_only', 'multi_tenant')),
        status TEXT NOT NULL CHECK (status IN ('available', 'degraded', 'missing')),
        safeguard_notes TEXT NOT NULL DEFAULT '[]',
        platform TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK ((status = 'available') = (vector IS NOT NULL))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analyst_audit_events (
        id TEXT PRIMARY KEY,
        analyst_id TEXT NOT NULL,
        source_workspace TEXT NOT NULL,
        related_workspace TEXT NOT NULL,
        source_session_id TEXT,
        related_session_id TEXT NOT NULL,
        action TEXT NOT NULL,
        audit_token TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        CHECK (source_workspace <> related_workspace)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS retrieval_tenant_state (
        tenant_id TEXT PRIMARY KEY,
        state TEXT NOT NULL CHECK (state IN ('enabled', 'monitoring', 'auto_disabled')),
        updated_at INTEGER NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON ingestion_jobs(tenant_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_audits_job ON archive_audits(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_cache_staleness ON embedding_cache(tenant_id, state, last_accessed_at)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_session ON chunks(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_tenant ON chunk_vectors(tenant_id)",
    "CREATE INDEX IF NOT EXISTS idx_fingerprints_tenant ON incident_fingerprints(tenant_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_audit_events_token ON analyst_audit_events(audit_token)",
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("data/ihx.sqlite"));
        run_migrations(&config).await.unwrap();
        run_migrations(&config).await.unwrap();

        let pool = db::connect(&config).await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('archive_audits', 'detection_results', 'embedding_cache', 'incident_fingerprints', \
              'analyst_audit_events', 'chunks_fts')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 6);
    }

    #[tokio::test]
    async fn parser_executed_requires_threshold() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("ihx.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        apply(&pool).await.unwrap();

        let res = sqlx::query(
            "INSERT INTO detection_results (job_id, tenant_id, platform, confidence, method, \
             parser_executed, flags_json, rollout_threshold, created_at) \
             VALUES ('j', 't', 'uipath', 0.5, 'signature_v1', 1, '{}', 0.7, 0)",
        )
        .execute(&pool)
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn audit_events_reject_same_workspace() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("ihx.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        apply(&pool).await.unwrap();

        let res = sqlx::query(
            "INSERT INTO analyst_audit_events (id, analyst_id, source_workspace, \
             related_workspace, related_session_id, action, audit_token, created_at) \
             VALUES ('e', 'a', 'acme', 'acme', 's', 'view', 'tok', 0)",
        )
        .execute(&pool)
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn size_cap_status_requires_reason() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("ihx.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        apply(&pool).await.unwrap();

        let insert = "INSERT INTO archive_audits (id, job_id, tenant_id, source_filename, \
                      compressed_size, status, blocked_reason, started_at) \
                      VALUES (?, 'j', 't', 'big.log', 10, 'blocked_size', ?, 0)";
        let missing = sqlx::query(insert)
            .bind("a1")
            .bind(None::<String>)
            .execute(&pool)
            .await;
        assert!(missing.is_err());

        sqlx::query(insert)
            .bind("a2")
            .bind("size_cap")
            .execute(&pool)
            .await
            .unwrap();
    }
}
