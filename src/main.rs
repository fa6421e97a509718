//! # Incident Harness CLI (`ihx`)
//!
//! Commands for database initialization, guarded upload ingestion, job
//! inspection, incident search, chunk retrieval, cache maintenance and the
//! HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! ihx --config ./config/ihx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ihx init` | Create the SQLite database and run schema migrations |
//! | `ihx ingest <path> --tenant <t>` | Extract, detect, chunk and embed an upload |
//! | `ihx job <id>` | Show a job with its archive audit and detection result |
//! | `ihx reprocess <id>` | Re-run detection from preserved raw content |
//! | `ihx search "<query>"` | Rank similar incidents |
//! | `ihx related <session>` | Incidents related to an existing session |
//! | `ihx retrieve "<query>"` | Hybrid chunk retrieval with citations |
//! | `ihx cache evict` | Drain the eviction queue once |
//! | `ihx hybrid enable <tenant>` | Re-enable hybrid retrieval for a tenant |
//! | `ihx stats` | Database and pipeline overview |
//! | `ihx serve` | Start the HTTP server |
//!
//! Logs go to stderr (`RUST_LOG`, default `incident_harness=info`); command
//! output goes to stdout.

use clap::{Parser, Subcommand};
use incident_harness::search::SearchFilters;
use incident_harness::{cache, config, ingest, jobs, migrate, search, server, stats};
use incident_harness_core::models::{ArchiveType, Platform, VisibilityScope};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Incident Harness CLI: safe ingestion, platform detection and
/// similar-incident search for automation diagnostics.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ihx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ihx",
    about = "Incident Harness: safe ingestion, platform detection and similar-incident search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ihx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest one upload (archive, compressed stream or plain log).
    Ingest {
        /// File to ingest.
        path: PathBuf,

        /// Tenant (workspace) that owns the upload.
        #[arg(long)]
        tenant: String,

        /// Declared container type (`zip`, `tar`, `tar_gz`, `gzip`, ...).
        /// Otherwise resolved from the extension, then magic bytes.
        #[arg(long = "type", value_parser = parse_archive_type)]
        archive_type: Option<ArchiveType>,
    },

    /// Show a job with its archive audit, detection result and fingerprint.
    Job {
        /// Job (session) UUID.
        id: String,
    },

    /// Re-run detection for a job from its preserved raw content.
    Reprocess {
        /// Job (session) UUID.
        id: String,
    },

    /// Rank incidents similar to a free-text query.
    Search {
        query: String,
        #[command(flatten)]
        caller: Caller,
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Rank incidents related to an existing session.
    Related {
        session: String,
        #[command(flatten)]
        caller: Caller,
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Retrieve the tenant's best-matching chunks with line citations.
    Retrieve {
        query: String,

        #[arg(long)]
        tenant: String,

        /// Maximum results (defaults to `retrieval.final_limit`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Embedding cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Hybrid retrieval controls.
    Hybrid {
        #[command(subcommand)]
        action: HybridAction,
    },

    /// Show database and pipeline statistics.
    Stats,

    /// Start the HTTP server and the cache eviction scheduler.
    Serve,
}

#[derive(clap::Args)]
struct Caller {
    /// Workspace the request acts in.
    #[arg(long)]
    tenant: String,

    /// Analyst issuing the request; checked against `[authz]` grants.
    #[arg(long)]
    analyst: String,
}

#[derive(clap::Args)]
struct FilterArgs {
    /// `tenant_only` or `multi_tenant`.
    #[arg(long, default_value = "tenant_only", value_parser = parse_scope)]
    scope: VisibilityScope,

    /// Other workspace to include (repeatable); requires `--scope multi_tenant`.
    #[arg(long = "workspace")]
    workspaces: Vec<String>,

    /// Only incidents detected as this platform.
    #[arg(long, value_parser = parse_platform)]
    platform: Option<Platform>,

    /// Minimum relevance score.
    #[arg(long)]
    min_relevance: Option<f64>,

    #[arg(long)]
    limit: Option<usize>,

    #[arg(long, default_value_t = 0)]
    offset: usize,
}

impl From<FilterArgs> for SearchFilters {
    fn from(f: FilterArgs) -> Self {
        SearchFilters {
            scope: f.scope,
            workspaces: f.workspaces,
            platform: f.platform,
            min_relevance: f.min_relevance,
            limit: f.limit,
            offset: f.offset,
        }
    }
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drain the eviction queue once.
    Evict,
}

#[derive(Subcommand)]
enum HybridAction {
    /// Operator override back to hybrid mode for a tenant.
    Enable { tenant: String },
}

fn parse_archive_type(s: &str) -> Result<ArchiveType, String> {
    s.parse().map_err(|e| format!("{}", e))
}

fn parse_scope(s: &str) -> Result<VisibilityScope, String> {
    s.parse().map_err(|e| format!("{}", e))
}

fn parse_platform(s: &str) -> Result<Platform, String> {
    s.parse().map_err(|e| format!("{}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "incident_harness=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            tenant,
            archive_type,
        } => {
            ingest::run_ingest(&cfg, &path, &tenant, archive_type).await?;
        }
        Commands::Job { id } => {
            jobs::run_job(&cfg, &id).await?;
        }
        Commands::Reprocess { id } => {
            ingest::run_reprocess(&cfg, &id).await?;
        }
        Commands::Search {
            query,
            caller,
            filters,
        } => {
            search::run_search(&cfg, &caller.tenant, &caller.analyst, &query, filters.into())
                .await?;
        }
        Commands::Related {
            session,
            caller,
            filters,
        } => {
            search::run_related(&cfg, &caller.tenant, &caller.analyst, &session, filters.into())
                .await?;
        }
        Commands::Retrieve {
            query,
            tenant,
            limit,
        } => {
            search::run_retrieve(&cfg, &tenant, &query, limit).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Evict => {
                cache::run_evict(&cfg).await?;
            }
        },
        Commands::Hybrid { action } => match action {
            HybridAction::Enable { tenant } => {
                search::run_hybrid_enable(&cfg, &tenant).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
