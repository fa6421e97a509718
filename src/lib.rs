//! # Incident Harness
//!
//! Safe ingestion, platform detection and similar-incident search for
//! diagnostic uploads from automation platforms (UiPath, Automation
//! Anywhere, Blue Prism, Power Automate, Ansible).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌────────────┐   ┌──────────┐
//! │  Upload  │──▶│  Archive   │──▶│  Detect +  │──▶│  SQLite  │
//! │ CLI/HTTP │   │ guardrails │   │   parse    │   │ FTS5+Vec │
//! └──────────┘   └────────────┘   └────────────┘   └────┬─────┘
//!                                                       │
//!                 ┌──────────────────┬──────────────────┤
//!                 ▼                  ▼                  ▼
//!          ┌────────────┐    ┌──────────────┐   ┌─────────────┐
//!          │ Embedding  │    │ Fingerprint  │   │   Hybrid    │
//!          │   cache    │    │ search+audit │   │  retrieval  │
//!          └────────────┘    └──────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ihx init                                  # create database
//! ihx ingest robot_logs.zip --tenant acme   # guarded extraction + detection
//! ihx job <job-id>                          # audit, detection, fingerprint
//! ihx search "selector not found" --tenant acme --analyst ana
//! ihx retrieve "timeout" --tenant acme
//! ihx serve                                 # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`archive`] | Guarded archive extraction and audit |
//! | [`detect`] | Platform detection and parser execution |
//! | [`cache`] | Embedding cache and eviction |
//! | [`fingerprint`] | Incident fingerprints and authorized search |
//! | [`retrieval`] | Hybrid chunk retrieval with circuit breaker |
//! | [`ingest`] | Upload pipeline |
//! | [`jobs`] | Job lookup |
//! | [`server`] | HTTP server |
//! | [`telemetry`] | Outcome records and Prometheus metrics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//!
//! Pure logic (models, detection scoring, parsers, chunking, score fusion,
//! breaker state machine) lives in the `incident-harness-core` crate.

pub mod archive;
pub mod cache;
pub mod config;
pub mod db;
pub mod detect;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod harness;
pub mod ingest;
pub mod jobs;
pub mod migrate;
pub mod retrieval;
pub mod search;
pub mod server;
pub mod stats;
pub mod telemetry;
