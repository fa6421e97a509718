//! # Incident Harness Core
//!
//! Pure logic shared by the Incident Harness service: data models, line-aware
//! chunking, platform signature scoring, platform parsers, score fusion, and
//! the per-tenant hybrid retrieval breaker.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other runtime
//! dependencies. Everything here is deterministic given its inputs, which is
//! what lets detection results be replayed against a stored flag snapshot.

pub mod breaker;
pub mod chunk;
pub mod detection;
pub mod embedding;
pub mod models;
pub mod parsers;
pub mod scoring;
