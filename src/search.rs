//! CLI entry points for incident search and chunk retrieval.
//!
//! Thin printers over [`Harness::search`](crate::harness::Harness) and
//! [`RetrievalEngine`](crate::retrieval::RetrievalEngine); the HTTP server
//! calls the same components directly.

use anyhow::Result;
use incident_harness_core::models::{Platform, VisibilityScope};

use crate::config::Config;
use crate::fingerprint::{SearchRequest, SearchResponse};
use crate::harness::Harness;

/// Filters shared by `ihx search` and `ihx related`.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub scope: VisibilityScope,
    pub workspaces: Vec<String>,
    pub platform: Option<Platform>,
    pub min_relevance: Option<f64>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SearchFilters {
    fn apply(self, base: SearchRequest) -> SearchRequest {
        SearchRequest {
            scope: self.scope,
            workspaces: self.workspaces,
            platform: self.platform,
            min_relevance: self.min_relevance,
            limit: self.limit,
            offset: self.offset,
            ..base
        }
    }
}

pub async fn run_search(
    config: &Config,
    tenant: &str,
    analyst: &str,
    query: &str,
    filters: SearchFilters,
) -> Result<()> {
    let h = Harness::open(config).await?;
    let request = filters.apply(SearchRequest::text(tenant, analyst, query));
    let response = h.search.search(&request).await?;
    print_incidents(&response);
    h.close().await;
    Ok(())
}

pub async fn run_related(
    config: &Config,
    tenant: &str,
    analyst: &str,
    session_id: &str,
    filters: SearchFilters,
) -> Result<()> {
    let h = Harness::open(config).await?;
    let request = filters.apply(SearchRequest::related(tenant, analyst, session_id));
    let response = h.search.search(&request).await?;
    print_incidents(&response);
    h.close().await;
    Ok(())
}

fn print_incidents(response: &SearchResponse) {
    if response.results.is_empty() {
        println!("No results.");
        return;
    }

    for (i, m) in response.results.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(m.created_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let marker = if m.cross_workspace { " (cross-workspace)" } else { "" };

        println!(
            "{}. [{:.2}] {} / {}{}",
            i + 1,
            m.score,
            m.workspace,
            m.platform,
            marker
        );
        println!("    created: {}", date);
        let first = m.summary.lines().nth(1).unwrap_or("").trim();
        if !first.is_empty() {
            println!("    summary: \"{}\"", first);
        }
        println!("    session: {}", m.session_id);
        println!();
    }
    if let Some(ref token) = response.audit_token {
        println!("audit token: {}", token);
    }
}

pub async fn run_retrieve(
    config: &Config,
    tenant: &str,
    query: &str,
    limit: Option<usize>,
) -> Result<()> {
    let h = Harness::open(config).await?;
    let response = h.retrieval.retrieve(tenant, query, limit).await?;

    println!(
        "mode: {} (hybrid state: {}){}",
        response.mode,
        response.hybrid_state,
        if response.lexical_fallback {
            ", lexical channel failed"
        } else {
            ""
        }
    );
    println!();

    if response.results.is_empty() {
        println!("No results.");
    }
    for (i, m) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.2}] session {} lines {}-{}",
            i + 1,
            m.score,
            m.session_id,
            m.line_range.start,
            m.line_range.end
        );
        match m.lexical_score {
            Some(lex) => println!("    vector: {:.2}  lexical: {:.2}", m.vector_score, lex),
            None => println!("    vector: {:.2}", m.vector_score),
        }
        let excerpt: String = m.text.chars().take(160).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    chunk: {}", m.chunk_id);
        println!();
    }

    h.close().await;
    Ok(())
}

/// `ihx hybrid enable <tenant>`.
pub async fn run_hybrid_enable(config: &Config, tenant: &str) -> Result<()> {
    let h = Harness::open(config).await?;
    let before = h.retrieval.state(tenant);
    let after = h.retrieval.reenable(tenant).await?;
    println!("tenant {}: {} -> {}", tenant, before, after);
    h.close().await;
    Ok(())
}
