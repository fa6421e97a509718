//! Core data models shared by the ingestion, detection, and retrieval paths.
//!
//! Enumerations are stored in SQLite as their `snake_case` string form;
//! [`std::str::FromStr`] impls parse them back when rows are loaded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Returned when a stored enum column holds an unrecognised value.
#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

fn parse_err(kind: &'static str, value: &str) -> ParseEnumError {
    ParseEnumError {
        kind,
        value: value.to_string(),
    }
}

// ============ Platforms ============

/// Automation platform that produced an uploaded diagnostic artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "uipath")]
    UiPath,
    #[serde(rename = "automation_anywhere")]
    AutomationAnywhere,
    #[serde(rename = "blue_prism")]
    BluePrism,
    #[serde(rename = "power_automate")]
    PowerAutomate,
    #[serde(rename = "ansible")]
    Ansible,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Platform {
    /// Platforms with signatures and parsers, in tie-break order.
    pub const SUPPORTED: [Platform; 5] = [
        Platform::UiPath,
        Platform::AutomationAnywhere,
        Platform::BluePrism,
        Platform::PowerAutomate,
        Platform::Ansible,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::UiPath => "uipath",
            Platform::AutomationAnywhere => "automation_anywhere",
            Platform::BluePrism => "blue_prism",
            Platform::PowerAutomate => "power_automate",
            Platform::Ansible => "ansible",
            Platform::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uipath" => Ok(Platform::UiPath),
            "automation_anywhere" => Ok(Platform::AutomationAnywhere),
            "blue_prism" => Ok(Platform::BluePrism),
            "power_automate" => Ok(Platform::PowerAutomate),
            "ansible" => Ok(Platform::Ansible),
            "unknown" => Ok(Platform::Unknown),
            other => Err(parse_err("platform", other)),
        }
    }
}

// ============ Archives ============

/// Container or compression family of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveType {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Gzip,
    Bzip2,
    Xz,
    Plain,
}

impl ArchiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveType::Zip => "zip",
            ArchiveType::Tar => "tar",
            ArchiveType::TarGz => "tar_gz",
            ArchiveType::TarBz2 => "tar_bz2",
            ArchiveType::TarXz => "tar_xz",
            ArchiveType::Gzip => "gzip",
            ArchiveType::Bzip2 => "bzip2",
            ArchiveType::Xz => "xz",
            ArchiveType::Plain => "plain",
        }
    }

    /// Whether members come from a tar stream.
    pub fn is_tar(&self) -> bool {
        matches!(
            self,
            ArchiveType::Tar | ArchiveType::TarGz | ArchiveType::TarBz2 | ArchiveType::TarXz
        )
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zip" => Ok(ArchiveType::Zip),
            "tar" => Ok(ArchiveType::Tar),
            "tar_gz" | "tgz" => Ok(ArchiveType::TarGz),
            "tar_bz2" | "tbz2" => Ok(ArchiveType::TarBz2),
            "tar_xz" | "txz" => Ok(ArchiveType::TarXz),
            "gzip" | "gz" => Ok(ArchiveType::Gzip),
            "bzip2" | "bz2" => Ok(ArchiveType::Bzip2),
            "xz" => Ok(ArchiveType::Xz),
            "plain" => Ok(ArchiveType::Plain),
            other => Err(parse_err("archive type", other)),
        }
    }
}

/// Terminal outcome of an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailStatus {
    Passed,
    BlockedRatio,
    BlockedMembers,
    /// Extracted size exceeded `max_total_bytes`; reason `size_cap`.
    BlockedSize,
    Timeout,
    Error,
}

impl GuardrailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailStatus::Passed => "passed",
            GuardrailStatus::BlockedRatio => "blocked_ratio",
            GuardrailStatus::BlockedMembers => "blocked_members",
            GuardrailStatus::BlockedSize => "blocked_size",
            GuardrailStatus::Timeout => "timeout",
            GuardrailStatus::Error => "error",
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            GuardrailStatus::BlockedRatio
                | GuardrailStatus::BlockedMembers
                | GuardrailStatus::BlockedSize
        )
    }
}

impl fmt::Display for GuardrailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuardrailStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(GuardrailStatus::Passed),
            "blocked_ratio" => Ok(GuardrailStatus::BlockedRatio),
            "blocked_members" => Ok(GuardrailStatus::BlockedMembers),
            "blocked_size" => Ok(GuardrailStatus::BlockedSize),
            "timeout" => Ok(GuardrailStatus::Timeout),
            "error" => Ok(GuardrailStatus::Error),
            other => Err(parse_err("guardrail status", other)),
        }
    }
}

// ============ Detection ============

/// A structured value pulled out of raw content by a platform parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    /// Where the value was found, e.g. `line:42`.
    pub source: String,
}

impl Entity {
    pub fn new(entity_type: &str, value: impl Into<String>, line: usize) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            value: value.into(),
            source: format!("line:{}", line),
        }
    }
}

/// Feature-flag state captured at the start of an operation.
///
/// Stored next to detection results so a result can be explained (and
/// replayed) against the exact thresholds that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagSnapshot {
    pub parsers_enabled: bool,
    pub min_confidence: f64,
    pub rollout_threshold: f64,
    pub disabled_platforms: Vec<Platform>,
    pub multi_extraction: bool,
    pub hybrid_enabled: bool,
    pub cross_tenant_audit: bool,
}

impl Default for FlagSnapshot {
    fn default() -> Self {
        Self {
            parsers_enabled: true,
            min_confidence: 0.15,
            rollout_threshold: 0.70,
            disabled_platforms: Vec::new(),
            multi_extraction: false,
            hybrid_enabled: true,
            cross_tenant_audit: true,
        }
    }
}

impl FlagSnapshot {
    pub fn parser_allowed(&self, platform: Platform) -> bool {
        self.parsers_enabled
            && platform != Platform::Unknown
            && !self.disabled_platforms.contains(&platform)
    }
}

// ============ Fingerprints ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintStatus {
    Available,
    Degraded,
    Missing,
}

impl FingerprintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintStatus::Available => "available",
            FingerprintStatus::Degraded => "degraded",
            FingerprintStatus::Missing => "missing",
        }
    }
}

impl FromStr for FingerprintStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(FingerprintStatus::Available),
            "degraded" => Ok(FingerprintStatus::Degraded),
            "missing" => Ok(FingerprintStatus::Missing),
            other => Err(parse_err("fingerprint status", other)),
        }
    }
}

/// Who may see a fingerprint in similarity search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityScope {
    #[default]
    TenantOnly,
    MultiTenant,
}

impl VisibilityScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisibilityScope::TenantOnly => "tenant_only",
            VisibilityScope::MultiTenant => "multi_tenant",
        }
    }
}

impl FromStr for VisibilityScope {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant_only" => Ok(VisibilityScope::TenantOnly),
            "multi_tenant" => Ok(VisibilityScope::MultiTenant),
            other => Err(parse_err("visibility scope", other)),
        }
    }
}

// ============ Jobs and chunks ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    NeedsReview,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::NeedsReview => "needs_review",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "needs_review" => Ok(JobStatus::NeedsReview),
            "failed" => Ok(JobStatus::Failed),
            other => Err(parse_err("job status", other)),
        }
    }
}

/// Inclusive, 1-based line span of a chunk within its source content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

/// A chunk of extracted content, cited by line range.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub session_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub lines: LineRange,
    /// SHA-256 of `text`; doubles as the embedding cache content hash.
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_roundtrips_through_str() {
        for p in Platform::SUPPORTED {
            assert_eq!(p.as_str().parse::<Platform>().unwrap(), p);
        }
        assert!("jenkins".parse::<Platform>().is_err());
    }

    #[test]
    fn platform_serializes_as_label() {
        let json = serde_json::to_string(&Platform::UiPath).unwrap();
        assert_eq!(json, "\"uipath\"");
    }

    #[test]
    fn blocked_statuses() {
        assert!(GuardrailStatus::BlockedRatio.is_blocked());
        assert!(GuardrailStatus::BlockedSize.is_blocked());
        assert!(!GuardrailStatus::Timeout.is_blocked());
        assert!(!GuardrailStatus::Passed.is_blocked());
    }

    #[test]
    fn disabled_platform_blocks_parser() {
        let flags = FlagSnapshot {
            disabled_platforms: vec![Platform::Ansible],
            ..FlagSnapshot::default()
        };
        assert!(!flags.parser_allowed(Platform::Ansible));
        assert!(flags.parser_allowed(Platform::UiPath));
        assert!(!flags.parser_allowed(Platform::Unknown));
    }
}
