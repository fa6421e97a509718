//! Guarded extraction of uploaded archives.
//!
//! Uploads are streamed member by member; nothing is materialized except the
//! members that are kept. Every decompressed byte passes through a
//! [`Meter`], which tracks uncompressed size, member count and elapsed time
//! and aborts the moment a limit is exceeded. Sizes declared by zip and tar
//! headers are added to the estimate before a member is read, so a bomb is
//! judged by what it claims to expand to, with the byte count as a backstop
//! for streams that declare nothing:
//!
//! | Limit | Status | Reason |
//! |-------|--------|--------|
//! | `estimated / compressed > max_ratio` | `blocked_ratio` | `decompression_ratio` |
//! | members > `max_members` | `blocked_members` | `member_count` |
//! | absolute or `..` member path | `blocked_members` | `path_traversal` |
//! | estimated > `max_total_bytes` | `blocked_size` | `size_cap` |
//! | elapsed > `timeout` or cancelled | `timeout` | `timeout` |
//!
//! Trips are values, not errors: [`extract_stream`] always returns an
//! [`ExtractionReport`], and extracted content is only present when the
//! status is `passed`.
//!
//! [`ArchiveExtractor`] runs the blocking extraction on tokio's blocking
//! pool under an outer timeout and keeps the `archive_audits` row: inserted
//! provisionally (`error` / `incomplete`) before any work, finalized exactly
//! once afterwards.

use anyhow::Result;
use bzip2::read::BzDecoder;
use flate2::read::MultiGzDecoder;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use incident_harness_core::models::{ArchiveType, GuardrailStatus};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::cell::Cell;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use xz2::read::XzDecoder;

use crate::config::ArchiveConfig;
use crate::db;
use crate::telemetry::Telemetry;

/// How long a cancelled extraction gets to notice the flag.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

const SNIFF_LEN: u64 = 512;

#[derive(Debug, Clone)]
pub struct ArchiveLimits {
    pub max_ratio: f64,
    pub max_members: u64,
    pub max_total_bytes: u64,
    pub timeout: Duration,
    pub multi_extraction: bool,
    supported: GlobSet,
}

impl ArchiveLimits {
    pub fn from_config(config: &ArchiveConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for ext in &config.supported_extensions {
            let glob = GlobBuilder::new(&format!("*.{}", ext.trim_start_matches('.')))
                .case_insensitive(true)
                .build()?;
            builder.add(glob);
        }
        Ok(Self {
            max_ratio: config.max_ratio,
            max_members: config.max_members,
            max_total_bytes: config.max_total_bytes,
            timeout: Duration::from_secs(config.timeout_secs),
            multi_extraction: config.multi_extraction,
            supported: builder.build()?,
        })
    }

    pub fn is_supported(&self, member: &str) -> bool {
        self.supported.is_match(basename(member))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedMember {
    pub name: String,
    pub content: String,
}

/// Result of one extraction, passed or not.
#[derive(Debug, Clone)]
pub struct ExtractionReport {
    pub archive_type: Option<ArchiveType>,
    pub status: GuardrailStatus,
    pub blocked_reason: Option<String>,
    pub member_count: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub decompression_ratio: f64,
    /// Names of every member seen before completion or abort.
    pub members: Vec<String>,
    pub extracted: Vec<ExtractedMember>,
}

impl ExtractionReport {
    fn failed(archive_type: Option<ArchiveType>, compressed_size: u64, reason: String) -> Self {
        Self {
            archive_type,
            status: GuardrailStatus::Error,
            blocked_reason: Some(reason),
            member_count: 0,
            compressed_size,
            uncompressed_size: 0,
            decompression_ratio: 0.0,
            members: Vec::new(),
            extracted: Vec::new(),
        }
    }

    fn into_timeout(mut self) -> Self {
        self.status = GuardrailStatus::Timeout;
        self.blocked_reason = Some("timeout".to_string());
        self.extracted.clear();
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Trip {
    status: GuardrailStatus,
    reason: &'static str,
}

impl Trip {
    const RATIO: Trip = Trip {
        status: GuardrailStatus::BlockedRatio,
        reason: "decompression_ratio",
    };
    const MEMBERS: Trip = Trip {
        status: GuardrailStatus::BlockedMembers,
        reason: "member_count",
    };
    const TRAVERSAL: Trip = Trip {
        status: GuardrailStatus::BlockedMembers,
        reason: "path_traversal",
    };
    const SIZE: Trip = Trip {
        status: GuardrailStatus::BlockedSize,
        reason: "size_cap",
    };
    const TIMEOUT: Trip = Trip {
        status: GuardrailStatus::Timeout,
        reason: "timeout",
    };
}

enum Abort {
    Trip(Trip),
    Failed(String),
}

impl From<Trip> for Abort {
    fn from(t: Trip) -> Self {
        Abort::Trip(t)
    }
}

/// Running counters shared by every reader of one extraction.
struct Meter {
    limits: ArchiveLimits,
    cancel: Arc<AtomicBool>,
    started: Instant,
    compressed: u64,
    uncompressed: Cell<u64>,
    declared: Cell<u64>,
    members: Cell<u64>,
    tripped: Cell<Option<Trip>>,
}

impl Meter {
    fn new(limits: ArchiveLimits, compressed: u64, cancel: Arc<AtomicBool>) -> Self {
        Self {
            limits,
            cancel,
            started: Instant::now(),
            compressed,
            uncompressed: Cell::new(0),
            declared: Cell::new(0),
            members: Cell::new(0),
            tripped: Cell::new(None),
        }
    }

    /// Larger of the header-declared total and the bytes actually produced.
    fn estimated(&self) -> u64 {
        self.declared.get().max(self.uncompressed.get())
    }

    fn ratio(&self) -> f64 {
        self.estimated() as f64 / self.compressed.max(1) as f64
    }

    fn check(&self) -> Result<(), Trip> {
        if let Some(t) = self.tripped.get() {
            return Err(t);
        }
        let trip = if self.cancel.load(Ordering::Relaxed)
            || self.started.elapsed() > self.limits.timeout
        {
            Some(Trip::TIMEOUT)
        } else if self.ratio() > self.limits.max_ratio {
            Some(Trip::RATIO)
        } else if self.estimated() > self.limits.max_total_bytes {
            Some(Trip::SIZE)
        } else if self.members.get() > self.limits.max_members {
            Some(Trip::MEMBERS)
        } else {
            None
        };
        match trip {
            Some(t) => {
                self.tripped.set(Some(t));
                Err(t)
            }
            None => Ok(()),
        }
    }

    fn add_bytes(&self, n: usize) -> Result<(), Trip> {
        self.uncompressed.set(self.uncompressed.get() + n as u64);
        self.check()
    }

    fn add_member(&self) -> Result<(), Trip> {
        self.members.set(self.members.get() + 1);
        self.check()
    }

    /// Uncompressed size a member header claims, counted before its data.
    fn declare(&self, size: u64) -> Result<(), Trip> {
        self.declared.set(self.declared.get().saturating_add(size));
        self.check()
    }

    fn trip(&self, t: Trip) -> Abort {
        self.tripped.set(Some(t));
        Abort::Trip(t)
    }

    /// Classify a read failure: a guardrail trip surfaced through `io`, or
    /// a genuinely broken stream.
    fn abort(&self, err: impl std::fmt::Display) -> Abort {
        match self.tripped.get() {
            Some(t) => Abort::Trip(t),
            None => Abort::Failed(format!("corrupt_archive: {}", err)),
        }
    }
}

/// Counts every byte it yields against the meter.
struct Metered<'m, R> {
    inner: R,
    meter: &'m Meter,
}

impl<'m, R: Read> Metered<'m, R> {
    fn new(inner: R, meter: &'m Meter) -> Self {
        Self { inner, meter }
    }
}

impl<R: Read> Read for Metered<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.meter
            .check()
            .map_err(|t| io::Error::other(t.reason))?;
        let n = self.inner.read(buf)?;
        self.meter
            .add_bytes(n)
            .map_err(|t| io::Error::other(t.reason))?;
        Ok(n)
    }
}

/// Decides which members are kept and collects them.
struct Collector<'l> {
    limits: &'l ArchiveLimits,
    seen: Vec<String>,
    kept: Vec<ExtractedMember>,
}

impl Collector<'_> {
    fn wants(&self, name: &str) -> bool {
        (self.limits.multi_extraction || self.kept.is_empty()) && self.limits.is_supported(name)
    }

    fn member<R: Read>(
        &mut self,
        meter: &Meter,
        name: &str,
        is_file: bool,
        declared_size: u64,
        force_keep: bool,
        mut reader: R,
    ) -> Result<(), Abort> {
        self.seen.push(name.to_string());
        meter.add_member()?;
        if is_traversal(name) {
            return Err(meter.trip(Trip::TRAVERSAL));
        }
        if !is_file {
            return Ok(());
        }
        meter.declare(declared_size)?;

        if force_keep || self.wants(name) {
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .map_err(|e| meter.abort(e))?;
            self.kept.push(ExtractedMember {
                name: name.to_string(),
                content: String::from_utf8_lossy(&buf).into_owned(),
            });
        } else {
            io::copy(&mut reader, &mut io::sink()).map_err(|e| meter.abort(e))?;
        }
        Ok(())
    }
}

/// Absolute paths, drive prefixes and `..` segments.
pub fn is_traversal(name: &str) -> bool {
    if name.starts_with('/') || name.starts_with('\\') {
        return true;
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return true;
    }
    name.split(['/', '\\']).any(|seg| seg == "..")
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Archive type implied by a filename, if any.
pub fn type_from_name(filename: &str) -> Option<ArchiveType> {
    let name = basename(filename).to_ascii_lowercase();
    let by_suffix = [
        (".tar.gz", ArchiveType::TarGz),
        (".tgz", ArchiveType::TarGz),
        (".tar.bz2", ArchiveType::TarBz2),
        (".tbz2", ArchiveType::TarBz2),
        (".tar.xz", ArchiveType::TarXz),
        (".txz", ArchiveType::TarXz),
        (".tar", ArchiveType::Tar),
        (".zip", ArchiveType::Zip),
        (".gz", ArchiveType::Gzip),
        (".bz2", ArchiveType::Bzip2),
        (".xz", ArchiveType::Xz),
    ];
    by_suffix
        .iter()
        .find(|(suffix, _)| name.ends_with(suffix))
        .map(|(_, t)| *t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Magic {
    Zip,
    Gzip,
    Bzip2,
    Xz,
    Tar,
    SevenZip,
    Rar,
    Unknown,
}

fn sniff(head: &[u8]) -> Magic {
    if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        Magic::Zip
    } else if head.starts_with(&[0x1f, 0x8b]) {
        Magic::Gzip
    } else if head.starts_with(b"BZh") {
        Magic::Bzip2
    } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Magic::Xz
    } else if head.starts_with(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c]) {
        Magic::SevenZip
    } else if head.starts_with(b"Rar!\x1a\x07") {
        Magic::Rar
    } else if is_ustar(head) {
        Magic::Tar
    } else {
        Magic::Unknown
    }
}

fn is_ustar(head: &[u8]) -> bool {
    head.len() >= 262 && &head[257..262] == b"ustar"
}

fn magic_matches(archive_type: ArchiveType, magic: Magic) -> bool {
    match archive_type {
        ArchiveType::Zip => magic == Magic::Zip,
        ArchiveType::Gzip | ArchiveType::TarGz => magic == Magic::Gzip,
        ArchiveType::Bzip2 | ArchiveType::TarBz2 => magic == Magic::Bzip2,
        ArchiveType::Xz | ArchiveType::TarXz => magic == Magic::Xz,
        // pre-POSIX tar headers carry no magic
        ArchiveType::Tar => matches!(magic, Magic::Tar | Magic::Unknown),
        ArchiveType::Plain => magic == Magic::Unknown,
    }
}

/// Declared type, then extension, then magic bytes.
fn resolve_type(
    filename: &str,
    declared: Option<ArchiveType>,
    head: &[u8],
) -> Result<ArchiveType, String> {
    let magic = sniff(head);
    if matches!(magic, Magic::SevenZip | Magic::Rar) {
        return Err("unsupported_format".to_string());
    }

    let claimed = declared.or_else(|| type_from_name(filename));
    match claimed {
        Some(t) if magic_matches(t, magic) => Ok(t),
        Some(t) => Err(format!("type_mismatch: {} content does not match", t)),
        None => Ok(match magic {
            Magic::Zip => ArchiveType::Zip,
            Magic::Gzip => ArchiveType::Gzip,
            Magic::Bzip2 => ArchiveType::Bzip2,
            Magic::Xz => ArchiveType::Xz,
            Magic::Tar => ArchiveType::Tar,
            _ => ArchiveType::Plain,
        }),
    }
}

/// Name for the single member of a bare compressed stream.
fn single_member_name(filename: &str, archive_type: ArchiveType) -> String {
    let base = basename(filename);
    let suffix = match archive_type {
        ArchiveType::Gzip => ".gz",
        ArchiveType::Bzip2 => ".bz2",
        ArchiveType::Xz => ".xz",
        _ => "",
    };
    let lower = base.to_ascii_lowercase();
    if !suffix.is_empty() && lower.ends_with(suffix) {
        base[..base.len() - suffix.len()].to_string()
    } else {
        base.to_string()
    }
}

fn read_zip<R: Read>(mut stream: R, meter: &Meter, collector: &mut Collector) -> Result<(), Abort> {
    loop {
        meter.check()?;
        let file = match zip::read::read_zipfile_from_stream(&mut stream) {
            Ok(Some(f)) => f,
            Ok(None) => return Ok(()),
            Err(e) => return Err(meter.abort(e)),
        };
        let name = file.name().to_string();
        let is_file = !file.is_dir();
        // zero when the sizes live in a trailing data descriptor
        let size = file.size();
        collector.member(meter, &name, is_file, size, false, Metered::new(file, meter))?;
    }
}

/// `reader` must already be metered.
fn read_tar<R: Read>(reader: R, meter: &Meter, collector: &mut Collector) -> Result<(), Abort> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| meter.abort(e))?;
    for entry in entries {
        meter.check()?;
        let entry = entry.map_err(|e| meter.abort(e))?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let is_file = entry.header().entry_type().is_file();
        let size = entry.size();
        collector.member(meter, &name, is_file, size, false, entry)?;
    }
    Ok(())
}

/// A bare compressed stream (or plain upload). Tarballs without a tar
/// suffix are recognised by their header and read as tar.
fn read_single<R: Read>(
    reader: R,
    name: &str,
    meter: &Meter,
    collector: &mut Collector,
) -> Result<(), Abort> {
    let mut metered = Metered::new(reader, meter);
    let mut head = Vec::new();
    metered
        .by_ref()
        .take(SNIFF_LEN)
        .read_to_end(&mut head)
        .map_err(|e| meter.abort(e))?;

    let rest = Cursor::new(head).chain(metered);
    if is_ustar(rest.get_ref().0.get_ref()) {
        return read_tar(rest, meter, collector);
    }
    collector.member(meter, name, true, 0, true, rest)
}

/// Extract `reader` under `limits`. Blocking; never panics on bad input.
pub fn extract_stream<R: Read>(
    mut reader: R,
    compressed_size: u64,
    filename: &str,
    declared: Option<ArchiveType>,
    limits: &ArchiveLimits,
    cancel: Arc<AtomicBool>,
) -> ExtractionReport {
    let mut head = Vec::new();
    if let Err(e) = reader.by_ref().take(SNIFF_LEN).read_to_end(&mut head) {
        return ExtractionReport::failed(None, compressed_size, format!("read_error: {}", e));
    }
    let archive_type = match resolve_type(filename, declared, &head) {
        Ok(t) => t,
        Err(reason) => return ExtractionReport::failed(declared, compressed_size, reason),
    };
    let stream = Cursor::new(head).chain(reader);

    let meter = Meter::new(limits.clone(), compressed_size, cancel);
    let mut collector = Collector {
        limits,
        seen: Vec::new(),
        kept: Vec::new(),
    };
    let single_name = single_member_name(filename, archive_type);

    let result = match archive_type {
        ArchiveType::Zip => read_zip(stream, &meter, &mut collector),
        ArchiveType::Tar => read_tar(Metered::new(stream, &meter), &meter, &mut collector),
        ArchiveType::TarGz => read_tar(
            Metered::new(MultiGzDecoder::new(stream), &meter),
            &meter,
            &mut collector,
        ),
        ArchiveType::TarBz2 => read_tar(
            Metered::new(BzDecoder::new(stream), &meter),
            &meter,
            &mut collector,
        ),
        ArchiveType::TarXz => read_tar(
            Metered::new(XzDecoder::new(stream), &meter),
            &meter,
            &mut collector,
        ),
        ArchiveType::Gzip => read_single(
            MultiGzDecoder::new(stream),
            &single_name,
            &meter,
            &mut collector,
        ),
        ArchiveType::Bzip2 => {
            read_single(BzDecoder::new(stream), &single_name, &meter, &mut collector)
        }
        ArchiveType::Xz => {
            read_single(XzDecoder::new(stream), &single_name, &meter, &mut collector)
        }
        ArchiveType::Plain => read_single(stream, &single_name, &meter, &mut collector),
    };

    let (status, blocked_reason, extracted) = match result {
        Ok(()) => (GuardrailStatus::Passed, None, collector.kept),
        Err(Abort::Trip(t)) => (t.status, Some(t.reason.to_string()), Vec::new()),
        Err(Abort::Failed(reason)) => (GuardrailStatus::Error, Some(reason), Vec::new()),
    };

    ExtractionReport {
        archive_type: Some(archive_type),
        status,
        blocked_reason,
        member_count: meter.members.get(),
        compressed_size,
        uncompressed_size: meter.estimated(),
        decompression_ratio: meter.ratio(),
        members: collector.seen,
        extracted,
    }
}

/// Persisted `archive_audits` row.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveAudit {
    pub id: String,
    pub job_id: String,
    pub tenant_id: String,
    pub source_filename: String,
    pub archive_type: Option<ArchiveType>,
    pub member_count: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub decompression_ratio: f64,
    pub status: GuardrailStatus,
    pub blocked_reason: Option<String>,
    pub members: Vec<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl ArchiveAudit {
    pub async fn for_job(pool: &SqlitePool, job_id: &str) -> Result<Option<ArchiveAudit>> {
        let row = sqlx::query(
            "SELECT id, job_id, tenant_id, source_filename, archive_type, member_count, \
             compressed_size, uncompressed_size, decompression_ratio, status, blocked_reason, \
             members_json, started_at, finished_at FROM archive_audits WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let archive_type: Option<String> = row.get("archive_type");
        let status: String = row.get("status");
        let members_json: String = row.get("members_json");

        Ok(Some(ArchiveAudit {
            id: row.get("id"),
            job_id: row.get("job_id"),
            tenant_id: row.get("tenant_id"),
            source_filename: row.get("source_filename"),
            archive_type: archive_type.and_then(|t| t.parse().ok()),
            member_count: row.get::<i64, _>("member_count") as u64,
            compressed_size: row.get::<i64, _>("compressed_size") as u64,
            uncompressed_size: row.get::<i64, _>("uncompressed_size") as u64,
            decompression_ratio: row.get("decompression_ratio"),
            status: status.parse().unwrap_or(GuardrailStatus::Error),
            blocked_reason: row.get("blocked_reason"),
            members: serde_json::from_str(&members_json).unwrap_or_default(),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        }))
    }
}

pub struct ExtractionOutcome {
    pub audit: ArchiveAudit,
    /// Kept members; empty unless the audit status is `passed`.
    pub members: Vec<ExtractedMember>,
}

pub struct ArchiveExtractor {
    pool: SqlitePool,
    limits: ArchiveLimits,
    telemetry: Arc<Telemetry>,
}

impl ArchiveExtractor {
    pub fn new(pool: SqlitePool, limits: ArchiveLimits, telemetry: Arc<Telemetry>) -> Self {
        Self {
            pool,
            limits,
            telemetry,
        }
    }

    pub fn limits(&self) -> &ArchiveLimits {
        &self.limits
    }

    /// Extract an upload for `job_id` and record its audit row.
    pub async fn extract<R>(
        &self,
        job_id: &str,
        tenant_id: &str,
        filename: &str,
        declared: Option<ArchiveType>,
        reader: R,
        compressed_size: u64,
    ) -> Result<ExtractionOutcome>
    where
        R: Read + Send + 'static,
    {
        let audit_id = Uuid::new_v4().to_string();
        let started_at = db::now_ts();
        sqlx::query(
            "INSERT INTO archive_audits (id, job_id, tenant_id, source_filename, compressed_size, \
             status, blocked_reason, started_at) VALUES (?, ?, ?, ?, ?, 'error', 'incomplete', ?)",
        )
        .bind(&audit_id)
        .bind(job_id)
        .bind(tenant_id)
        .bind(filename)
        .bind(compressed_size as i64)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        let start = Instant::now();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut handle = {
            let limits = self.limits.clone();
            let filename = filename.to_string();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                extract_stream(reader, compressed_size, &filename, declared, &limits, cancel)
            })
        };

        let report = match tokio::time::timeout(self.limits.timeout, &mut handle).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => ExtractionReport::failed(
                declared,
                compressed_size,
                format!("extractor_failed: {}", e),
            ),
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                match tokio::time::timeout(CANCEL_GRACE, handle).await {
                    Ok(Ok(late)) => late.into_timeout(),
                    _ => ExtractionReport::failed(declared, compressed_size, String::new())
                        .into_timeout(),
                }
            }
        };

        let finished_at = db::now_ts();
        sqlx::query(
            "UPDATE archive_audits SET archive_type = ?, member_count = ?, uncompressed_size = ?, \
             decompression_ratio = ?, status = ?, blocked_reason = ?, members_json = ?, \
             finished_at = ? WHERE id = ? AND finished_at IS NULL",
        )
        .bind(report.archive_type.map(|t| t.as_str()))
        .bind(report.member_count as i64)
        .bind(report.uncompressed_size as i64)
        .bind(report.decompression_ratio)
        .bind(report.status.as_str())
        .bind(&report.blocked_reason)
        .bind(serde_json::to_string(&report.members)?)
        .bind(finished_at)
        .bind(&audit_id)
        .execute(&self.pool)
        .await?;

        let type_label = report.archive_type.map(|t| t.as_str()).unwrap_or("unknown");
        self.telemetry.archive(
            tenant_id,
            type_label,
            report.status.as_str(),
            report.decompression_ratio,
            report.member_count,
            start.elapsed(),
        );
        if report.status == GuardrailStatus::Passed {
            tracing::info!(
                job_id,
                archive_type = type_label,
                members = report.member_count,
                kept = report.extracted.len(),
                "extraction passed"
            );
        } else {
            tracing::warn!(
                job_id,
                tenant = tenant_id,
                archive_type = type_label,
                status = report.status.as_str(),
                reason = report.blocked_reason.as_deref().unwrap_or(""),
                ratio = report.decompression_ratio,
                "extraction stopped"
            );
        }

        let audit = ArchiveAudit {
            id: audit_id,
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            source_filename: filename.to_string(),
            archive_type: report.archive_type,
            member_count: report.member_count,
            compressed_size,
            uncompressed_size: report.uncompressed_size,
            decompression_ratio: report.decompression_ratio,
            status: report.status,
            blocked_reason: report.blocked_reason,
            members: report.members,
            started_at,
            finished_at: Some(finished_at),
        };
        Ok(ExtractionOutcome {
            audit,
            members: report.extracted,
        })
    }
}
