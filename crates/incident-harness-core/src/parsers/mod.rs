//! Platform parsers: one implementation per automation platform.
//!
//! A parser turns raw, pre-redacted content into an ordered list of
//! [`Entity`] values. Parsers are looked up through a [`ParserRegistry`]
//! keyed by [`Platform`]; adding a platform means registering another
//! implementation, the detector never changes.
//!
//! # Usage
//!
//! ```rust
//! use incident_harness_core::models::Platform;
//! use incident_harness_core::parsers::ParserRegistry;
//!
//! let registry = ParserRegistry::with_builtins();
//! let parser = registry.get(Platform::Ansible).unwrap();
//! let result = parser.parse("TASK [restart nginx] ***\nfatal: [web2]: FAILED! => {}\n");
//! assert!(result.error.is_none());
//! assert!(result.entities.iter().any(|e| e.value == "web2"));
//! ```

mod ansible;
mod automation_anywhere;
mod blue_prism;
mod power_automate;
mod uipath;

pub use ansible::AnsibleParser;
pub use automation_anywhere::AutomationAnywhereParser;
pub use blue_prism::BluePrismParser;
pub use power_automate::PowerAutomateParser;
pub use uipath::UiPathParser;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::models::{Entity, Platform};

/// Upper bound on entities kept from one upload.
pub const MAX_ENTITIES: usize = 500;

/// Entities and non-fatal findings from a successful extraction.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub warnings: Vec<String>,
}

/// Outcome of a single [`PlatformParser::parse`] call.
#[derive(Debug, Clone, Serialize)]
pub struct ParserResult {
    pub entities: Vec<Entity>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Capability implemented once per platform.
pub trait PlatformParser: Send + Sync {
    fn platform(&self) -> Platform;

    /// Version string stored with detection results.
    fn version(&self) -> &'static str;

    /// Pull entities out of `content`.
    fn extract(&self, content: &str) -> Result<Extraction>;

    /// Timed wrapper around [`extract`](PlatformParser::extract) that never
    /// fails: errors are reported in [`ParserResult::error`].
    fn parse(&self, content: &str) -> ParserResult {
        let start = Instant::now();
        match self.extract(content) {
            Ok(ex) => ParserResult {
                entities: ex.entities,
                warnings: ex.warnings,
                error: None,
                duration: start.elapsed(),
            },
            Err(e) => ParserResult {
                entities: Vec::new(),
                warnings: Vec::new(),
                error: Some(format!("{:#}", e)),
                duration: start.elapsed(),
            },
        }
    }
}

/// Parsers keyed by platform.
pub struct ParserRegistry {
    parsers: HashMap<Platform, Box<dyn PlatformParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry holding the five built-in platform parsers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(UiPathParser));
        registry.register(Box::new(AutomationAnywhereParser));
        registry.register(Box::new(BluePrismParser));
        registry.register(Box::new(PowerAutomateParser));
        registry.register(Box::new(AnsibleParser));
        registry
    }

    /// Register a parser, replacing any previous one for the same platform.
    pub fn register(&mut self, parser: Box<dyn PlatformParser>) {
        self.parsers.insert(parser.platform(), parser);
    }

    pub fn get(&self, platform: Platform) -> Option<&dyn PlatformParser> {
        self.parsers.get(&platform).map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Shared line rules ============

/// A regex applied to each line; capture group 1 becomes the entity value.
pub(crate) struct LineRule {
    pub entity_type: &'static str,
    pub regex: Regex,
}

pub(crate) fn rule(entity_type: &'static str, pattern: &str) -> LineRule {
    LineRule {
        entity_type,
        regex: Regex::new(pattern).expect("invalid builtin parser rule"),
    }
}

/// Accumulates entities in order of appearance, dropping duplicates and
/// stopping at [`MAX_ENTITIES`].
pub(crate) struct EntitySink {
    seen: HashSet<(String, String)>,
    out: Extraction,
    truncated: bool,
}

impl EntitySink {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
            out: Extraction::default(),
            truncated: false,
        }
    }

    pub fn push(&mut self, entity_type: &str, value: &str, line: usize) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        if self.out.entities.len() >= MAX_ENTITIES {
            self.truncated = true;
            return;
        }
        if self
            .seen
            .insert((entity_type.to_string(), value.to_string()))
        {
            self.out.entities.push(Entity::new(entity_type, value, line));
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.out.warnings.push(message.into());
    }

    pub fn apply_rules(&mut self, rules: &[LineRule], line: &str, line_no: usize) {
        for r in rules {
            if let Some(caps) = r.regex.captures(line) {
                if let Some(m) = caps.get(1) {
                    self.push(r.entity_type, m.as_str(), line_no);
                }
            }
        }
    }

    pub fn finish(mut self) -> Extraction {
        if self.truncated {
            self.out
                .warnings
                .push(format!("entity limit of {} reached; remainder dropped", MAX_ENTITIES));
        }
        self.out
    }
}

/// Fail fast on content with nothing to parse.
pub(crate) fn ensure_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        anyhow::bail!("content is empty");
    }
    Ok(())
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exploding;

    impl PlatformParser for Exploding {
        fn platform(&self) -> Platform {
            Platform::UiPath
        }
        fn version(&self) -> &'static str {
            "test"
        }
        fn extract(&self, _content: &str) -> Result<Extraction> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn builtins_cover_every_supported_platform() {
        let registry = ParserRegistry::with_builtins();
        assert_eq!(registry.len(), Platform::SUPPORTED.len());
        for p in Platform::SUPPORTED {
            let parser = registry.get(p).unwrap();
            assert_eq!(parser.platform(), p);
        }
        assert!(registry.get(Platform::Unknown).is_none());
    }

    #[test]
    fn register_replaces_existing_parser() {
        let mut registry = ParserRegistry::with_builtins();
        registry.register(Box::new(Exploding));
        let parser = registry.get(Platform::UiPath).unwrap();
        assert_eq!(parser.version(), "test");
    }

    #[test]
    fn parse_reports_errors_without_failing() {
        let result = Exploding.parse("anything");
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.entities.is_empty());
    }

    #[test]
    fn sink_dedups_and_caps() {
        let mut sink = EntitySink::new();
        sink.push("host", "web1", 1);
        sink.push("host", "web1", 2);
        sink.push("host", "  ", 3);
        for i in 0..(MAX_ENTITIES + 5) {
            sink.push("n", &i.to_string(), i);
        }
        let ex = sink.finish();
        assert_eq!(ex.entities.len(), MAX_ENTITIES);
        assert_eq!(ex.entities[0].source, "line:1");
        assert_eq!(ex.warnings.len(), 1);
    }

    #[test]
    fn every_builtin_rejects_empty_content() {
        let registry = ParserRegistry::with_builtins();
        for p in Platform::SUPPORTED {
            let result = registry.get(p).unwrap().parse("   \n");
            assert!(result.error.is_some(), "{} accepted empty content", p);
        }
    }
}
