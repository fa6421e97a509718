//! Blue Prism session log exports (pipe-separated `Key: value` columns).

use anyhow::Result;
use std::sync::LazyLock;

use super::{ensure_content, rule, EntitySink, Extraction, LineRule, PlatformParser};
use crate::models::Platform;

static RULES: LazyLock<Vec<LineRule>> = LazyLock::new(|| {
    vec![
        rule(
            "session_id",
            r"(?i)\bsession\s*(?:id)?\s*[:=]?\s*([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
        ),
        rule("process", r"(?i)\bprocess\s*(?:name)?\s*[:=]\s*([^|,;]+)"),
        rule("resource", r"(?i)\bresource(?:\s?pc)?\s*[:=]\s*([\w\-.]+)"),
        rule("stage", r"(?i)\bstage(?:\s?name)?\s*[:=]\s*([^|,;]+)"),
        rule("work_queue", r"(?i)\bwork\s?queue\s*[:=]\s*([^|,;]+)"),
        rule("exception_type", r"(?i)\bexception\s?type\s*[:=]\s*([^|,;]+)"),
        rule("exception", r"(?i)\bexception\s?detail\s*[:=]\s*(.+)$"),
    ]
});

pub struct BluePrismParser;

impl PlatformParser for BluePrismParser {
    fn platform(&self) -> Platform {
        Platform::BluePrism
    }

    fn version(&self) -> &'static str {
        "blueprism-1.0"
    }

    fn extract(&self, content: &str) -> Result<Extraction> {
        ensure_content(content)?;
        let mut sink = EntitySink::new();
        for (idx, line) in content.lines().enumerate() {
            sink.apply_rules(&RULES, line, idx + 1);
        }
        Ok(sink.finish())
    }
}
