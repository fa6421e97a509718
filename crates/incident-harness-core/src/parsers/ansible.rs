//! Ansible playbook run output (`ansible-playbook` default callback).

use anyhow::Result;
use std::sync::LazyLock;

use super::{ensure_content, rule, EntitySink, Extraction, LineRule, PlatformParser};
use crate::models::Platform;

static RULES: LazyLock<Vec<LineRule>> = LazyLock::new(|| {
    vec![
        rule("playbook", r"(?i)\bplaybook:?\s+(\S+\.ya?ml)\b"),
        rule("play", r"^PLAY \[(.+?)\]"),
        rule("task", r"^TASK \[(.+?)\]"),
        rule("role", r"^TASK \[([^\]:]+?) : "),
        rule("host", r"^fatal: \[([^\]]+)\]"),
        rule("host", r"^(\S+)\s+:\s+ok=\d+.*\b(?:failed|unreachable)=[1-9]"),
        rule("module", r#""module_name":\s*"([^"]+)""#),
        rule("error_message", r#""msg":\s*"((?:[^"\\]|\\.)*)""#),
    ]
});

pub struct AnsibleParser;

impl PlatformParser for AnsibleParser {
    fn platform(&self) -> Platform {
        Platform::Ansible
    }

    fn version(&self) -> &'static str {
        "ansible-1.0"
    }

    fn extract(&self, content: &str) -> Result<Extraction> {
        ensure_content(content)?;
        let mut sink = EntitySink::new();
        let mut has_recap = false;
        for (idx, line) in content.lines().enumerate() {
            has_recap |= line.starts_with("PLAY RECAP");
            sink.apply_rules(&RULES, line, idx + 1);
        }
        if !has_recap {
            sink.warn("no PLAY RECAP found; output may be truncated");
        }
        Ok(sink.finish())
    }
}
