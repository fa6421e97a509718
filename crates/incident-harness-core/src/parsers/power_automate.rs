//! Power Automate run history exports.
//!
//! Exports are either one JSON document or JSON lines. Known keys are
//! collected from anywhere in the tree; `code` and `message` only count
//! inside an `error` object. Content that is not JSON falls back to line
//! rules.

use anyhow::Result;
use serde_json::Value;
use std::sync::LazyLock;

use super::{ensure_content, rule, EntitySink, Extraction, LineRule, PlatformParser};
use crate::models::Platform;

static TEXT_RULES: LazyLock<Vec<LineRule>> = LazyLock::new(|| {
    vec![
        rule("flow", r#"(?i)\bflow\s?(?:display\s?)?name\s*[:=]\s*"?([^",;]+)"#),
        rule("run_id", r#"(?i)\brun\s?id\s*[:=]\s*"?([\w\-]+)"#),
        rule("action", r#"(?i)\baction\s?(?:name)?\s*[:=]\s*['"]?([^'",;]+)"#),
        rule("error_code", r"(?i)\berror\s?code\s*[:=]\s*([\w\-]+)"),
        rule("error_message", r"(?i)\b(?:error|failed)\b[^:]*:\s*(.+)$"),
    ]
});

const JSON_KEYS: [(&str, &str); 6] = [
    ("flowDisplayName", "flow"),
    ("flowName", "flow_id"),
    ("runId", "run_id"),
    ("actionName", "action"),
    ("environmentName", "environment"),
    ("connectionName", "connector"),
];

pub struct PowerAutomateParser;

impl PlatformParser for PowerAutomateParser {
    fn platform(&self) -> Platform {
        Platform::PowerAutomate
    }

    fn version(&self) -> &'static str {
        "powerautomate-1.1"
    }

    fn extract(&self, content: &str) -> Result<Extraction> {
        ensure_content(content)?;
        let mut sink = EntitySink::new();

        if let Ok(doc) = serde_json::from_str::<Value>(content) {
            let mut hits = Vec::new();
            walk(&doc, None, &mut hits);
            for (entity_type, value) in hits {
                sink.push(entity_type, &value, line_of(content, &value));
            }
            return Ok(sink.finish());
        }

        let mut unparsed = 0usize;
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with('{') {
                if let Ok(record) = serde_json::from_str::<Value>(trimmed) {
                    let mut hits = Vec::new();
                    walk(&record, None, &mut hits);
                    for (entity_type, value) in hits {
                        sink.push(entity_type, &value, idx + 1);
                    }
                    continue;
                }
                unparsed += 1;
            }
            sink.apply_rules(&TEXT_RULES, line, idx + 1);
        }
        if unparsed > 0 {
            sink.warn(format!("{} JSON records could not be parsed", unparsed));
        }
        Ok(sink.finish())
    }
}

fn walk(value: &Value, parent: Option<&str>, hits: &mut Vec<(&'static str, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if let Some(s) = child.as_str() {
                    if let Some(&(_, entity_type)) =
                        JSON_KEYS.iter().find(|(k, _)| *k == key.as_str())
                    {
                        hits.push((entity_type, s.to_string()));
                    } else if parent == Some("error") {
                        match key.as_str() {
                            "code" => hits.push(("error_code", s.to_string())),
                            "message" => hits.push(("error_message", s.to_string())),
                            _ => {}
                        }
                    }
                } else {
                    walk(child, Some(key.as_str()), hits);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, parent, hits);
            }
        }
        _ => {}
    }
}

/// 1-based line of the first occurrence of `needle`, or 1 when the value
/// was escaped in the source and cannot be found verbatim.
fn line_of(content: &str, needle: &str) -> usize {
    content
        .find(needle)
        .map(|i| content[..i].matches('\n').count() + 1)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"{
  "flowDisplayName": "Approve Expense",
  "runId": "08585-run-77",
  "actions": [
    {"actionName": "Send_approval_email", "status": "Succeeded"},
    {"actionName": "Update_SharePoint_item", "status": "Failed",
     "error": {"code": "NotFound", "message": "Item 42 does not exist"}}
  ]
}"#;

    #[test]
    fn walks_json_document() {
        let ex = PowerAutomateParser.extract(EXPORT).unwrap();
        let find = |t: &str| ex.entities.iter().find(|e| e.entity_type == t).unwrap();
        assert_eq!(find("flow").value, "Approve Expense");
        assert_eq!(find("flow").source, "line:2");
        assert_eq!(find("run_id").value, "08585-run-77");
        assert_eq!(find("error_code").value, "NotFound");
        assert_eq!(find("error_message").value, "Item 42 does not exist");
        assert_eq!(find("error_message").source, "line:7");
        let actions = ex.entities.iter().filter(|e| e.entity_type == "action").count();
        assert_eq!(actions, 2);
    }

    #[test]
    fn message_outside_error_object_is_ignored() {
        let ex = PowerAutomateParser
            .extract(r#"{"flowDisplayName": "A", "message": "hello"}"#)
            .unwrap();
        assert!(!ex.entities.iter().any(|e| e.entity_type == "error_message"));
    }

    #[test]
    fn plain_text_falls_back_to_rules() {
        let log = "flow name: Nightly Sync\nrun id: abc-123\nAction 'Get_rows' failed: timeout after 120s\n{not json\n";
        let ex = PowerAutomateParser.extract(log).unwrap();
        assert!(ex.entities.iter().any(|e| e.entity_type == "flow" && e.value == "Nightly Sync"));
        assert!(ex.entities.iter().any(|e| e.entity_type == "run_id" && e.value == "abc-123"));
        assert!(ex
            .entities
            .iter()
            .any(|e| e.entity_type == "error_message" && e.value == "timeout after 120s"));
        assert_eq!(ex.warnings.len(), 1);
    }
}
