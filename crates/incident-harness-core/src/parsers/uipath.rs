//! UiPath robot execution logs.
//!
//! Robot logs are JSON lines (`processName`, `robotName`, `jobId`, `level`,
//! `message`, `fileName`). Lines that are not JSON are still scanned with
//! the plain-text rules so mixed Orchestrator exports parse too.

use anyhow::Result;
use serde_json::Value;
use std::sync::LazyLock;

use super::{ensure_content, rule, EntitySink, Extraction, LineRule, PlatformParser};
use crate::models::Platform;

static TEXT_RULES: LazyLock<Vec<LineRule>> = LazyLock::new(|| {
    vec![
        rule("activity", r"(UiPath\.[A-Za-z]+(?:\.[A-Za-z]+)*)"),
        rule("workflow_file", r"([\w\-]+\.xaml)\b"),
        rule("exception", r"\b((?:[A-Z]\w*\.)*[A-Z]\w*Exception)\b"),
        rule("error_message", r"(?i)\b(?:error|fatal)\b[^:]*:\s*(.+)$"),
    ]
});

const JSON_FIELDS: [(&str, &str); 4] = [
    ("processName", "process"),
    ("robotName", "robot"),
    ("jobId", "job_id"),
    ("fileName", "workflow_file"),
];

pub struct UiPathParser;

impl PlatformParser for UiPathParser {
    fn platform(&self) -> Platform {
        Platform::UiPath
    }

    fn version(&self) -> &'static str {
        "uipath-1.2"
    }

    fn extract(&self, content: &str) -> Result<Extraction> {
        ensure_content(content)?;
        let mut sink = EntitySink::new();
        let mut bad_json = 0usize;

        for (idx, line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = line.trim();
            if trimmed.starts_with('{') {
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(record) => {
                        scan_record(&mut sink, &record, line_no);
                        continue;
                    }
                    Err(_) => bad_json += 1,
                }
            }
            sink.apply_rules(&TEXT_RULES, line, line_no);
        }

        if bad_json > 0 {
            sink.warn(format!("{} log lines looked like JSON but did not parse", bad_json));
        }
        Ok(sink.finish())
    }
}

fn scan_record(sink: &mut EntitySink, record: &Value, line_no: usize) {
    for (field, entity_type) in JSON_FIELDS {
        if let Some(v) = record.get(field).and_then(Value::as_str) {
            sink.push(entity_type, v, line_no);
        }
    }

    let message = record.get("message").and_then(Value::as_str).unwrap_or("");
    let level = record.get("level").and_then(Value::as_str).unwrap_or("");
    if matches!(level, "Error" | "Fatal") {
        sink.push("error_message", message, line_no);
    }
    for r in TEXT_RULES.iter().filter(|r| r.entity_type != "error_message") {
        if let Some(m) = r.regex.captures(message).and_then(|c| c.get(1)) {
            sink.push(r.entity_type, m.as_str(), line_no);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"{"message":"Execution started","level":"Information","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c","fileName":"Main.xaml"}
{"message":"UiPath.Core.Activities.Click: Cannot find the UI element","level":"Error","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c"}
{"broken json
2024-05-01 10:00:02 ERROR Orchestrator: queue item failed with System.TimeoutException
"#;

    #[test]
    fn extracts_json_fields_in_order() {
        let ex = UiPathParser.extract(LOG).unwrap();
        let kinds: Vec<&str> = ex.entities.iter().map(|e| e.entity_type.as_str()).collect();
        assert_eq!(&kinds[..4], &["process", "robot", "job_id", "workflow_file"]);
        assert_eq!(ex.entities[0].value, "InvoiceBot");
        assert_eq!(ex.entities[0].source, "line:1");
    }

    #[test]
    fn error_records_produce_messages_and_activities() {
        let ex = UiPathParser.extract(LOG).unwrap();
        assert!(ex
            .entities
            .iter()
            .any(|e| e.entity_type == "error_message" && e.value.contains("Cannot find")));
        assert!(ex
            .entities
            .iter()
            .any(|e| e.entity_type == "activity" && e.value == "UiPath.Core.Activities.Click"));
    }

    #[test]
    fn plain_lines_use_text_rules() {
        let ex = UiPathParser.extract(LOG).unwrap();
        let exc = ex
            .entities
            .iter()
            .find(|e| e.entity_type == "exception")
            .unwrap();
        assert_eq!(exc.value, "System.TimeoutException");
        assert_eq!(exc.source, "line:4");
    }

    #[test]
    fn malformed_json_is_a_warning() {
        let ex = UiPathParser.extract(LOG).unwrap();
        assert_eq!(ex.warnings.len(), 1);
    }

    #[test]
    fn duplicate_values_are_reported_once() {
        let ex = UiPathParser.extract(LOG).unwrap();
        let robots = ex.entities.iter().filter(|e| e.entity_type == "robot").count();
        assert_eq!(robots, 1);
    }
}
