//! Automation Anywhere Bot Runner and Control Room logs.

use anyhow::Result;
use std::sync::LazyLock;

use super::{ensure_content, rule, EntitySink, Extraction, LineRule, PlatformParser};
use crate::models::Platform;

static RULES: LazyLock<Vec<LineRule>> = LazyLock::new(|| {
    vec![
        rule("bot_file", r"([\w\-]+\.atmx)\b"),
        rule("bot", r#"(?i)\bbot\s?name["']?\s*[:=]\s*["']?([\w\-. ]+?)["']?\s*(?:[,;]|$)"#),
        rule("device", r#"(?i)\bdevice\s?name["']?\s*[:=]\s*["']?([\w\-.]+)"#),
        rule("control_room", r"(?i)\bcontrol\s?room(?:\s?url)?\s*[:=]\s*(\S+)"),
        rule("run_as_user", r"(?i)\brun\s?as\s?user\s*[:=]\s*([\w\-.@\\]+)"),
        rule("error_code", r"(?i)\berror\s?code\s*[:=]\s*([\w\-]+)"),
        rule("error_message", r"(?i)\b(?:error|failed)\b[^:]*:\s*(.+)$"),
    ]
});

pub struct AutomationAnywhereParser;

impl PlatformParser for AutomationAnywhereParser {
    fn platform(&self) -> Platform {
        Platform::AutomationAnywhere
    }

    fn version(&self) -> &'static str {
        "aa-1.0"
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

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
2024-05-01 08:00:00 INFO Bot Runner connected to Control Room URL: https://cr.example.com
2024-05-01 08:00:01 INFO Deploying TaskBot Finance-Reconcile.atmx; Device Name: VDI-042
2024-05-01 08:00:02 INFO Bot Name: Finance Reconcile, Run As User: svc_rpa
2024-05-01 08:03:10 ERROR Step 14 failed: Object not found in window 'SAP Logon' (Error Code: OBJ-404)
";

    #[test]
    fn extracts_deployment_context() {
        let ex = AutomationAnywhereParser.extract(LOG).unwrap();
        let get = |t: &str| {
            ex.entities
                .iter()
                .find(|e| e.entity_type == t)
                .map(|e| e.value.clone())
        };
        assert_eq!(get("control_room").as_deref(), Some("https://cr.example.com"));
        assert_eq!(get("bot_file").as_deref(), Some("Finance-Reconcile.atmx"));
        assert_eq!(get("device").as_deref(), Some("VDI-042"));
        assert_eq!(get("bot").as_deref(), Some("Finance Reconcile"));
        assert_eq!(get("run_as_user").as_deref(), Some("svc_rpa"));
    }

    #[test]
    fn extracts_failures() {
        let ex = AutomationAnywhereParser.extract(LOG).unwrap();
        let code = ex.entities.iter().find(|e| e.entity_type == "error_code").unwrap();
        assert_eq!(code.value, "OBJ-404");
        assert_eq!(code.source, "line:4");
        assert!(ex
            .entities
            .iter()
            .any(|e| e.entity_type == "error_message" && e.value.contains("Object not found")));
    }
}
