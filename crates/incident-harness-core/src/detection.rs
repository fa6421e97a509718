//! Signature-based platform detection.
//!
//! Every supported platform carries a weighted indicator set: filename globs
//! (roughly 0.3 of the weight) and content regexes (roughly 0.7). Scoring:
//!
//! 1. `base = Σ weight × matched` over the platform's indicators.
//! 2. `+0.1` when at least two independent indicators matched.
//! 3. `−0.2` for every platform with a strong base score (≥ 0.4) when another
//!    platform also fires strongly.
//! 4. Clamp to `[0, 1]`.
//!
//! The highest confidence wins (ties go to the earlier platform in
//! [`Platform::SUPPORTED`]). The decision is gated by the thresholds in the
//! caller's [`FlagSnapshot`].

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::models::{FlagSnapshot, Platform};

/// Tag stored with every detection result.
pub const DETECTION_METHOD: &str = "signature_v1";

/// Bonus applied when two or more indicators match.
pub const MULTI_INDICATOR_BONUS: f64 = 0.1;
/// Penalty applied to each strongly firing platform in a conflict.
pub const CONFLICT_PENALTY: f64 = 0.2;
/// Base score at which a platform counts as firing strongly.
pub const STRONG_SIGNAL: f64 = 0.4;
/// Only this many leading bytes of content are scanned.
pub const SCAN_LIMIT_BYTES: usize = 1 << 20;

enum Matcher {
    Filename(GlobMatcher),
    Content(Regex),
}

struct Indicator {
    name: &'static str,
    weight: f64,
    matcher: Matcher,
}

struct Signature {
    platform: Platform,
    indicators: Vec<Indicator>,
}

fn filename(name: &'static str, weight: f64, glob: &str) -> Indicator {
    let matcher = GlobBuilder::new(glob)
        .case_insensitive(true)
        .build()
        .expect("invalid builtin filename glob")
        .compile_matcher();
    Indicator {
        name,
        weight,
        matcher: Matcher::Filename(matcher),
    }
}

fn content(name: &'static str, weight: f64, pattern: &str) -> Indicator {
    Indicator {
        name,
        weight,
        matcher: Matcher::Content(Regex::new(pattern).expect("invalid builtin content pattern")),
    }
}

static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    vec![
        Signature {
            platform: Platform::UiPath,
            indicators: vec![
                filename("xaml_file", 0.15, "*.xaml"),
                filename("uipath_name", 0.10, "*uipath*"),
                filename("execution_log", 0.05, "*_execution.log"),
                content(
                    "uipath_namespace",
                    0.25,
                    r"UiPath\.(Executor|Robot|Core|System\.Activities|UIAutomation)",
                ),
                content("process_name_field", 0.15, r#""processName"\s*:"#),
                content("robot_name_field", 0.10, r#""robotName"\s*:"#),
                content("job_id_field", 0.10, r#""jobId"\s*:"#),
                content("xaml_reference", 0.10, r"\w\.xaml\b"),
            ],
        },
        Signature {
            platform: Platform::AutomationAnywhere,
            indicators: vec![
                filename("atmx_file", 0.10, "*.atmx"),
                filename("bot_runner_name", 0.10, "*botrunner*"),
                filename("aa_name", 0.10, "*automationanywhere*"),
                content("aa_product", 0.20, r"(?i)automation\s?anywhere"),
                content("bot_runner", 0.15, r"(?i)\bbot\s?runner\b"),
                content("control_room", 0.15, r"(?i)\bcontrol\s?room\b"),
                content("taskbot", 0.10, r"\bTaskBot\b|\.atmx\b"),
                content("device_field", 0.10, r#""deviceName"\s*:|\bDevice\s?Name\s*[:=]"#),
            ],
        },
        Signature {
            platform: Platform::BluePrism,
            indicators: vec![
                filename("bp_name", 0.15, "*blueprism*"),
                filename("bprelease_file", 0.15, "*.bprelease"),
                content("bp_product", 0.20, r"(?i)blue\s?prism"),
                content("stage_field", 0.15, r"\bStage(\s?Name)?\s*[:=]"),
                content("session_field", 0.15, r"\bSession\s?(ID|Number)\s*[:=]"),
                content("bpa_table", 0.10, r"\bBPA(Session|Process|Resource|SessionLog)\w*"),
                content("resource_pc", 0.10, r"\bResource\s?PC\b"),
            ],
        },
        Signature {
            platform: Platform::PowerAutomate,
            indicators: vec![
                filename("pa_name", 0.15, "*powerautomate*"),
                filename("flow_run_name", 0.15, "*flow_run*"),
                content("pa_product", 0.20, r"(?i)power\s?automate"),
                content("flow_name_field", 0.15, r#""flow(Name|DisplayName)"\s*:"#),
                content("ms_flow_namespace", 0.15, r"Microsoft\.(Flow|Logic)\b"),
                content("run_id_field", 0.10, r#""runId"\s*:"#),
                content("action_name_field", 0.10, r#""actionName"\s*:"#),
            ],
        },
        Signature {
            platform: Platform::Ansible,
            indicators: vec![
                filename("ansible_name", 0.15, "*ansible*"),
                filename("playbook_name", 0.15, "*playbook*"),
                content("play_header", 0.20, r"(?m)^PLAY \["),
                content("task_header", 0.20, r"(?m)^TASK \["),
                content("play_recap", 0.15, r"(?m)^PLAY RECAP"),
                content("fatal_host", 0.15, r"(?m)^fatal: \[[^\]]+\]"),
            ],
        },
    ]
});

/// Score of one platform's signature against an upload.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformScore {
    pub platform: Platform,
    pub base: f64,
    pub matched: Vec<&'static str>,
    pub confidence: f64,
}

/// What the pipeline should do with a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Below the minimum confidence: generic path, no label.
    Unknown,
    /// Labelled, but not trusted enough to parse; raw content is kept.
    LabelOnly,
    /// Trusted: run the platform parser.
    RunParser,
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub platform: Platform,
    pub confidence: f64,
    pub decision: Decision,
    pub scores: Vec<PlatformScore>,
}

/// Score `content` (and its `filename`) against every platform signature.
pub fn detect(filename: &str, content: &str, flags: &FlagSnapshot) -> Detection {
    let basename = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let scanned = &content[..floor_char_boundary(content, SCAN_LIMIT_BYTES)];

    let mut scores: Vec<PlatformScore> = SIGNATURES
        .iter()
        .map(|sig| {
            let mut base = 0.0;
            let mut matched = Vec::new();
            for ind in &sig.indicators {
                let hit = match &ind.matcher {
                    Matcher::Filename(glob) => glob.is_match(basename),
                    Matcher::Content(re) => re.is_match(scanned),
                };
                if hit {
                    base += ind.weight;
                    matched.push(ind.name);
                }
            }
            PlatformScore {
                platform: sig.platform,
                base,
                matched,
                confidence: 0.0,
            }
        })
        .collect();

    let strong = scores.iter().filter(|s| s.base >= STRONG_SIGNAL).count();
    for s in scores.iter_mut() {
        let mut c = s.base;
        if s.matched.len() >= 2 {
            c += MULTI_INDICATOR_BONUS;
        }
        if strong >= 2 && s.base >= STRONG_SIGNAL {
            c -= CONFLICT_PENALTY;
        }
        s.confidence = c.clamp(0.0, 1.0);
    }

    let mut best: Option<&PlatformScore> = None;
    for s in &scores {
        if best.map_or(true, |b| s.confidence > b.confidence) {
            best = Some(s);
        }
    }

    let (platform, confidence) = best
        .map(|b| (b.platform, b.confidence))
        .unwrap_or((Platform::Unknown, 0.0));

    let (platform, decision) = if confidence < flags.min_confidence {
        (Platform::Unknown, Decision::Unknown)
    } else if confidence >= flags.rollout_threshold && flags.parser_allowed(platform) {
        (platform, Decision::RunParser)
    } else {
        (platform, Decision::LabelOnly)
    };

    Detection {
        platform,
        confidence,
        decision,
        scores,
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    const UIPATH_LOG: &str = r#"{"message":"Execution started","level":"Information","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c","fileName":"Main.xaml"}
{"message":"UiPath.Core.Activities.Click: Cannot find the UI element corresponding to this selector","level":"Error","processName":"InvoiceBot","robotName":"ROBOT-07","jobId":"8f3c"}
"#;

    const ANSIBLE_LOG: &str = "PLAY [webservers] *****\n\nTASK [Gathering Facts] *****\nok: [web1]\nfatal: [web2]: UNREACHABLE! => {\"changed\": false}\n\nPLAY RECAP *****\nweb1 : ok=1\n";

    fn flags() -> FlagSnapshot {
        FlagSnapshot::default()
    }

    #[test]
    fn uipath_log_runs_parser() {
        let d = detect("Robot_execution.log", UIPATH_LOG, &flags());
        assert_eq!(d.platform, Platform::UiPath);
        assert!(d.confidence >= 0.70, "confidence {}", d.confidence);
        assert_eq!(d.decision, Decision::RunParser);
    }

    #[test]
    fn ansible_log_detected() {
        let d = detect("deploy.log", ANSIBLE_LOG, &flags());
        assert_eq!(d.platform, Platform::Ansible);
        assert_eq!(d.decision, Decision::RunParser);
    }

    #[test]
    fn plain_text_is_unknown() {
        let d = detect("notes.txt", "nothing interesting happened today", &flags());
        assert_eq!(d.platform, Platform::Unknown);
        assert_eq!(d.decision, Decision::Unknown);
        assert!(d.confidence < 0.15);
    }

    #[test]
    fn filename_only_signal_is_label_only() {
        // xaml (0.15) + uipath (0.10) = 0.25, +0.1 bonus = 0.35
        let d = detect("uipath_Main.xaml", "<Activity />", &flags());
        assert_eq!(d.platform, Platform::UiPath);
        assert!((d.confidence - 0.35).abs() < 1e-9);
        assert_eq!(d.decision, Decision::LabelOnly);
    }

    #[test]
    fn single_indicator_gets_no_bonus() {
        let d = detect("x.log", "Bot Runner started", &flags());
        let aa = d
            .scores
            .iter()
            .find(|s| s.platform == Platform::AutomationAnywhere)
            .unwrap();
        assert_eq!(aa.matched, vec!["bot_runner"]);
        assert!((aa.confidence - 0.15).abs() < 1e-9);
    }

    #[test]
    fn conflicting_platforms_are_penalized() {
        let mixed = format!("{}{}", UIPATH_LOG, ANSIBLE_LOG);
        let d = detect("combined.log", &mixed, &flags());
        for s in d.scores.iter().filter(|s| s.base >= STRONG_SIGNAL) {
            let expected = (s.base + MULTI_INDICATOR_BONUS - CONFLICT_PENALTY).clamp(0.0, 1.0);
            assert!((s.confidence - expected).abs() < 1e-9);
        }
        assert!(d.scores.iter().filter(|s| s.base >= STRONG_SIGNAL).count() >= 2);
    }

    #[test]
    fn confidence_always_in_unit_interval() {
        let everything = format!(
            "{}{} Automation Anywhere Control Room Bot Runner TaskBot Blue Prism Power Automate Microsoft.Flow",
            UIPATH_LOG, ANSIBLE_LOG
        );
        for name in ["a.xaml", "uipath_ansible_playbook.atmx", ""] {
            let d = detect(name, &everything, &flags());
            assert!((0.0..=1.0).contains(&d.confidence));
            for s in &d.scores {
                assert!((0.0..=1.0).contains(&s.confidence));
            }
        }
    }

    #[test]
    fn raised_threshold_skips_parser() {
        let strict = FlagSnapshot {
            rollout_threshold: 0.99,
            ..flags()
        };
        let d = detect("Robot_execution.log", UIPATH_LOG, &strict);
        assert_eq!(d.platform, Platform::UiPath);
        assert_eq!(d.decision, Decision::LabelOnly);
    }

    #[test]
    fn disabled_parsers_skip_parser() {
        let off = FlagSnapshot {
            parsers_enabled: false,
            ..flags()
        };
        let d = detect("Robot_execution.log", UIPATH_LOG, &off);
        assert_eq!(d.decision, Decision::LabelOnly);
    }

    #[test]
    fn path_components_are_ignored_for_filename_globs() {
        let d = detect("exports/ansible/run.txt", "", &flags());
        let ansible = d
            .scores
            .iter()
            .find(|s| s.platform == Platform::Ansible)
            .unwrap();
        assert!(ansible.matched.is_empty());
    }
}
