//! Per-tenant latency breaker for hybrid retrieval.
//!
//! ```text
//!            slow query                 N consecutive slow
//! enabled ─────────────▶ monitoring ──────────────────────▶ auto_disabled
//!    ▲                       │                                   │
//!    └──── fast query ───────┘                                   │
//!    └────────────────────── operator re-enable ─────────────────┘
//! ```
//!
//! A query is slow when its latency exceeds `latency_multiplier` times the
//! rolling P95 of recent healthy queries. Slow samples never enter the
//! baseline, so a sustained regression cannot drag the baseline up and hide
//! itself. Until `min_baseline_samples` healthy queries have been seen no
//! query is judged slow.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::models::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridState {
    Enabled,
    Monitoring,
    AutoDisabled,
}

impl HybridState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HybridState::Enabled => "enabled",
            HybridState::Monitoring => "monitoring",
            HybridState::AutoDisabled => "auto_disabled",
        }
    }
}

impl fmt::Display for HybridState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HybridState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(HybridState::Enabled),
            "monitoring" => Ok(HybridState::Monitoring),
            "auto_disabled" => Ok(HybridState::AutoDisabled),
            other => Err(ParseEnumError {
                kind: "hybrid state",
                value: other.to_string(),
            }),
        }
    }
}

/// Tuning for [`HybridBreaker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    pub latency_multiplier: f64,
    pub sustained_window: u32,
    pub baseline_window: usize,
    pub min_baseline_samples: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            latency_multiplier: 1.5,
            sustained_window: 5,
            baseline_window: 100,
            min_baseline_samples: 20,
        }
    }
}

/// A state change produced by [`HybridBreaker::record`] or
/// [`HybridBreaker::reenable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HybridState,
    pub to: HybridState,
}

#[derive(Debug, Clone)]
pub struct HybridBreaker {
    settings: BreakerSettings,
    state: HybridState,
    baseline: VecDeque<f64>,
    consecutive_slow: u32,
}

impl HybridBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: HybridState::Enabled,
            baseline: VecDeque::with_capacity(settings.baseline_window),
            consecutive_slow: 0,
        }
    }

    /// Restore a breaker that was persisted as `state`.
    pub fn restored(settings: BreakerSettings, state: HybridState) -> Self {
        let mut breaker = Self::new(settings);
        // A restart loses the baseline, so monitoring restarts from enabled.
        if state == HybridState::AutoDisabled {
            breaker.state = state;
        }
        breaker
    }

    pub fn state(&self) -> HybridState {
        self.state
    }

    pub fn allows_hybrid(&self) -> bool {
        self.state != HybridState::AutoDisabled
    }

    /// Rolling P95 of healthy latencies, once enough samples exist.
    pub fn p95(&self) -> Option<f64> {
        if self.baseline.len() < self.settings.min_baseline_samples.max(1) {
            return None;
        }
        let mut sorted: Vec<f64> = self.baseline.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    /// Record the combined latency of one hybrid query, in milliseconds.
    pub fn record(&mut self, latency_ms: f64) -> Option<Transition> {
        if self.state == HybridState::AutoDisabled {
            return None;
        }

        let slow = match self.p95() {
            Some(p95) => latency_ms > self.settings.latency_multiplier * p95,
            None => false,
        };

        let from = self.state;
        if slow {
            self.consecutive_slow += 1;
            self.state = if self.consecutive_slow >= self.settings.sustained_window.max(1) {
                HybridState::AutoDisabled
            } else {
                HybridState::Monitoring
            };
        } else {
            self.consecutive_slow = 0;
            self.state = HybridState::Enabled;
            self.push_sample(latency_ms);
        }

        (from != self.state).then_some(Transition {
            from,
            to: self.state,
        })
    }

    /// Operator override: return to hybrid mode, keeping the baseline.
    pub fn reenable(&mut self) -> Option<Transition> {
        let from = self.state;
        self.state = HybridState::Enabled;
        self.consecutive_slow = 0;
        (from != self.state).then_some(Transition {
            from,
            to: self.state,
        })
    }

    fn push_sample(&mut self, latency_ms: f64) {
        if self.baseline.len() == self.settings.baseline_window.max(1) {
            self.baseline.pop_front();
        }
        self.baseline.push_back(latency_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warmed(settings: BreakerSettings) -> HybridBreaker {
        let mut b = HybridBreaker::new(settings);
        for _ in 0..settings.min_baseline_samples {
            assert!(b.record(10.0).is_none());
        }
        b
    }

    #[test]
    fn no_judgement_before_baseline_exists() {
        let mut b = HybridBreaker::new(BreakerSettings::default());
        for _ in 0..10 {
            b.record(10_000.0);
        }
        assert_eq!(b.state(), HybridState::Enabled);
    }

    #[test]
    fn p95_of_uniform_samples() {
        let b = warmed(BreakerSettings::default());
        assert_eq!(b.p95(), Some(10.0));
    }

    #[test]
    fn sustained_slow_queries_auto_disable() {
        let mut b = warmed(BreakerSettings::default());
        let t = b.record(16.0).unwrap();
        assert_eq!(t.to, HybridState::Monitoring);
        for _ in 0..3 {
            assert!(b.record(16.0).is_none());
        }
        let t = b.record(16.0).unwrap();
        assert_eq!(t.from, HybridState::Monitoring);
        assert_eq!(t.to, HybridState::AutoDisabled);
        assert!(!b.allows_hybrid());
    }

    #[test]
    fn fast_query_returns_monitoring_to_enabled() {
        let mut b = warmed(BreakerSettings::default());
        b.record(20.0);
        assert_eq!(b.state(), HybridState::Monitoring);
        let t = b.record(11.0).unwrap();
        assert_eq!(t.to, HybridState::Enabled);
        // counter was reset: four more slow queries do not trip the breaker
        for _ in 0..4 {
            b.record(20.0);
        }
        assert_eq!(b.state(), HybridState::Monitoring);
    }

    #[test]
    fn latency_at_threshold_is_not_slow() {
        let mut b = warmed(BreakerSettings::default());
        assert!(b.record(15.0).is_none());
        assert_eq!(b.state(), HybridState::Enabled);
    }

    #[test]
    fn auto_disabled_ignores_samples_until_reenabled() {
        let mut b = warmed(BreakerSettings {
            sustained_window: 1,
            ..BreakerSettings::default()
        });
        assert_eq!(b.record(100.0).unwrap().to, HybridState::AutoDisabled);
        assert!(b.record(1.0).is_none());
        assert_eq!(b.state(), HybridState::AutoDisabled);
        let t = b.reenable().unwrap();
        assert_eq!(t.to, HybridState::Enabled);
        assert_eq!(b.p95(), Some(10.0));
    }

    #[test]
    fn restored_breaker_keeps_auto_disabled_only() {
        let s = BreakerSettings::default();
        assert_eq!(
            HybridBreaker::restored(s, HybridState::AutoDisabled).state(),
            HybridState::AutoDisabled
        );
        assert_eq!(
            HybridBreaker::restored(s, HybridState::Monitoring).state(),
            HybridState::Enabled
        );
    }
}
