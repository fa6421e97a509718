//! Score normalization and weighted fusion for hybrid retrieval.
//!
//! # Fusion
//!
//! 1. Vector and lexical channels are ranked independently.
//! 2. Each channel is min-max normalized to `[0, 1]`.
//! 3. `combined = w_v × vector + w_l × lexical`, with the weights rescaled to
//!    sum to 1. A candidate missing from a channel scores 0 there.
//! 4. Without a lexical channel (breaker open, lexical failure) the combined
//!    score is the vector score and no lexical component is reported.
//! 5. Sort by combined (desc), then id (asc) for determinism.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Relative weights of the two retrieval channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub vector: f64,
    pub lexical: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            lexical: 0.4,
        }
    }
}

impl FusionWeights {
    fn normalized(&self) -> (f64, f64) {
        let total = self.vector + self.lexical;
        if total <= f64::EPSILON {
            (1.0, 0.0)
        } else {
            (self.vector / total, self.lexical / total)
        }
    }
}

/// One candidate after fusion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedScore {
    pub id: String,
    pub combined: f64,
    pub vector: f64,
    /// `None` when the query ran vector-only.
    pub lexical: Option<f64>,
}

/// Min-max normalize raw scores to `[0, 1]`.
///
/// An all-equal (or single-element) set normalizes to `1.0` throughout.
pub fn normalize(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let s_min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Normalize a channel of `(id, raw_score)` pairs into an id → score map.
pub fn normalize_channel(raw: &[(String, f64)]) -> HashMap<String, f64> {
    let scores: Vec<f64> = raw.iter().map(|(_, s)| *s).collect();
    raw.iter()
        .map(|(id, _)| id.clone())
        .zip(normalize(&scores))
        .collect()
}

/// Fuse normalized channels into a single ranking.
pub fn fuse(
    vector: &HashMap<String, f64>,
    lexical: Option<&HashMap<String, f64>>,
    weights: FusionWeights,
) -> Vec<FusedScore> {
    let mut ids: BTreeSet<&String> = vector.keys().collect();
    if let Some(lex) = lexical {
        ids.extend(lex.keys());
    }

    let (w_v, w_l) = weights.normalized();
    let mut fused: Vec<FusedScore> = ids
        .into_iter()
        .map(|id| {
            let v = vector.get(id).copied().unwrap_or(0.0);
            match lexical {
                Some(lex) => {
                    let l = lex.get(id).copied().unwrap_or(0.0);
                    FusedScore {
                        id: id.clone(),
                        combined: w_v * v + w_l * l,
                        vector: v,
                        lexical: Some(l),
                    }
                }
                None => FusedScore {
                    id: id.clone(),
                    combined: v,
                    vector: v,
                    lexical: None,
                },
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    fused
}
