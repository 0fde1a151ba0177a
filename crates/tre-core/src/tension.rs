//! Tension detection: pairwise scoring of geoid snapshots.
//!
//! Each unordered pair gets three sub-scores, combined with fixed weights:
//! vector misalignment (cosine distance of the feature distributions), layer
//! conflict (a geoid's dominant feature contradicted by symbolic content of
//! the pair) and symbolic opposition (claims negating each other). Pairs are
//! independent and scored in parallel.

use std::collections::BTreeMap;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::TensionConfig;
use crate::constants::EPSILON;
use crate::geoid::{Assertion, Geoid, GeoidId};

/// Which sub-score contributed the largest weighted share.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradientType {
    Embedding,
    Layer,
    Symbolic,
}

impl GradientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Layer => "layer",
            Self::Symbolic => "symbolic",
        }
    }
}

impl fmt::Display for GradientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw sub-scores, each in [0,1].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TensionComponents {
    pub vector_misalignment: f64,
    pub layer_conflict: f64,
    pub symbolic_opposition: f64,
}

/// A scored, not yet resolved, contradiction between two geoids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensionGradient {
    pub geoid_a: GeoidId,
    pub geoid_b: GeoidId,
    pub tension_score: f64,
    pub gradient_type: GradientType,
    pub components: TensionComponents,
}

impl TensionGradient {
    /// Pair key independent of argument order.
    pub fn pair_key(&self) -> (GeoidId, GeoidId) {
        pair_key(self.geoid_a, self.geoid_b)
    }
}

pub fn pair_key(a: GeoidId, b: GeoidId) -> (GeoidId, GeoidId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// How strongly two concepts oppose each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opposition {
    /// One is the prefixed negation of the other (`x` / `not_x`).
    Direct,
    /// Listed in the opposing-pairs table.
    Paired,
}

/// Configurable rules deciding when semantic and symbolic layers disagree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConflictRules {
    pub negation_prefix: String,
    pub opposing_pairs: Vec<(String, String)>,
    /// Symbolic opposition score for claims that are a table pair rather
    /// than a direct negation.
    pub opposing_pair_grade: f64,
}

impl Default for LayerConflictRules {
    fn default() -> Self {
        Self {
            negation_prefix: "not_".to_string(),
            opposing_pairs: Vec::new(),
            opposing_pair_grade: 0.5,
        }
    }
}

impl LayerConflictRules {
    pub fn opposition(&self, x: &str, y: &str) -> Option<Opposition> {
        let x = x.to_lowercase();
        let y = y.to_lowercase();
        if x == y {
            return None;
        }
        let p = self.negation_prefix.as_str();
        if !p.is_empty()
            && (x.strip_prefix(p) == Some(y.as_str()) || y.strip_prefix(p) == Some(x.as_str()))
        {
            return Some(Opposition::Direct);
        }
        let paired = self.opposing_pairs.iter().any(|(l, r)| {
            let (l, r) = (l.to_lowercase(), r.to_lowercase());
            (l == x && r == y) || (l == y && r == x)
        });
        paired.then_some(Opposition::Paired)
    }

    /// Does `assertion` contradict a geoid whose dominant feature is `dominant`?
    pub fn contradicts(&self, dominant: &str, assertion: &Assertion) -> bool {
        let same = assertion.concept.eq_ignore_ascii_case(dominant);
        if assertion.negated {
            same
        } else {
            self.opposition(dominant, &assertion.concept).is_some()
        }
    }
}

pub fn cosine_similarity(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    let norm_a = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b = b.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm_a < EPSILON || norm_b < EPSILON {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .filter_map(|(k, wa)| b.get(k).map(|wb| wa * wb))
        .sum();
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Cosine distance over the union of feature keys. Empty on either side is 0.
pub fn vector_misalignment(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let norm_a = a.values().map(|w| w * w).sum::<f64>();
    let norm_b = b.values().map(|w| w * w).sum::<f64>();
    if norm_a < EPSILON || norm_b < EPSILON {
        return 0.0;
    }
    (1.0 - cosine_similarity(a, b)).clamp(0.0, 1.0)
}

/// Angle between the feature vectors, in radians. 0 when either is empty.
pub fn axis_angle(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    cosine_similarity(a, b).acos()
}

pub fn layer_conflict(a: &Geoid, b: &Geoid, rules: &LayerConflictRules) -> f64 {
    let assertions: Vec<Assertion> = a.assertions().chain(b.assertions()).collect();
    if assertions.is_empty() {
        return 0.0;
    }
    [a, b]
        .iter()
        .filter_map(|g| g.dominant_feature())
        .filter(|(feature, _)| assertions.iter().any(|asr| rules.contradicts(feature, asr)))
        .map(|(_, weight)| weight)
        .fold(0.0, f64::max)
        .clamp(0.0, 1.0)
}

pub fn symbolic_opposition(a: &Geoid, b: &Geoid, rules: &LayerConflictRules) -> f64 {
    let mut score: f64 = 0.0;
    for (pa, na) in a.claims() {
        for (pb, nb) in b.claims() {
            if pa == pb {
                if na != nb {
                    return 1.0;
                }
                continue;
            }
            if na || nb {
                continue;
            }
            match rules.opposition(pa, pb) {
                Some(Opposition::Direct) => return 1.0,
                Some(Opposition::Paired) => score = score.max(rules.opposing_pair_grade),
                None => {}
            }
        }
    }
    score.clamp(0.0, 1.0)
}

pub struct TensionDetector {
    config: TensionConfig,
}

impl TensionDetector {
    pub fn new(config: TensionConfig) -> Self {
        Self { config }
    }

    /// Composite score, dominant component and raw components for one pair.
    pub fn score_pair(&self, a: &Geoid, b: &Geoid) -> (f64, GradientType, TensionComponents) {
        let components = TensionComponents {
            vector_misalignment: vector_misalignment(a.semantic_state(), b.semantic_state()),
            layer_conflict: layer_conflict(a, b, &self.config.rules),
            symbolic_opposition: symbolic_opposition(a, b, &self.config.rules),
        };
        let shares = [
            (
                GradientType::Embedding,
                self.config.vector_weight * components.vector_misalignment,
            ),
            (
                GradientType::Layer,
                self.config.layer_weight * components.layer_conflict,
            ),
            (
                GradientType::Symbolic,
                self.config.symbolic_weight * components.symbolic_opposition,
            ),
        ];
        let composite: f64 = shares.iter().map(|(_, s)| s).sum();
        let mut dominant = shares[0];
        for share in &shares[1..] {
            if share.1 > dominant.1 {
                dominant = *share;
            }
        }
        (composite.clamp(0.0, 1.0), dominant.0, components)
    }

    fn gradient(&self, a: &Geoid, b: &Geoid, threshold: f64) -> Option<TensionGradient> {
        let (tension_score, gradient_type, components) = self.score_pair(a, b);
        (tension_score > threshold).then(|| TensionGradient {
            geoid_a: a.id,
            geoid_b: b.id,
            tension_score,
            gradient_type,
            components,
        })
    }

    /// Score every unordered pair; keep those strictly above `threshold`.
    pub fn detect(&self, geoids: &[Geoid], threshold: f64) -> Vec<TensionGradient> {
        let n = geoids.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect();
        pairs
            .par_iter()
            .filter_map(|&(i, j)| self.gradient(&geoids[i], &geoids[j], threshold))
            .collect()
    }

    /// Score an explicit list of pairs (buffered re-submissions).
    pub fn detect_pairs(&self, pairs: &[(Geoid, Geoid)], threshold: f64) -> Vec<TensionGradient> {
        pairs
            .par_iter()
            .filter_map(|(a, b)| self.gradient(a, b, threshold))
            .collect()
    }
}
