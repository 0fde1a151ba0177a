use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    ENTROPY_HISTORY_LIMIT, EPSILON, INITIAL_ENERGY, NORMALIZATION_EPSILON,
};
use crate::error::{EngineError, Result};
use crate::time::{elapsed_secs, now_iso8601, now_unix_f64};

/// Opaque geoid identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeoidId(pub Uuid);

impl GeoidId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GeoidId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GeoidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Leading negation markers: `not p`, `¬p`, `~p`, `!p`.
static NEGATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?i:not\s+|¬\s*|~\s*|!\s*)(.+)$").unwrap());

/// A recognised shape of symbolic content.
///
/// Arbitrary JSON is classified once at ingestion; anything that matches no
/// known shape is carried as `Opaque` and ignored by the tension rules.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SymbolicValue {
    /// A proposition, possibly negated.
    Claim { proposition: String, negated: bool },
    /// A concept the geoid asserts about itself.
    Concept(String),
    Flag(bool),
    Number(f64),
    Text(String),
    Opaque(serde_json::Value),
}

/// A concept asserted by symbolic content, for layer-conflict checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assertion {
    pub concept: String,
    pub negated: bool,
}

impl SymbolicValue {
    /// Classify an ingested `key: value` pair.
    pub fn classify(key: &str, value: serde_json::Value) -> Self {
        let key = key.to_ascii_lowercase();
        match value {
            serde_json::Value::Object(ref obj) => {
                if let Some(p) = obj.get("proposition").and_then(|p| p.as_str()) {
                    let negated = obj.get("negated").and_then(|n| n.as_bool()).unwrap_or(false);
                    let (proposition, parsed_neg) = parse_claim(p);
                    return Self::Claim {
                        proposition,
                        negated: negated ^ parsed_neg,
                    };
                }
                Self::Opaque(value)
            }
            serde_json::Value::String(s) if key.starts_with("claim") => {
                let (proposition, negated) = parse_claim(&s);
                Self::Claim {
                    proposition,
                    negated,
                }
            }
            serde_json::Value::String(s) if key.starts_with("concept") => {
                Self::Concept(s.trim().to_lowercase())
            }
            serde_json::Value::String(s) => Self::Text(s),
            serde_json::Value::Bool(b) => Self::Flag(b),
            serde_json::Value::Number(ref n) => match n.as_f64() {
                Some(f) => Self::Number(f),
                None => Self::Opaque(value),
            },
            other => Self::Opaque(other),
        }
    }

    pub fn assertion(&self) -> Option<Assertion> {
        match self {
            Self::Claim {
                proposition,
                negated,
            } => Some(Assertion {
                concept: proposition.clone(),
                negated: *negated,
            }),
            Self::Concept(c) => Some(Assertion {
                concept: c.clone(),
                negated: false,
            }),
            _ => None,
        }
    }
}

/// Strip any number of leading negation markers. Returns the lowercased
/// proposition and whether an odd number of negations was found.
fn parse_claim(raw: &str) -> (String, bool) {
    let mut rest = raw.trim().to_string();
    let mut negated = false;
    while let Some(caps) = NEGATION.captures(&rest) {
        let inner = caps[1].trim().to_string();
        rest = inner;
        negated = !negated;
    }
    (rest.to_lowercase(), negated)
}

/// Semantic energy stored as `(base, epoch)`; decay is applied at read time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticEnergy {
    pub base: f64,
    /// Unix seconds at which `base` was measured.
    pub epoch: f64,
}

impl SemanticEnergy {
    pub fn fresh(now: f64) -> Self {
        Self {
            base: INITIAL_ENERGY,
            epoch: now,
        }
    }

    /// `SE(t) = SE0 * exp(-lambda_eff * dt)`
    pub fn at(&self, now: f64, lambda_eff: f64) -> f64 {
        self.base * (-lambda_eff * elapsed_secs(self.epoch, now)).exp()
    }

    /// Fold decay so far into a new base, so a later rate change applies
    /// only from `now` on.
    pub fn rebase(&mut self, now: f64, lambda_eff: f64) {
        self.base = self.at(now, lambda_eff);
        self.epoch = now.max(self.epoch);
    }
}

/// One accepted entropy-changing mutation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntropyRecord {
    pub cycle: u64,
    pub pre: f64,
    pub post: f64,
    pub delta: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoidMetadata {
    pub created_at: String,
    #[serde(default)]
    pub provenance: Option<String>,
    #[serde(default)]
    pub entropy_history: Vec<EntropyRecord>,
    /// Cycles in which the semantic state changed, oldest first.
    #[serde(default)]
    pub mutation_cycles: Vec<u64>,
    #[serde(default)]
    pub annotations: BTreeMap<String, serde_json::Value>,
}

/// A semantic unit: a normalized feature distribution plus symbolic content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geoid {
    pub id: GeoidId,
    semantic_state: BTreeMap<String, f64>,
    pub symbolic_state: BTreeMap<String, SymbolicValue>,
    pub energy: SemanticEnergy,
    pub metadata: GeoidMetadata,
}

impl Geoid {
    /// Build a geoid, normalizing `semantic_state`.
    pub fn new(
        id: GeoidId,
        semantic_state: BTreeMap<String, f64>,
        symbolic_state: BTreeMap<String, SymbolicValue>,
    ) -> Result<Self> {
        let semantic_state = normalize(semantic_state)?;
        Ok(Self {
            id,
            semantic_state,
            symbolic_state,
            energy: SemanticEnergy::fresh(now_unix_f64()),
            metadata: GeoidMetadata {
                created_at: now_iso8601(),
                ..GeoidMetadata::default()
            },
        })
    }

    pub fn semantic_state(&self) -> &BTreeMap<String, f64> {
        &self.semantic_state
    }

    /// Replace the distribution. Only the thermodynamic validator calls this.
    pub(crate) fn set_semantic_state(&mut self, state: BTreeMap<String, f64>) -> Result<()> {
        self.semantic_state = normalize(state)?;
        Ok(())
    }

    /// Shannon entropy (nats), always recomputed from the current state.
    pub fn entropy(&self) -> f64 {
        entropy(&self.semantic_state)
    }

    /// Feature with the largest weight. Ties resolve to the lexically first.
    pub fn dominant_feature(&self) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (k, &w) in &self.semantic_state {
            if best.is_none_or(|(_, bw)| w > bw) {
                best = Some((k.as_str(), w));
            }
        }
        best.filter(|(_, w)| *w > 0.0)
    }

    pub fn assertions(&self) -> impl Iterator<Item = Assertion> + '_ {
        self.symbolic_state.values().filter_map(|v| v.assertion())
    }

    pub fn claims(&self) -> impl Iterator<Item = (&str, bool)> + '_ {
        self.symbolic_state.values().filter_map(|v| match v {
            SymbolicValue::Claim {
                proposition,
                negated,
            } => Some((proposition.as_str(), *negated)),
            _ => None,
        })
    }

    pub fn is_normalized(&self) -> bool {
        let sum: f64 = self.semantic_state.values().sum();
        (sum - 1.0).abs() <= NORMALIZATION_EPSILON
            && self.semantic_state.values().all(|w| w.is_finite() && *w >= 0.0)
    }

    /// Mutations recorded in the `window` cycles ending at `cycle`, as a
    /// fraction of the window.
    pub fn mutation_frequency(&self, cycle: u64, window: u64) -> f64 {
        if window == 0 {
            return 0.0;
        }
        let start = cycle.saturating_sub(window - 1);
        let recent = self
            .metadata
            .mutation_cycles
            .iter()
            .filter(|&&c| c >= start && c <= cycle)
            .count();
        (recent as f64 / window as f64).min(1.0)
    }

    /// Record an accepted mutation, keeping at most `window` cycle stamps
    /// and the newest [`ENTROPY_HISTORY_LIMIT`] entropy records.
    pub(crate) fn record_mutation(&mut self, record: EntropyRecord, window: u64) {
        let history = &mut self.metadata.entropy_history;
        history.push(record);
        let len = history.len();
        if len > ENTROPY_HISTORY_LIMIT {
            history.drain(..len - ENTROPY_HISTORY_LIMIT);
        }
        self.metadata.mutation_cycles.push(record.cycle);
        let keep = window.max(1) as usize;
        let len = self.metadata.mutation_cycles.len();
        if len > keep {
            self.metadata.mutation_cycles.drain(..len - keep);
        }
    }
}

/// Shannon entropy (nats) of a weight map. Zero weights contribute nothing.
pub fn entropy(state: &BTreeMap<String, f64>) -> f64 {
    state
        .values()
        .filter(|&&p| p > 0.0)
        .map(|&p| -p * p.ln())
        .sum()
}

/// Scale weights to sum to 1. Rejects empty, negative, non-finite or
/// all-zero distributions.
pub fn normalize(state: BTreeMap<String, f64>) -> Result<BTreeMap<String, f64>> {
    if state.is_empty() {
        return Err(EngineError::MalformedGeoidInput(
            "semantic_state is empty".to_string(),
        ));
    }
    if let Some((k, w)) = state.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
        return Err(EngineError::MalformedGeoidInput(format!(
            "feature '{k}' has invalid weight {w}"
        )));
    }
    let sum: f64 = state.values().sum();
    if sum <= EPSILON {
        return Err(EngineError::MalformedGeoidInput(
            "semantic_state has zero total weight".to_string(),
        ));
    }
    Ok(state.into_iter().map(|(k, w)| (k, w / sum)).collect())
}

/// A geoid as supplied by the ingestion service.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GeoidInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub semantic_state: BTreeMap<String, f64>,
    #[serde(default)]
    pub symbolic_state: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub provenance: Option<String>,
}

impl GeoidInput {
    /// Validate and convert. Nothing malformed crosses this boundary.
    pub fn into_geoid(self) -> Result<Geoid> {
        if let Some(k) = self.semantic_state.keys().find(|k| k.trim().is_empty()) {
            return Err(EngineError::MalformedGeoidInput(format!(
                "empty feature name {k:?}"
            )));
        }
        let mut symbolic = BTreeMap::new();
        for (key, value) in self.symbolic_state {
            if key.trim().is_empty() {
                return Err(EngineError::MalformedGeoidInput(
                    "empty symbolic key".to_string(),
                ));
            }
            let classified = SymbolicValue::classify(&key, value);
            if let Some(a) = classified.assertion()
                && a.concept.is_empty()
            {
                return Err(EngineError::MalformedGeoidInput(format!(
                    "symbolic '{key}' asserts an empty proposition"
                )));
            }
            symbolic.insert(key, classified);
        }
        let id = self.id.map(GeoidId).unwrap_or_default();
        let mut geoid = Geoid::new(id, self.semantic_state, symbolic)?;
        geoid.metadata.provenance = self.provenance;
        Ok(geoid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, w)| (k.to_string(), *w)).collect()
    }

    #[test]
    fn test_normalizes_on_creation() {
        let g = Geoid::new(GeoidId::new(), weights(&[("a", 2.0), ("b", 6.0)]), BTreeMap::new())
            .unwrap();
        assert_relative_eq!(g.semantic_state()["a"], 0.25);
        assert_relative_eq!(g.semantic_state()["b"], 0.75);
        assert!(g.is_normalized());
    }

    #[test]
    fn test_zero_weights_kept() {
        let g = Geoid::new(
            GeoidId::new(),
            weights(&[("a", 0.0), ("not_a", 1.0)]),
            BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(g.semantic_state().len(), 2);
        assert_eq!(g.dominant_feature(), Some(("not_a", 1.0)));
        assert_eq!(g.entropy(), 0.0);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(normalize(BTreeMap::new()).is_err());
        assert!(normalize(weights(&[("a", -1.0)])).is_err());
        assert!(normalize(weights(&[("a", f64::NAN)])).is_err());
        assert!(normalize(weights(&[("a", 0.0), ("b", 0.0)])).is_err());
    }

    #[test]
    fn test_uniform_entropy() {
        let g = Geoid::new(
            GeoidId::new(),
            weights(&[("a", 1.0), ("b", 1.0), ("c", 1.0), ("d", 1.0)]),
            BTreeMap::new(),
        )
        .unwrap();
        assert_relative_eq!(g.entropy(), 4f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_classify_claims() {
        assert_eq!(
            SymbolicValue::classify("claim", json!("A")),
            SymbolicValue::Claim {
                proposition: "a".into(),
                negated: false
            }
        );
        assert_eq!(
            SymbolicValue::classify("claim", json!("not a")),
            SymbolicValue::Claim {
                proposition: "a".into(),
                negated: true
            }
        );
        assert_eq!(
            SymbolicValue::classify("claim_2", json!("¬ ¬a")),
            SymbolicValue::Claim {
                proposition: "a".into(),
                negated: false
            }
        );
        assert_eq!(
            SymbolicValue::classify("x", json!({"proposition": "rain", "negated": true})),
            SymbolicValue::Claim {
                proposition: "rain".into(),
                negated: true
            }
        );
    }

    #[test]
    fn test_classify_fallbacks() {
        assert_eq!(
            SymbolicValue::classify("concept", json!(" Warm ")),
            SymbolicValue::Concept("warm".into())
        );
        assert_eq!(SymbolicValue::classify("ok", json!(true)), SymbolicValue::Flag(true));
        assert_eq!(SymbolicValue::classify("n", json!(3)), SymbolicValue::Number(3.0));
        assert_eq!(
            SymbolicValue::classify("note", json!("free text")),
            SymbolicValue::Text("free text".into())
        );
        assert!(matches!(
            SymbolicValue::classify("list", json!([1, 2])),
            SymbolicValue::Opaque(_)
        ));
    }

    #[test]
    fn test_input_rejects_empty_proposition() {
        let input = GeoidInput {
            semantic_state: weights(&[("a", 1.0)]),
            symbolic_state: [("claim".to_string(), json!("not "))].into_iter().collect(),
            ..GeoidInput::default()
        };
        // "not " trims to "not", which is a bare word, not a negation
        assert!(input.into_geoid().is_ok());

        let input = GeoidInput {
            semantic_state: weights(&[("a", 1.0)]),
            symbolic_state: [("claim".to_string(), json!("  "))].into_iter().collect(),
            ..GeoidInput::default()
        };
        assert!(matches!(
            input.into_geoid(),
            Err(EngineError::MalformedGeoidInput(_))
        ));
    }

    #[test]
    fn test_energy_decay_is_lazy_and_idempotent() {
        let e = SemanticEnergy {
            base: 1.0,
            epoch: 100.0,
        };
        let a = e.at(110.0, 0.1);
        let b = e.at(110.0, 0.1);
        assert_eq!(a, b);
        assert_relative_eq!(a, (-1.0f64).exp(), epsilon = 1e-12);
        assert_eq!(e.at(90.0, 0.1), 1.0);
    }

    #[test]
    fn test_energy_rebase_continuous() {
        let mut e = SemanticEnergy {
            base: 1.0,
            epoch: 0.0,
        };
        let before = e.at(5.0, 0.2);
        e.rebase(5.0, 0.2);
        assert_relative_eq!(e.base, before, epsilon = 1e-12);
        assert_relative_eq!(e.at(10.0, 0.2), (-2.0f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_mutation_frequency_window() {
        let mut g =
            Geoid::new(GeoidId::new(), weights(&[("a", 1.0)]), BTreeMap::new()).unwrap();
        for cycle in [1, 2, 8, 9] {
            g.record_mutation(
                EntropyRecord {
                    cycle,
                    pre: 0.0,
                    post: 0.0,
                    delta: 0.0,
                },
                10,
            );
        }
        assert_relative_eq!(g.mutation_frequency(10, 10), 0.4);
        assert_relative_eq!(g.mutation_frequency(10, 2), 0.5);
        assert_relative_eq!(g.mutation_frequency(30, 10), 0.0);
    }

    #[test]
    fn test_entropy_history_keeps_newest() {
        let mut g =
            Geoid::new(GeoidId::new(), weights(&[("a", 1.0)]), BTreeMap::new()).unwrap();
        let total = ENTROPY_HISTORY_LIMIT as u64 + 40;
        for cycle in 1..=total {
            g.record_mutation(
                EntropyRecord {
                    cycle,
                    pre: 0.0,
                    post: 0.0,
                    delta: 0.0,
                },
                10,
            );
        }
        let history = &g.metadata.entropy_history;
        assert_eq!(history.len(), ENTROPY_HISTORY_LIMIT);
        assert_eq!(history.first().unwrap().cycle, 41);
        assert_eq!(history.last().unwrap().cycle, total);
        assert_eq!(g.metadata.mutation_cycles.len(), 10);
    }
}
