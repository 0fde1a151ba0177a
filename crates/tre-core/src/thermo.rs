//! Thermodynamic validator: entropy monotonicity and passive energy decay.
//!
//! Every collapse-driven mutation of a geoid's distribution passes through
//! [`ThermodynamicValidator::validate_and_apply`]. A transformation that
//! lowers entropy gets a synthetic compensation feature; if that cannot
//! restore a non-negative delta the transformation is rejected whole.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::ThermoConfig;
use crate::error::EngineError;
use crate::geoid::{Geoid, GeoidId};
use crate::registry::GeoidStore;

/// Entropy differences smaller than this are floating-point noise.
const ENTROPY_TOLERANCE: f64 = 1e-12;

/// Inputs to the effective decay rate, supplied by the cycle driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DecayEnvironment {
    pub instability_index: f64,
    pub void_pressure: f64,
}

impl DecayEnvironment {
    /// `lambda_eff = lambda_base * (1 + instability) * (1 + void_pressure)`
    pub fn lambda_eff(&self, lambda_base: f64) -> f64 {
        lambda_base * (1.0 + self.instability_index.max(0.0)) * (1.0 + self.void_pressure.max(0.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntropyDelta {
    pub pre: f64,
    pub post: f64,
    pub delta: f64,
}

/// The transformation could not be made entropy-monotone.
#[derive(Clone, Debug, PartialEq)]
pub struct ViolationRejected {
    pub geoid: GeoidId,
    pub pre: f64,
    pub post: f64,
}

impl From<ViolationRejected> for EngineError {
    fn from(v: ViolationRejected) -> Self {
        EngineError::ThermodynamicViolation {
            geoid: v.geoid,
            pre: v.pre,
            post: v.post,
        }
    }
}

/// An accepted transformation.
#[derive(Clone, Debug)]
pub struct Validated {
    pub geoid: Geoid,
    pub entropy: EntropyDelta,
    /// Compensation rounds that were needed (0 if none).
    pub compensation_rounds: u32,
}

pub struct ThermodynamicValidator {
    config: ThermoConfig,
    environment: RwLock<DecayEnvironment>,
}

impl ThermodynamicValidator {
    pub fn new(config: ThermoConfig) -> Self {
        Self {
            config,
            environment: RwLock::new(DecayEnvironment::default()),
        }
    }

    pub fn config(&self) -> &ThermoConfig {
        &self.config
    }

    /// Accept `after` as the successor of `before` only if entropy does not
    /// decrease, compensating first when it does.
    pub fn validate_and_apply(
        &self,
        before: &Geoid,
        mut after: Geoid,
    ) -> Result<Validated, ViolationRejected> {
        let pre = before.entropy();
        let mut post = after.entropy();
        let mut rounds = 0;

        while post < pre - ENTROPY_TOLERANCE && rounds < self.config.max_compensation_rounds {
            // deficit / scale, doubled each round the previous dose fell short
            let escalation = f64::from(1u32 << rounds.min(16));
            let dose = (pre - post) / self.config.compensation_scale * escalation;
            let mut state = after.semantic_state().clone();
            *state
                .entry(self.config.compensation_feature.clone())
                .or_insert(0.0) += dose;
            if after.set_semantic_state(state).is_err() {
                break;
            }
            let next = after.entropy();
            rounds += 1;
            if next <= post {
                // Compensation feature already dominates; more weight only
                // concentrates the distribution further.
                post = next;
                break;
            }
            post = next;
        }

        if post < pre - ENTROPY_TOLERANCE {
            tracing::warn!(
                geoid = %before.id,
                pre,
                post,
                rounds,
                "rejected entropy-decreasing transformation"
            );
            return Err(ViolationRejected {
                geoid: before.id,
                pre,
                post,
            });
        }

        if rounds > 0 {
            tracing::debug!(geoid = %before.id, rounds, "entropy compensated");
        }
        Ok(Validated {
            geoid: after,
            entropy: EntropyDelta {
                pre,
                post,
                // within tolerance counts as no change
                delta: (post - pre).max(0.0),
            },
            compensation_rounds: rounds,
        })
    }

    pub fn environment(&self) -> DecayEnvironment {
        *self.environment.read()
    }

    pub fn lambda_eff(&self) -> f64 {
        self.environment().lambda_eff(self.config.lambda_base)
    }

    /// Semantic energy of `geoid` at `now`, decayed lazily.
    pub fn energy_at(&self, geoid: &Geoid, now: f64) -> f64 {
        geoid.energy.at(now, self.lambda_eff())
    }

    /// Change the decay environment. Decay accrued so far is folded into
    /// every geoid at the old rate first, so the update is order independent.
    pub fn set_environment(&self, store: &GeoidStore, env: DecayEnvironment, now: f64) {
        let mut current = self.environment.write();
        let old_rate = current.lambda_eff(self.config.lambda_base);
        store.for_each_mut(|g| g.energy.rebase(now, old_rate));
        *current = env;
    }
}

/// `normalize((1 - alpha) * from + alpha * toward)` over the union of keys.
pub fn blend_toward(
    from: &BTreeMap<String, f64>,
    toward: &BTreeMap<String, f64>,
    alpha: f64,
) -> BTreeMap<String, f64> {
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out: BTreeMap<String, f64> = from
        .iter()
        .map(|(k, w)| (k.clone(), (1.0 - alpha) * w))
        .collect();
    for (k, w) in toward {
        *out.entry(k.clone()).or_insert(0.0) += alpha * w;
    }
    let sum: f64 = out.values().sum();
    if sum > 0.0 {
        for w in out.values_mut() {
            *w /= sum;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoid::GeoidInput;
    use approx::assert_relative_eq;

    fn geoid(weights: &[(&str, f64)]) -> Geoid {
        GeoidInput {
            semantic_state: weights.iter().map(|(k, w)| (k.to_string(), *w)).collect(),
            ..GeoidInput::default()
        }
        .into_geoid()
        .unwrap()
    }

    fn with_state(g: &Geoid, weights: &[(&str, f64)]) -> Geoid {
        let mut next = g.clone();
        next.set_semantic_state(weights.iter().map(|(k, w)| (k.to_string(), *w)).collect())
            .unwrap();
        next
    }

    fn validator() -> ThermodynamicValidator {
        ThermodynamicValidator::new(ThermoConfig::default())
    }

    #[test]
    fn test_entropy_increase_accepted_unchanged() {
        let before = geoid(&[("a", 1.0)]);
        let after = with_state(&before, &[("a", 0.5), ("b", 0.5)]);
        let v = validator().validate_and_apply(&before, after.clone()).unwrap();
        assert_eq!(v.compensation_rounds, 0);
        assert_eq!(v.geoid, after);
        assert_relative_eq!(v.entropy.delta, 2f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_identity_is_zero_delta() {
        let before = geoid(&[("a", 0.3), ("b", 0.7)]);
        let v = validator().validate_and_apply(&before, before.clone()).unwrap();
        assert_eq!(v.entropy.delta, 0.0);
    }

    #[test]
    fn test_small_decrease_compensated() {
        let before = geoid(&[("a", 0.5), ("b", 0.3), ("c", 0.2)]);
        let after = with_state(&before, &[("a", 0.55), ("b", 0.28), ("c", 0.17)]);
        assert!(after.entropy() < before.entropy());

        let v = validator().validate_and_apply(&before, after).unwrap();
        assert!(v.compensation_rounds >= 1);
        assert!(v.entropy.delta >= 0.0);
        assert!(v.geoid.semantic_state().contains_key("__compensation__"));
        assert!(v.geoid.is_normalized());
    }

    #[test]
    fn test_recorded_post_is_accepted_entropy() {
        let before = geoid(&[("a", 0.5), ("b", 0.5)]);
        let after = with_state(&before, &[("a", 0.5 + 1e-9), ("b", 0.5 - 1e-9)]);
        let v = validator().validate_and_apply(&before, after).unwrap();
        assert_eq!(v.compensation_rounds, 0);
        assert_eq!(v.entropy.post, v.geoid.entropy());
        assert_eq!(v.entropy.pre, before.entropy());
        assert!(v.entropy.delta >= 0.0);

        let compensated = with_state(&before, &[("a", 0.6), ("b", 0.4)]);
        let v = validator().validate_and_apply(&before, compensated).unwrap();
        assert!(v.compensation_rounds >= 1);
        assert_eq!(v.entropy.post, v.geoid.entropy());
    }

    #[test]
    fn test_collapse_to_point_rejected() {
        let before = geoid(&[("a", 1.0), ("b", 1.0), ("c", 1.0), ("d", 1.0)]);
        let after = with_state(&before, &[("a", 1.0)]);
        let err = validator().validate_and_apply(&before, after).unwrap_err();
        assert_eq!(err.geoid, before.id);
        assert!(err.post < err.pre);
    }

    #[test]
    fn test_blend_is_normalized_union() {
        let a = geoid(&[("a", 1.0)]);
        let b = geoid(&[("b", 1.0)]);
        let mixed = blend_toward(a.semantic_state(), b.semantic_state(), 0.25);
        assert_relative_eq!(mixed["a"], 0.75);
        assert_relative_eq!(mixed["b"], 0.25);
        assert_relative_eq!(mixed.values().sum::<f64>(), 1.0);
    }

    #[test]
    fn test_lambda_eff_formula() {
        let env = DecayEnvironment {
            instability_index: 0.5,
            void_pressure: 1.0,
        };
        assert_relative_eq!(env.lambda_eff(0.1), 0.1 * 1.5 * 2.0);
    }

    #[test]
    fn test_environment_change_rebases_energy() {
        let store = GeoidStore::new();
        let id = store.insert(geoid(&[("a", 1.0)])).unwrap();
        let v = ThermodynamicValidator::new(ThermoConfig {
            lambda_base: 0.1,
            ..ThermoConfig::default()
        });
        let epoch = store.snapshot(id).unwrap().energy.epoch;

        v.set_environment(
            &store,
            DecayEnvironment {
                instability_index: 1.0,
                void_pressure: 0.0,
            },
            epoch + 10.0,
        );
        let g = store.snapshot(id).unwrap();
        // 10s at 0.1, then 10s at 0.2
        assert_relative_eq!(g.energy.base, (-1.0f64).exp(), epsilon = 1e-9);
        assert_relative_eq!(v.energy_at(&g, epoch + 20.0), (-3.0f64).exp(), epsilon = 1e-9);
    }
}
