//! Engine configuration.
//!
//! Every field has a default so a partial TOML document (or none at all)
//! yields a working engine. Loading from disk lives in `tre-store`; this
//! module stays I/O free.

use serde::{Deserialize, Serialize};

use crate::constants::{
    COLLAPSE_AXIS_CONVERGENCE, COLLAPSE_PULSE, COLLAPSE_VAULT_RESONANCE, COMPENSATION_FEATURE,
    COMPENSATION_SCALE, EVICTION_FRACTION, FRACTURE_THRESHOLD, LAMBDA_BASE, LAYER_WEIGHT,
    SURGE_AMBIGUITY, SURGE_PULSE, SYMBOLIC_WEIGHT, VECTOR_WEIGHT,
};
use crate::error::{EngineError, Result};
use crate::tension::LayerConflictRules;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tension: TensionConfig,
    pub arbiter: ArbiterConfig,
    pub thermo: ThermoConfig,
    pub vault: VaultConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TensionConfig {
    pub vector_weight: f64,
    pub layer_weight: f64,
    pub symbolic_weight: f64,
    /// Threshold used by the CLI when none is given.
    pub default_threshold: f64,
    pub rules: LayerConflictRules,
}

impl Default for TensionConfig {
    fn default() -> Self {
        Self {
            vector_weight: VECTOR_WEIGHT,
            layer_weight: LAYER_WEIGHT,
            symbolic_weight: SYMBOLIC_WEIGHT,
            default_threshold: 0.5,
            rules: LayerConflictRules::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub collapse_pulse: f64,
    pub collapse_axis_convergence: f64,
    pub collapse_vault_resonance: f64,
    pub surge_pulse: f64,
    pub surge_ambiguity: f64,
    /// Number of recent cycles the mutation frequency is measured over.
    pub mutation_window: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            collapse_pulse: COLLAPSE_PULSE,
            collapse_axis_convergence: COLLAPSE_AXIS_CONVERGENCE,
            collapse_vault_resonance: COLLAPSE_VAULT_RESONANCE,
            surge_pulse: SURGE_PULSE,
            surge_ambiguity: SURGE_AMBIGUITY,
            mutation_window: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermoConfig {
    pub compensation_scale: f64,
    pub compensation_feature: String,
    pub max_compensation_rounds: u32,
    /// Blend factor of a collapse, scaled by pulse strength.
    pub collapse_blend: f64,
    pub lambda_base: f64,
}

impl Default for ThermoConfig {
    fn default() -> Self {
        Self {
            compensation_scale: COMPENSATION_SCALE,
            compensation_feature: COMPENSATION_FEATURE.to_string(),
            max_compensation_rounds: 8,
            collapse_blend: 0.5,
            lambda_base: LAMBDA_BASE,
        }
    }
}

/// How the fractional eviction count of a fracture is rounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionRounding {
    #[default]
    Ceil,
    Floor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Per-vault capacity.
    pub capacity: usize,
    pub fracture_threshold: f64,
    pub eviction_fraction: f64,
    pub eviction_rounding: EvictionRounding,
    /// Maximum tolerated `|count(A) - count(B)|`. `None` disables the
    /// insert-time balance guard; rebalance then treats the bound as 1.
    pub balance_bound: Option<usize>,
    pub max_concurrent_writers: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            fracture_threshold: FRACTURE_THRESHOLD,
            eviction_fraction: EVICTION_FRACTION,
            eviction_rounding: EvictionRounding::Ceil,
            balance_bound: Some(1),
            max_concurrent_writers: 16,
        }
    }
}

impl VaultConfig {
    /// Number of scars one fracture evicts from a vault holding `count`.
    /// Always at least 1 and never more than `count`.
    pub fn eviction_count(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let raw = count as f64 * self.eviction_fraction;
        let rounded = match self.eviction_rounding {
            EvictionRounding::Ceil => raw.ceil(),
            EvictionRounding::Floor => raw.floor(),
        } as usize;
        rounded.clamp(1, count)
    }

    pub fn rebalance_bound(&self) -> usize {
        self.balance_bound.unwrap_or(1)
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let t = &self.tension;
        for (name, w) in [
            ("tension.vector_weight", t.vector_weight),
            ("tension.layer_weight", t.layer_weight),
            ("tension.symbolic_weight", t.symbolic_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(invalid(format!("{name} must be in [0,1], got {w}")));
            }
        }
        let total = t.vector_weight + t.layer_weight + t.symbolic_weight;
        if (total - 1.0).abs() > 1e-9 {
            return Err(invalid(format!("tension weights must sum to 1, got {total}")));
        }

        let v = &self.vault;
        if v.capacity == 0 {
            return Err(invalid("vault.capacity must be positive".to_string()));
        }
        if !(v.fracture_threshold > 0.0 && v.fracture_threshold <= 1.0) {
            return Err(invalid(format!(
                "vault.fracture_threshold must be in (0,1], got {}",
                v.fracture_threshold
            )));
        }
        if !(v.eviction_fraction > 0.0 && v.eviction_fraction <= 1.0) {
            return Err(invalid(format!(
                "vault.eviction_fraction must be in (0,1], got {}",
                v.eviction_fraction
            )));
        }
        if v.balance_bound == Some(0) {
            return Err(invalid("vault.balance_bound must be at least 1".to_string()));
        }
        if v.max_concurrent_writers == 0 {
            return Err(invalid("vault.max_concurrent_writers must be positive".to_string()));
        }

        let th = &self.thermo;
        if th.compensation_scale <= 0.0 {
            return Err(invalid("thermo.compensation_scale must be positive".to_string()));
        }
        if th.compensation_feature.is_empty() {
            return Err(invalid("thermo.compensation_feature must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&th.collapse_blend) {
            return Err(invalid("thermo.collapse_blend must be in [0,1]".to_string()));
        }
        if th.lambda_base < 0.0 {
            return Err(invalid("thermo.lambda_base must be non-negative".to_string()));
        }

        if self.arbiter.mutation_window == 0 {
            return Err(invalid("arbiter.mutation_window must be positive".to_string()));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> EngineError {
    EngineError::InvalidConfig(msg)
}
