//! Resolution arbiter: turn a tension gradient into a decision.
//!
//! The arbiter is pure. Stability metrics arrive as an argument every cycle
//! and the geoid snapshots are supplied by the caller.

use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

use crate::config::ArbiterConfig;
use crate::geoid::Geoid;
use crate::tension::{TensionGradient, axis_angle};

/// Global stability signals supplied by the cycle driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilityMetrics {
    pub axis_convergence: f64,
    pub vault_resonance: f64,
    pub contradiction_lineage_ambiguity: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Resolve now: mutate the pair and record a scar.
    Collapse,
    /// Propagate the tension forward without a scar.
    Surge,
    /// Defer the pair to the next cycle.
    Buffer,
}

/// Lifecycle of one gradient instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GradientState {
    Pending,
    Collapsed,
    Surged,
    Buffered,
}

impl GradientState {
    /// Apply a decision. Only a pending gradient can be decided.
    pub fn decide(self, decision: Decision) -> Option<Self> {
        match self {
            Self::Pending => Some(match decision {
                Decision::Collapse => Self::Collapsed,
                Decision::Surge => Self::Surged,
                Decision::Buffer => Self::Buffered,
            }),
            _ => None,
        }
    }

    /// A buffered gradient goes back to pending for the next cycle.
    pub fn requeue(self) -> Option<Self> {
        (self == Self::Buffered).then_some(Self::Pending)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Collapsed | Self::Surged)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseAssessment {
    pub axis_misalignment: f64,
    pub mutation_coherence: f64,
    pub pulse_strength: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Arbitration {
    pub decision: Decision,
    pub assessment: PulseAssessment,
}

pub fn pulse_strength(tension: f64, axis_misalignment: f64, mutation_coherence: f64) -> f64 {
    (tension * axis_misalignment * mutation_coherence).clamp(0.0, 1.0)
}

pub struct ResolutionArbiter {
    config: ArbiterConfig,
}

impl ResolutionArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self { config }
    }

    pub fn mutation_window(&self) -> u64 {
        self.config.mutation_window
    }

    /// Axis misalignment, mutation coherence and pulse for a gradient whose
    /// geoids are `a` and `b`, as of `cycle`.
    pub fn assess(&self, gradient: &TensionGradient, a: &Geoid, b: &Geoid, cycle: u64) -> PulseAssessment {
        let axis_misalignment =
            (axis_angle(a.semantic_state(), b.semantic_state()) / FRAC_PI_2).clamp(0.0, 1.0);
        let window = self.config.mutation_window;
        let fa = a.mutation_frequency(cycle, window);
        let fb = b.mutation_frequency(cycle, window);
        let mutation_coherence = (1.0 - (fa - fb).abs()).clamp(0.0, 1.0);
        PulseAssessment {
            axis_misalignment,
            mutation_coherence,
            pulse_strength: pulse_strength(
                gradient.tension_score,
                axis_misalignment,
                mutation_coherence,
            ),
        }
    }

    /// Decision rule, first match wins: collapse, surge, buffer.
    pub fn decide(&self, pulse: f64, stability: &StabilityMetrics) -> Decision {
        let c = &self.config;
        if pulse > c.collapse_pulse
            && stability.axis_convergence > c.collapse_axis_convergence
            && stability.vault_resonance > c.collapse_vault_resonance
        {
            Decision::Collapse
        } else if pulse < c.surge_pulse
            || stability.contradiction_lineage_ambiguity > c.surge_ambiguity
        {
            Decision::Surge
        } else {
            Decision::Buffer
        }
    }

    pub fn arbitrate(
        &self,
        gradient: &TensionGradient,
        a: &Geoid,
        b: &Geoid,
        cycle: u64,
        stability: &StabilityMetrics,
    ) -> Arbitration {
        let assessment = self.assess(gradient, a, b, cycle);
        let decision = self.decide(assessment.pulse_strength, stability);
        tracing::debug!(
            a = %gradient.geoid_a,
            b = %gradient.geoid_b,
            pulse = assessment.pulse_strength,
            ?decision,
            "arbitrated gradient"
        );
        Arbitration {
            decision,
            assessment,
        }
    }
}
