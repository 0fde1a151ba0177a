//! Scars: permanent records of resolved tension.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geoid::GeoidId;
use crate::tension::{axis_angle, cosine_similarity};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScarId(pub Uuid);

impl ScarId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScarId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VaultId {
    A,
    B,
}

impl VaultId {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VaultId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" | "A" => Ok(Self::A),
            "b" | "B" => Ok(Self::B),
            other => Err(format!("unknown vault '{other}' (expected A or B)")),
        }
    }
}

/// A scar before routing: everything except its vault and quarantine flag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScarDraft {
    pub id: ScarId,
    pub geoid_refs: Vec<GeoidId>,
    pub reason: String,
    pub pre_entropy: f64,
    pub post_entropy: f64,
    pub delta_entropy: f64,
    pub cls_angle: f64,
    pub semantic_polarity: f64,
    pub mutation_frequency: f64,
    pub weight: f64,
    pub tension_score: f64,
    pub created_at: String,
}

impl ScarDraft {
    pub fn into_scar(self, vault_id: VaultId, quarantined: bool) -> Scar {
        debug_assert!(
            self.delta_entropy >= 0.0,
            "scar {} has negative entropy delta {}",
            self.id,
            self.delta_entropy
        );
        Scar {
            id: self.id,
            geoid_refs: self.geoid_refs,
            reason: self.reason,
            pre_entropy: self.pre_entropy,
            post_entropy: self.post_entropy,
            delta_entropy: self.delta_entropy,
            cls_angle: self.cls_angle,
            semantic_polarity: self.semantic_polarity,
            mutation_frequency: self.mutation_frequency,
            weight: self.weight,
            tension_score: self.tension_score,
            created_at: self.created_at,
            vault_id,
            quarantined,
        }
    }
}

/// Immutable once inserted. `vault_id` is the vault that first accepted
/// the scar; a rebalance may move the record without rewriting it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scar {
    pub id: ScarId,
    pub geoid_refs: Vec<GeoidId>,
    pub reason: String,
    pub pre_entropy: f64,
    pub post_entropy: f64,
    pub delta_entropy: f64,
    pub cls_angle: f64,
    pub semantic_polarity: f64,
    pub mutation_frequency: f64,
    pub weight: f64,
    pub tension_score: f64,
    pub created_at: String,
    pub vault_id: VaultId,
    pub quarantined: bool,
}

impl Scar {
    /// Eviction and rebalance priority.
    pub fn priority(&self) -> f64 {
        self.weight * self.tension_score
    }
}

/// Signed angle between two distributions in degrees, mapped into [0, 360).
/// The sign follows the entropy gradient `h_b - h_a`.
pub fn cls_angle(
    a: &BTreeMap<String, f64>,
    b: &BTreeMap<String, f64>,
    h_a: f64,
    h_b: f64,
) -> f64 {
    let degrees = axis_angle(a, b).to_degrees();
    let signed = if h_b < h_a { -degrees } else { degrees };
    let wrapped = signed.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negatives
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

pub fn semantic_polarity(
    a: &BTreeMap<String, f64>,
    b: &BTreeMap<String, f64>,
    symbolic_opposition: f64,
) -> f64 {
    (cosine_similarity(a, b) - symbolic_opposition).clamp(-1.0, 1.0)
}
