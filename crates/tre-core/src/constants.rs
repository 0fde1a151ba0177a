/// Composite weight of the vector misalignment sub-score.
pub const VECTOR_WEIGHT: f64 = 0.4;

/// Composite weight of the layer conflict sub-score.
pub const LAYER_WEIGHT: f64 = 0.3;

/// Composite weight of the symbolic opposition sub-score.
pub const SYMBOLIC_WEIGHT: f64 = 0.3;

/// Tolerance on `sum(semantic_state) == 1.0`.
pub const NORMALIZATION_EPSILON: f64 = 1e-6;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-12;

/// Pulse strength above which a gradient may collapse.
pub const COLLAPSE_PULSE: f64 = 0.8;

/// Minimum axis convergence for a collapse.
pub const COLLAPSE_AXIS_CONVERGENCE: f64 = 0.75;

/// Minimum vault resonance for a collapse.
pub const COLLAPSE_VAULT_RESONANCE: f64 = 0.6;

/// Pulse strength below which a gradient surges.
pub const SURGE_PULSE: f64 = 0.5;

/// Lineage ambiguity above which a gradient surges.
pub const SURGE_AMBIGUITY: f64 = 0.7;

/// Prospective stress index above which an insert fractures the vault.
pub const FRACTURE_THRESHOLD: f64 = 0.8;

/// Share of a stressed vault evicted by one fracture.
pub const EVICTION_FRACTION: f64 = 0.2;

/// Stage-1 routing: frequently mutating pairs go to vault A.
pub const ROUTE_MUTATION_FREQUENCY: f64 = 0.75;

/// Stage-2 routing: strongly polarised scars follow their sign.
pub const ROUTE_POLARITY: f64 = 0.5;

/// Compensation weight is `deficit / COMPENSATION_SCALE`.
pub const COMPENSATION_SCALE: f64 = 10.0;

/// Synthetic feature injected to restore entropy monotonicity.
pub const COMPENSATION_FEATURE: &str = "__compensation__";

/// Base semantic energy decay rate, per second.
pub const LAMBDA_BASE: f64 = 1e-4;

/// Initial semantic energy of a fresh geoid.
pub const INITIAL_ENERGY: f64 = 1.0;

/// Entropy records kept per geoid; older entries are dropped first.
pub const ENTROPY_HISTORY_LIMIT: usize = 256;
