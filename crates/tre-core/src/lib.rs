//! Semantic tension resolution engine.
//!
//! Geoids (normalized feature distributions with symbolic annotations) are
//! scored pairwise for contradiction, arbitrated into collapse, surge or
//! buffer, and collapses are validated against entropy monotonicity before
//! the resulting scar is routed into one of two bounded vaults.
//!
//! No I/O: persistence plugs in through [`VaultBackend`].

pub mod arbiter;
pub mod backend;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod export;
pub mod geoid;
pub mod registry;
pub mod router;
pub mod scar;
pub mod tension;
pub mod thermo;
pub mod time;
pub mod vault;

pub use arbiter::{
    Arbitration, Decision, GradientState, PulseAssessment, ResolutionArbiter, StabilityMetrics,
};
pub use backend::{NullBackend, VaultBackend};
pub use config::{
    ArbiterConfig, EngineConfig, EvictionRounding, TensionConfig, ThermoConfig, VaultConfig,
};
pub use engine::{CycleReport, TensionEngine};
pub use error::{EngineError, Result};
pub use export::{EXPORT_VERSION, EngineExport, export_json, parse_export};
pub use geoid::{Geoid, GeoidId, GeoidInput, GeoidMetadata, SymbolicValue};
pub use registry::GeoidStore;
pub use router::{InsertResult, RebalanceReport, RouteStage, VaultAssignment, VaultCoordinator};
pub use scar::{Scar, ScarDraft, ScarId, VaultId};
pub use tension::{GradientType, LayerConflictRules, TensionDetector, TensionGradient};
pub use thermo::{DecayEnvironment, ThermodynamicValidator, ViolationRejected};
pub use vault::{Vault, VaultStatus};
