use thiserror::Error;

use crate::geoid::GeoidId;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Entropy would decrease even after compensation. The geoid is untouched.
    #[error("thermodynamic violation on geoid {geoid}: entropy {pre:.6} -> {post:.6}")]
    ThermodynamicViolation { geoid: GeoidId, pre: f64, post: f64 },

    /// Fracture eviction could not free room in the target vault.
    #[error("routing fallback exhausted: {0}")]
    RoutingFallbackExhausted(String),

    /// Rejected at the ingestion boundary.
    #[error("malformed geoid input: {0}")]
    MalformedGeoidInput(String),

    #[error("unknown geoid: {0}")]
    UnknownGeoid(GeoidId),

    /// Writer ceiling reached on a non-blocking insert.
    #[error("vault writers saturated ({0} in flight)")]
    Backpressure(usize),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
