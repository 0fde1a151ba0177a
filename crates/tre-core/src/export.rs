//! JSON snapshot of an engine: geoids, both vaults, overflow and the
//! buffered queue.

use serde::{Deserialize, Serialize};

use crate::engine::TensionEngine;
use crate::error::{EngineError, Result};
use crate::geoid::{Geoid, GeoidId};
use crate::scar::{Scar, VaultId};
use crate::time::now_iso8601;

pub const EXPORT_VERSION: &str = "1";

#[derive(Serialize, Deserialize, Debug)]
pub struct EngineExport {
    pub version: String,
    pub timestamp: String,
    pub cycle: u64,
    pub geoids: Vec<Geoid>,
    pub vault_a: Vec<Scar>,
    pub vault_b: Vec<Scar>,
    #[serde(default)]
    pub overflow: Vec<Scar>,
    #[serde(default)]
    pub buffered: Vec<(GeoidId, GeoidId)>,
}

impl EngineExport {
    pub fn from_engine(engine: &TensionEngine) -> Self {
        let vaults = engine.vaults();
        Self {
            version: EXPORT_VERSION.to_string(),
            timestamp: now_iso8601(),
            cycle: engine.cycle(),
            geoids: engine.geoids().all_snapshots(),
            vault_a: vaults.scars(VaultId::A),
            vault_b: vaults.scars(VaultId::B),
            overflow: vaults.overflow(),
            buffered: engine.buffered_pairs(),
        }
    }
}

pub fn export_json(engine: &TensionEngine) -> Result<String> {
    serde_json::to_string_pretty(&EngineExport::from_engine(engine))
        .map_err(|e| EngineError::Persistence(format!("export: {e}")))
}

pub fn parse_export(json: &str) -> Result<EngineExport> {
    let export: EngineExport = serde_json::from_str(json)
        .map_err(|e| EngineError::Persistence(format!("import: {e}")))?;
    if export.version != EXPORT_VERSION {
        return Err(EngineError::Persistence(format!(
            "unsupported export version {}",
            export.version
        )));
    }
    Ok(export)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::geoid::GeoidInput;

    #[test]
    fn test_export_carries_geoids_and_version() {
        let engine = TensionEngine::new(EngineConfig::default()).unwrap();
        engine
            .ingest(GeoidInput {
                semantic_state: [("x".to_string(), 2.0), ("y".to_string(), 2.0)].into(),
                ..GeoidInput::default()
            })
            .unwrap();
        let json = export_json(&engine).unwrap();
        let parsed = parse_export(&json).unwrap();
        assert_eq!(parsed.geoids.len(), 1);
        assert!((parsed.geoids[0].semantic_state()["x"] - 0.5).abs() < 1e-12);
        assert!(parsed.vault_a.is_empty());
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let json = r#"{"version":"0","timestamp":"","cycle":0,"geoids":[],"vault_a":[],"vault_b":[]}"#;
        assert!(parse_export(json).is_err());
    }
}
