//! Data directory resolution and TOML engine configuration.

use std::path::{Path, PathBuf};
use std::{env, fs};

use tre_core::EngineConfig;

use crate::error::{Result, StoreError};

pub const DATA_DIR_ENV: &str = "TRE_DATA_DIR";
pub const CONFIG_FILE: &str = "tre.toml";
pub const DB_FILE: &str = "tre.db";

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Default base directory for all engine storage.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".tension-engine")
}

/// `TRE_DATA_DIR` if set, else the default base directory.
pub fn resolve_data_dir() -> PathBuf {
    env::var(DATA_DIR_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_base_dir)
}

pub fn parse_config(content: &str) -> Result<EngineConfig> {
    let config: EngineConfig = toml::from_str(content)?;
    config
        .validate()
        .map_err(|e| StoreError::InvalidData(e.to_string()))?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Explicit path if given, else `<data_dir>/tre.toml` when present, else
/// defaults.
pub fn resolve_config(explicit: Option<&Path>, data_dir: &Path) -> Result<EngineConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let candidate = data_dir.join(CONFIG_FILE);
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "loading config");
        return load_config(&candidate);
    }
    Ok(EngineConfig::default())
}

pub fn render_config(config: &EngineConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}
