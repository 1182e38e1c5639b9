//! Engine and server configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_GC_THRESHOLD, DEFAULT_LISTEN_ADDR, DEFAULT_MASTER_PATH, DEFAULT_TICK_BUDGET};

/// Knobs for the interpreter core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Host directory the virtual filesystem mirrors.
    pub anchor: PathBuf,
    /// Virtual path of the object whose `login` method greets connections.
    pub master: String,
    /// Instructions per scheduling slice before a fiber yields.
    pub tick_budget: u32,
    /// Allocations between garbage collection cycles.
    pub gc_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            anchor: PathBuf::from("world"),
            master: DEFAULT_MASTER_PATH.to_string(),
            tick_budget: DEFAULT_TICK_BUDGET,
            gc_threshold: DEFAULT_GC_THRESHOLD,
        }
    }
}

/// Full server configuration: network surface plus engine knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: ListenAddr,
    pub engine: EngineConfig,
}

/// Wrapper so the listen address defaults sensibly under `serde(default)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenAddr(pub String);

impl Default for ListenAddr {
    fn default() -> Self {
        ListenAddr(DEFAULT_LISTEN_ADDR.to_string())
    }
}

impl ServerConfig {
    /// Load from a JSON file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert!(config.engine.tick_budget > 0);
        assert!(config.engine.gc_threshold > 0);
        assert!(config.listen.0.contains(':'));
        assert!(config.engine.master.starts_with('/'));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"listen":"0.0.0.0:5555","engine":{"anchor":"lib"}}"#)
                .unwrap();
        assert_eq!(config.listen.0, "0.0.0.0:5555");
        assert_eq!(config.engine.anchor, PathBuf::from("lib"));
        assert_eq!(config.engine.tick_budget, DEFAULT_TICK_BUDGET);
    }
}
