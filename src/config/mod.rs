//! Configuration module for rowflow
//!
//! This module handles engine configuration:
//! - Queue sizing and progress checkpoint cadence for local runs
//! - Cluster settings (bind address, heartbeats) in [`settings`]
//! - Logging destinations
//!
//! # Config Location
//!
//! When no explicit path is given the engine reads `engine.toml` from the
//! platform-appropriate config directory under `rowflow`:
//! - **Linux**: `~/.config/rowflow/engine.toml`
//! - **macOS**: `~/Library/Application Support/rowflow/engine.toml`
//! - **Windows**: `%APPDATA%\rowflow\engine.toml`
//!
//! # Example
//!
//! ```ignore
//! use rowflow::config::EngineConfig;
//!
//! let mut config = EngineConfig::load_or_default();
//! config.queue_capacity = 5_000;
//! config.save("engine.toml")?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "rowflow";

/// Config filename
pub const CONFIG_FILE: &str = "engine.toml";

/// Default number of rows a queue buffers before `put` blocks
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

/// Default number of rows between progress log lines
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 50_000;

/// Default wait when rotating over several inputs, in milliseconds
pub const DEFAULT_READ_POLL_MS: u64 = 50;

// ==================== Config Directory ====================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default config file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Engine Config ====================

/// Engine-wide settings.
///
/// Passed explicitly to the scheduler and the execution host; a snapshot is
/// taken when a run is prepared, so later edits never affect running graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of every queue unless an edge overrides it
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Rows between checkpoint log lines per copy
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Wait per input when a copy reads from several queues
    #[serde(default = "default_read_poll_ms")]
    pub read_poll_interval_ms: u64,

    /// Cluster transport and control plane settings
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Logging destinations
    #[serde(default)]
    pub logging: LogSettings,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_checkpoint_interval() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL
}

fn default_read_poll_ms() -> u64 {
    DEFAULT_READ_POLL_MS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            read_poll_interval_ms: DEFAULT_READ_POLL_MS,
            cluster: ClusterSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, returning defaults on any error
    pub fn load_or_default() -> Self {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load engine config, using defaults: {}", e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Save as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| EngineError::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(EngineError::Config("queue_capacity must be at least 1".into()));
        }
        if self.checkpoint_interval == 0 {
            return Err(EngineError::Config(
                "checkpoint_interval must be at least 1".into(),
            ));
        }
        if self.read_poll_interval_ms == 0 {
            return Err(EngineError::Config(
                "read_poll_interval_ms must be at least 1".into(),
            ));
        }
        self.cluster.validate()
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.queue_capacity, 1_000);
        assert_eq!(config.checkpoint_interval, 50_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("queue_capacity = 16\n").unwrap();
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.checkpoint_interval, DEFAULT_CHECKPOINT_INTERVAL);
        assert_eq!(config.cluster, ClusterSettings::default());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = EngineConfig::from_toml_str("queue_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = EngineConfig::default();
        config.queue_capacity = 42;
        config.cluster.bind = "0.0.0.0:9000".into();
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
