//! Cluster and logging settings
//!
//! These are nested sections of [`EngineConfig`](super::EngineConfig):
//!
//! ```toml
//! [cluster]
//! bind = "127.0.0.1:7070"
//! heartbeat_interval_ms = 1000
//! heartbeat_timeout_ms = 5000
//! run_retention_secs = 600
//!
//! [logging]
//! dir = "/var/log/rowflow"
//! history = 500
//! ```

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the execution host and remote links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Address the execution host listens on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// How often a remote run is polled
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a remote host is considered dead
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Timeout for establishing control and data connections
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long a host keeps an ended (or never started) run nobody released
    #[serde(default = "default_run_retention")]
    pub run_retention_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:7070".to_string()
}

fn default_heartbeat_interval() -> u64 {
    1_000
}

fn default_heartbeat_timeout() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    2_000
}

fn default_run_retention() -> u64 {
    600
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            run_retention_secs: default_run_retention(),
        }
    }
}

impl ClusterSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn run_retention(&self) -> Duration {
        Duration::from_secs(self.run_retention_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(EngineError::Config(
                "cluster.heartbeat_interval_ms must be at least 1".into(),
            ));
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(EngineError::Config(
                "cluster.heartbeat_timeout_ms must not be shorter than the interval".into(),
            ));
        }
        Ok(())
    }
}

/// Where log output goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Directory for daily rolling log files; stdout only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Lines of recent log output kept per run for the `Logs` request
    #[serde(default = "default_history")]
    pub history: usize,
}

fn default_history() -> usize {
    500
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: None,
            history: default_history(),
        }
    }
}
