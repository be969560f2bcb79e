//! Worker configuration
//!
//! Loaded from an optional YAML file, then overridden by command-line flags
//! in `main.rs`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::staging::Location;

/// Packet counts are derived from sizes given in MiB.
pub const UNIT_SIZE: usize = 1024 * 1024;

/// Default inbound command key.
pub const DEFAULT_REQUEST_KEY: &str = "ag_request";

/// Default coordinator inbound key.
pub const DEFAULT_COORDINATOR_KEY: &str = "coor_request";

/// Where fragment and chunk objects are stored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process memory; contents vanish with the process
    #[default]
    Memory,
    /// One file per object under `root`
    Local { root: PathBuf },
}

/// Configuration for one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// This node's staging store; also its identity towards the coordinator
    pub local: Location,
    /// The coordinator's staging store
    pub coordinator: Location,
    /// Bytes per packet; must divide [`UNIT_SIZE`]
    pub packet_size: usize,
    /// Key the dispatcher pops commands from
    pub request_key: String,
    /// Key the coordinator pops requests from
    pub coordinator_key: String,
    /// Bound on every staging/coordinator wait (None = wait forever)
    pub wait_timeout_ms: Option<u64>,
    /// How often an idle dispatcher checks for shutdown
    pub poll_interval_ms: u64,
    pub backend: BackendConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            local: Location::from("127.0.0.1:6379"),
            coordinator: Location::from("127.0.0.1:6379"),
            packet_size: UNIT_SIZE,
            request_key: DEFAULT_REQUEST_KEY.to_string(),
            coordinator_key: DEFAULT_COORDINATOR_KEY.to_string(),
            wait_timeout_ms: None,
            poll_interval_ms: 1000,
            backend: BackendConfig::Memory,
        }
    }
}

impl WorkerConfig {
    /// Load from a YAML file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the pipelines rely on.
    pub fn validate(&self) -> Result<()> {
        if self.packet_size == 0 || UNIT_SIZE % self.packet_size != 0 {
            return Err(Error::Config(format!(
                "packet_size {} must be a positive divisor of {}",
                self.packet_size, UNIT_SIZE
            )));
        }
        if self.request_key.is_empty() || self.coordinator_key.is_empty() {
            return Err(Error::Config("request and coordinator keys must be set".into()));
        }
        if self.local.as_str().is_empty() || self.coordinator.as_str().is_empty() {
            return Err(Error::Config("local and coordinator locations must be set".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be > 0".into()));
        }
        if self.wait_timeout_ms == Some(0) {
            return Err(Error::Config("wait_timeout_ms must be > 0 when set".into()));
        }
        Ok(())
    }

    /// Packets per MiB of file data.
    pub fn packets_per_unit(&self) -> usize {
        UNIT_SIZE / self.packet_size
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
