//! Broker configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Root for `meta.json` and `queues/*.log`.
    /// Default: ./micromq-data
    pub data_dir: PathBuf,

    /// Dispatch worker threads. 0 picks the machine's available parallelism.
    /// Default: 0
    pub worker_threads: usize,

    /// How often idle connections are swept.
    /// Default: 5000
    pub heartbeat_interval_ms: u64,

    /// A connection silent for longer than this is evicted.
    /// Default: 30000
    pub idle_timeout_ms: u64,

    /// fsync the queue log after every durable append and invalidation.
    /// Default: false
    pub sync_writes: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("micromq-data"),
            worker_threads: 0,
            heartbeat_interval_ms: 5_000,
            idle_timeout_ms: 30_000,
            sync_writes: false,
        }
    }
}

impl BrokerConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON config file; omitted fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig("heartbeat_interval_ms must be positive"));
        }
        if self.idle_timeout_ms == 0 {
            return Err(Error::InvalidConfig("idle_timeout_ms must be positive"));
        }
        if self.idle_timeout_ms < self.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(
                "idle_timeout_ms must not be shorter than heartbeat_interval_ms",
            ));
        }
        Ok(())
    }

    pub fn queues_dir(&self) -> PathBuf {
        self.data_dir.join("queues")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Resolved worker count, never zero.
    pub fn worker_count(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}
