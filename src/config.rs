//! Configuration objects: the run configuration accepted by `start`, internal worker timing, and
//! the application config file used by the binary.

use crate::error::{ConfigError, ControllerError};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

/// Parameters accepted by [`SystemController::start`](crate::controller::SystemController::start).
///
/// Every field must be at least 1. Fields missing from JSON/TOML input take the defaults
/// (2 producers, 3 consumers, 20 items per producer, capacity 10).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub num_producers: usize,
    pub num_consumers: usize,
    pub items_per_producer: usize,
    pub buffer_size: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_producers: 2,
            num_consumers: 3,
            items_per_producer: 20,
            buffer_size: 10,
        }
    }
}

impl SystemConfig {
    /// Reject any field below 1, naming the first offending field.
    pub fn validate(&self) -> Result<(), ControllerError> {
        let fields = [
            ("num_producers", self.num_producers),
            ("num_consumers", self.num_consumers),
            ("items_per_producer", self.items_per_producer),
            ("buffer_size", self.buffer_size),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ControllerError::InvalidConfig(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Inclusive millisecond range a worker samples delays from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MillisRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl MillisRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const ZERO: MillisRange = MillisRange::new(0, 0);

    pub fn as_range(&self) -> RangeInclusive<u64> {
        self.min_ms.min(self.max_ms)..=self.max_ms.max(self.min_ms)
    }
}

/// Internal worker tunables. Not part of the control contract; defaults mirror a slow,
/// human-observable simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerTiming {
    /// Pause between two items produced by the same producer.
    pub producer_delay: MillisRange,
    /// Simulated processing time per consumed item.
    pub processing_time: MillisRange,
    /// Upper bound on a consumer's `get` wait, and so on its stop latency while idle.
    pub consumer_poll_ms: u64,
    /// How long `add_manual_item` waits for a free slot before reporting `BufferFull`.
    pub manual_put_timeout_ms: u64,
}

impl Default for WorkerTiming {
    fn default() -> Self {
        Self {
            producer_delay: MillisRange::new(100, 500),
            processing_time: MillisRange::new(100, 300),
            consumer_poll_ms: 100,
            manual_put_timeout_ms: 100,
        }
    }
}

impl WorkerTiming {
    /// Timing with no artificial delays; useful for tests and benchmarks.
    pub fn immediate() -> Self {
        Self {
            producer_delay: MillisRange::ZERO,
            processing_time: MillisRange::ZERO,
            consumer_poll_ms: 10,
            manual_put_timeout_ms: 0,
        }
    }

    pub fn consumer_poll(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_ms)
    }

    pub fn manual_put_timeout(&self) -> Duration {
        Duration::from_millis(self.manual_put_timeout_ms)
    }
}

/// HTTP adapter and snapshot stream settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the HTTP control API.
    pub bind: String,
    /// Address of the line-delimited JSON snapshot stream.
    pub stream_bind: String,
    /// Cadence of snapshot lines pushed to stream clients.
    pub stream_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            stream_bind: "127.0.0.1:5001".to_string(),
            stream_interval_ms: 500,
        }
    }
}

/// Top-level configuration file for the binary.
///
/// ```toml
/// [server]
/// bind = "0.0.0.0:5000"
///
/// [system]
/// num_producers = 4
///
/// [timing]
/// consumer_poll_ms = 50
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub system: SystemConfig,
    pub timing: WorkerTiming,
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.system
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.server.stream_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.stream_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
