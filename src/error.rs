//! Error types for the buffer, the controller, and configuration loading.

use std::path::PathBuf;
use thiserror::Error;

/// Outcome of a `put` or `get` that did not complete.
///
/// Both variants are control-flow signals for workers rather than faults: `TimedOut` tells a
/// consumer to re-check its stop token, `Closed` tells any worker to exit cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("timed out waiting on the buffer")]
    TimedOut,
    #[error("buffer closed")]
    Closed,
}

impl From<crate::semaphore::AcquireError> for BufferError {
    fn from(err: crate::semaphore::AcquireError) -> Self {
        match err {
            crate::semaphore::AcquireError::TimedOut => BufferError::TimedOut,
            crate::semaphore::AcquireError::Closed => BufferError::Closed,
        }
    }
}

/// Failures reported by [`SystemController`](crate::controller::SystemController).
///
/// Every variant leaves controller and buffer state exactly as it was before the call.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("system already running")]
    AlreadyRunning,

    #[error("system not running")]
    NotRunning,

    #[error("buffer full")]
    BufferFull,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Failures while loading an [`AppConfig`](crate::config::AppConfig) file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
