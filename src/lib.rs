//! Bounded priority buffer coordinating producer and consumer worker pools.
//!
//! [`PriorityBoundedBuffer`] is the synchronisation core: a fixed-capacity container that hands
//! out the most urgent item first and keeps arrival order within a priority class.
//! [`SystemController`] owns one buffer per run together with its producer and consumer threads,
//! and [`server`] exposes the controller over HTTP and a line-delimited JSON stream.

pub mod buffer;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod item;
pub mod metrics;
pub mod priority;
pub mod semaphore;
pub mod server;
pub mod worker;

pub use buffer::{BufferSnapshot, PriorityBoundedBuffer};
pub use config::{AppConfig, SystemConfig, WorkerTiming};
pub use controller::{StopReport, SystemController, SystemStatus};
pub use error::{BufferError, ConfigError, ControllerError};
pub use events::{EventBus, SystemEvent};
pub use item::{ItemSource, PriorityItem};
pub use priority::{Priority, PriorityTable};
pub use worker::{PriorityDistribution, StopToken};
