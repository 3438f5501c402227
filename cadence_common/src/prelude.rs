//! Common re-exports for convenience.
//!
//! ```rust
//! use cadence_common::prelude::*;
//! ```

pub use crate::config::{
    ConfigError, ConfigLoader, CommandErrorPolicy, LogLevel, LoopConfig, OverrunPolicy,
    SchedulerConfig, SharedConfig, TelemetryConfig,
};
pub use crate::consts::*;
pub use crate::telemetry::{
    QueuedCommandMessage, RequirementMessage, RunningCommandMessage, SchedulerMessage,
};
