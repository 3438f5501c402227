//! Cadence Common Library
//!
//! Shared constants, configuration loading and the serializable telemetry
//! message used by the cadence scheduler crates.
//!
//! # Module Structure
//!
//! - [`config`] - Configuration loading traits and scheduler configuration
//! - [`consts`] - Priorities, loop defaults and fixed diagnostic strings
//! - [`telemetry`] - Scheduler snapshot message (dashboard wire shape)
//! - [`logging`] - `tracing` subscriber installation
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use cadence_common::config::{ConfigLoader, SchedulerConfig};
//! use cadence_common::consts::DEFAULT_PRIORITY;
//! ```

pub mod config;
pub mod consts;
pub mod logging;
pub mod prelude;
pub mod telemetry;
