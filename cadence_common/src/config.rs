//! Configuration loading traits and types.
//!
//! Every cadence process reads one TOML file. The [`ConfigLoader`] trait gives
//! any deserializable struct a `load` constructor; [`SchedulerConfig`] is the
//! document the scheduler and its tick loop understand.
//!
//! # Usage
//!
//! ```rust,no_run
//! use cadence_common::config::{load_config, ConfigError};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = load_config(Path::new("scheduler.toml"))?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::consts::{DEFAULT_PERIOD_US, MAX_PERIOD_US, MIN_PERIOD_US};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, per-slice tracing.
    Trace,
    /// Scheduling decisions.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Rejected commands, overruns.
    Warn,
    /// Failed commands.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "robot-scheduler"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the tick loop does when a tick takes longer than its period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverrunPolicy {
    /// Count the overrun, log it and keep going.
    #[default]
    Warn,
    /// Stop the loop with a cycle overrun error.
    Abort,
}

/// What the tick loop does when `run()` surfaces a command failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandErrorPolicy {
    /// Log the failure and keep ticking. The failed component is already torn down.
    #[default]
    Log,
    /// Stop the loop and return the failure.
    Stop,
}

/// `[loop]` section: pacing of the scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Tick period [µs].
    pub period_us: u64,
    /// Overrun handling.
    pub overrun: OverrunPolicy,
    /// Command failure handling.
    pub on_command_error: CommandErrorPolicy,
    /// CPU core to pin the loop thread to (`rt` feature only).
    pub rt_cpu: Option<usize>,
    /// SCHED_FIFO priority (`rt` feature only).
    pub rt_priority: Option<i32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            period_us: DEFAULT_PERIOD_US,
            overrun: OverrunPolicy::default(),
            on_command_error: CommandErrorPolicy::default(),
            rt_cpu: None,
            rt_priority: None,
        }
    }
}

impl LoopConfig {
    /// Validate pacing and RT parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PERIOD_US..=MAX_PERIOD_US).contains(&self.period_us) {
            return Err(ConfigError::ValidationError(format!(
                "loop.period_us must be within {MIN_PERIOD_US}..={MAX_PERIOD_US}, got {}",
                self.period_us
            )));
        }
        if let Some(priority) = self.rt_priority {
            if !(1..=99).contains(&priority) {
                return Err(ConfigError::ValidationError(format!(
                    "loop.rt_priority must be within 1..=99, got {priority}"
                )));
            }
        }
        Ok(())
    }
}

/// `[telemetry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Publish snapshots at all.
    pub enabled: bool,
    /// Publish every N ticks.
    pub publish_every: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            publish_every: 1,
        }
    }
}

/// Complete scheduler configuration document.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "robot-scheduler"
///
/// [loop]
/// period_us = 20000
/// overrun = "warn"
/// on_command_error = "log"
///
/// [telemetry]
/// publish_every = 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub shared: SharedConfig,
    #[serde(rename = "loop", default)]
    pub tick: LoopConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl SchedulerConfig {
    /// Config with defaults everywhere except the service name.
    pub fn named(service_name: impl Into<String>) -> Self {
        Self {
            shared: SharedConfig {
                log_level: LogLevel::default(),
                service_name: service_name.into(),
            },
            tick: LoopConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.tick.validate()?;
        if self.telemetry.publish_every == 0 {
            return Err(ConfigError::ValidationError(
                "telemetry.publish_every must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

/// Load and validate a [`SchedulerConfig`].
pub fn load_config(path: &Path) -> Result<SchedulerConfig, ConfigError> {
    let config = SchedulerConfig::load(path)?;
    config.validate()?;
    tracing::debug!(
        path = %path.display(),
        service = %config.shared.service_name,
        period_us = config.tick.period_us,
        "configuration loaded"
    );
    Ok(config)
}
