//! Workspace-wide constants.
//!
//! Single source of truth for priorities, loop defaults and the fixed
//! strings that appear in diagnostics.

/// Priority given to commands that do not ask for one.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Lowest possible priority. Idle commands use it so anything can preempt them.
pub const LOWEST_PRIORITY: i32 = i32::MIN;

/// Highest possible priority.
pub const HIGHEST_PRIORITY: i32 = i32::MAX;

/// Default tick period in microseconds (50 Hz).
pub const DEFAULT_PERIOD_US: u64 = 20_000;

/// Shortest tick period accepted by config validation.
pub const MIN_PERIOD_US: u64 = 100;

/// Longest tick period accepted by config validation.
pub const MAX_PERIOD_US: u64 = 1_000_000;

/// Prefix of every conflict report.
pub const CONFLICT_BANNER: &str = "Commands running in parallel cannot share requirements: ";

/// Header of the synthetic frame section appended to command failures.
pub const BINDING_TRACE_HEADER: &str = "=== Command Binding Trace ===";

/// Suffix of the name given to a mechanism's idle command.
pub const IDLE_SUFFIX: &str = "[IDLE]";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cadence/scheduler.toml";
