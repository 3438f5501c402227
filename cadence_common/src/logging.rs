//! `tracing` subscriber installation.
//!
//! `RUST_LOG` wins when set; otherwise the configured [`LogLevel`] applies.
//! Installing twice is harmless: the second call reports `false`.

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogLevel;

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()))
}

/// Install a human-readable subscriber. Returns `false` if one was already set.
pub fn init_tracing(level: LogLevel) -> bool {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// Install a JSON subscriber for log shipping. Returns `false` if one was already set.
pub fn init_tracing_json(level: LogLevel) -> bool {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter(level))
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
