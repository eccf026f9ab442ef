//! Structured logging bootstrap. One global subscriber, installed once.

use std::sync::Once;

use crate::config::LogLevel;

static INIT: Once = Once::new();

/// Install a `tracing` subscriber writing to stdout, filtered by `level` unless `RUST_LOG`
/// is set (in which case `RUST_LOG` wins, matching `EnvFilter`'s normal precedence). Calling
/// this more than once is a no-op: the broker may be embedded by multiple binaries in tests.
pub fn init(level: LogLevel) {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_str()));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        tracing::info!(event = "logging_initialized", ?level, "logging initialized");
    });
}

impl LogLevel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}
