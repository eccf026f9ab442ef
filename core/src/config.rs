//! Broker configuration: every tunable named in spec §6 "Configuration (enumerated)",
//! each with the stated default. The broker itself is a constructed-once instance handed
//! to collaborators (see lib note on "no ambient state"), not a process-wide singleton
//! reached through a lazily-initialized loader — but `from_env` keeps that same
//! "load once, overlay env" shape for the binary that wires the broker up.

use std::time::Duration;

/// How verbose `logging::init` should make the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Off,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn from_env_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(LogLevel::Off),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// All broker tunables. Defaults match spec §6 exactly.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_output_chunks: usize,
    pub max_output_bytes: usize,
    pub replay_k: usize,
    pub max_sessions_per_user: usize,
    pub ping_interval: Duration,
    pub detach_reap: Duration,
    pub detached_ttl: Duration,
    pub dead_ttl: Duration,
    pub audit_interval: Duration,
    pub reap_interval: Duration,
    pub pty_grace: Duration,
    pub shutdown_grace: Duration,
    pub cwd_delay: Duration,
    pub stale_client_threshold: Duration,
    pub container_mode: bool,
    pub log_level: LogLevel,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_output_chunks: 5000,
            max_output_bytes: 5 * 1024 * 1024,
            replay_k: 500,
            max_sessions_per_user: 50,
            ping_interval: Duration::from_secs(30),
            detach_reap: Duration::from_secs(10 * 60),
            detached_ttl: Duration::from_secs(2 * 60 * 60),
            dead_ttl: Duration::from_secs(24 * 60 * 60),
            audit_interval: Duration::from_secs(30),
            reap_interval: Duration::from_secs(60),
            pty_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            cwd_delay: Duration::from_secs(1),
            stale_client_threshold: Duration::from_secs(5 * 60),
            container_mode: false,
            log_level: LogLevel::Info,
        }
    }
}

impl BrokerConfig {
    /// Start from defaults and overlay `BROKER_*` environment variables. Malformed values are
    /// ignored (default wins) rather than failing startup over a typo'd env var.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("BROKER_MAX_OUTPUT_CHUNKS") {
            if let Ok(n) = v.parse() {
                cfg.max_output_chunks = n;
            }
        }
        if let Ok(v) = std::env::var("BROKER_MAX_OUTPUT_BYTES") {
            if let Ok(n) = v.parse() {
                cfg.max_output_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("BROKER_REPLAY_K") {
            if let Ok(n) = v.parse() {
                cfg.replay_k = n;
            }
        }
        if let Ok(v) = std::env::var("BROKER_MAX_SESSIONS_PER_USER") {
            if let Ok(n) = v.parse() {
                cfg.max_sessions_per_user = n;
            }
        }
        if let Ok(v) = std::env::var("BROKER_CONTAINER_MODE") {
            cfg.container_mode = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Ok(v) = std::env::var("BROKER_LOG_LEVEL") {
            if let Some(lvl) = LogLevel::from_env_str(&v) {
                cfg.log_level = lvl;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.max_output_chunks, 5000);
        assert_eq!(cfg.max_output_bytes, 5 * 1024 * 1024);
        assert_eq!(cfg.replay_k, 500);
        assert_eq!(cfg.max_sessions_per_user, 50);
        assert_eq!(cfg.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.detach_reap, Duration::from_secs(600));
        assert_eq!(cfg.detached_ttl, Duration::from_secs(7200));
        assert_eq!(cfg.dead_ttl, Duration::from_secs(86400));
        assert!(!cfg.container_mode);
    }

    #[test]
    fn env_overlay_ignores_garbage() {
        std::env::set_var("BROKER_MAX_SESSIONS_PER_USER", "not-a-number");
        let cfg = BrokerConfig::from_env();
        assert_eq!(cfg.max_sessions_per_user, 50);
        std::env::remove_var("BROKER_MAX_SESSIONS_PER_USER");
    }
}
