//! Engine configuration (§10.3 of SPEC_FULL.md). Plain struct + `Default`,
//! mirroring the teacher's CLI-arg/env-var precedence in
//! `bpmn-lite-server/src/main.rs::parse_database_url`: an explicit override
//! wins, then an environment variable, then a hardcoded default.

use std::env;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// `sqlite://path/to/file.db`, or `None` to run against `MemoryEventStore`.
    pub database_url: Option<String>,
    /// §4.9 default threshold before a stalled join publishes `gateway.deadlock`.
    pub deadlock_threshold_ms: i64,
    /// How often the background deadlock watcher re-checks active joins.
    pub deadlock_poll_interval_ms: u64,
    /// §4.5 per-subscriber bounded buffer size.
    pub subscriber_buffer: usize,
    /// §4.7 mailbox-size warning threshold.
    pub mailbox_warning_threshold: usize,
    /// HTTP bind address for `bpmn-engine-server`.
    pub bind_address: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            deadlock_threshold_ms: 30_000,
            deadlock_poll_interval_ms: 5_000,
            subscriber_buffer: 256,
            mailbox_warning_threshold: 1_000,
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl EngineConfig {
    /// Resolve from environment variables, falling back to defaults.
    /// `database_url_override` models an explicit CLI flag, which always
    /// wins over `DATABASE_URL` when given.
    pub fn from_env(database_url_override: Option<String>) -> Self {
        let mut config = Self::default();
        config.database_url = database_url_override.or_else(|| env::var("DATABASE_URL").ok());
        if let Ok(threshold) = env::var("DEADLOCK_THRESHOLD_MS") {
            if let Ok(parsed) = threshold.parse() {
                config.deadlock_threshold_ms = parsed;
            }
        }
        if let Ok(bind) = env::var("BIND_ADDRESS") {
            config.bind_address = bind;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = EngineConfig::default();
        assert_eq!(config.deadlock_threshold_ms, 30_000);
        assert_eq!(config.subscriber_buffer, 256);
        assert_eq!(config.mailbox_warning_threshold, 1_000);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn explicit_override_wins_over_env() {
        env::set_var("DATABASE_URL", "sqlite://from-env.db");
        let config = EngineConfig::from_env(Some("sqlite://explicit.db".to_string()));
        assert_eq!(config.database_url.as_deref(), Some("sqlite://explicit.db"));
        env::remove_var("DATABASE_URL");
    }
}
