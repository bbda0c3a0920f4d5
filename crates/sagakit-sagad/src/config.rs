//! Daemon configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, ConfigError, Environment, File};
use sagakit::WorkerConfig;
use sagakit_common::Amount;
use serde::{Deserialize, Serialize};

/// Network and logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Info {
    /// Address the acceptance API binds to
    pub listen_host: String,
    /// Port the acceptance API binds to
    pub listen_port: u16,
    /// Log filter directive; overrides `RUST_LOG`
    pub log_filter: Option<String>,
}

impl Default for Info {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8085,
            log_filter: None,
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    /// SQLite database file; defaults to `<work_dir>/sagakit.db`
    pub path: Option<PathBuf>,
}

impl Database {
    /// Resolved database path.
    pub fn resolved_path(&self, work_dir: &Path) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| work_dir.join("sagakit.db"))
    }
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    /// Number of outbox worker tasks
    pub workers: usize,
    /// Sleep when the outbox is empty, in seconds
    pub empty_queue_delay_secs: u64,
    /// Outbox message lease, in seconds
    pub lease_ttl_secs: u64,
    /// Re-queue delay after a transient conflict, in seconds
    pub transient_conflict_delay_secs: u64,
    /// Re-queue delay after a lost lease, in seconds
    pub lost_lease_delay_secs: u64,
    /// Attempt count that triggers the operator warning
    pub max_attempts_before_dlq: u32,
    /// Step lock lease, in seconds
    pub step_lease_secs: u64,
    /// Lowest balance a debit may leave behind, in minor units
    pub overdraft_limit: i64,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            workers: 2,
            empty_queue_delay_secs: 1,
            lease_ttl_secs: 30,
            transient_conflict_delay_secs: 2,
            lost_lease_delay_secs: 5,
            max_attempts_before_dlq: 10,
            step_lease_secs: 120,
            overdraft_limit: -50_000,
        }
    }
}

impl Engine {
    /// Outbox worker tuning derived from these settings.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            empty_queue_delay: Duration::from_secs(self.empty_queue_delay_secs),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            transient_conflict_delay: Duration::from_secs(self.transient_conflict_delay_secs),
            lost_lease_delay: Duration::from_secs(self.lost_lease_delay_secs),
            max_attempts_before_dlq: self.max_attempts_before_dlq,
            ..WorkerConfig::default()
        }
    }

    /// Step lock lease duration.
    pub fn step_lease(&self) -> Duration {
        Duration::from_secs(self.step_lease_secs)
    }

    /// Overdraft limit as an [`Amount`].
    pub fn overdraft(&self) -> Amount {
        Amount::from(self.overdraft_limit)
    }
}

/// Daemon settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Network and logging
    pub info: Info,
    /// Storage
    pub database: Database,
    /// Engine tuning
    pub engine: Engine,
}

impl Settings {
    /// Loads settings from the config file (explicit path, or
    /// `<work_dir>/config.toml` when present) with `SAGAD_`-prefixed
    /// environment overrides, e.g. `SAGAD_INFO__LISTEN_PORT=9000`.
    pub fn new(config_path: Option<PathBuf>, work_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_path.unwrap_or_else(|| work_dir.join("config.toml"));

        Config::builder()
            .add_source(File::from(config_path).required(false))
            .add_source(Environment::with_prefix("SAGAD").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let engine = Engine::default();
        assert_eq!(engine.lease_ttl_secs, 30);
        assert_eq!(engine.transient_conflict_delay_secs, 2);
        assert_eq!(engine.max_attempts_before_dlq, 10);
        assert_eq!(engine.step_lease_secs, 120);
        assert_eq!(engine.overdraft_limit, -50_000);

        let worker = engine.worker_config();
        assert_eq!(worker.empty_queue_delay, Duration::from_secs(1));
        assert_eq!(worker.lease_ttl, Duration::from_secs(30));
    }
}
