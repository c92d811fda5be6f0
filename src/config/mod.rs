//! Typed configuration.
//!
//! Process settings come from environment variables and fail fast when a
//! required one is missing; sensitive values are wrapped in
//! `secrecy::SecretString` so they never reach logs. Queue, health, and
//! scaler tuning lives in an optional TOML file.

pub mod secrets;

use crate::error::{Error, Result};
use crate::health::{HealthConfig, HealthThresholds};
use crate::queue::QueueConfig;
use crate::scaler::ScalerConfig;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Path to the runtime TOML file, if any.
    pub runtime_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            runtime_config: std::env::var_os("JOBGATE_CONFIG").map(PathBuf::from),
        })
    }

    /// The runtime file named by `JOBGATE_CONFIG`, or defaults when unset.
    pub fn load_runtime(&self) -> Result<RuntimeConfig> {
        match &self.runtime_config {
            Some(path) => RuntimeConfig::load(path),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

// ---------------------------------------------------------------------------
// Runtime file
// ---------------------------------------------------------------------------

/// Contents of the runtime TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub database: DatabaseSection,
    pub health: HealthSection,
    pub queues: Vec<QueueSection>,
    /// Keyed by worker type.
    pub scalers: BTreeMap<String, ScalerConfig>,
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read runtime config {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad runtime config {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        for queue in &config.queues {
            queue.queue.validate()?;
        }
        Ok(config)
    }

    /// Find the queue section for `table`.
    pub fn queue(&self, table: &str) -> Option<&QueueSection> {
        self.queues.iter().find(|q| q.queue.table == table)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            max_connections: crate::db::DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// `[health]`: intervals in seconds, thresholds in percent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
    pub stale_after_secs: u64,
    pub collection_timeout_secs: u64,
    pub thresholds: HealthThresholds,
}

impl Default for HealthSection {
    fn default() -> Self {
        let defaults = HealthConfig::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            stale_after_secs: defaults.stale_after.as_secs(),
            collection_timeout_secs: defaults.collection_timeout.as_secs(),
            thresholds: defaults.thresholds,
        }
    }
}

impl HealthSection {
    pub fn to_health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            stale_after: Duration::from_secs(self.stale_after_secs.max(1)),
            collection_timeout: Duration::from_secs(self.collection_timeout_secs.max(1)),
            thresholds: self.thresholds,
        }
    }
}

/// One `[[queues]]` entry: the queue itself plus its stale-job reaper.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    #[serde(flatten)]
    pub queue: QueueConfig,
    #[serde(default = "default_stale_threshold_minutes")]
    pub stale_threshold_minutes: u32,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_stale_threshold_minutes() -> u32 {
    crate::harness::DEFAULT_STALE_THRESHOLD_MINUTES
}

fn default_reaper_interval_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = RuntimeConfig::parse("").unwrap();
        assert!(config.queues.is_empty());
        assert!(config.scalers.is_empty());
        assert_eq!(config.health.interval_secs, 10);
        assert_eq!(config.health.thresholds.io_wait.critical, 40.0);
        assert_eq!(config.database.max_connections, 10);
    }

    #[test]
    fn parses_queues_scalers_and_thresholds() {
        let config = RuntimeConfig::parse(
            r#"
            [database]
            max_connections = 25

            [health]
            interval_secs = 5
            stale_after_secs = 20

            [health.thresholds.io_wait]
            warning = 30.0
            critical = 40.0

            [[queues]]
            table = "document_jobs"
            max_attempts = 5
            stale_threshold_minutes = 15

            [[queues]]
            table = "outbound_emails"
            error_column = "error_message"
            completed_column = "processed_at"

            [scalers.embedding]
            enabled = true
            min = 2
            max = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.database.max_connections, 25);
        let health = config.health.to_health_config();
        assert_eq!(health.interval, Duration::from_secs(5));
        assert_eq!(health.stale_after, Duration::from_secs(20));
        assert_eq!(health.thresholds.io_wait.warning, 30.0);
        // Unlisted signals keep their defaults.
        assert_eq!(health.thresholds.memory.critical, 95.0);

        let docs = config.queue("document_jobs").unwrap();
        assert_eq!(docs.queue.max_attempts, 5);
        assert_eq!(docs.stale_threshold_minutes, 15);
        assert_eq!(docs.reaper_interval_secs, 60);

        let emails = config.queue("outbound_emails").unwrap();
        assert_eq!(emails.queue.completed_column, "processed_at");
        assert_eq!(emails.stale_threshold_minutes, 10);

        let embedding = config.scalers["embedding"];
        assert!(embedding.enabled);
        assert_eq!((embedding.min, embedding.max), (2, 20));
    }

    #[test]
    fn rejects_unsafe_table_names() {
        let err = RuntimeConfig::parse(
            r#"
            [[queues]]
            table = "jobs; DROP TABLE jobs"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)));
    }
}
