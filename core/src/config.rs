//! Configuration for the upload engine and its front end

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration; every section has defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CourierConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.scheduler.validate()?;
        Ok(config)
    }
}

/// Scheduling limits and retry behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum simultaneous transport calls (default: 2)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per job before it fails terminally (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before attempt n+1, indexed by n-1 and clamped to the last entry
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    /// Ceiling for the priority boost a job earns by failing (default: 10)
    #[serde(default = "default_priority_cap")]
    pub priority_cap: u32,
}

fn default_concurrency() -> usize { 2 }
fn default_max_attempts() -> u32 { 5 }
fn default_backoff_secs() -> Vec<u64> { vec![1, 2, 4, 8, 16] }
fn default_priority_cap() -> u32 { 10 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            priority_cap: default_priority_cap(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("scheduler.concurrency must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("scheduler.max_attempts must be at least 1".into()));
        }
        if self.backoff_secs.is_empty() {
            return Err(ConfigError::Invalid("scheduler.backoff_secs must not be empty".into()));
        }
        if self.priority_cap == 0 {
            return Err(ConfigError::Invalid("scheduler.priority_cap must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff_secs.iter().copied().map(Duration::from_secs).collect(),
            priority_cap: self.priority_cap,
        }
    }
}

/// Job store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SurrealKV database directory
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

/// Where the directory transport delivers files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_remote_dir")]
    pub remote_dir: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { remote_dir: default_remote_dir() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Log file directory. Logs go to stderr when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: default_log_filter(), dir: None }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("courier")
}

fn default_store_path() -> PathBuf {
    data_dir().join("courier.db")
}

fn default_remote_dir() -> PathBuf {
    data_dir().join("remote")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_policy().backoff, RetryPolicy::default().backoff);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = CourierConfig::from_toml(
            r#"
            [scheduler]
            concurrency = 4

            [logging]
            filter = "courier_core=debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.concurrency, 4);
        assert_eq!(config.scheduler.max_attempts, 5);
        assert_eq!(config.logging.filter, "courier_core=debug");
        assert!(config.logging.dir.is_none());
        assert!(config.store.path.ends_with("courier/courier.db"));
    }

    #[test]
    fn empty_file_is_default() {
        let config = CourierConfig::from_toml("").unwrap();
        assert_eq!(config.scheduler.priority_cap, 10);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = CourierConfig::from_toml("[scheduler]\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_empty_backoff() {
        let err = CourierConfig::from_toml("[scheduler]\nbackoff_secs = []\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = CourierConfig::load(Path::new("/tmp/courier_no_such_config.toml")).unwrap_err();
        assert!(err.to_string().contains("courier_no_such_config.toml"));
    }
}
