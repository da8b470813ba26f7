//! Engine configuration.
//!
//! Typed sections with serde defaults, overridable from `JOBFLOW_*`
//! environment variables (after `.env` has been loaded by the binary).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::pipeline::{JobQueueConfig, PurgeConfig, WorkerPoolConfig};
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// Default SQLite database URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:jobflow.db?mode=rwc";

/// Where job records live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Sqlite { database_url: String },
    File { directory: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Sqlite {
            database_url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(flatten)]
    pub pool: WorkerPoolConfig,
    /// Timeout applied to jobs submitted without one.
    #[serde(default = "default_job_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_job_timeout_secs() -> u64 {
    3600 // 1 hour
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::default(),
            default_timeout_secs: default_job_timeout_secs(),
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs.max(1))
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: JobQueueConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
    /// How long shutdown waits for in-flight attempts.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Directory for rolling log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            queue: JobQueueConfig::default(),
            purge: PurgeConfig::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            log_dir: default_log_dir(),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("{}={:?}: {}", key, value, e)))
}

impl EngineConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `JOBFLOW_*` key.
    ///
    /// Supported keys:
    /// - `JOBFLOW_STORAGE` (`sqlite` | `file`)
    /// - `JOBFLOW_DATABASE_URL`, `JOBFLOW_STORAGE_DIR`
    /// - `JOBFLOW_MAX_WORKERS`, `JOBFLOW_JOB_TIMEOUT_SECS`, `JOBFLOW_MAX_BACKOFF_SECS`
    /// - `JOBFLOW_SCHEDULER_ENABLED`, `JOBFLOW_CHECK_INTERVAL_MS`
    /// - `JOBFLOW_RETENTION_DAYS`, `JOBFLOW_PURGE_WINDOW`
    /// - `JOBFLOW_SHUTDOWN_GRACE_SECS`, `JOBFLOW_LOG_DIR`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        let backend = var("JOBFLOW_STORAGE").unwrap_or_else(|| "sqlite".to_string());
        config.storage = match backend.trim().to_ascii_lowercase().as_str() {
            "sqlite" => StorageConfig::Sqlite {
                database_url: var("JOBFLOW_DATABASE_URL")
                    .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            },
            "file" => StorageConfig::File {
                directory: var("JOBFLOW_STORAGE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("jobs")),
            },
            other => {
                return Err(Error::config(format!(
                    "JOBFLOW_STORAGE must be 'sqlite' or 'file', got '{}'",
                    other
                )));
            }
        };

        if let Some(v) = var("JOBFLOW_MAX_WORKERS") {
            config.executor.pool.max_workers = parse_var("JOBFLOW_MAX_WORKERS", &v)?;
        }
        if let Some(v) = var("JOBFLOW_JOB_TIMEOUT_SECS") {
            config.executor.default_timeout_secs = parse_var("JOBFLOW_JOB_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("JOBFLOW_MAX_BACKOFF_SECS") {
            config.executor.pool.max_backoff_secs = parse_var("JOBFLOW_MAX_BACKOFF_SECS", &v)?;
        }
        if let Some(v) = var("JOBFLOW_SCHEDULER_ENABLED") {
            config.scheduler.enabled = parse_var("JOBFLOW_SCHEDULER_ENABLED", &v)?;
        }
        if let Some(v) = var("JOBFLOW_CHECK_INTERVAL_MS") {
            config.scheduler.check_interval_ms = parse_var("JOBFLOW_CHECK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = var("JOBFLOW_RETENTION_DAYS") {
            config.purge.retention_days = parse_var("JOBFLOW_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = var("JOBFLOW_PURGE_WINDOW") {
            config.purge.window = Some(v.trim().to_string());
        }
        if let Some(v) = var("JOBFLOW_SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace_secs = parse_var("JOBFLOW_SHUTDOWN_GRACE_SECS", &v)?;
        }
        if let Some(v) = var("JOBFLOW_LOG_DIR") {
            config.log_dir = PathBuf::from(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.pool.max_workers == 0 {
            return Err(Error::config("max_workers must be at least 1"));
        }
        if self.executor.default_timeout_secs == 0 {
            return Err(Error::config("default job timeout must be positive"));
        }
        if self.scheduler.check_interval_ms == 0 {
            return Err(Error::config("scheduler check interval must be positive"));
        }
        if self.queue.warning_threshold > self.queue.critical_threshold {
            return Err(Error::config(
                "queue warning threshold must not exceed the critical threshold",
            ));
        }
        self.purge.parsed_window()?;
        Ok(())
    }

    /// In-memory SQLite with a fast scheduler tick, for tests and embedding.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig::Sqlite {
                database_url: "sqlite::memory:".to_string(),
            },
            scheduler: SchedulerConfig::default().with_check_interval(Duration::from_millis(50)),
            shutdown_grace_secs: 5,
            ..Self::default()
        }
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.executor.pool.max_workers = max_workers;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_secs = grace.as_secs();
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.storage, StorageConfig::default());
        assert_eq!(config.executor.pool.max_workers, 4);
        assert_eq!(config.executor.default_timeout_secs, 3600);
        assert_eq!(config.scheduler.check_interval_ms, 1000);
        assert_eq!(config.purge.retention_days, 30);
        assert_eq!(config.shutdown_grace_secs, 30);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("JOBFLOW_STORAGE", "file"),
            ("JOBFLOW_STORAGE_DIR", "/var/lib/jobflow"),
            ("JOBFLOW_MAX_WORKERS", "8"),
            ("JOBFLOW_SCHEDULER_ENABLED", "false"),
            ("JOBFLOW_CHECK_INTERVAL_MS", "250"),
            ("JOBFLOW_RETENTION_DAYS", "0"),
            ("JOBFLOW_PURGE_WINDOW", "01:00-04:00"),
        ]))
        .unwrap();

        assert_eq!(
            config.storage,
            StorageConfig::File {
                directory: PathBuf::from("/var/lib/jobflow")
            }
        );
        assert_eq!(config.executor.pool.max_workers, 8);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.scheduler.check_interval_ms, 250);
        assert_eq!(config.purge.retention_days, 0);
        assert_eq!(config.purge.window.as_deref(), Some("01:00-04:00"));
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("JOBFLOW_MAX_WORKERS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("JOBFLOW_MAX_WORKERS"));

        assert!(EngineConfig::from_lookup(lookup(&[("JOBFLOW_STORAGE", "redis")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("JOBFLOW_MAX_WORKERS", "0")])).is_err());
        assert!(
            EngineConfig::from_lookup(lookup(&[("JOBFLOW_PURGE_WINDOW", "after midnight")]))
                .is_err()
        );
    }

    #[test]
    fn test_serde_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"storage":{"backend":"file","directory":"jobs"}}"#).unwrap();
        assert_eq!(config.executor.pool.max_workers, 4);
        assert!(config.scheduler.enabled);
    }
}
