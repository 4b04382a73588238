//! Ingestion configuration
//!
//! Loaded from `DEPOSIT_*` environment variables (a `.env` file is honoured).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use deposit_common::DepositId;

/// Default directory holding one sub-directory per deposit.
pub const DEFAULT_DEPOSITS_DIR: &str = "./deposits";

/// Default name of the technical metadata side directory inside a deposit.
pub const DEFAULT_TECHMD_DIR_NAME: &str = "techmd";

/// Default number of concurrent workers per concurrent job.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default interval between registrar flushes, in seconds.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

/// Default time allowed for the registrar to shut down, in seconds.
pub const DEFAULT_REGISTRAR_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Default polling interval while waiting for queue capacity, in milliseconds.
pub const DEFAULT_QUEUE_POLL_MILLIS: u64 = 50;

/// File name of the persisted deposit model inside a deposit directory.
pub const MODEL_FILE_NAME: &str = "model.json";

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory holding one sub-directory per deposit
    pub deposits_dir: PathBuf,
    /// Name of the technical metadata side directory within a deposit directory
    pub techmd_dir_name: String,
    /// Settings for concurrent jobs
    pub concurrency: ConcurrencyConfig,
}

/// Settings for jobs that fan work out to a worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Number of tasks allowed to execute at once
    pub worker_count: usize,
    /// Ceiling on submitted but not yet collected tasks
    pub max_queued_jobs: usize,
    /// Interval between result registration flushes
    pub flush_interval: Duration,
    /// Bound on the wait for the registrar to exit
    pub registrar_shutdown_timeout: Duration,
    /// Sleep between checks while waiting for queue capacity
    pub capacity_poll_interval: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            max_queued_jobs: DEFAULT_WORKER_COUNT * 2,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            registrar_shutdown_timeout: Duration::from_secs(
                DEFAULT_REGISTRAR_SHUTDOWN_TIMEOUT_SECS,
            ),
            capacity_poll_interval: Duration::from_millis(DEFAULT_QUEUE_POLL_MILLIS),
        }
    }
}

impl ConcurrencyConfig {
    /// Load concurrency settings from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_count = env_or("DEPOSIT_WORKER_THREADS", DEFAULT_WORKER_COUNT);
        let config = Self {
            worker_count,
            max_queued_jobs: env_or("DEPOSIT_MAX_QUEUED_JOBS", worker_count * 2),
            flush_interval: Duration::from_secs(env_or(
                "DEPOSIT_FLUSH_INTERVAL_SECS",
                DEFAULT_FLUSH_INTERVAL_SECS,
            )),
            registrar_shutdown_timeout: Duration::from_secs(env_or(
                "DEPOSIT_REGISTRAR_SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_REGISTRAR_SHUTDOWN_TIMEOUT_SECS,
            )),
            capacity_poll_interval: Duration::from_millis(env_or(
                "DEPOSIT_QUEUE_POLL_MILLIS",
                DEFAULT_QUEUE_POLL_MILLIS,
            )),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("DEPOSIT_WORKER_THREADS must be greater than 0");
        }
        if self.max_queued_jobs < self.worker_count {
            anyhow::bail!(
                "DEPOSIT_MAX_QUEUED_JOBS ({}) cannot be lower than DEPOSIT_WORKER_THREADS ({})",
                self.max_queued_jobs,
                self.worker_count
            );
        }
        if self.flush_interval.is_zero() {
            anyhow::bail!("DEPOSIT_FLUSH_INTERVAL_SECS must be greater than 0");
        }
        if self.registrar_shutdown_timeout.is_zero() {
            anyhow::bail!("DEPOSIT_REGISTRAR_SHUTDOWN_TIMEOUT_SECS must be greater than 0");
        }
        if self.capacity_poll_interval.is_zero() {
            anyhow::bail!("DEPOSIT_QUEUE_POLL_MILLIS must be greater than 0");
        }
        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            deposits_dir: PathBuf::from(DEFAULT_DEPOSITS_DIR),
            techmd_dir_name: DEFAULT_TECHMD_DIR_NAME.to_string(),
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Load ingestion configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            deposits_dir: std::env::var("DEPOSIT_BASE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DEPOSITS_DIR)),
            techmd_dir_name: std::env::var("DEPOSIT_TECHMD_DIR")
                .unwrap_or_else(|_| DEFAULT_TECHMD_DIR_NAME.to_string()),
            concurrency: ConcurrencyConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.techmd_dir_name.trim().is_empty() {
            anyhow::bail!("DEPOSIT_TECHMD_DIR cannot be empty");
        }
        if self.techmd_dir_name.contains(['/', '\\']) {
            anyhow::bail!(
                "DEPOSIT_TECHMD_DIR must be a single directory name, got '{}'",
                self.techmd_dir_name
            );
        }
        self.concurrency.validate()
    }

    /// Directory holding the staged content of one deposit
    pub fn deposit_dir(&self, deposit_id: &DepositId) -> PathBuf {
        self.deposits_dir.join(deposit_id.as_str())
    }

    /// Technical metadata side directory of one deposit
    pub fn techmd_dir(&self, deposit_id: &DepositId) -> PathBuf {
        self.deposit_dir(deposit_id).join(&self.techmd_dir_name)
    }

    /// Use `dir` as the deposits directory
    pub fn with_deposits_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.deposits_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
        self.concurrency = concurrency;
        self
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.concurrency.max_queued_jobs > config.concurrency.worker_count);
        assert_eq!(config.concurrency.flush_interval, Duration::from_secs(5));
        assert_eq!(config.concurrency.registrar_shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_queue_ceiling_below_workers_is_rejected() {
        let concurrency = ConcurrencyConfig {
            worker_count: 8,
            max_queued_jobs: 4,
            ..Default::default()
        };
        assert!(concurrency.validate().is_err());
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let concurrency = ConcurrencyConfig {
            worker_count: 0,
            max_queued_jobs: 0,
            ..Default::default()
        };
        assert!(concurrency.validate().is_err());
    }

    #[test]
    fn test_techmd_dir_must_be_a_name() {
        let config = IngestConfig {
            techmd_dir_name: "a/b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deposit_layout() {
        let config = IngestConfig::default().with_deposits_dir("/srv/deposits");
        let deposit: DepositId = "d1".parse().unwrap();

        assert_eq!(config.deposit_dir(&deposit), PathBuf::from("/srv/deposits/d1"));
        assert_eq!(config.techmd_dir(&deposit), PathBuf::from("/srv/deposits/d1/techmd"));
    }
}
