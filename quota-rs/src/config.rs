use crate::error::{QuotaError, Result};
use crate::quota::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides, e.g. `QUOTA_WORKER_POOL__POOL_SIZE=8`
pub const ENV_PREFIX: &str = "QUOTA";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub store: StoreConfig,
    pub quota: EngineConfig,
    pub worker_pool: WorkerPoolConfig,
    pub job: JobConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Compute initial usage as soon as a folder becomes quota-managed
    pub update_on_marker_add: bool,
    /// Deliver committed deltas to the update queue instead of the worker pool
    #[serde(alias = "use_durable_queue")]
    pub use_job_queue: bool,
    pub queue_strategy: QueueStrategy,
    /// Cap on the ancestor walk; deeper trees resolve to no quota folder
    pub max_ancestor_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategy {
    /// In-process FIFO, lost on restart
    Volatile,
    /// Persisted in the store's attribute table
    Durable,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub pool_size: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobConfig {
    /// Identity the host runs reconciliation under
    pub run_as: String,
    pub incremental_interval_secs: u64,
    pub recalculate_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://quota.db".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            update_on_marker_add: true,
            use_job_queue: false,
            queue_strategy: QueueStrategy::Durable,
            max_ancestor_depth: 512,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_attempts: 5,
            retry_base_delay_ms: 20,
            retry_max_delay_ms: 2_000,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            run_as: "system".to_string(),
            incremental_interval_secs: 60,
            recalculate_interval_secs: 24 * 60 * 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

impl QuotaConfig {
    /// Parse a TOML file; missing keys fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| QuotaError::Config(e.to_string()))?;

        let config: Self =
            toml::from_str(&content).map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional TOML file under `QUOTA_*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.as_ref()).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| QuotaError::Config(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// A process other than the host can only drain the durable queue; a
    /// volatile queue exists only in the host's memory.
    pub fn validate_standalone_drain(&self) -> Result<()> {
        if !self.quota.use_job_queue {
            return Err(QuotaError::Config(
                "quota.use_job_queue is off, committed changes go to the worker pool".to_string(),
            ));
        }
        if self.quota.queue_strategy == QueueStrategy::Volatile {
            return Err(QuotaError::Config(
                "a volatile update queue can only be drained inside the host process".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool.pool_size == 0 {
            return Err(QuotaError::Config(
                "worker_pool.pool_size must be at least 1".to_string(),
            ));
        }
        if self.worker_pool.max_attempts == 0 {
            return Err(QuotaError::Config(
                "worker_pool.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.quota.max_ancestor_depth == 0 {
            return Err(QuotaError::Config(
                "quota.max_ancestor_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = QuotaConfig::default();
        assert!(config.quota.update_on_marker_add);
        assert!(!config.quota.use_job_queue);
        assert_eq!(config.quota.queue_strategy, QueueStrategy::Durable);
        assert_eq!(config.worker_pool.pool_size, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[quota]
use_durable_queue = true
queue_strategy = "volatile"

[worker_pool]
pool_size = 2
"#
        )
        .unwrap();

        let config = QuotaConfig::from_file(file.path()).unwrap();
        assert!(config.quota.use_job_queue);
        assert_eq!(config.quota.queue_strategy, QueueStrategy::Volatile);
        assert_eq!(config.worker_pool.pool_size, 2);
        assert_eq!(config.worker_pool.max_attempts, 5);
        assert_eq!(config.store.database_url, "sqlite://quota.db");
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let mut config = QuotaConfig::default();
        config.worker_pool.pool_size = 0;
        assert!(matches!(config.validate(), Err(QuotaError::Config(_))));
    }

    #[test]
    fn test_standalone_drain_needs_durable_queue() {
        let mut config = QuotaConfig::default();
        assert!(matches!(
            config.validate_standalone_drain(),
            Err(QuotaError::Config(_))
        ));

        config.quota.use_job_queue = true;
        config.quota.queue_strategy = QueueStrategy::Volatile;
        assert!(matches!(
            config.validate_standalone_drain(),
            Err(QuotaError::Config(_))
        ));

        config.quota.queue_strategy = QueueStrategy::Durable;
        assert!(config.validate_standalone_drain().is_ok());
    }

    #[test]
    fn test_retry_policy_from_pool_config() {
        let policy = WorkerPoolConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(20));
    }

    #[test]
    fn test_from_file_missing() {
        let result = QuotaConfig::from_file("/nonexistent/quota.toml");
        assert!(matches!(result, Err(QuotaError::Config(_))));
    }
}
