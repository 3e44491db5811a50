//! Configuration for the hookline delivery worker.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookline_delivery::{
    BackoffStrategy, ClientConfig, EngineConfig, RetryPolicy, WorkerConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "hookline.toml";

/// Worker process configuration.
///
/// Loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`hookline.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to keep open.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,

    // Queue and workers
    /// Name of the asynchronous delivery queue.
    ///
    /// Environment variable: `QUEUE_NAME`
    #[serde(default = "default_queue_name", alias = "QUEUE_NAME")]
    pub queue_name: String,
    /// Number of concurrent delivery workers.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,
    /// Maximum jobs claimed per batch.
    ///
    /// Environment variable: `WORKER_BATCH_SIZE`
    #[serde(default = "default_batch_size", alias = "WORKER_BATCH_SIZE")]
    pub worker_batch_size: usize,
    /// Idle poll interval in milliseconds.
    ///
    /// Environment variable: `WORKER_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "WORKER_POLL_INTERVAL_MS")]
    pub worker_poll_interval_ms: u64,
    /// How long a claimed job stays hidden from other workers, in seconds.
    ///
    /// Environment variable: `JOB_LEASE_SECONDS`
    #[serde(default = "default_job_lease_seconds", alias = "JOB_LEASE_SECONDS")]
    pub job_lease_seconds: u64,

    // Retry
    /// Attempts per queued delivery, including the first.
    ///
    /// Environment variable: `MAX_RETRY_ATTEMPTS`
    #[serde(default = "default_retry_attempts", alias = "MAX_RETRY_ATTEMPTS")]
    pub max_retry_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Upper bound for any retry delay, in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,

    // Delivery
    /// Deadline of each synchronous delivery, in milliseconds.
    ///
    /// Environment variable: `SYNC_DEADLINE_MS`
    #[serde(default = "default_sync_deadline_ms", alias = "SYNC_DEADLINE_MS")]
    pub sync_deadline_ms: u64,
    /// HTTP timeout for any delivery, in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,
    /// Time to wait for workers on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Log filter used when `RUST_LOG` is not a valid directive.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `hookline.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
            .extract()
            .context("failed to load configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Engine configuration for the delivery crate.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            queue_name: self.queue_name.clone(),
            worker: self.to_worker_config(),
            client_config: self.to_client_config(),
            retry_policy: self.to_retry_policy(),
            sync_deadline: Duration::from_millis(self.sync_deadline_ms),
            job_lease: Duration::from_secs(self.job_lease_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Worker pool configuration.
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_count: self.worker_pool_size,
            batch_size: self.worker_batch_size,
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            ..WorkerConfig::default()
        }
    }

    /// HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Retry policy submitted with every queued job.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Database URL with the password masked, for logs.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.rfind('@') {
            let scheme_end = self.database_url.find("://").map_or(0, |pos| pos + 3);
            if let Some(colon_pos) = self.database_url[scheme_end..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(scheme_end + colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }

        if self.queue_name.trim().is_empty() {
            anyhow::bail!("queue_name must not be empty");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.worker_batch_size == 0 {
            anyhow::bail!("worker_batch_size must be greater than 0");
        }

        if self.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be greater than 0");
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms cannot exceed retry_max_delay_ms");
        }

        if self.sync_deadline_ms == 0 {
            anyhow::bail!("sync_deadline_ms must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            queue_name: default_queue_name(),
            worker_pool_size: default_worker_count(),
            worker_batch_size: default_batch_size(),
            worker_poll_interval_ms: default_poll_interval_ms(),
            job_lease_seconds: default_job_lease_seconds(),
            max_retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            sync_deadline_ms: default_sync_deadline_ms(),
            delivery_timeout_seconds: default_delivery_timeout(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/hookline".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_queue_name() -> String {
    hookline_delivery::DEFAULT_QUEUE_NAME.to_string()
}

fn default_worker_count() -> usize {
    hookline_delivery::DEFAULT_WORKER_COUNT
}

fn default_batch_size() -> usize {
    hookline_delivery::DEFAULT_BATCH_SIZE
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_job_lease_seconds() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    hookline_delivery::DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    hookline_delivery::DEFAULT_BACKOFF_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_sync_deadline_ms() -> u64 {
    hookline_delivery::DEFAULT_SYNC_DEADLINE_MS
}

fn default_delivery_timeout() -> u64 {
    hookline_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
