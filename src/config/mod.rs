use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string (job store, verdict persistence)
    pub database_url: String,

    /// Redis connection string (queue broker, override lists)
    pub redis_url: String,

    /// External analyzer endpoint URL
    pub analyzer_url: String,

    /// External analyzer API token
    pub analyzer_token: String,

    /// Number of concurrent workers; the knob for respecting the
    /// analyzer's concurrency ceiling
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Retry budget per job for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-item analyzer call timeout, seconds
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,

    /// Base delay for exponential retry backoff, milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Worker sleep between polls of an empty queue, milliseconds
    #[serde(default = "default_dequeue_idle_ms")]
    pub dequeue_idle_ms: u64,

    /// Age after which a queued entry is promoted one priority tier, seconds
    #[serde(default = "default_promotion_threshold_secs")]
    pub promotion_threshold_secs: u64,

    /// How long terminal jobs stay queryable before eviction, seconds
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    /// Interval between retention sweeps, seconds
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_item_timeout_secs() -> u64 {
    30
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_dequeue_idle_ms() -> u64 {
    1000
}

fn default_promotion_threshold_secs() -> u64 {
    600
}

fn default_job_retention_secs() -> u64 {
    86_400
}

fn default_eviction_interval_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn dequeue_idle(&self) -> Duration {
        Duration::from_millis(self.dequeue_idle_ms)
    }

    pub fn promotion_threshold(&self) -> Duration {
        Duration::from_secs(self.promotion_threshold_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}
