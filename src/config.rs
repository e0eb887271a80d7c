use std::path::PathBuf;
use std::time::Duration;

use crate::error::{QueueError, Result};

/// Default retry budget for jobs enqueued without `max_retries`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base of the exponential backoff, in seconds.
pub const DEFAULT_BASE_BACKOFF: f64 = 2.0;

/// Keys of the store-held config table that the queue itself consumes.
///
/// Any other key is stored and returned verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    MaxRetries,
    BaseBackoff,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 2] = [ConfigKey::MaxRetries, ConfigKey::BaseBackoff];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BaseBackoff => "base_backoff",
        }
    }

    pub fn lookup(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == key)
    }

    pub fn default_value(&self) -> String {
        match self {
            ConfigKey::MaxRetries => DEFAULT_MAX_RETRIES.to_string(),
            ConfigKey::BaseBackoff => DEFAULT_BASE_BACKOFF.to_string(),
        }
    }

    /// Check that `raw` is a usable value for this key.
    pub fn validate(&self, raw: &str) -> Result<()> {
        match self {
            ConfigKey::MaxRetries => self.parse_u32(raw).map(|_| ()),
            ConfigKey::BaseBackoff => self.parse_f64(raw).map(|_| ()),
        }
    }

    pub fn parse_u32(&self, raw: &str) -> Result<u32> {
        raw.trim().parse::<u32>().map_err(|e| {
            QueueError::Validation(format!("{} must be a non-negative integer: {e}", self.as_str()))
        })
    }

    pub fn parse_f64(&self, raw: &str) -> Result<f64> {
        match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
            _ => Err(QueueError::Validation(format!(
                "{} must be a finite number >= 0, got {raw:?}",
                self.as_str()
            ))),
        }
    }
}

/// Bounded retry of transient store errors (busy or locked database).
#[derive(Debug, Clone)]
pub struct StoreRetryConfig {
    /// Total tries per operation, including the first.
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay_ms: 100,
        }
    }
}

impl StoreRetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Settings shared by every worker in a pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Sleep between polls that found nothing to claim.
    pub poll_interval_ms: u64,
    /// Consecutive failed claims after which a worker gives up.
    pub max_claim_failures: u32,
    /// Captured stdout+stderr kept per run.
    pub max_output_bytes: usize,
    /// How long to wait for a killed process and its pipes to close.
    pub kill_grace_ms: u64,
    pub store_retry: StoreRetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            poll_interval_ms: 1000,
            max_claim_failures: 10,
            max_output_bytes: 4096,
            kill_grace_ms: 2000,
            store_retry: StoreRetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub db_path: PathBuf,
    pub worker: WorkerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("queue.db"),
            worker: WorkerConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}
