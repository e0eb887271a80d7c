use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigKey, QueueConfig, DEFAULT_MAX_RETRIES};
use crate::error::{QueueError, Result};
use crate::queue::dlq::DeadLetterQueue;
use crate::queue::job::{parse_run_at, utc_now, Job, JobState, Run};
use crate::store::{JobFilter, JobStore, MetricsSummary, SqliteStore};

/// Input of an enqueue call, also the JSON shape accepted by the CLI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// ISO-8601 activation time.
    #[serde(default)]
    pub run_at: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl EnqueueRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_run_at(mut self, run_at: impl Into<String>) -> Self {
        self.run_at = Some(run_at.into());
        self
    }

    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Every state, zero-filled.
    pub counts: BTreeMap<JobState, u64>,
    pub metrics: MetricsSummary,
}

/// Operations exposed to the CLI and dashboard.
///
/// Presentation layers go through this type and never write job rows
/// themselves.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Open the SQLite database named by `config`.
    pub fn open(config: &QueueConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteStore::open(&config.db_path)?)))
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn dlq(&self) -> DeadLetterQueue {
        DeadLetterQueue::new(self.store.clone())
    }

    pub fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        let command = request.command.trim();
        if command.is_empty() {
            return Err(QueueError::Validation("command must not be empty".into()));
        }
        if let Some(timeout) = request.timeout {
            if !timeout.is_finite() || timeout <= 0.0 {
                return Err(QueueError::Validation(format!(
                    "timeout must be a positive number of seconds, got {timeout}"
                )));
            }
        }
        let run_at = request.run_at.as_deref().map(parse_run_at).transpose()?;
        let max_retries = match request.max_retries {
            Some(n) => n,
            None => self.default_max_retries()?,
        };

        let now = utc_now();
        let mut job = match request.id {
            Some(id) if id.trim().is_empty() => {
                return Err(QueueError::Validation("id must not be empty".into()));
            }
            Some(id) => Job::with_id(id.trim().to_string(), request.command, max_retries, now),
            None => {
                let mut job = Job::new(request.command, max_retries);
                job.created_at = now;
                job.updated_at = now;
                job
            }
        };
        if let Some(timeout) = request.timeout {
            job = job.with_timeout(timeout);
        }
        if let Some(run_at) = run_at {
            job = job.with_run_at(run_at, now);
        }

        self.store.insert_job(&job)?;
        tracing::info!(
            job_id = %job.id,
            state = %job.state,
            max_retries = job.max_retries,
            run_at = ?job.run_at,
            "Job enqueued"
        );
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Result<Job> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| QueueError::NotFound(format!("job {job_id}")))
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(filter)
    }

    pub fn status(&self) -> Result<QueueStatus> {
        let mut counts: BTreeMap<JobState, u64> =
            JobState::ALL.into_iter().map(|state| (state, 0)).collect();
        counts.extend(self.store.counts_by_state()?);
        Ok(QueueStatus {
            counts,
            metrics: self.store.metrics()?,
        })
    }

    pub fn runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<Run>> {
        self.store.list_runs(job_id, limit)
    }

    pub fn metrics(&self) -> Result<MetricsSummary> {
        self.store.metrics()
    }

    /// Stored value, or the built-in default for a known key never set.
    pub fn get_config(&self, key: &str) -> Result<String> {
        if let Some(value) = self.store.get_config(key)? {
            return Ok(value);
        }
        ConfigKey::lookup(key)
            .map(|k| k.default_value())
            .ok_or_else(|| QueueError::NotFound(format!("config key {key}")))
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(QueueError::Validation("config key must not be empty".into()));
        }
        if let Some(known) = ConfigKey::lookup(key) {
            known.validate(value)?;
        }
        self.store.set_config(key, value.trim())?;
        tracing::info!(key, value, "Config updated");
        Ok(())
    }

    fn default_max_retries(&self) -> Result<u32> {
        let Some(raw) = self.store.get_config(ConfigKey::MaxRetries.as_str())? else {
            return Ok(DEFAULT_MAX_RETRIES);
        };
        Ok(ConfigKey::MaxRetries.parse_u32(&raw).unwrap_or_else(|e| {
            tracing::warn!(value = %raw, error = %e, "Invalid max_retries, using default");
            DEFAULT_MAX_RETRIES
        }))
    }
}
