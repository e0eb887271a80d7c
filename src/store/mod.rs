//! Persistent store for jobs, runs and config.
//!
//! Every component shares one [`JobStore`] handle. The only coordination
//! between workers is [`JobStore::claim_next_ready_job`], which must hand a
//! given job to at most one caller.
//!
//! # Implementations
//!
//! - [`SqliteStore`]: durable, safe across processes sharing the database file
//! - [`MemoryStore`]: mutex-guarded maps, for tests and embedding

mod memory;
pub mod retry;
mod sqlite;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::queue::{Job, JobState, Run};

pub use memory::MemoryStore;
pub use retry::{run_blocking, with_store_retry};
pub use sqlite::SqliteStore;

pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Filter for job listings. Results are newest first.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            state: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl JobFilter {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_jobs: u64,
    pub success_runs: u64,
    pub failed_runs: u64,
    pub timeout_runs: u64,
    pub avg_attempts_per_job: Option<f64>,
}

pub trait JobStore: Send + Sync {
    fn insert_job(&self, job: &Job) -> Result<()>;

    fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Atomically move the oldest claimable job to `processing` and return it.
    ///
    /// Claimable: pending or scheduled, or failed with attempts left, and
    /// `run_at` unset or not after `now`.
    fn claim_next_ready_job(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Persist `job` if its stored state is still `expected`.
    ///
    /// Fails with `NotFound` when the job is missing or has moved on.
    fn update_job_state(&self, job: &Job, expected: JobState) -> Result<()>;

    /// Append a run and stamp the job's `last_run_at`.
    fn record_run(&self, run: &Run) -> Result<()>;

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    fn counts_by_state(&self) -> Result<BTreeMap<JobState, u64>>;

    /// Runs newest first, optionally for one job.
    fn list_runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<Run>>;

    fn metrics(&self) -> Result<MetricsSummary>;

    fn get_config(&self, key: &str) -> Result<Option<String>>;

    fn set_config(&self, key: &str, value: &str) -> Result<()>;
}
