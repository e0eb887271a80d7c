use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::{QueueError, Result, StoreError};
use crate::queue::{Job, JobEvent, JobState, Run, RunOutcome, StateMachine};
use crate::store::{JobFilter, JobStore, MetricsSummary};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<String, Job>,
    /// Insertion order, used to break `created_at` ties.
    order: Vec<String>,
    runs: Vec<Run>,
    config: HashMap<String, String>,
}

/// In-memory store. One mutex guards every table, so each call is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| QueueError::Store(StoreError::Poisoned))
    }

    /// Returns the current number of jobs
    pub fn len(&self) -> usize {
        self.lock().map(|t| t.jobs.len()).unwrap_or(0)
    }

    /// Returns true if the store holds no jobs
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobStore for MemoryStore {
    fn insert_job(&self, job: &Job) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(QueueError::Validation(format!("job {} already exists", job.id)));
        }
        tables.order.push(job.id.clone());
        tables.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(id).cloned())
    }

    fn claim_next_ready_job(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut tables = self.lock()?;
        let Tables { jobs, order, .. } = &mut *tables;

        let next = order
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| jobs.get(id).map(|job| (pos, job)))
            .filter(|(_, job)| job.is_claimable(now))
            .min_by_key(|(pos, job)| (job.created_at, *pos))
            .map(|(_, job)| job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        StateMachine::apply(job, JobEvent::Claim, now)?;
        Ok(Some(job.clone()))
    }

    fn update_job_state(&self, job: &Job, expected: JobState) -> Result<()> {
        let mut tables = self.lock()?;
        match tables.jobs.get_mut(&job.id) {
            Some(stored) if stored.state == expected => {
                stored.state = job.state;
                stored.attempts = job.attempts;
                stored.run_at = job.run_at;
                stored.last_error = job.last_error.clone();
                stored.updated_at = job.updated_at;
                Ok(())
            }
            Some(stored) => Err(QueueError::NotFound(format!(
                "job {} is {}, expected {}",
                job.id, stored.state, expected
            ))),
            None => Err(QueueError::NotFound(format!("job {}", job.id))),
        }
    }

    fn record_run(&self, run: &Run) -> Result<()> {
        let mut tables = self.lock()?;
        if let Some(job) = tables.jobs.get_mut(&run.job_id) {
            job.last_run_at = Some(run.finished_at);
        }
        tables.runs.push(run.clone());
        Ok(())
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let tables = self.lock()?;
        let mut jobs: Vec<(usize, &Job)> = tables
            .order
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| tables.jobs.get(id).map(|job| (pos, job)))
            .filter(|(_, job)| filter.state.map_or(true, |s| job.state == s))
            .collect();
        jobs.sort_by(|a, b| (b.1.created_at, b.0).cmp(&(a.1.created_at, a.0)));
        Ok(jobs
            .into_iter()
            .take(filter.limit)
            .map(|(_, job)| job.clone())
            .collect())
    }

    fn counts_by_state(&self) -> Result<BTreeMap<JobState, u64>> {
        let tables = self.lock()?;
        let mut counts = BTreeMap::new();
        for job in tables.jobs.values() {
            *counts.entry(job.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn list_runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<Run>> {
        let tables = self.lock()?;
        Ok(tables
            .runs
            .iter()
            .rev()
            .filter(|run| job_id.map_or(true, |id| run.job_id == id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn metrics(&self) -> Result<MetricsSummary> {
        let tables = self.lock()?;
        let count = |outcome: RunOutcome| {
            tables.runs.iter().filter(|r| r.outcome == outcome).count() as u64
        };
        let total_jobs = tables.jobs.len() as u64;
        let avg_attempts_per_job = (total_jobs > 0).then(|| {
            tables.jobs.values().map(|j| j.attempts as f64).sum::<f64>() / total_jobs as f64
        });
        Ok(MetricsSummary {
            total_jobs,
            success_runs: count(RunOutcome::Success),
            failed_runs: count(RunOutcome::Failure),
            timeout_runs: count(RunOutcome::Timeout),
            avg_attempts_per_job,
        })
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.config.get(key).cloned())
    }

    fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.config.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
