use std::sync::Arc;

use crate::error::{QueueError, Result};
use crate::queue::job::{utc_now, Job, JobState};
use crate::queue::state_machine::{JobEvent, StateMachine};
use crate::store::{JobFilter, JobStore};

/// Dead letter queue: jobs that used up every retry.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn JobStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn list_dead_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.store
            .list_jobs(&JobFilter::state(JobState::Dead).with_limit(limit))
    }

    /// Move a dead job back to pending with a fresh retry budget.
    pub fn retry(&self, job_id: &str) -> Result<Job> {
        let mut job = self
            .store
            .get_job(job_id)?
            .filter(|job| job.state == JobState::Dead)
            .ok_or_else(|| QueueError::NotFound(format!("job {job_id} is not in the dead letter queue")))?;

        StateMachine::apply(&mut job, JobEvent::Revive, utc_now())?;
        // Another caller may have revived it first.
        self.store
            .update_job_state(&job, JobState::Dead)
            .map_err(|e| match e {
                QueueError::NotFound(_) => {
                    QueueError::NotFound(format!("job {job_id} is not in the dead letter queue"))
                }
                other => other,
            })?;

        tracing::info!(job_id = %job.id, "Moved job from dead letter queue to pending");
        Ok(job)
    }
}
