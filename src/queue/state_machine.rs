use chrono::{DateTime, Utc};

use crate::error::{QueueError, Result};
use crate::queue::backoff::RetryPolicy;
use crate::queue::job::{Job, JobState};

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A worker won the atomic claim.
    Claim,
    /// The command exited 0 within its timeout.
    Succeed,
    /// Nonzero exit, timeout, launch error or crash.
    Fail { error: String },
    /// Put a failed job back in line once `run_at` passes.
    Requeue { run_at: DateTime<Utc> },
    /// Move a failed job with no retries left to the dead letter queue.
    Bury,
    /// Manual retry of a dead job.
    Revive,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Claim => "claim",
            JobEvent::Succeed => "succeed",
            JobEvent::Fail { .. } => "fail",
            JobEvent::Requeue { .. } => "requeue",
            JobEvent::Bury => "bury",
            JobEvent::Revive => "revive",
        }
    }
}

/// Validates and applies job lifecycle transitions.
///
/// ```text
/// pending ──┐
///           ├─ claim ─> processing ─ succeed ─> completed
/// scheduled ┘               │
///                           └─ fail ─> failed ─ requeue ─> pending
///                                         └──── bury ────> dead ─ revive ─> pending
/// ```
///
/// A scheduled job is a pending job gated by a future `run_at`; the gate is
/// checked when the job is claimed.
pub struct StateMachine;

impl StateMachine {
    /// State the job would move to, or `None` if the event is not allowed.
    pub fn target(job: &Job, event: &JobEvent, now: DateTime<Utc>) -> Option<JobState> {
        match (job.state, event) {
            (JobState::Pending | JobState::Scheduled | JobState::Failed, JobEvent::Claim)
                if job.is_claimable(now) =>
            {
                Some(JobState::Processing)
            }
            (JobState::Processing, JobEvent::Succeed) => Some(JobState::Completed),
            (JobState::Processing, JobEvent::Fail { .. }) => Some(JobState::Failed),
            (JobState::Failed, JobEvent::Requeue { .. }) if !job.retries_exhausted() => {
                Some(JobState::Pending)
            }
            (JobState::Failed, JobEvent::Bury) if job.retries_exhausted() => Some(JobState::Dead),
            (JobState::Dead, JobEvent::Revive) => Some(JobState::Pending),
            _ => None,
        }
    }

    /// Apply `event` to `job`, returning the state it left.
    ///
    /// An invalid transition is logged and leaves the job untouched.
    pub fn apply(job: &mut Job, event: JobEvent, now: DateTime<Utc>) -> Result<JobState> {
        let Some(next) = Self::target(job, &event, now) else {
            tracing::warn!(
                job_id = %job.id,
                state = %job.state,
                event = event.name(),
                attempts = job.attempts,
                "Rejected invalid job transition"
            );
            return Err(QueueError::InvalidTransition {
                job_id: job.id.clone(),
                state: job.state,
                event: event.name(),
            });
        };

        let previous = job.state;
        match event {
            JobEvent::Claim | JobEvent::Succeed | JobEvent::Bury => {}
            JobEvent::Fail { error } => {
                job.attempts = job.attempts.saturating_add(1);
                job.last_error = Some(error);
            }
            JobEvent::Requeue { run_at } => job.run_at = Some(run_at),
            JobEvent::Revive => {
                job.attempts = 0;
                job.run_at = None;
            }
        }
        job.state = next;
        job.updated_at = now;

        tracing::debug!(job_id = %job.id, from = %previous, to = %next, "Job transition");
        Ok(previous)
    }

    /// Decide where a failed job goes next: back in line after its backoff
    /// delay, or to the dead letter queue once every attempt is spent.
    pub fn settle_failure(job: &mut Job, policy: &RetryPolicy, now: DateTime<Utc>) -> Result<JobState> {
        let event = if job.retries_exhausted() {
            JobEvent::Bury
        } else {
            JobEvent::Requeue {
                run_at: policy.next_run_at(now, job.attempts),
            }
        };
        Self::apply(job, event, now)?;
        Ok(job.state)
    }
}
