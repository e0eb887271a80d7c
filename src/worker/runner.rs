use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::queue::{utc_now, Job, JobEvent, JobState, RetryPolicy, Run, RunOutcome, StateMachine};
use crate::store::{run_blocking, with_store_retry, JobStore};
use crate::worker::executor::{ExecutionResult, JobExecutor};

/// One execution slot: claims a job, runs it, settles it, repeats.
pub struct Worker {
    id: usize,
    store: Arc<dyn JobStore>,
    executor: JobExecutor,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(id: usize, store: Arc<dyn JobStore>, config: WorkerConfig) -> Self {
        Self {
            id,
            store,
            executor: JobExecutor::from_config(&config),
            config,
        }
    }

    /// Poll and process jobs until `shutdown` fires.
    ///
    /// Shutdown is only observed between jobs: a claimed job always runs to
    /// completion first. Returns an error once the store has refused
    /// `max_claim_failures` claims in a row.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(worker_id = self.id, "Worker started");
        let mut claim_failures = 0u32;

        while !shutdown.is_cancelled() {
            match self.claim().await {
                Ok(Some(job)) => {
                    claim_failures = 0;
                    // Failures are logged inside; the job keeps its last persisted state.
                    let _ = self.process(job).await;
                }
                Ok(None) => {
                    claim_failures = 0;
                    self.idle(&shutdown).await;
                }
                Err(e) => {
                    claim_failures += 1;
                    if claim_failures >= self.config.max_claim_failures {
                        tracing::error!(
                            worker_id = self.id,
                            failures = claim_failures,
                            error = %e,
                            "Store unavailable, worker giving up"
                        );
                        return Err(e);
                    }
                    tracing::warn!(worker_id = self.id, failures = claim_failures, error = %e, "Claim failed");
                    self.idle(&shutdown).await;
                }
            }
        }

        tracing::info!(worker_id = self.id, "Worker stopped");
        Ok(())
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval()) => {}
        }
    }

    async fn claim(&self) -> Result<Option<Job>> {
        with_store_retry("claim_next_ready_job", &self.store, &self.config.store_retry, |store| {
            store.claim_next_ready_job(utc_now())
        })
        .await
    }

    /// Execute a claimed job, append its run and settle its next state.
    pub async fn process(&self, mut job: Job) -> Result<JobState> {
        let attempt = job.attempts.saturating_add(1);
        tracing::info!(
            worker_id = self.id,
            job_id = %job.id,
            attempt,
            max_attempts = job.max_attempts(),
            "Claimed job"
        );

        let result = self
            .executor
            .execute(&job.id, &job.command, job.timeout())
            .await;

        let run = Run {
            job_id: job.id.clone(),
            attempt,
            outcome: result.outcome,
            exit_code: result.exit_code,
            started_at: result.started_at,
            finished_at: result.finished_at,
            output: result.output.clone(),
        };
        if let Err(e) = with_store_retry("record_run", &self.store, &self.config.store_retry, move |store| {
            store.record_run(&run)
        })
        .await
        {
            tracing::error!(worker_id = self.id, job_id = %job.id, error = %e, "Failed to record run");
        }

        match self.settle(&mut job, &result).await {
            Ok(state) => {
                tracing::info!(
                    worker_id = self.id,
                    job_id = %job.id,
                    state = %state,
                    attempts = job.attempts,
                    run_at = ?job.run_at,
                    "Job settled"
                );
                Ok(state)
            }
            Err(e) => {
                tracing::error!(worker_id = self.id, job_id = %job.id, error = %e, "Failed to settle job");
                Err(e)
            }
        }
    }

    async fn settle(&self, job: &mut Job, result: &ExecutionResult) -> Result<JobState> {
        let now = utc_now();
        match result.outcome {
            RunOutcome::Success => self.transition(job, JobEvent::Succeed).await?,
            RunOutcome::Failure | RunOutcome::Timeout => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} without error output", result.outcome));
                self.transition(job, JobEvent::Fail { error }).await?;

                let policy = run_blocking(self.store.clone(), |store| Ok(RetryPolicy::load(store))).await?;
                let from = job.state;
                StateMachine::settle_failure(job, &policy, now)?;
                self.persist(job, from).await?;
                if job.state == JobState::Dead {
                    tracing::warn!(
                        worker_id = self.id,
                        job_id = %job.id,
                        attempts = job.attempts,
                        "Job moved to dead letter queue"
                    );
                }
            }
        }
        Ok(job.state)
    }

    async fn transition(&self, job: &mut Job, event: JobEvent) -> Result<()> {
        let from = StateMachine::apply(job, event, utc_now())?;
        self.persist(job, from).await
    }

    async fn persist(&self, job: &Job, from: JobState) -> Result<()> {
        let job = job.clone();
        with_store_retry("update_job_state", &self.store, &self.config.store_retry, move |store| {
            store.update_job_state(&job, from)
        })
        .await
    }
}
