
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use queuectl::config::StoreRetryConfig;
use queuectl::queue::{EnqueueRequest, Job, JobState, Run, RunOutcome};
use queuectl::store::{JobFilter, JobStore, MetricsSummary};
use queuectl::QueueError;
use queuectl::worker::{Worker, WorkerPool};
use test_harness::{fast_worker_config, wait_for_state, TestQueue};

#[tokio::test]
async fn test_successful_job_completes() {
    let harness = TestQueue::new();
    let job = harness
        .queue
        .enqueue(EnqueueRequest::new("echo done").with_max_retries(3))
        .unwrap();
    let claimed = harness.store.claim_next_ready_job(queuectl::queue::utc_now()).unwrap().unwrap();

    let worker = Worker::new(1, harness.store.clone(), fast_worker_config(1));
    let state = worker.process(claimed).await.unwrap();

    assert_eq!(state, JobState::Completed);
    let stored = harness.job(&job.id);
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts, 0);
    assert!(stored.last_run_at.is_some());

    let runs = harness.store.list_runs(Some(&job.id), 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].attempt, 1);
    assert_eq!(runs[0].outcome, RunOutcome::Success);
    assert_eq!(runs[0].exit_code, Some(0));
    assert_eq!(runs[0].output.as_deref(), Some("done\n"));
}

#[tokio::test]
async fn test_failing_job_retries_then_dies() {
    let harness = TestQueue::new();
    harness.queue.set_config("base_backoff", "1").unwrap();
    let job = harness
        .queue
        .enqueue(EnqueueRequest::new("exit 2").with_max_retries(2))
        .unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(harness.queue.store(), fast_worker_config(1));
    let handle = tokio::spawn(pool.run(shutdown.clone()));

    assert!(
        wait_for_state(harness.store.as_ref(), &job.id, JobState::Dead, Duration::from_secs(15)).await,
        "job should reach the dead letter queue"
    );
    shutdown.cancel();
    let report = handle.await.unwrap();
    assert!(report.is_clean());

    let stored = harness.job(&job.id);
    assert_eq!(stored.attempts, 3);
    assert_eq!(stored.last_error.as_deref(), Some("Exit code: 2"));

    let mut runs = harness.store.list_runs(Some(&job.id), 10).unwrap();
    runs.reverse();
    assert_eq!(runs.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(runs.iter().all(|r| r.outcome == RunOutcome::Failure && r.exit_code == Some(2)));
    // Second attempt starts no earlier than base^1 seconds after the first
    assert!(runs[1].started_at - runs[0].finished_at >= chrono::Duration::milliseconds(900));

    let dead = harness.queue.dlq().list_dead_jobs(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job.id);
}

#[tokio::test]
async fn test_failure_is_requeued_with_backoff() {
    let harness = TestQueue::new();
    harness.queue.set_config("base_backoff", "2").unwrap();
    let job = harness
        .queue
        .enqueue(EnqueueRequest::new("exit 1").with_max_retries(3))
        .unwrap();
    let claimed = harness.store.claim_next_ready_job(queuectl::queue::utc_now()).unwrap().unwrap();

    let worker = Worker::new(1, harness.store.clone(), fast_worker_config(1));
    let state = worker.process(claimed).await.unwrap();

    assert_eq!(state, JobState::Pending);
    let stored = harness.job(&job.id);
    assert_eq!(stored.attempts, 1);
    let run_at = stored.run_at.expect("retry gated by run_at");
    let run = &harness.store.list_runs(Some(&job.id), 1).unwrap()[0];
    assert!(run_at - run.finished_at >= chrono::Duration::milliseconds(1900));
    assert!(harness
        .store
        .claim_next_ready_job(queuectl::queue::utc_now())
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let harness = TestQueue::new();
    let job = harness
        .queue
        .enqueue(
            EnqueueRequest::new("sleep 5")
                .with_max_retries(0)
                .with_timeout(1.0),
        )
        .unwrap();
    let claimed = harness.store.claim_next_ready_job(queuectl::queue::utc_now()).unwrap().unwrap();

    let worker = Worker::new(1, harness.store.clone(), fast_worker_config(1));
    let state = worker.process(claimed).await.unwrap();

    assert_eq!(state, JobState::Dead);
    let stored = harness.job(&job.id);
    assert_eq!(stored.attempts, 1);
    assert!(stored.last_error.unwrap().contains("timed out"));

    let runs = harness.store.list_runs(Some(&job.id), 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Timeout);
    assert!(runs[0].exit_code.is_none());
    assert!(runs[0].finished_at - runs[0].started_at < chrono::Duration::seconds(4));
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_job() {
    let harness = TestQueue::new();
    let first = harness.queue.enqueue(EnqueueRequest::new("sleep 1")).unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(harness.queue.store(), fast_worker_config(1));
    let handle = tokio::spawn(pool.run(shutdown.clone()));

    assert!(
        wait_for_state(harness.store.as_ref(), &first.id, JobState::Processing, Duration::from_secs(5)).await,
        "first job should be claimed"
    );
    let second = harness.queue.enqueue(EnqueueRequest::new("echo later")).unwrap();
    shutdown.cancel();

    let report = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("pool should drain")
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.exit_code(), 0);

    assert_eq!(harness.job(&first.id).state, JobState::Completed);
    assert_eq!(harness.job(&second.id).state, JobState::Pending);
    assert!(harness.store.list_runs(Some(&second.id), 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_pool_processes_jobs_in_parallel() {
    let harness = TestQueue::new();
    let jobs: Vec<_> = (0..3)
        .map(|_| harness.queue.enqueue(EnqueueRequest::new("sleep 1")).unwrap())
        .collect();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(harness.queue.store(), fast_worker_config(3));
    let started = std::time::Instant::now();
    let handle = tokio::spawn(pool.run(shutdown.clone()));

    for job in &jobs {
        assert!(wait_for_state(harness.store.as_ref(), &job.id, JobState::Completed, Duration::from_secs(10)).await);
    }
    // Three one-second jobs on three workers finish well before three seconds
    assert!(started.elapsed() < Duration::from_millis(2800));
    shutdown.cancel();
    let report = handle.await.unwrap();
    assert_eq!(report.workers, 3);
    assert_eq!(report.clean, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_enforced_while_database_is_locked() {
    let harness = TestQueue::new();
    let job = harness
        .queue
        .enqueue(
            EnqueueRequest::new("sleep 30")
                .with_max_retries(0)
                .with_timeout(1.0),
        )
        .unwrap();

    // More workers than runtime threads, on their own connection
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(Arc::new(harness.reopen()), fast_worker_config(3));
    let handle = tokio::spawn(pool.run(shutdown.clone()));

    assert!(
        wait_for_state(harness.store.as_ref(), &job.id, JobState::Processing, Duration::from_secs(5)).await,
        "job should be claimed"
    );

    // Another process holds the write lock; idle workers pile up in SQLite's busy handler
    let db_path = harness.db_path();
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let holder = std::thread::spawn(move || {
        let conn = rusqlite::Connection::open(db_path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_secs(4));
        conn.execute_batch("COMMIT").unwrap();
    });
    tokio::task::spawn_blocking(move || locked_rx.recv().unwrap())
        .await
        .unwrap();

    assert!(
        wait_for_state(harness.store.as_ref(), &job.id, JobState::Dead, Duration::from_secs(15)).await,
        "job should be buried once the lock is released"
    );
    holder.join().unwrap();
    shutdown.cancel();
    assert!(handle.await.unwrap().is_clean());

    let runs = harness.store.list_runs(Some(&job.id), 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Timeout);
    assert!(runs[0].finished_at - runs[0].started_at < chrono::Duration::milliseconds(2500));
}

/// Store whose claim always reports a locked database.
struct LockedStore {
    claims: AtomicU32,
}

impl LockedStore {
    fn busy() -> QueueError {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None).into()
    }
}

impl JobStore for LockedStore {
    fn insert_job(&self, _job: &Job) -> queuectl::Result<()> {
        Err(Self::busy())
    }

    fn get_job(&self, _id: &str) -> queuectl::Result<Option<Job>> {
        Err(Self::busy())
    }

    fn claim_next_ready_job(&self, _now: DateTime<Utc>) -> queuectl::Result<Option<Job>> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        Err(Self::busy())
    }

    fn update_job_state(&self, _job: &Job, _expected: JobState) -> queuectl::Result<()> {
        Err(Self::busy())
    }

    fn record_run(&self, _run: &Run) -> queuectl::Result<()> {
        Err(Self::busy())
    }

    fn list_jobs(&self, _filter: &JobFilter) -> queuectl::Result<Vec<Job>> {
        Err(Self::busy())
    }

    fn counts_by_state(&self) -> queuectl::Result<BTreeMap<JobState, u64>> {
        Err(Self::busy())
    }

    fn list_runs(&self, _job_id: Option<&str>, _limit: usize) -> queuectl::Result<Vec<Run>> {
        Err(Self::busy())
    }

    fn metrics(&self) -> queuectl::Result<MetricsSummary> {
        Err(Self::busy())
    }

    fn get_config(&self, _key: &str) -> queuectl::Result<Option<String>> {
        Err(Self::busy())
    }

    fn set_config(&self, _key: &str, _value: &str) -> queuectl::Result<()> {
        Err(Self::busy())
    }
}

#[tokio::test]
async fn test_pool_stops_when_store_unavailable() {
    let store = Arc::new(LockedStore {
        claims: AtomicU32::new(0),
    });
    let mut config = fast_worker_config(2).with_poll_interval(Duration::from_millis(10));
    config.max_claim_failures = 3;
    config.store_retry = StoreRetryConfig {
        attempts: 2,
        delay_ms: 1,
    };

    // Never cancelled: the workers must stop on their own
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        WorkerPool::new(store.clone(), config).run(CancellationToken::new()),
    )
    .await
    .expect("workers should give up");

    assert_eq!(report.workers, 2);
    assert_eq!(report.clean, 0);
    assert_eq!(report.failed, 2);
    assert!(!report.is_clean());
    assert_eq!(report.exit_code(), 1);
    // Each worker: 3 failed claims, each retried once
    assert_eq!(store.claims.load(Ordering::SeqCst), 2 * 3 * 2);
}
