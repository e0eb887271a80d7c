
use std::thread;

use queuectl::queue::{utc_now, EnqueueRequest, Job, JobState};
use queuectl::store::JobStore;
use queuectl::QueueError;
use test_harness::TestQueue;

fn dead_job(harness: &TestQueue, id: &str) -> Job {
    let mut job = Job::with_id(id.into(), "false".into(), 2, utc_now());
    job.state = JobState::Dead;
    job.attempts = 3;
    job.last_error = Some("Exit code: 1".into());
    harness.store.insert_job(&job).unwrap();
    job
}

#[test]
fn test_list_dead_jobs_only_returns_dead() {
    let harness = TestQueue::new();
    dead_job(&harness, "dead-1");
    harness.queue.enqueue(EnqueueRequest::new("true")).unwrap();

    let dead = harness.queue.dlq().list_dead_jobs(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, "dead-1");
    assert_eq!(dead[0].last_error.as_deref(), Some("Exit code: 1"));
}

#[test]
fn test_retry_resets_attempts_and_requeues() {
    let harness = TestQueue::new();
    dead_job(&harness, "dead-1");

    let revived = harness.queue.dlq().retry("dead-1").unwrap();
    assert_eq!(revived.state, JobState::Pending);
    assert_eq!(revived.attempts, 0);
    assert!(revived.run_at.is_none());

    let stored = harness.job("dead-1");
    assert_eq!(stored.state, JobState::Pending);
    assert_eq!(stored.attempts, 0);
    assert!(harness.queue.dlq().list_dead_jobs(10).unwrap().is_empty());

    let claimed = harness.store.claim_next_ready_job(utc_now()).unwrap().unwrap();
    assert_eq!(claimed.id, "dead-1");
}

#[test]
fn test_retry_unknown_or_live_job_is_not_found() {
    let harness = TestQueue::new();
    let live = harness.queue.enqueue(EnqueueRequest::new("true")).unwrap();

    assert!(matches!(
        harness.queue.dlq().retry("missing"),
        Err(QueueError::NotFound(_))
    ));
    assert!(matches!(
        harness.queue.dlq().retry(&live.id),
        Err(QueueError::NotFound(_))
    ));
    assert_eq!(harness.job(&live.id).state, JobState::Pending);
}

#[test]
fn test_concurrent_retry_revives_once() {
    let harness = TestQueue::new();
    dead_job(&harness, "dead-1");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = queuectl::queue::JobQueue::new(std::sync::Arc::new(harness.reopen()));
            thread::spawn(move || queue.dlq().retry("dead-1").is_ok())
        })
        .collect();
    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(successes, 1);
    assert_eq!(harness.job("dead-1").state, JobState::Pending);
}
