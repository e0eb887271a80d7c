pub mod backoff;
pub mod dlq;
pub mod job;
pub mod service;
pub mod state_machine;

pub use backoff::{backoff, RetryPolicy};
pub use dlq::DeadLetterQueue;
pub use job::{parse_run_at, utc_now, Job, JobState, Run, RunOutcome};
pub use service::{EnqueueRequest, JobQueue, QueueStatus};
pub use state_machine::{JobEvent, StateMachine};
