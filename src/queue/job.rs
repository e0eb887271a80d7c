use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Current time truncated to the millisecond precision the store keeps.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Scheduled,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Scheduled,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Scheduled => "scheduled",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| QueueError::Validation(format!("unknown job state: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    /// Execution limit in seconds. `None` lets the command run indefinitely.
    pub timeout_secs: Option<f64>,
    /// Activation gate: the job is not claimable before this instant.
    pub run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(command: String, max_retries: u32) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), command, max_retries, utc_now())
    }

    pub fn with_id(id: String, command: String, max_retries: u32, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            timeout_secs: None,
            run_at: None,
            last_error: None,
            created_at,
            updated_at: created_at,
            last_run_at: None,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: f64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Gate the job behind `run_at`. A future instant parks it as scheduled.
    pub fn with_run_at(mut self, run_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self.state = if run_at > now {
            JobState::Scheduled
        } else {
            JobState::Pending
        };
        self
    }

    /// Total number of executions allowed before the job is buried.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        let activated = self.run_at.map_or(true, |at| at <= now);
        let state_ok = match self.state {
            JobState::Pending | JobState::Scheduled => true,
            JobState::Failed => !self.retries_exhausted(),
            _ => false,
        };
        activated && state_ok
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failure,
    Timeout,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "failure" => Ok(RunOutcome::Failure),
            "timeout" => Ok(RunOutcome::Timeout),
            other => Err(QueueError::Validation(format!("unknown run outcome: {other}"))),
        }
    }
}

/// Immutable record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub job_id: String,
    pub attempt: u32,
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output: Option<String>,
}

/// Parse an ISO-8601 activation time.
///
/// Accepts RFC 3339 (`2025-01-01T10:00:00Z`, `...+02:00`) and naive timestamps
/// (`2025-01-01T10:00:00`, optional fraction), which are read as UTC.
pub fn parse_run_at(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc).trunc_subsecs(3));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc().trunc_subsecs(3));
        }
    }
    Err(QueueError::Validation(format!("invalid run_at timestamp: {raw}")))
}
