use std::os::unix::process::CommandExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::queue::{utc_now, RunOutcome};

/// Result of job execution
#[derive(Debug)]
pub struct ExecutionResult {
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr, truncated.
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut(Duration),
}

/// Runs job commands through `sh -c`.
///
/// Each command gets its own process group so a timeout kills everything it
/// started, not just the shell.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    max_output_bytes: usize,
    kill_grace: Duration,
}

impl Default for JobExecutor {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl JobExecutor {
    pub fn new(max_output_bytes: usize, kill_grace: Duration) -> Self {
        Self {
            max_output_bytes,
            kill_grace,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.max_output_bytes, config.kill_grace())
    }

    /// Execute a job command, enforcing `timeout` if given
    pub async fn execute(&self, job_id: &str, command: &str, timeout: Option<Duration>) -> ExecutionResult {
        tracing::info!(job_id, command, timeout = ?timeout, "Executing job");
        let started_at = utc_now();

        let mut child = match self.spawn(command) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Job launch failed");
                return ExecutionResult {
                    outcome: RunOutcome::Failure,
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                    started_at,
                    finished_at: utc_now(),
                };
            }
        };

        let stdout = tokio::spawn(read_capped(child.stdout.take(), self.max_output_bytes));
        let stderr = tokio::spawn(read_capped(child.stderr.take(), self.max_output_bytes));

        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => Waited::Exited(status),
                Err(_) => Waited::TimedOut(limit),
            },
            None => Waited::Exited(child.wait().await),
        };
        if let Waited::TimedOut(limit) = waited {
            tracing::warn!(job_id, timeout_secs = limit.as_secs_f64(), "Job timed out, terminating");
            self.terminate(job_id, &mut child).await;
        }

        let stdout = self.collect(stdout).await;
        let stderr = self.collect(stderr).await;
        let finished_at = utc_now();
        let output = truncate_utf8(format!("{stdout}{stderr}"), self.max_output_bytes);
        let output = (!output.is_empty()).then_some(output);

        let (outcome, exit_code, error) = match waited {
            Waited::TimedOut(limit) => (
                RunOutcome::Timeout,
                None,
                Some(format!("timed out after {}s", limit.as_secs_f64())),
            ),
            Waited::Exited(Ok(status)) if status.success() => (RunOutcome::Success, status.code(), None),
            Waited::Exited(Ok(status)) => {
                let error = match (stderr.trim(), status.code()) {
                    ("", Some(code)) => format!("Exit code: {code}"),
                    ("", None) => format!("Terminated: {status}"),
                    (msg, _) => truncate_utf8(msg.to_string(), self.max_output_bytes),
                };
                (RunOutcome::Failure, status.code(), Some(error))
            }
            Waited::Exited(Err(e)) => (RunOutcome::Failure, None, Some(e.to_string())),
        };

        tracing::info!(
            job_id,
            outcome = %outcome,
            exit_code = ?exit_code,
            "Job finished"
        );

        ExecutionResult {
            outcome,
            exit_code,
            output,
            error,
            started_at,
            finished_at,
        }
    }

    fn spawn(&self, command: &str) -> Result<Child, QueueError> {
        let mut std_cmd = std::process::Command::new("sh");
        std_cmd
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);
        cmd.spawn()
            .map_err(|e| QueueError::Execution(format!("failed to launch `{command}`: {e}")))
    }

    /// Kill the command's whole process group and reap the shell.
    async fn terminate(&self, job_id: &str, child: &mut Child) {
        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                tracing::warn!(job_id, pid, error = %e, "Failed to kill process group");
            }
        }
        if let Err(e) = child.start_kill() {
            tracing::debug!(job_id, error = %e, "Shell already gone");
        }
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(job_id, error = %e, "Failed to reap terminated job"),
            Err(_) => tracing::error!(
                job_id,
                grace_ms = self.kill_grace.as_millis() as u64,
                "Job process unresponsive after forced termination"
            ),
        }
    }

    /// Wait for a pipe reader. Background processes that inherited the pipe
    /// can keep it open, so give up after the grace period.
    async fn collect(&self, mut reader: JoinHandle<Vec<u8>>) -> String {
        match tokio::time::timeout(self.kill_grace, &mut reader).await {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Output reader failed");
                String::new()
            }
            Err(_) => {
                reader.abort();
                String::new()
            }
        }
    }
}

/// Read a stream to the end, keeping at most `limit` bytes.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    kept
}

/// Cut `s` to at most `limit` bytes without splitting a character.
pub fn truncate_utf8(mut s: String, limit: usize) -> String {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}
