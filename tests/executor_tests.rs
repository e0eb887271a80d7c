use std::time::{Duration, Instant};

use queuectl::queue::RunOutcome;
use queuectl::worker::JobExecutor;

/// Executor with a short kill grace so timeout tests stay quick
fn test_executor() -> JobExecutor {
    JobExecutor::new(4096, Duration::from_millis(500))
}

#[tokio::test]
async fn test_execute_simple_command() {
    let executor = test_executor();

    let result = executor.execute("job-1", "echo hello", None).await;

    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output, Some("hello\n".to_string()));
    assert!(result.error.is_none());
    assert!(result.finished_at >= result.started_at);
}

#[tokio::test]
async fn test_execute_empty_output() {
    let executor = test_executor();

    let result = executor.execute("job-1", "true", None).await;

    assert_eq!(result.outcome, RunOutcome::Success);
    assert!(result.output.is_none()); // Empty output should be None
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_execute_large_output() {
    let executor = test_executor();

    let result = executor.execute("job-1", "seq 1 1000", None).await;

    assert_eq!(result.outcome, RunOutcome::Success);
    let output = result.output.expect("output");
    assert_eq!(output.lines().count(), 1000);
}

#[tokio::test]
async fn test_execute_output_is_truncated() {
    let executor = JobExecutor::new(16, Duration::from_millis(500));

    let result = executor.execute("job-1", "seq 1 1000", None).await;

    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.output.expect("output").len(), 16);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let executor = test_executor();

    let result = executor.execute("job-1", "exit 1", None).await;

    assert_eq!(result.outcome, RunOutcome::Failure);
    assert_eq!(result.exit_code, Some(1));
    assert_eq!(result.error.as_deref(), Some("Exit code: 1"));
}

#[tokio::test]
async fn test_execute_command_with_stderr() {
    let executor = test_executor();

    let result = executor
        .execute("job-1", "echo 'error message' >&2 && exit 1", None)
        .await;

    assert_eq!(result.outcome, RunOutcome::Failure);
    assert_eq!(result.error.as_deref(), Some("error message"));
    assert!(result.output.expect("output").contains("error message"));
}

#[tokio::test]
async fn test_execute_invalid_command() {
    let executor = test_executor();

    let result = executor
        .execute("job-1", "nonexistent_command_12345", None)
        .await;

    // The shell starts fine and reports 127 for an unknown command
    assert_eq!(result.outcome, RunOutcome::Failure);
    assert_eq!(result.exit_code, Some(127));
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_execute_multiline_output() {
    let executor = test_executor();

    let result = executor
        .execute("job-1", "printf 'line1\\nline2\\nline3\\n'", None)
        .await;

    assert_eq!(result.outcome, RunOutcome::Success);
    let output = result.output.expect("output");
    assert_eq!(output.lines().collect::<Vec<_>>(), vec!["line1", "line2", "line3"]);
}

#[tokio::test]
async fn test_execute_with_special_characters() {
    let executor = test_executor();

    let result = executor.execute("job-1", "echo 'hello $USER'", None).await;

    assert_eq!(result.outcome, RunOutcome::Success);
    // Single quotes prevent variable expansion
    assert_eq!(result.output, Some("hello $USER\n".to_string()));
}

#[tokio::test]
async fn test_execute_piped_commands() {
    let executor = test_executor();

    let result = executor
        .execute("job-1", "echo 'hello world' | wc -w", None)
        .await;

    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.output.expect("output").trim(), "2");
}

#[tokio::test]
async fn test_execute_timeout() {
    let executor = test_executor();
    let started = Instant::now();

    let result = executor
        .execute("job-1", "sleep 5", Some(Duration::from_millis(300)))
        .await;

    assert_eq!(result.outcome, RunOutcome::Timeout);
    assert!(result.exit_code.is_none());
    assert!(result.error.expect("error").contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_execute_timeout_kills_process_group() {
    let executor = test_executor();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    // The background child would create the marker after the timeout if it survived
    let command = format!("(sleep 1 && touch {}) & wait", marker.display());

    let result = executor
        .execute("job-1", &command, Some(Duration::from_millis(200)))
        .await;
    assert_eq!(result.outcome, RunOutcome::Timeout);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_execute_within_timeout_succeeds() {
    let executor = test_executor();

    let result = executor
        .execute("job-1", "echo fast", Some(Duration::from_secs(5)))
        .await;

    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.output, Some("fast\n".to_string()));
}
