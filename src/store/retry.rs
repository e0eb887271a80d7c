use std::sync::Arc;

use crate::config::StoreRetryConfig;
use crate::error::Result;
use crate::store::JobStore;

/// Run a store call on the blocking thread pool.
///
/// Store calls may sit in SQLite's busy handler for seconds, which must not
/// stall the runtime threads driving job timeouts.
pub async fn run_blocking<T, F>(store: Arc<dyn JobStore>, op: F) -> Result<T>
where
    F: FnOnce(&dyn JobStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || op(store.as_ref())).await?
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
///
/// Only transient store errors (busy or locked database) are retried. Each
/// attempt goes through [`run_blocking`].
pub async fn with_store_retry<T, F>(
    name: &'static str,
    store: &Arc<dyn JobStore>,
    budget: &StoreRetryConfig,
    op: F,
) -> Result<T>
where
    F: Fn(&dyn JobStore) -> Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    let op = Arc::new(op);
    let attempts = budget.attempts.max(1);
    let mut tried = 1;
    loop {
        let attempt_op = Arc::clone(&op);
        match run_blocking(Arc::clone(store), move |s| attempt_op(s)).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && tried < attempts => {
                tracing::warn!(operation = name, attempt = tried, error = %e, "Transient store error, retrying");
                tried += 1;
                tokio::time::sleep(budget.delay()).await;
            }
            Err(e) => {
                tracing::error!(operation = name, attempts = tried, error = %e, "Store operation failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::QueueError;
    use crate::store::MemoryStore;

    fn budget(attempts: u32) -> StoreRetryConfig {
        StoreRetryConfig {
            attempts,
            delay_ms: 1,
        }
    }

    fn store() -> Arc<dyn JobStore> {
        Arc::new(MemoryStore::new())
    }

    fn busy() -> QueueError {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None)
            .into()
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_store_retry("claim", &store(), &budget(3), move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(busy())
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_store_retry("claim", &store(), &budget(2), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(busy())
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_store_retry("update", &store(), &budget(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::NotFound("job x".into()))
        })
        .await;
        assert!(matches!(result, Err(QueueError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_blocking_passes_the_store_through() {
        let store = store();
        store.set_config("base_backoff", "3").unwrap();
        let value = run_blocking(store, |s| s.get_config("base_backoff")).await.unwrap();
        assert_eq!(value.as_deref(), Some("3"));
    }
}
