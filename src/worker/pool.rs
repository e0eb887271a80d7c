use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::store::JobStore;
use crate::worker::runner::Worker;

/// How the workers of a pool ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub workers: usize,
    pub clean: usize,
    pub failed: usize,
}

impl PoolReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    /// Process exit code: 0 when every worker stopped cleanly.
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }
}

/// Supervises a fixed number of workers sharing one store handle.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn JobStore>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    /// Run the workers until `shutdown` fires and all of them have drained.
    pub async fn run(self, shutdown: CancellationToken) -> PoolReport {
        let count = self.config.worker_count.max(1);
        let mut workers = JoinSet::new();
        for id in 1..=count {
            let worker = Worker::new(id, self.store.clone(), self.config.clone());
            let token = shutdown.clone();
            workers.spawn(async move { (id, worker.run(token).await) });
        }
        tracing::info!(
            workers = count,
            poll_interval_ms = self.config.poll_interval_ms,
            "Worker pool started"
        );

        let mut report = PoolReport {
            workers: count,
            ..Default::default()
        };
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.clean += 1,
                Ok((worker_id, Err(e))) => {
                    tracing::error!(worker_id, error = %e, "Worker exited with error");
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Worker task panicked");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            clean = report.clean,
            failed = report.failed,
            "Worker pool stopped"
        );
        report
    }
}
