//! Fixed-size worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, warn};

use super::worker::run_worker;
use super::Shared;

/// Handle to the running workers.
pub struct WorkerPool {
    workers: JoinSet<()>,
    shared: Arc<Shared>,
    size: usize,
}

impl WorkerPool {
    pub(super) fn spawn(shared: Arc<Shared>, size: usize) -> Self {
        let mut workers = JoinSet::new();
        for index in 0..size {
            workers.spawn(run_worker(index, Arc::clone(&shared)));
        }
        info!(workers = size, "Worker pool started");
        Self {
            workers,
            shared,
            size,
        }
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Stop taking work and wait for the workers to exit.
    ///
    /// Jobs still running after `grace` are interrupted and recorded as
    /// failed so they can be retried. Waiting jobs stay queued in the store.
    pub async fn shutdown(mut self, grace: Duration) {
        info!(grace_secs = grace.as_secs(), "Shutting down worker pool");
        self.shared.queue.close();

        let drained = tokio::time::timeout(grace, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            let interrupted = self.shared.registry.interrupt_all().await;
            warn!(jobs = interrupted, "Grace period elapsed; interrupting running jobs");
            while self.workers.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }
}
