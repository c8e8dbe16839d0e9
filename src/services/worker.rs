use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::services::edge_cache::EdgeCache;
use crate::services::task_store::TaskStore;

const SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Periodic janitor for the in-process stores: expired task records and
/// aged edge-cache entries.
pub struct BackgroundWorker {
    tasks: Arc<TaskStore>,
    edge_cache: Arc<EdgeCache>,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        tasks: Arc<TaskStore>,
        edge_cache: Arc<EdgeCache>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            tasks,
            edge_cache,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("background worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("background worker shutting down");
                    break;
                }
                _ = sleep(Duration::from_secs(SWEEP_INTERVAL_SECONDS)) => {
                    let expired_tasks = self.tasks.sweep();
                    let evicted = self.edge_cache.sweep();
                    if expired_tasks > 0 || evicted > 0 {
                        tracing::debug!(expired_tasks, evicted, "sweep complete");
                    }
                }
            }
        }
    }
}
