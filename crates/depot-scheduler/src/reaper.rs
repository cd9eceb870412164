//! Fails builds whose worker has stopped heartbeating.
//!
//! A job left in `building` by a dead worker would otherwise stay there
//! forever. Orphans are failed with `WORKER_LOST`, never requeued, so a
//! build that half-pushed an image is not silently run twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use depot_core::{BuildResult, FailureReason, JobStatus};
use depot_queue::{QueueError, QueueResult, QueueStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::CallbackDispatcher;

/// Upper bound on building jobs inspected per pass.
const SCAN_LIMIT: usize = 1000;

pub struct StaleWorkerReaper {
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<CallbackDispatcher>,
    ttl: Duration,
    interval: Duration,
}

impl StaleWorkerReaper {
    pub fn new(
        store: Arc<dyn QueueStore>,
        dispatcher: Arc<CallbackDispatcher>,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            ttl,
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(ttl_secs = self.ttl.as_secs(), "Starting stale worker reaper");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.reap_once().await {
                Ok(0) => {}
                Ok(n) => info!(jobs = n, "Failed orphaned builds"),
                Err(e) => warn!(error = %e, "Reaper pass failed"),
            }
        }

        debug!("Stale worker reaper stopped");
    }

    /// One pass. Returns the number of jobs failed.
    pub async fn reap_once(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);

        let workers = self.store.active_workers().await?;
        let mut live = HashSet::new();
        for worker in workers {
            if worker.is_stale(ttl, now) {
                warn!(
                    worker_id = %worker.id,
                    last_heartbeat = %worker.last_heartbeat,
                    "Worker missed its heartbeat, unregistering"
                );
                self.store.unregister_worker(&worker.id).await?;
            } else {
                live.insert(worker.id);
            }
        }

        let building = self
            .store
            .list_jobs(Some(JobStatus::Building), SCAN_LIMIT)
            .await?;

        let mut reaped = 0;
        for job in building {
            let owner = job.worker_id.as_deref().unwrap_or_default();
            if live.contains(owner) {
                continue;
            }

            let result = BuildResult::failed(
                FailureReason::WorkerLost,
                format!("worker {} stopped responding", owner),
                job.started_at
                    .map(|started| (now - started).num_milliseconds() as f64 / 1000.0)
                    .unwrap_or_default(),
            );

            match self
                .store
                .update_status(job.id, JobStatus::Building, JobStatus::Failed, Some(result.clone()))
                .await
            {
                Ok(failed) => {
                    warn!(job_id = %job.id, worker_id = owner, "Failed orphaned build");
                    self.dispatcher
                        .dispatch(&failed, JobStatus::Failed, &result)
                        .await;
                    reaped += 1;
                }
                // Finished while we were looking.
                Err(QueueError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(reaped)
    }
}
