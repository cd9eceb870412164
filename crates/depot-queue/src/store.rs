//! The queue store contract shared by the in-memory and PostgreSQL backends.

use std::time::Duration;

use async_trait::async_trait;
use depot_core::build::{LogLine, LogStream};
use depot_core::job::CallbackState;
use depot_core::worker::WorkerRegistration;
use depot_core::{BuildResult, Job, JobId, JobStatus, NewJob};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::QueueResult;

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub building: u64,
    pub ready: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.queued + self.building + self.ready + self.failed + self.cancelled
    }

    pub(crate) fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Building => self.building += n,
            JobStatus::Ready => self.ready += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }
}

/// Priority-ordered job store with per-job log channels and a worker
/// registry.
///
/// Ordering is strict: higher priority first, then lower sequence number.
/// There is no aging, so sustained high-priority load can starve lower
/// tiers indefinitely.
///
/// Every status change is a compare-and-swap against the expected
/// predecessor; `dequeue` is the only operation that picks its target.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Store a new job as `queued`. Returns the job and the queue depth
    /// including it.
    async fn enqueue(&self, job: NewJob) -> QueueResult<(Job, u64)>;

    /// Atomically take the best queued job and move it to `building`,
    /// owned by `worker_id`. Never hands the same job to two callers.
    async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<Job>>;

    /// Wait up to `max_wait` for work to become available. Returning early
    /// does not guarantee a subsequent `dequeue` succeeds.
    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }

    async fn get_job(&self, id: JobId) -> QueueResult<Job>;

    /// The result attached at a terminal transition, if any.
    async fn get_result(&self, id: JobId) -> QueueResult<Option<BuildResult>>;

    /// CAS transition `from -> to`, attaching `result` when given.
    /// Fails with `Conflict` if the stored status is not `from`.
    async fn update_status(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        result: Option<BuildResult>,
    ) -> QueueResult<Job>;

    /// Flag a `building` job for cancellation. The owning worker observes
    /// the flag and performs the `building -> cancelled` transition.
    async fn request_cancel(&self, id: JobId) -> QueueResult<Job>;

    async fn cancel_requested(&self, id: JobId) -> QueueResult<bool>;

    /// Append one line to the job's log. Offsets start at 1.
    async fn append_log(&self, id: JobId, stream: LogStream, content: String)
    -> QueueResult<LogLine>;

    /// Lines with offset greater than `from_offset`, followed by live lines
    /// until the job is terminal. The stream may also end early if the
    /// subscriber falls too far behind; resume from the last offset seen.
    async fn stream_logs(
        &self,
        id: JobId,
        from_offset: u64,
    ) -> QueueResult<BoxStream<'static, LogLine>>;

    async fn queue_length(&self) -> QueueResult<u64>;

    /// Jobs newest first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    async fn set_callback_state(&self, id: JobId, state: CallbackState) -> QueueResult<()>;

    async fn register_worker(&self, registration: WorkerRegistration) -> QueueResult<()>;

    async fn heartbeat(&self, worker_id: &str, active_jobs: u32) -> QueueResult<()>;

    async fn unregister_worker(&self, worker_id: &str) -> QueueResult<()>;

    async fn active_workers(&self) -> QueueResult<Vec<WorkerRegistration>>;

    /// Cheap reachability check for the readiness endpoint.
    async fn ping(&self) -> QueueResult<()>;
}
