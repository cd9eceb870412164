//! Worker pool that claims jobs from the queue and runs them.
//!
//! Each slot is an independent claim loop, so at most `slots` builds run at
//! once. A running build is stopped by whichever comes first of its
//! timeout, an operator cancel request, or a forced shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use depot_config::WorkerConfig;
use depot_core::worker::WorkerRegistration;
use depot_core::{Job, JobId, JobStatus};
use depot_queue::{QueueError, QueueResult, QueueStore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callback::CallbackDispatcher;
use crate::context::{BuildContext, StopReason};
use crate::runner::{BuildRunner, Finished};
use crate::sink::JobLogSink;

/// Attempts at recording a finished build before giving up on the store.
const FINISH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub slots: u32,
    pub build_timeout: Duration,
    pub poll_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.id.clone(),
            slots: config.max_concurrent_builds,
            build_timeout: config.build_timeout,
            poll_interval: config.poll_interval,
            cancel_poll_interval: config.cancel_poll_interval,
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

struct Shared {
    config: WorkerPoolConfig,
    store: Arc<dyn QueueStore>,
    runner: Arc<BuildRunner>,
    dispatcher: Arc<CallbackDispatcher>,
    /// Cancelled once shutdown begins; slots stop claiming new work.
    stop_dequeue: CancellationToken,
    running: Mutex<HashMap<JobId, BuildContext>>,
    active: AtomicU32,
}

/// A running pool. Dropping it without [`shutdown`](Self::shutdown) leaves
/// the slots running.
pub struct WorkerPool {
    shared: Arc<Shared>,
    slots: JoinSet<()>,
    heartbeat: JoinHandle<()>,
    heartbeat_stop: CancellationToken,
}

impl WorkerPool {
    /// Register the worker and start its slots and heartbeat.
    pub async fn start(
        config: WorkerPoolConfig,
        store: Arc<dyn QueueStore>,
        runner: Arc<BuildRunner>,
        dispatcher: Arc<CallbackDispatcher>,
    ) -> QueueResult<Self> {
        let slots = config.slots.max(1);
        store
            .register_worker(WorkerRegistration::new(config.worker_id.clone(), slots))
            .await?;
        info!(worker_id = %config.worker_id, slots, "Starting worker pool");

        let shared = Arc::new(Shared {
            config,
            store,
            runner,
            dispatcher,
            stop_dequeue: CancellationToken::new(),
            running: Mutex::new(HashMap::new()),
            active: AtomicU32::new(0),
        });

        let mut set = JoinSet::new();
        for slot in 0..slots {
            let shared = shared.clone();
            set.spawn(async move { shared.slot_loop(slot).await });
        }

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone(), heartbeat_stop.clone()));

        Ok(Self {
            shared,
            slots: set,
            heartbeat,
            heartbeat_stop,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    /// Number of builds currently running.
    pub fn active_jobs(&self) -> u32 {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Stop claiming work and wait up to `grace` for running builds. Builds
    /// still running after that are stopped and recorded as failed with
    /// `WORKER_SHUTDOWN`.
    pub async fn shutdown(mut self, grace: Duration) {
        let worker_id = self.shared.config.worker_id.clone();
        info!(worker_id = %worker_id, active = self.active_jobs(), "Draining worker pool");
        self.shared.stop_dequeue.cancel();

        if tokio::time::timeout(grace, drain(&mut self.slots)).await.is_err() {
            let running: Vec<(JobId, BuildContext)> = self
                .shared
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(id, ctx)| (*id, ctx.clone()))
                .collect();
            warn!(
                worker_id = %worker_id,
                remaining = running.len(),
                "Grace period elapsed, stopping running builds"
            );
            for (job_id, ctx) in running {
                debug!(job_id = %job_id, "Stopping build for shutdown");
                ctx.stop(StopReason::Shutdown);
            }
            drain(&mut self.slots).await;
        }

        self.heartbeat_stop.cancel();
        if let Err(e) = self.heartbeat.await {
            warn!(error = %e, "Heartbeat task failed");
        }
        if let Err(e) = self.shared.store.unregister_worker(&worker_id).await {
            warn!(worker_id = %worker_id, error = %e, "Failed to unregister worker");
        }
        info!(worker_id = %worker_id, "Worker pool stopped");
    }
}

async fn drain(set: &mut JoinSet<()>) {
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker slot panicked");
        }
    }
}

impl Shared {
    async fn slot_loop(&self, slot: u32) {
        let worker_id = self.config.worker_id.as_str();
        debug!(worker_id, slot, "Slot started");

        while !self.stop_dequeue.is_cancelled() {
            match self.store.dequeue(worker_id).await {
                Ok(Some(job)) => {
                    info!(job_id = %job.id, worker_id, slot, "Claimed job");
                    self.execute(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.stop_dequeue.cancelled() => {}
                        _ = self.store.wait_for_work(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = self.stop_dequeue.cancelled() => {}
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        debug!(worker_id, slot, "Slot stopped");
    }

    async fn execute(&self, job: Job) {
        let ctx = BuildContext::new();
        self.active.fetch_add(1, Ordering::SeqCst);
        self.track(job.id, Some(ctx.clone()));

        let timeout = tokio::spawn({
            let ctx = ctx.clone();
            let limit = self.config.build_timeout;
            async move {
                sleep(limit).await;
                ctx.stop(StopReason::Timeout);
            }
        });
        let watch = tokio::spawn(watch_cancel(
            self.store.clone(),
            job.id,
            ctx.clone(),
            self.config.cancel_poll_interval,
        ));

        let sink = JobLogSink::new(self.store.clone(), job.id);
        let finished = self.runner.run(&job, &ctx, &sink).await;

        timeout.abort();
        watch.abort();

        info!(
            job_id = %job.id,
            status = %finished.status,
            duration_secs = finished.result.duration_secs,
            "Build finished"
        );

        if let Some(updated) = self.finish(job.id, &finished).await {
            self.dispatcher
                .dispatch(&updated, finished.status, &finished.result)
                .await;
        }

        self.track(job.id, None);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record the outcome with a `building -> status` CAS. Returns the
    /// updated job, or `None` if someone else already moved it on.
    async fn finish(&self, id: JobId, finished: &Finished) -> Option<Job> {
        let mut attempt = 1;
        loop {
            let outcome = self
                .store
                .update_status(
                    id,
                    JobStatus::Building,
                    finished.status,
                    Some(finished.result.clone()),
                )
                .await;

            match outcome {
                Ok(job) => return Some(job),
                Err(QueueError::Conflict { actual, .. }) => {
                    warn!(job_id = %id, status = %actual, "Job changed while building, dropping result");
                    return None;
                }
                Err(e) if e.is_infrastructure() && attempt < FINISH_ATTEMPTS => {
                    warn!(job_id = %id, attempt, error = %e, "Failed to record build result, retrying");
                    attempt += 1;
                    sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    error!(job_id = %id, error = %e, "Failed to record build result");
                    return None;
                }
            }
        }
    }

    fn track(&self, id: JobId, ctx: Option<BuildContext>) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match ctx {
            Some(ctx) => {
                running.insert(id, ctx);
            }
            None => {
                running.remove(&id);
            }
        }
    }
}

/// Poll the cancel flag until it is set or the build stops for another
/// reason.
async fn watch_cancel(
    store: Arc<dyn QueueStore>,
    id: JobId,
    ctx: BuildContext,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ctx.stopped() => return,
            _ = ticker.tick() => {}
        }
        match store.cancel_requested(id).await {
            Ok(true) => {
                info!(job_id = %id, "Cancel requested, stopping build");
                ctx.stop(StopReason::CancelRequested);
                return;
            }
            Ok(false) => {}
            Err(e) => debug!(job_id = %id, error = %e, "Cancel check failed"),
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, stop: CancellationToken) {
    let worker_id = shared.config.worker_id.as_str();
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let active = shared.active.load(Ordering::SeqCst);
        match shared.store.heartbeat(worker_id, active).await {
            Ok(()) => debug!(worker_id, active, "Heartbeat"),
            Err(QueueError::NotFound(_)) => {
                // Reaped while we were unreachable.
                warn!(worker_id, "Worker registration missing, re-registering");
                let mut registration =
                    WorkerRegistration::new(worker_id, shared.config.slots.max(1));
                registration.active_jobs = active;
                if let Err(e) = shared.store.register_worker(registration).await {
                    warn!(worker_id, error = %e, "Failed to re-register worker");
                }
            }
            Err(e) => warn!(worker_id, error = %e, "Heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackSettings;
    use crate::runner::RunnerSettings;
    use crate::testing::{FakeBackend, new_job};
    use depot_core::job::CallbackStatus;
    use depot_core::{BuildResult, FailureReason};
    use depot_core::build::BuildBackend;
    use depot_queue::MemoryQueueStore;

    fn config(slots: u32, build_timeout: Duration) -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_id: "pool-test".to_string(),
            slots,
            build_timeout,
            poll_interval: Duration::from_millis(20),
            cancel_poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    async fn start(
        store: Arc<MemoryQueueStore>,
        backend: Arc<dyn BuildBackend>,
        config: WorkerPoolConfig,
    ) -> WorkerPool {
        let runner = BuildRunner::new(
            backend,
            RunnerSettings {
                registry: "registry.local".to_string(),
                image_template: "${registry}/${service.short_id}:${git.short_sha}".to_string(),
                sbom_format: "spdx-json".to_string(),
                build_timeout: config.build_timeout,
                stop_grace: Duration::from_millis(100),
            },
        );
        let dispatcher = CallbackDispatcher::new(store.clone(), CallbackSettings::default());
        WorkerPool::start(config, store, Arc::new(runner), Arc::new(dispatcher))
            .await
            .unwrap()
    }

    async fn wait_for(store: &MemoryQueueStore, id: JobId, status: JobStatus) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = store.get_job(id).await.unwrap();
                if job.status == status {
                    return job;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {} never reached {}", id, status))
    }

    async fn count_with_status(store: &MemoryQueueStore, status: JobStatus) -> usize {
        store.list_jobs(Some(status), 100).await.unwrap().len()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_runs_jobs_within_slot_limit() {
        let store = Arc::new(MemoryQueueStore::new());
        let backend = Arc::new(FakeBackend::gated());
        let pool = start(store.clone(), backend.clone(), config(3, Duration::from_secs(30))).await;

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.enqueue(new_job(0)).await.unwrap().0.id);
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.running() < 3 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("three builds should start");
        sleep(Duration::from_millis(100)).await;

        // Every slot is busy: the other two wait in the queue.
        assert_eq!(count_with_status(&store, JobStatus::Building).await, 3);
        assert_eq!(count_with_status(&store, JobStatus::Queued).await, 2);
        assert_eq!(pool.active_jobs(), 3);
        assert_eq!(backend.running(), 3);

        backend.open_gate();
        for id in &ids {
            let job = wait_for(&store, *id, JobStatus::Ready).await;
            assert!(job.started_at.is_some());
            assert!(job.finished_at.is_some());
        }

        assert_eq!(backend.calls(), 5);
        assert_eq!(backend.max_concurrency(), 3);

        let result = store.get_result(ids[0]).await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.image_digest, "sha256:fake");

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_build_timeout() {
        let store = Arc::new(MemoryQueueStore::new());
        let backend = Arc::new(FakeBackend::hanging());
        let pool = start(store.clone(), backend.clone(), config(1, Duration::from_millis(100))).await;

        let (job, _) = store.enqueue(new_job(0)).await.unwrap();
        wait_for(&store, job.id, JobStatus::Failed).await;

        let result = store.get_result(job.id).await.unwrap().unwrap();
        assert_eq!(result.failure_reason, Some(FailureReason::BuildTimeout));
        assert!(backend.saw_cancellation());
        assert_eq!(pool.active_jobs(), 0);

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_timeout_with_backend_ignoring_cancellation() {
        let store = Arc::new(MemoryQueueStore::new());
        let backend = Arc::new(FakeBackend::stubborn(Duration::from_secs(30)));
        let pool = start(store.clone(), backend.clone(), config(1, Duration::from_millis(100))).await;

        let (job, _) = store.enqueue(new_job(0)).await.unwrap();
        // build_timeout plus stop_grace, well inside wait_for's limit.
        wait_for(&store, job.id, JobStatus::Failed).await;

        let result = store.get_result(job.id).await.unwrap().unwrap();
        assert_eq!(result.failure_reason, Some(FailureReason::BuildTimeout));
        assert!(!backend.saw_cancellation());
        assert_eq!(pool.active_jobs(), 0);

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_result_dropped_when_job_moved_on() {
        let store = Arc::new(MemoryQueueStore::new());
        let backend = Arc::new(FakeBackend::gated());
        let pool = start(store.clone(), backend.clone(), config(1, Duration::from_secs(30))).await;

        let (job, _) = store.enqueue(new_job(0)).await.unwrap();
        wait_for(&store, job.id, JobStatus::Building).await;

        // Another party wins the building -> cancelled CAS while the build runs.
        store
            .update_status(
                job.id,
                JobStatus::Building,
                JobStatus::Cancelled,
                Some(BuildResult::cancelled(0.0)),
            )
            .await
            .unwrap();
        backend.open_gate();

        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.active_jobs() > 0 || backend.calls() == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("build should finish");

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        // No callback from the losing worker.
        assert_eq!(stored.callback.status, CallbackStatus::Pending);
        let result = store.get_result(job.id).await.unwrap().unwrap();
        assert!(!result.success);
        assert!(result.image_uri.is_empty());

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cancel_running_build() {
        let store = Arc::new(MemoryQueueStore::new());
        let backend = Arc::new(FakeBackend::hanging());
        let pool = start(store.clone(), backend.clone(), config(1, Duration::from_secs(30))).await;

        let (job, _) = store.enqueue(new_job(0)).await.unwrap();
        wait_for(&store, job.id, JobStatus::Building).await;

        store.request_cancel(job.id).await.unwrap();
        let cancelled = wait_for(&store, job.id, JobStatus::Cancelled).await;

        assert!(cancelled.finished_at.is_some());
        assert!(backend.saw_cancellation());
        let result = store.get_result(job.id).await.unwrap().unwrap();
        assert!(!result.success);

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_for_builds() {
        let store = Arc::new(MemoryQueueStore::new());
        let backend = Arc::new(FakeBackend::sleeping(Duration::from_millis(150)));
        let pool = start(store.clone(), backend, config(1, Duration::from_secs(30))).await;

        let (job, _) = store.enqueue(new_job(0)).await.unwrap();
        wait_for(&store, job.id, JobStatus::Building).await;

        pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Ready);
    }

    #[tokio::test]
    async fn test_forced_shutdown_fails_running_builds() {
        let store = Arc::new(MemoryQueueStore::new());
        let backend = Arc::new(FakeBackend::hanging());
        let pool = start(store.clone(), backend.clone(), config(2, Duration::from_secs(30))).await;

        let (job, _) = store.enqueue(new_job(0)).await.unwrap();
        wait_for(&store, job.id, JobStatus::Building).await;

        pool.shutdown(Duration::from_millis(50)).await;

        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Failed);
        let result = store.get_result(job.id).await.unwrap().unwrap();
        assert_eq!(result.failure_reason, Some(FailureReason::WorkerShutdown));
        assert!(backend.saw_cancellation());
        assert!(store.active_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_claims_after_shutdown() {
        let store = Arc::new(MemoryQueueStore::new());
        let backend = Arc::new(FakeBackend::instant());
        let pool = start(store.clone(), backend.clone(), config(2, Duration::from_secs(30))).await;

        pool.shutdown(Duration::from_secs(1)).await;
        let (job, _) = store.enqueue(new_job(0)).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_re_registers() {
        let store = Arc::new(MemoryQueueStore::new());
        let pool = start(
            store.clone(),
            Arc::new(FakeBackend::instant()),
            config(2, Duration::from_secs(30)),
        )
        .await;

        assert_eq!(store.active_workers().await.unwrap().len(), 1);
        store.unregister_worker("pool-test").await.unwrap();
        sleep(Duration::from_millis(200)).await;

        let workers = store.active_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id, "pool-test");
        assert_eq!(workers[0].capacity, 2);

        pool.shutdown(Duration::from_secs(1)).await;
    }
}
