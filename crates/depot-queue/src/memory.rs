//! In-process queue store.
//!
//! All state sits behind one mutex, so dequeue and every CAS transition are
//! atomic with respect to each other. Nothing is held across an await.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use depot_core::build::{LogLine, LogStream};
use depot_core::job::CallbackState;
use depot_core::worker::WorkerRegistration;
use depot_core::{BuildResult, Job, JobId, JobStatus, NewJob};
use futures::stream::BoxStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::logs::LogChannel;
use crate::store::{QueueStats, QueueStore};
use crate::{QueueError, QueueResult};

/// Default per-subscriber log buffer.
pub const DEFAULT_LOG_BUFFER: usize = 256;

type QueueKey = (Reverse<i32>, u64);

#[derive(Debug)]
struct Entry {
    job: Job,
    result: Option<BuildResult>,
    logs: LogChannel,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    /// Queued jobs in dispatch order.
    queue: BTreeMap<QueueKey, JobId>,
    /// Every job id in enqueue order.
    history: Vec<JobId>,
    workers: HashMap<String, WorkerRegistration>,
    next_sequence: u64,
}

impl State {
    fn entry_mut(&mut self, id: JobId) -> QueueResult<&mut Entry> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::job_not_found(id))
    }
}

fn queue_key(job: &Job) -> QueueKey {
    (Reverse(job.priority), job.sequence)
}

pub struct MemoryQueueStore {
    state: Mutex<State>,
    work_available: Notify,
    log_buffer: usize,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::with_log_buffer(DEFAULT_LOG_BUFFER)
    }

    pub fn with_log_buffer(log_buffer: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            work_available: Notify::new(),
            log_buffer,
        }
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, new_job: NewJob) -> QueueResult<(Job, u64)> {
        let mut state = self.state.lock().await;

        state.next_sequence += 1;
        let job = Job::queued(new_job, JobId::new(), state.next_sequence, Utc::now());
        let id = job.id;

        state.queue.insert(queue_key(&job), id);
        state.history.push(id);
        state.jobs.insert(
            id,
            Entry {
                job: job.clone(),
                result: None,
                logs: LogChannel::new(self.log_buffer),
            },
        );
        let position = state.queue.len() as u64;
        drop(state);

        self.work_available.notify_one();
        Ok((job, position))
    }

    async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        let mut state = self.state.lock().await;

        let Some((_, id)) = state.queue.pop_first() else {
            return Ok(None);
        };
        let entry = state.entry_mut(id)?;
        entry
            .job
            .apply_transition(JobStatus::Building, Some(worker_id), Utc::now());

        debug!(job_id = %id, worker_id, "Dequeued job");
        Ok(Some(entry.job.clone()))
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.work_available.notified()).await;
    }

    async fn get_job(&self, id: JobId) -> QueueResult<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| QueueError::job_not_found(id))
    }

    async fn get_result(&self, id: JobId) -> QueueResult<Option<BuildResult>> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .map(|entry| entry.result.clone())
            .ok_or_else(|| QueueError::job_not_found(id))
    }

    async fn update_status(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        result: Option<BuildResult>,
    ) -> QueueResult<Job> {
        if !from.can_transition_to(to) {
            return Err(QueueError::IllegalTransition { from, to });
        }

        let mut state = self.state.lock().await;
        let entry = state.entry_mut(id)?;
        if entry.job.status != from {
            return Err(QueueError::Conflict {
                expected: from,
                actual: entry.job.status,
            });
        }

        let key = queue_key(&entry.job);
        entry.job.apply_transition(to, None, Utc::now());
        if result.is_some() {
            entry.result = result;
        }
        if to.is_terminal() {
            entry.logs.close();
        }
        let job = entry.job.clone();

        if from == JobStatus::Queued {
            state.queue.remove(&key);
        }

        info!(job_id = %id, from = %from, to = %to, "Job status updated");
        Ok(job)
    }

    async fn request_cancel(&self, id: JobId) -> QueueResult<Job> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(id)?;
        if entry.job.status != JobStatus::Building {
            return Err(QueueError::Conflict {
                expected: JobStatus::Building,
                actual: entry.job.status,
            });
        }
        entry.job.cancel_requested = true;
        Ok(entry.job.clone())
    }

    async fn cancel_requested(&self, id: JobId) -> QueueResult<bool> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .map(|entry| entry.job.cancel_requested)
            .ok_or_else(|| QueueError::job_not_found(id))
    }

    async fn append_log(
        &self,
        id: JobId,
        stream: LogStream,
        content: String,
    ) -> QueueResult<LogLine> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(id)?;
        Ok(entry.logs.append(stream, content))
    }

    async fn stream_logs(
        &self,
        id: JobId,
        from_offset: u64,
    ) -> QueueResult<BoxStream<'static, LogLine>> {
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(id)?;
        Ok(entry.logs.subscribe(from_offset))
    }

    async fn queue_length(&self) -> QueueResult<u64> {
        Ok(self.state.lock().await.queue.len() as u64)
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>> {
        let state = self.state.lock().await;
        let jobs = state
            .history
            .iter()
            .rev()
            .filter_map(|id| state.jobs.get(id))
            .map(|entry| &entry.job)
            .filter(|job| status.is_none_or(|s| job.status == s))
            .take(limit)
            .cloned()
            .collect();
        Ok(jobs)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for entry in state.jobs.values() {
            stats.add(entry.job.status, 1);
        }
        Ok(stats)
    }

    async fn set_callback_state(&self, id: JobId, callback: CallbackState) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.entry_mut(id)?.job.callback = callback;
        Ok(())
    }

    async fn register_worker(&self, registration: WorkerRegistration) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state
            .workers
            .insert(registration.id.clone(), registration);
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, active_jobs: u32) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| QueueError::NotFound(format!("worker {}", worker_id)))?;
        worker.last_heartbeat = Utc::now();
        worker.active_jobs = active_jobs;
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> QueueResult<()> {
        self.state.lock().await.workers.remove(worker_id);
        Ok(())
    }

    async fn active_workers(&self) -> QueueResult<Vec<WorkerRegistration>> {
        let state = self.state.lock().await;
        let mut workers: Vec<WorkerRegistration> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}
