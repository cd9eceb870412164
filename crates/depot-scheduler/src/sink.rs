//! Routes build output into the queue's per-job log.

use std::sync::Arc;

use async_trait::async_trait;
use depot_core::JobId;
use depot_core::build::{LogSink, LogStream};
use depot_queue::QueueStore;
use tracing::{debug, warn};

pub struct JobLogSink {
    store: Arc<dyn QueueStore>,
    job_id: JobId,
}

impl JobLogSink {
    pub fn new(store: Arc<dyn QueueStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }
}

#[async_trait]
impl LogSink for JobLogSink {
    async fn emit(&self, stream: LogStream, content: String) {
        debug!(job_id = %self.job_id, stream = stream.as_str(), "{}", content);
        if let Err(e) = self.store.append_log(self.job_id, stream, content).await {
            warn!(job_id = %self.job_id, error = %e, "Dropped build log line");
        }
    }
}
