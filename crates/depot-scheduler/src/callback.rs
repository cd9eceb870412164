//! Delivery of terminal results to the control plane.
//!
//! Delivery is at-least-once with bounded retry. Exhausting the retries
//! marks the callback `undelivered` on the job; the job itself is never
//! reopened. Receivers needing certainty should fall back to polling the
//! job.

use std::sync::Arc;
use std::time::Duration;

use depot_core::job::{CallbackState, CallbackStatus};
use depot_core::{BuildResult, CallbackPayload, Job, JobId, JobStatus};
use depot_queue::QueueStore;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use sha2::Sha256;
use tracing::{debug, info, warn};

/// Header carrying `sha256=<hex hmac>` of the request body.
pub const SIGNATURE_HEADER: &str = "X-Depot-Signature";

#[derive(Debug, Clone)]
pub struct CallbackSettings {
    pub api_key: Option<String>,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    /// Base URL the control plane can reach this service on.
    pub public_url: String,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            public_url: "http://localhost:8081".to_string(),
        }
    }
}

pub struct CallbackDispatcher {
    client: reqwest::Client,
    store: Arc<dyn QueueStore>,
    settings: CallbackSettings,
}

impl CallbackDispatcher {
    pub fn new(store: Arc<dyn QueueStore>, settings: CallbackSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
            settings,
        }
    }

    pub fn logs_url(&self, id: JobId) -> String {
        format!(
            "{}/api/v1/jobs/{}/logs",
            self.settings.public_url.trim_end_matches('/'),
            id
        )
    }

    /// Deliver the terminal result for `job` and record how it went.
    pub async fn dispatch(&self, job: &Job, status: JobStatus, result: &BuildResult) -> CallbackState {
        let state = if job.callback_url.is_empty() {
            CallbackState {
                status: CallbackStatus::Skipped,
                ..Default::default()
            }
        } else {
            let payload = CallbackPayload::new(job, status, result, self.logs_url(job.id));
            self.deliver(job.id, &job.callback_url, &payload).await
        };

        if let Err(e) = self.store.set_callback_state(job.id, state.clone()).await {
            warn!(job_id = %job.id, error = %e, "Failed to record callback state");
        }
        state
    }

    async fn deliver(&self, job_id: JobId, url: &str, payload: &CallbackPayload) -> CallbackState {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                return CallbackState {
                    status: CallbackStatus::Undelivered,
                    attempts: 0,
                    last_error: Some(format!("serializing payload: {}", e)),
                };
            }
        };
        let signature = self.settings.api_key.as_deref().map(|key| sign(key, &body));

        let max_attempts = self.settings.max_attempts.max(1);
        let mut backoff = self.settings.initial_backoff;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.send(url, &body, signature.as_deref()).await {
                Ok(()) => {
                    info!(job_id = %job_id, attempt, "Callback delivered");
                    return CallbackState {
                        status: CallbackStatus::Delivered,
                        attempts: attempt,
                        last_error: None,
                    };
                }
                Err(e) => {
                    debug!(job_id = %job_id, attempt, error = %e, "Callback attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.settings.max_backoff);
            }
        }

        warn!(
            job_id = %job_id,
            attempts = max_attempts,
            error = last_error.as_deref().unwrap_or("unknown"),
            "Callback undelivered"
        );
        CallbackState {
            status: CallbackStatus::Undelivered,
            attempts: max_attempts,
            last_error,
        }
    }

    async fn send(&self, url: &str, body: &[u8], signature: Option<&str>) -> Result<(), String> {
        let mut request = self
            .client
            .post(url)
            .timeout(self.settings.request_timeout)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());

        if let Some(key) = &self.settings.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key));
        }
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", status))
        }
    }
}

/// `sha256=<hex>` HMAC of `body` keyed with `key`.
pub fn sign(key: &str, body: &[u8]) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::new_job;
    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use depot_core::FailureReason;
    use depot_queue::MemoryQueueStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Receiver {
        /// Respond 503 to this many requests before accepting.
        fail_first: usize,
        hits: Arc<AtomicUsize>,
        last: Arc<Mutex<Option<(HeaderMap, Bytes)>>>,
    }

    async fn receive(
        State(receiver): State<Receiver>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        let n = receiver.hits.fetch_add(1, Ordering::SeqCst);
        *receiver.last.lock().unwrap() = Some((headers, body));
        if n < receiver.fail_first {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }

    async fn spawn_receiver(receiver: Receiver) -> String {
        let app = Router::new()
            .route("/callback", post(receive))
            .with_state(receiver);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/callback", addr)
    }

    fn fast_settings() -> CallbackSettings {
        CallbackSettings {
            api_key: Some("cb-secret".to_string()),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            request_timeout: Duration::from_secs(2),
            public_url: "https://builds.example.com/".to_string(),
        }
    }

    async fn job_with_callback(store: &MemoryQueueStore, url: &str) -> Job {
        let mut new = new_job(0);
        new.callback_url = url.to_string();
        store.enqueue(new).await.unwrap().0
    }

    #[tokio::test]
    async fn test_delivers_signed_payload() {
        let receiver = Receiver::default();
        let url = spawn_receiver(receiver.clone()).await;
        let store = Arc::new(MemoryQueueStore::new());
        let job = job_with_callback(&store, &url).await;

        let dispatcher = CallbackDispatcher::new(store.clone(), fast_settings());
        let result = BuildResult {
            success: true,
            image_uri: "ghcr.io/a/b:1".to_string(),
            ..Default::default()
        };
        let state = dispatcher.dispatch(&job, JobStatus::Ready, &result).await;

        assert_eq!(state.status, CallbackStatus::Delivered);
        assert_eq!(state.attempts, 1);

        let (headers, body) = receiver.last.lock().unwrap().clone().unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer cb-secret");
        assert_eq!(
            headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap(),
            sign("cb-secret", &body)
        );

        let payload: CallbackPayload = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.job_id, job.id);
        assert!(payload.success);
        assert_eq!(
            payload.logs_url,
            format!("https://builds.example.com/api/v1/jobs/{}/logs", job.id)
        );

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.callback.status, CallbackStatus::Delivered);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let receiver = Receiver {
            fail_first: 2,
            ..Default::default()
        };
        let url = spawn_receiver(receiver.clone()).await;
        let store = Arc::new(MemoryQueueStore::new());
        let job = job_with_callback(&store, &url).await;

        let dispatcher = CallbackDispatcher::new(store, fast_settings());
        let result = BuildResult::failed(FailureReason::BuildFailed, "exit 1", 2.0);
        let state = dispatcher.dispatch(&job, JobStatus::Failed, &result).await;

        assert_eq!(state.status, CallbackStatus::Delivered);
        assert_eq!(state.attempts, 3);
        assert_eq!(receiver.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let receiver = Receiver {
            fail_first: usize::MAX,
            ..Default::default()
        };
        let url = spawn_receiver(receiver.clone()).await;
        let store = Arc::new(MemoryQueueStore::new());
        let job = job_with_callback(&store, &url).await;

        let dispatcher = CallbackDispatcher::new(store.clone(), fast_settings());
        let result = BuildResult::failed(FailureReason::BuildFailed, "exit 1", 2.0);
        let state = dispatcher.dispatch(&job, JobStatus::Failed, &result).await;

        assert_eq!(state.status, CallbackStatus::Undelivered);
        assert_eq!(state.attempts, 3);
        assert_eq!(state.last_error.as_deref(), Some("HTTP 503 Service Unavailable"));

        // The job itself is untouched.
        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.callback.status, CallbackStatus::Undelivered);
    }

    #[tokio::test]
    async fn test_unreachable_receiver() {
        let store = Arc::new(MemoryQueueStore::new());
        // Port 9 (discard) on localhost is closed in test environments.
        let job = job_with_callback(&store, "http://127.0.0.1:9/callback").await;

        let dispatcher = CallbackDispatcher::new(store, fast_settings());
        let state = dispatcher
            .dispatch(&job, JobStatus::Cancelled, &BuildResult::cancelled(0.5))
            .await;
        assert_eq!(state.status, CallbackStatus::Undelivered);
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_no_callback_url_is_skipped() {
        let store = Arc::new(MemoryQueueStore::new());
        let (job, _) = store.enqueue(new_job(0)).await.unwrap();

        let dispatcher = CallbackDispatcher::new(store.clone(), fast_settings());
        let state = dispatcher
            .dispatch(&job, JobStatus::Ready, &BuildResult::default())
            .await;

        assert_eq!(state.status, CallbackStatus::Skipped);
        assert_eq!(
            store.get_job(job.id).await.unwrap().callback.status,
            CallbackStatus::Skipped
        );
    }

    #[test]
    fn test_signature_format() {
        let sig = sign("key", b"{}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert_ne!(sig, sign("other", b"{}"));
    }
}
