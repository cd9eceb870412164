//! Scripted collaborators shared by the scheduler tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use depot_core::build::{
    BuildBackend, BuildRequest, BuiltImage, ImageSigner, LogSink, LogStream, Sbom, SbomGenerator,
};
use depot_core::job::{BuildConfig, SourceRef};
use depot_core::{Error, Job, JobId, NewJob, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub fn new_job(priority: i32) -> NewJob {
    NewJob {
        release_id: Uuid::new_v4(),
        service_id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        source: SourceRef {
            git_repo: "https://github.com/acme/app.git".to_string(),
            git_sha: "0123456789abcdef0123456789abcdef01234567".to_string(),
            git_branch: "main".to_string(),
        },
        build_config: BuildConfig::default(),
        callback_url: String::new(),
        priority,
    }
}

pub fn sample_job(priority: i32) -> Job {
    Job::queued(new_job(priority), JobId::new(), 1, Utc::now())
}

pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn emit(&self, _stream: LogStream, _content: String) {}
}

/// Build backend with a scripted duration and outcome.
pub struct FakeBackend {
    /// `None` never finishes on its own.
    delay: Option<Duration>,
    failure: Option<String>,
    /// Keep going after the token fires.
    ignore_cancel: bool,
    /// Builds wait here until [`open_gate`](Self::open_gate).
    gate: Option<Semaphore>,
    cancelled: AtomicBool,
    running: AtomicUsize,
    max_running: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeBackend {
    fn new(delay: Option<Duration>, failure: Option<&str>) -> Self {
        Self {
            delay,
            failure: failure.map(str::to_string),
            ignore_cancel: false,
            gate: None,
            cancelled: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn instant() -> Self {
        Self::new(Some(Duration::ZERO), None)
    }

    pub fn sleeping(delay: Duration) -> Self {
        Self::new(Some(delay), None)
    }

    pub fn hanging() -> Self {
        Self::new(None, None)
    }

    pub fn failing(message: &str) -> Self {
        Self::new(Some(Duration::ZERO), Some(message))
    }

    /// Sleeps for `delay` whatever happens to its token.
    pub fn stubborn(delay: Duration) -> Self {
        Self {
            ignore_cancel: true,
            ..Self::new(Some(delay), None)
        }
    }

    /// Succeeds once the gate is opened.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(Some(Duration::ZERO), None)
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1024);
        }
    }

    /// Builds currently inside `build`.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a build observed its token being cancelled.
    pub fn saw_cancellation(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn build(
        &self,
        cancel: &CancellationToken,
        request: &BuildRequest,
        logs: &dyn LogSink,
    ) -> Result<BuiltImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        logs.emit(LogStream::Stdout, "Step 1/1 : FROM scratch".to_string())
            .await;

        let work = async {
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => futures::future::pending::<()>().await,
            }
        };

        let outcome = if self.ignore_cancel {
            work.await;
            self.outcome(request)
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancelled.store(true, Ordering::SeqCst);
                    Err(Error::Cancelled)
                }
                _ = work => self.outcome(request),
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

impl FakeBackend {
    fn outcome(&self, request: &BuildRequest) -> Result<BuiltImage> {
        match &self.failure {
            Some(message) => Err(Error::ExecutionFailed(message.clone())),
            None => Ok(BuiltImage {
                image_uri: request.image_ref.clone(),
                digest: "sha256:fake".to_string(),
                size_mb: 12.5,
            }),
        }
    }
}

/// Stand-in for both the SBOM generator and the signer.
pub struct FakeTool {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeTool {
    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn call(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(Error::ExecutionFailed("tool exited with 1".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SbomGenerator for FakeTool {
    async fn generate(
        &self,
        _cancel: &CancellationToken,
        _image_uri: &str,
        format: &str,
        _logs: &dyn LogSink,
    ) -> Result<Sbom> {
        self.call()?;
        Ok(Sbom {
            content: "{\"spdxVersion\":\"SPDX-2.3\"}".to_string(),
            format: format.to_string(),
        })
    }
}

#[async_trait]
impl ImageSigner for FakeTool {
    async fn sign(
        &self,
        _cancel: &CancellationToken,
        _image_uri: &str,
        _logs: &dyn LogSink,
    ) -> Result<String> {
        self.call()?;
        Ok("sha256-fake.sig".to_string())
    }
}
