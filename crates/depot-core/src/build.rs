//! Build collaborator traits and log types.
//!
//! Backends run the actual container build, SBOM generation and image
//! signing. They receive a cancellation token that fires on timeout,
//! operator cancel, or shutdown; any subprocess still running at that point
//! must be terminated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::{BuildConfig, SourceRef};
use crate::{JobId, Result};

/// Everything a backend needs to produce one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub job_id: JobId,
    pub release_id: Uuid,
    pub service_id: Uuid,
    pub project_id: Uuid,
    pub source: SourceRef,
    pub config: BuildConfig,
    /// Fully qualified image reference to tag and push.
    pub image_ref: String,
}

/// An image produced and pushed by a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub image_uri: String,
    pub digest: String,
    pub size_mb: f64,
}

/// A generated software bill of materials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sbom {
    pub content: String,
    pub format: String,
}

/// A line of build output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Position within the job's log, starting at 1.
    pub offset: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "system",
        }
    }
}

impl std::str::FromStr for LogStream {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            "system" => Ok(LogStream::System),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown log stream: {}",
                other
            ))),
        }
    }
}

/// Destination for one job's build output.
///
/// Appending never fails from the caller's point of view: a lost log line
/// must not fail a build.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn emit(&self, stream: LogStream, content: String);

    async fn system(&self, content: String) {
        self.emit(LogStream::System, content).await;
    }
}

/// Runs clone + image build + push.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn build(
        &self,
        cancel: &CancellationToken,
        request: &BuildRequest,
        logs: &dyn LogSink,
    ) -> Result<BuiltImage>;
}

/// Produces an SBOM for a pushed image.
#[async_trait]
pub trait SbomGenerator: Send + Sync {
    async fn generate(
        &self,
        cancel: &CancellationToken,
        image_uri: &str,
        format: &str,
        logs: &dyn LogSink,
    ) -> Result<Sbom>;
}

/// Signs a pushed image and returns the signature reference.
#[async_trait]
pub trait ImageSigner: Send + Sync {
    async fn sign(
        &self,
        cancel: &CancellationToken,
        image_uri: &str,
        logs: &dyn LogSink,
    ) -> Result<String>;
}
