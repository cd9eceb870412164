//! Terminal build results and the callback payload derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::JobId;
use crate::job::{Job, JobStatus};

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Clone, build, or push exited non-zero.
    BuildFailed,
    /// The wall-clock build timeout fired.
    BuildTimeout,
    SbomFailed,
    SigningFailed,
    /// The pool was shut down before the build finished.
    WorkerShutdown,
    /// The owning worker stopped heartbeating.
    WorkerLost,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::BuildFailed => "BUILD_FAILED",
            FailureReason::BuildTimeout => "BUILD_TIMEOUT",
            FailureReason::SbomFailed => "SBOM_FAILED",
            FailureReason::SigningFailed => "SIGNING_FAILED",
            FailureReason::WorkerShutdown => "WORKER_SHUTDOWN",
            FailureReason::WorkerLost => "WORKER_LOST",
            FailureReason::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome attached to a job once it reaches a terminal status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub image_uri: String,
    pub image_digest: String,
    pub image_size_mb: f64,
    pub sbom: String,
    pub sbom_format: String,
    pub image_signature: String,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl BuildResult {
    /// A failed result. Partial artifacts (e.g. an image built before
    /// signing failed) can be filled in by the caller.
    pub fn failed(reason: FailureReason, message: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            success: false,
            duration_secs,
            error_message: Some(message.into()),
            failure_reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn cancelled(duration_secs: f64) -> Self {
        Self {
            success: false,
            duration_secs,
            error_message: Some("build cancelled".to_string()),
            ..Default::default()
        }
    }
}

/// Body POSTed to the control plane when a job terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub job_id: JobId,
    pub release_id: Uuid,
    pub status: JobStatus,
    pub success: bool,
    pub image_uri: String,
    pub image_digest: String,
    pub image_size_mb: f64,
    pub sbom: String,
    pub sbom_format: String,
    pub image_signature: String,
    pub duration_secs: f64,
    pub logs_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl CallbackPayload {
    pub fn new(job: &Job, status: JobStatus, result: &BuildResult, logs_url: String) -> Self {
        Self {
            job_id: job.id,
            release_id: job.release_id,
            status,
            success: result.success,
            image_uri: result.image_uri.clone(),
            image_digest: result.image_digest.clone(),
            image_size_mb: result.image_size_mb,
            sbom: result.sbom.clone(),
            sbom_format: result.sbom_format.clone(),
            image_signature: result.image_signature.clone(),
            duration_secs: result.duration_secs,
            logs_url,
            error_message: result.error_message.clone(),
            failure_reason: result.failure_reason,
        }
    }
}
