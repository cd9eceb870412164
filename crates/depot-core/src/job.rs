//! Build job record and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, JobId};

/// Lifecycle status of a build job.
///
/// Legal edges: `queued -> building -> {ready | failed}`, `queued -> cancelled`
/// and `building -> cancelled`. Every other edge is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Building,
    Ready,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Building,
        JobStatus::Ready,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Ready | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the transition graph.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Building)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Building, JobStatus::Ready)
                | (JobStatus::Building, JobStatus::Failed)
                | (JobStatus::Building, JobStatus::Cancelled)
        )
    }

    /// Cancellation is only accepted before a job finishes.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Building)
    }

    /// Only jobs that ended without producing an image can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Building => "building",
            JobStatus::Ready => "ready",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "building" => Ok(JobStatus::Building),
            "ready" => Ok(JobStatus::Ready),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// Where the source for a build comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub git_repo: String,
    pub git_sha: String,
    #[serde(default)]
    pub git_branch: String,
}

impl SourceRef {
    /// Abbreviated commit, at most eight characters.
    pub fn short_sha(&self) -> &str {
        let end = self.git_sha.len().min(8);
        self.git_sha.get(..end).unwrap_or(&self.git_sha)
    }
}

/// How the image should be produced. Opaque to scheduling; interpreted by
/// the build backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BuildType {
    Dockerfile,
    Buildpack,
    #[default]
    Auto,
}

impl TryFrom<String> for BuildType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "dockerfile" => Ok(BuildType::Dockerfile),
            "buildpack" => Ok(BuildType::Buildpack),
            "auto" | "" => Ok(BuildType::Auto),
            other => Err(Error::InvalidInput(format!(
                "unsupported build type: {}",
                other
            ))),
        }
    }
}

impl BuildType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildType::Dockerfile => "dockerfile",
            BuildType::Buildpack => "buildpack",
            BuildType::Auto => "auto",
        }
    }
}

impl From<BuildType> for String {
    fn from(value: BuildType) -> Self {
        value.as_str().to_string()
    }
}

/// Build configuration as submitted with the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    #[serde(rename = "type")]
    pub build_type: BuildType,
    pub dockerfile: String,
    pub buildpack: String,
    pub context: String,
    pub build_args: BTreeMap<String, String>,
    pub target: String,
}

impl BuildConfig {
    pub fn dockerfile_or_default(&self) -> &str {
        if self.dockerfile.is_empty() {
            "Dockerfile"
        } else {
            &self.dockerfile
        }
    }

    pub fn context_or_default(&self) -> &str {
        if self.context.is_empty() {
            "."
        } else {
            &self.context
        }
    }
}

/// Delivery state of the terminal callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    #[default]
    Pending,
    Delivered,
    Undelivered,
    /// The job had no callback URL.
    Skipped,
}

impl CallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStatus::Pending => "pending",
            CallbackStatus::Delivered => "delivered",
            CallbackStatus::Undelivered => "undelivered",
            CallbackStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for CallbackStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CallbackStatus::Pending),
            "delivered" => Ok(CallbackStatus::Delivered),
            "undelivered" => Ok(CallbackStatus::Undelivered),
            "skipped" => Ok(CallbackStatus::Skipped),
            other => Err(Error::InvalidInput(format!(
                "unknown callback status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackState {
    pub status: CallbackStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// A job as handed to the queue, before it has an id or sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub release_id: Uuid,
    pub service_id: Uuid,
    pub project_id: Uuid,
    #[serde(flatten)]
    pub source: SourceRef,
    pub build_config: BuildConfig,
    pub callback_url: String,
    pub priority: i32,
}

impl NewJob {
    /// A fresh job for re-running `original`. The original is never touched;
    /// the retry is served one priority tier above it.
    pub fn retry_of(original: &Job) -> Self {
        Self {
            release_id: original.release_id,
            service_id: original.service_id,
            project_id: original.project_id,
            source: original.source.clone(),
            build_config: original.build_config.clone(),
            callback_url: original.callback_url.clone(),
            priority: original.priority.saturating_add(1),
        }
    }
}

/// A build job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub release_id: Uuid,
    pub service_id: Uuid,
    pub project_id: Uuid,
    #[serde(flatten)]
    pub source: SourceRef,
    pub build_config: BuildConfig,
    pub callback_url: String,
    /// Higher is served first.
    pub priority: i32,
    pub status: JobStatus,
    /// Monotonic enqueue order; FIFO tie-break within a priority tier.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Owning worker, set only while building.
    pub worker_id: Option<String>,
    pub cancel_requested: bool,
    pub callback: CallbackState,
}

impl Job {
    /// Materialize a queued job from a submission.
    pub fn queued(new: NewJob, id: JobId, sequence: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            release_id: new.release_id,
            service_id: new.service_id,
            project_id: new.project_id,
            source: new.source,
            build_config: new.build_config,
            callback_url: new.callback_url,
            priority: new.priority,
            status: JobStatus::Queued,
            sequence,
            created_at,
            started_at: None,
            finished_at: None,
            worker_id: None,
            cancel_requested: false,
            callback: CallbackState::default(),
        }
    }

    /// Apply a transition that the store has already verified against the
    /// expected predecessor. Stamps timestamps and owner.
    pub fn apply_transition(&mut self, to: JobStatus, worker_id: Option<&str>, at: DateTime<Utc>) {
        match to {
            JobStatus::Building => {
                self.started_at = Some(at);
                self.worker_id = worker_id.map(str::to_string);
            }
            status if status.is_terminal() => {
                self.finished_at = Some(at);
                self.worker_id = None;
            }
            _ => {}
        }
        self.status = to;
    }
}
