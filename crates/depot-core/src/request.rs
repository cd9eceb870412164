//! Wire types for submitting builds.

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::job::{BuildConfig, NewJob, SourceRef};
use crate::{Error, JobId, Result};

/// Request to enqueue a new build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub release_id: Uuid,
    pub service_id: Uuid,
    pub project_id: Uuid,
    pub git_repo: String,
    pub git_sha: String,
    #[serde(default)]
    pub git_branch: String,
    pub build_config: BuildConfig,
    #[serde(default)]
    pub callback_url: String,
    #[serde(default)]
    pub priority: i32,
}

impl EnqueueRequest {
    /// Validate the request and turn it into a job submission.
    pub fn into_new_job(self) -> Result<NewJob> {
        validate_git_repo(&self.git_repo)?;

        if !is_git_sha(&self.git_sha) {
            return Err(Error::InvalidInput(format!(
                "git_sha must be 7-40 hex characters, got '{}'",
                self.git_sha
            )));
        }

        if !self.callback_url.is_empty() {
            validate_callback_url(&self.callback_url)?;
        }

        Ok(NewJob {
            release_id: self.release_id,
            service_id: self.service_id,
            project_id: self.project_id,
            source: SourceRef {
                git_repo: self.git_repo,
                git_sha: self.git_sha,
                git_branch: self.git_branch,
            },
            build_config: self.build_config,
            callback_url: self.callback_url,
            priority: self.priority,
        })
    }
}

/// Response after enqueueing a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: JobId,
    /// Queue depth including the new job.
    pub position: u64,
}

fn is_git_sha(sha: &str) -> bool {
    (7..=40).contains(&sha.len()) && sha.chars().all(|c| c.is_ascii_hexdigit())
}

/// `user@host:path`, the scp-style remote git accepts.
fn is_scp_like_remote(repo: &str) -> bool {
    let Some((user, rest)) = repo.split_once('@') else {
        return false;
    };
    let Some((host, path)) = rest.split_once(':') else {
        return false;
    };

    let user_ok = user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    let host_ok = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'));
    let path_ok = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '~' | '-'));

    !user.is_empty()
        && !host.is_empty()
        && !path.is_empty()
        && !host.starts_with('-')
        && user_ok
        && host_ok
        && path_ok
}

fn validate_git_repo(repo: &str) -> Result<()> {
    if repo.is_empty() {
        return Err(Error::InvalidInput("git_repo is required".to_string()));
    }
    // Anything starting with '-' would reach `git clone` as an option.
    if repo.starts_with('-') {
        return Err(Error::InvalidInput(format!(
            "git_repo must not start with '-': {}",
            repo
        )));
    }

    if is_scp_like_remote(repo) {
        return Ok(());
    }

    let url = Url::parse(repo)
        .map_err(|e| Error::InvalidInput(format!("invalid git_repo '{}': {}", repo, e)))?;

    match url.scheme() {
        "https" | "http" | "ssh" | "git" => Ok(()),
        scheme => Err(Error::InvalidInput(format!(
            "unsupported git_repo scheme: {}",
            scheme
        ))),
    }
}

fn validate_callback_url(callback: &str) -> Result<()> {
    let url = Url::parse(callback)
        .map_err(|e| Error::InvalidInput(format!("invalid callback_url '{}': {}", callback, e)))?;

    match url.scheme() {
        "https" | "http" => Ok(()),
        scheme => Err(Error::InvalidInput(format!(
            "callback_url must be http(s), got {}",
            scheme
        ))),
    }
}
