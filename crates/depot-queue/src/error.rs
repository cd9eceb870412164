//! Queue store error types.

use depot_core::JobStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-swap transition lost: the stored status was not the
    /// expected predecessor.
    #[error("conflict: expected status {expected}, found {actual}")]
    Conflict {
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    pub(crate) fn job_not_found(id: impl std::fmt::Display) -> Self {
        QueueError::NotFound(format!("job {}", id))
    }

    /// True for failures of the store itself rather than of the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            QueueError::Unavailable(_) | QueueError::Database(_) | QueueError::Migration(_)
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
