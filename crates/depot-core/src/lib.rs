//! Core domain types and traits for the depot build queue.
//!
//! This crate contains:
//! - Job identifiers, the job record and its status transition graph
//! - Enqueue request validation
//! - Build results, failure reasons and the callback payload
//! - Collaborator traits for build backends, SBOM generators and signers
//! - Worker registrations

pub mod build;
pub mod error;
pub mod id;
pub mod job;
pub mod request;
pub mod result;
pub mod worker;

pub use error::{Error, Result};
pub use id::JobId;
pub use job::{BuildConfig, BuildType, CallbackStatus, Job, JobStatus, NewJob, SourceRef};
pub use result::{BuildResult, CallbackPayload, FailureReason};
