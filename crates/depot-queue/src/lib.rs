//! Job queue for the depot build service.
//!
//! Provides the [`QueueStore`] contract and two implementations: an
//! in-process store for single-binary deployments and a PostgreSQL store
//! shared between API and worker processes.

pub mod error;
mod logs;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueueStore;
pub use postgres::PgQueueStore;
pub use store::{QueueStats, QueueStore};
