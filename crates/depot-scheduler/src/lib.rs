//! Job execution for depot.
//!
//! A [`WorkerPool`] claims jobs from a [`QueueStore`](depot_queue::QueueStore),
//! drives each through a [`BuildRunner`] and reports the terminal result
//! with a [`CallbackDispatcher`]. The [`StaleWorkerReaper`] cleans up after
//! pools that die without shutting down.

pub mod callback;
pub mod context;
pub mod reaper;
pub mod runner;
pub mod sink;
pub mod worker;

#[cfg(test)]
mod testing;

pub use callback::{CallbackDispatcher, CallbackSettings};
pub use context::{BuildContext, StopReason};
pub use reaper::StaleWorkerReaper;
pub use runner::{BuildRunner, Finished, RunnerSettings};
pub use sink::JobLogSink;
pub use worker::{WorkerPool, WorkerPoolConfig};
