//! HTTP surface for depot.
//!
//! Admin endpoints live under `/api/v1`, the control-plane enqueue endpoint
//! under `/internal`, and health checks at `/health` and `/ready`.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
