//! API routes.

pub mod health;
pub mod internal;
pub mod jobs;
pub mod stats;
pub mod workers;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .nest("/internal", internal::router(state.clone()))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/workers", workers::router())
        .nest("/stats", stats::router())
}
