//! Worker registry endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use depot_core::worker::WorkerRegistration;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_workers))
}

#[derive(Debug, Serialize)]
struct WorkersResponse {
    workers: Vec<WorkerRegistration>,
    count: usize,
}

async fn list_workers(State(state): State<AppState>) -> Result<Json<WorkersResponse>, ApiError> {
    let workers = state.store.active_workers().await?;
    Ok(Json(WorkersResponse {
        count: workers.len(),
        workers,
    }))
}
