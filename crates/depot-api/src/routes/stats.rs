//! Queue statistics.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use depot_queue::QueueStats;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(stats))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    jobs: QueueStats,
    queue_depth: u64,
    building: u64,
    workers: usize,
    /// Sum of registered workers' build slots.
    capacity: u32,
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let jobs = state.store.stats().await?;
    let queue_depth = state.store.queue_length().await?;
    let workers = state.store.active_workers().await?;

    Ok(Json(StatsResponse {
        building: jobs.building,
        jobs,
        queue_depth,
        workers: workers.len(),
        capacity: workers.iter().map(|w| w.capacity).sum(),
    }))
}
