//! Internal endpoints called by the control plane.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router, middleware};
use depot_core::request::{EnqueueRequest, EnqueueResponse};
use tracing::info;

use crate::AppState;
use crate::auth::require_api_key;
use crate::error::ApiError;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/enqueue", post(enqueue))
        .route_layer(middleware::from_fn_with_state(state, require_api_key))
}

async fn enqueue(
    State(state): State<AppState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let Json(request) = payload?;
    let new_job = request.into_new_job()?;

    let (job, position) = state.store.enqueue(new_job).await?;
    info!(
        job_id = %job.id,
        release_id = %job.release_id,
        priority = job.priority,
        position,
        "Job enqueued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: job.id,
            position,
        }),
    ))
}
