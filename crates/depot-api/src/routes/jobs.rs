//! Job inspection and administration endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use depot_core::{BuildResult, Job, JobId, JobStatus, NewJob};
use depot_queue::{QueueError, QueueStore};
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job))
        .route("/{id}/logs", get(stream_logs))
        .route("/{id}/cancel", post(cancel_job))
        .route("/{id}/retry", post(retry_job))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id: {}", raw)))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct JobSummary {
    id: JobId,
    release_id: Uuid,
    service_id: Uuid,
    project_id: Uuid,
    git_repo: String,
    git_sha: String,
    status: JobStatus,
    priority: i32,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            release_id: job.release_id,
            service_id: job.service_id,
            project_id: job.project_id,
            git_repo: job.source.git_repo,
            git_sha: job.source.git_sha,
            status: job.status,
            priority: job.priority,
            worker_id: job.worker_id,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct ListJobsResponse {
    jobs: Vec<JobSummary>,
    count: usize,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<JobStatus>()?),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let jobs: Vec<JobSummary> = state
        .store
        .list_jobs(status, limit)
        .await?
        .into_iter()
        .map(JobSummary::from)
        .collect();

    Ok(Json(ListJobsResponse {
        count: jobs.len(),
        jobs,
    }))
}

#[derive(Debug, Serialize)]
struct JobResponse {
    job: Job,
    result: Option<BuildResult>,
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let id = parse_job_id(&id)?;
    let job = state.store.get_job(id).await?;
    let result = state.store.get_result(id).await?;
    Ok(Json(JobResponse { job, result }))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    job_id: JobId,
    status: &'static str,
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let id = parse_job_id(&id)?;
    let job = state.store.get_job(id).await?;

    match job.status {
        JobStatus::Queued => {
            let result = BuildResult::cancelled(0.0);
            match state
                .store
                .update_status(id, JobStatus::Queued, JobStatus::Cancelled, Some(result.clone()))
                .await
            {
                Ok(cancelled) => {
                    info!(job_id = %id, "Cancelled queued job");
                    let dispatcher = state.dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher
                            .dispatch(&cancelled, JobStatus::Cancelled, &result)
                            .await;
                    });
                    Ok((
                        StatusCode::OK,
                        Json(CancelResponse {
                            job_id: id,
                            status: JobStatus::Cancelled.as_str(),
                        }),
                    ))
                }
                // Claimed by a worker in the meantime.
                Err(QueueError::Conflict {
                    actual: JobStatus::Building,
                    ..
                }) => request_cancel(&state, id).await,
                Err(QueueError::Conflict { actual, .. }) => Err(not_cancellable(actual)),
                Err(e) => Err(e.into()),
            }
        }
        JobStatus::Building => request_cancel(&state, id).await,
        other => Err(not_cancellable(other)),
    }
}

/// Cancelling is only legal from `queued` or `building`.
fn not_cancellable(status: JobStatus) -> ApiError {
    ApiError::BadRequest(format!("job is {} and cannot be cancelled", status))
}

async fn request_cancel(
    state: &AppState,
    id: JobId,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    match state.store.request_cancel(id).await {
        Ok(_) => {}
        // Finished before the flag could be set.
        Err(QueueError::Conflict { actual, .. }) => return Err(not_cancellable(actual)),
        Err(e) => return Err(e.into()),
    }
    info!(job_id = %id, "Cancel requested for building job");
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id: id,
            status: "cancelling",
        }),
    ))
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    job_id: JobId,
    retry_of: JobId,
    position: u64,
}

async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RetryResponse>), ApiError> {
    let id = parse_job_id(&id)?;
    let original = state.store.get_job(id).await?;

    if !original.status.is_retryable() {
        return Err(ApiError::BadRequest(format!(
            "job is {}; only failed or cancelled jobs can be retried",
            original.status
        )));
    }

    let (job, position) = state.store.enqueue(NewJob::retry_of(&original)).await?;
    info!(job_id = %job.id, retry_of = %id, priority = job.priority, "Job retried");

    Ok((
        StatusCode::ACCEPTED,
        Json(RetryResponse {
            job_id: job.id,
            retry_of: id,
            position,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    from: Option<u64>,
}

/// Server-sent log stream. Each line is an `event: log` frame whose `id` is
/// the line offset; when the job is terminal a final `event: end` frame
/// carries its status. A stream that ends without `end` should be resumed
/// with `from` (or `Last-Event-ID`) set to the last offset received.
async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_job_id(&id)?;
    let from = match query.from {
        Some(from) => from,
        None => headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
    };

    let lines = state.store.stream_logs(id, from).await?;

    let events = lines.map(|line| {
        // SSE frames cannot carry carriage returns.
        let content = line.content.replace('\r', "");
        Ok::<_, Infallible>(
            Event::default()
                .event("log")
                .id(line.offset.to_string())
                .data(content),
        )
    });

    let store = state.store.clone();
    let end = stream::once(end_event(store, id)).filter_map(futures::future::ready);

    Ok(Sse::new(events.chain(end)).keep_alive(KeepAlive::default()))
}

async fn end_event(store: Arc<dyn QueueStore>, id: JobId) -> Option<Result<Event, Infallible>> {
    match store.get_job(id).await {
        Ok(job) if job.status.is_terminal() => {
            Some(Ok(Event::default().event("end").data(job.status.as_str())))
        }
        Ok(_) => None,
        Err(e) => {
            warn!(job_id = %id, error = %e, "Could not load job at end of log stream");
            None
        }
    }
}
