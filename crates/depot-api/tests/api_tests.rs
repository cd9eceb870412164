use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use depot_api::{AppState, routes};
use depot_core::build::LogStream;
use depot_core::{BuildResult, FailureReason, JobId, JobStatus, NewJob};
use depot_queue::{MemoryQueueStore, QueueStore};
use depot_scheduler::{CallbackDispatcher, CallbackSettings};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

fn create_app(store: Arc<MemoryQueueStore>, api_key: Option<&str>) -> Router {
    let dispatcher = Arc::new(CallbackDispatcher::new(
        store.clone(),
        CallbackSettings::default(),
    ));
    let state =
        AppState::new(store, dispatcher).with_internal_api_key(api_key.map(str::to_string));
    routes::router(state)
}

fn enqueue_body(priority: i32) -> Value {
    json!({
        "release_id": Uuid::new_v4(),
        "service_id": Uuid::new_v4(),
        "project_id": Uuid::new_v4(),
        "git_repo": "https://github.com/acme/app.git",
        "git_sha": SHA,
        "git_branch": "main",
        "build_config": {
            "type": "dockerfile",
            "dockerfile": "Dockerfile",
            "context": ".",
            "build_args": {},
            "target": ""
        },
        "callback_url": "",
        "priority": priority
    })
}

fn new_job(priority: i32) -> NewJob {
    serde_json::from_value::<depot_core::request::EnqueueRequest>(enqueue_body(priority))
        .unwrap()
        .into_new_job()
        .unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

async fn send_text(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn job_id(body: &Value) -> JobId {
    body["job_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_health_and_ready() {
    let app = create_app(Arc::new(MemoryQueueStore::new()), None);

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_enqueue_then_get() {
    let app = create_app(Arc::new(MemoryQueueStore::new()), None);

    let (status, body) = send(&app, post_json("/internal/enqueue", &enqueue_body(0))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["position"], 1);

    let id = job_id(&body);
    let (status, body) = send(&app, get(&format!("/api/v1/jobs/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["status"], "queued");
    assert_eq!(body["job"]["git_sha"], SHA);
    assert_eq!(body["job"]["callback"]["status"], "pending");
    assert!(body["result"].is_null());
}

#[tokio::test]
async fn test_enqueue_validation() {
    let app = create_app(Arc::new(MemoryQueueStore::new()), None);

    let mut bad_sha = enqueue_body(0);
    bad_sha["git_sha"] = json!("not-a-sha");
    let (status, body) = send(&app, post_json("/internal/enqueue", &bad_sha)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("git_sha"));

    let mut bad_type = enqueue_body(0);
    bad_type["build_config"]["type"] = json!("nix");
    let (status, _) = send(&app, post_json("/internal/enqueue", &bad_type)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut bad_id = enqueue_body(0);
    bad_id["release_id"] = json!("release-1");
    let (status, body) = send(&app, post_json("/internal/enqueue", &bad_id)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(&app, get("/api/v1/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue_depth"], 0);
}

#[tokio::test]
async fn test_internal_api_key() {
    let app = create_app(Arc::new(MemoryQueueStore::new()), Some("s3cret"));

    let (status, body) = send(&app, post_json("/internal/enqueue", &enqueue_body(0))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let mut request = post_json("/internal/enqueue", &enqueue_body(0));
    request
        .headers_mut()
        .insert("x-api-key", "wrong".parse().unwrap());
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut request = post_json("/internal/enqueue", &enqueue_body(0));
    request
        .headers_mut()
        .insert("x-api-key", "s3cret".parse().unwrap());
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut request = post_json("/internal/enqueue", &enqueue_body(0));
    request
        .headers_mut()
        .insert("authorization", "Bearer s3cret".parse().unwrap());
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["position"], 2);

    // Admin routes are not behind the internal key.
    let (status, _) = send(&app, get("/api/v1/jobs")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let store = Arc::new(MemoryQueueStore::new());
    let app = create_app(store.clone(), None);
    let (job, _) = store.enqueue(new_job(0)).await.unwrap();

    let (status, body) = send(&app, post(&format!("/api/v1/jobs/{}/cancel", job.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Cancelled);
    assert!(store.dequeue("worker-1").await.unwrap().is_none());

    let (status, body) = send(&app, post(&format!("/api/v1/jobs/{}/cancel", job.id))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("cancelled"));
}

#[tokio::test]
async fn test_cancel_building_job() {
    let store = Arc::new(MemoryQueueStore::new());
    let app = create_app(store.clone(), None);
    store.enqueue(new_job(0)).await.unwrap();
    let job = store.dequeue("worker-1").await.unwrap().unwrap();

    let (status, body) = send(&app, post(&format!("/api/v1/jobs/{}/cancel", job.id))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "cancelling");

    // The owning worker performs the transition.
    assert!(store.cancel_requested(job.id).await.unwrap());
    assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Building);
}

#[tokio::test]
async fn test_retry_failed_job() {
    let store = Arc::new(MemoryQueueStore::new());
    let app = create_app(store.clone(), None);
    store.enqueue(new_job(3)).await.unwrap();
    let job = store.dequeue("worker-1").await.unwrap().unwrap();
    store
        .update_status(
            job.id,
            JobStatus::Building,
            JobStatus::Failed,
            Some(BuildResult::failed(FailureReason::BuildFailed, "exit 1", 1.0)),
        )
        .await
        .unwrap();

    let (status, body) = send(&app, post(&format!("/api/v1/jobs/{}/retry", job.id))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["retry_of"], job.id.to_string());
    assert_eq!(body["position"], 1);

    let retried = store.get_job(job_id(&body)).await.unwrap();
    assert_ne!(retried.id, job.id);
    assert_eq!(retried.priority, 4);
    assert_eq!(retried.source, job.source);
    assert_eq!(retried.build_config, job.build_config);
    assert_eq!(retried.status, JobStatus::Queued);

    let original = store.get_job(job.id).await.unwrap();
    assert_eq!(original.status, JobStatus::Failed);
    assert_eq!(original.priority, 3);
}

#[tokio::test]
async fn test_retry_rejected_for_active_job() {
    let store = Arc::new(MemoryQueueStore::new());
    let app = create_app(store.clone(), None);
    let (job, _) = store.enqueue(new_job(0)).await.unwrap();

    let (status, body) = send(&app, post(&format!("/api/v1/jobs/{}/retry", job.id))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("queued"));
    assert_eq!(store.queue_length().await.unwrap(), 1);
}

#[tokio::test]
async fn test_get_job_errors() {
    let app = create_app(Arc::new(MemoryQueueStore::new()), None);

    let (status, body) = send(&app, get(&format!("/api/v1/jobs/{}", JobId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, get("/api/v1/jobs/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post(&format!("/api/v1/jobs/{}/cancel", JobId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_jobs() {
    let store = Arc::new(MemoryQueueStore::new());
    let app = create_app(store.clone(), None);
    for _ in 0..3 {
        store.enqueue(new_job(0)).await.unwrap();
    }
    let building = store.dequeue("worker-1").await.unwrap().unwrap();

    let (status, body) = send(&app, get("/api/v1/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);

    let (_, body) = send(&app, get("/api/v1/jobs?status=building")).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["jobs"][0]["id"], building.id.to_string());
    assert_eq!(body["jobs"][0]["worker_id"], "worker-1");

    let (_, body) = send(&app, get("/api/v1/jobs?limit=2")).await;
    assert_eq!(body["count"], 2);

    let (status, _) = send(&app, get("/api/v1/jobs?status=exploded")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_and_workers() {
    let store = Arc::new(MemoryQueueStore::new());
    let app = create_app(store.clone(), None);
    store
        .register_worker(depot_core::worker::WorkerRegistration::new("pool-a", 3))
        .await
        .unwrap();
    store.enqueue(new_job(0)).await.unwrap();
    store.enqueue(new_job(0)).await.unwrap();
    store.dequeue("pool-a").await.unwrap();

    let (status, body) = send(&app, get("/api/v1/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue_depth"], 1);
    assert_eq!(body["building"], 1);
    assert_eq!(body["jobs"]["queued"], 1);
    assert_eq!(body["workers"], 1);
    assert_eq!(body["capacity"], 3);

    let (status, body) = send(&app, get("/api/v1/workers")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["workers"][0]["id"], "pool-a");
    assert_eq!(body["workers"][0]["capacity"], 3);
}

#[tokio::test]
async fn test_log_stream_resumes_from_offset() {
    let store = Arc::new(MemoryQueueStore::new());
    let app = create_app(store.clone(), None);
    store.enqueue(new_job(0)).await.unwrap();
    let job = store.dequeue("worker-1").await.unwrap().unwrap();

    for line in ["step one", "step two", "step three\r"] {
        store
            .append_log(job.id, LogStream::Stdout, line.to_string())
            .await
            .unwrap();
    }
    store
        .update_status(
            job.id,
            JobStatus::Building,
            JobStatus::Ready,
            Some(BuildResult::default()),
        )
        .await
        .unwrap();

    let (status, body) = send_text(&app, get(&format!("/api/v1/jobs/{}/logs?from=1", job.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.contains("step one"), "{}", body);
    assert!(body.contains("id: 2"), "{}", body);
    assert!(body.contains("data: step two"), "{}", body);
    assert!(body.contains("data: step three"), "{}", body);
    assert!(!body.contains('\r'));
    assert!(body.contains("event: end"), "{}", body);
    assert!(body.contains("data: ready"), "{}", body);

    // Last-Event-ID is honoured when `from` is absent.
    let request = Request::builder()
        .uri(format!("/api/v1/jobs/{}/logs", job.id))
        .header("last-event-id", "2")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send_text(&app, request).await;
    assert!(!body.contains("step two"), "{}", body);
    assert!(body.contains("data: step three"), "{}", body);
}
