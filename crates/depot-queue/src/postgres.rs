//! PostgreSQL queue store.
//!
//! Lets the API and worker pools run as separate processes sharing one
//! queue. Dequeue relies on `FOR UPDATE SKIP LOCKED`; status changes are
//! conditional updates on the expected status.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depot_core::build::{LogLine, LogStream};
use depot_core::job::{BuildConfig, CallbackState, SourceRef};
use depot_core::worker::WorkerRegistration;
use depot_core::{BuildResult, Job, JobId, JobStatus, NewJob};
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{QueueStats, QueueStore};
use crate::{QueueError, QueueResult};

/// How often a log stream polls for new lines.
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);
const LOG_PAGE_SIZE: i64 = 500;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    sequence: i64,
    release_id: Uuid,
    service_id: Uuid,
    project_id: Uuid,
    git_repo: String,
    git_sha: String,
    git_branch: String,
    build_config: Json<BuildConfig>,
    callback_url: String,
    priority: i32,
    status: String,
    worker_id: Option<String>,
    cancel_requested: bool,
    callback_status: String,
    callback_attempts: i32,
    callback_last_error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> QueueResult<Self> {
        let status = parse_status(&row.status)?;
        let callback_status = row
            .callback_status
            .parse()
            .map_err(|e: depot_core::Error| QueueError::Serialization(e.to_string()))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            release_id: row.release_id,
            service_id: row.service_id,
            project_id: row.project_id,
            source: SourceRef {
                git_repo: row.git_repo,
                git_sha: row.git_sha,
                git_branch: row.git_branch,
            },
            build_config: row.build_config.0,
            callback_url: row.callback_url,
            priority: row.priority,
            status,
            sequence: row.sequence as u64,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            worker_id: row.worker_id,
            cancel_requested: row.cancel_requested,
            callback: CallbackState {
                status: callback_status,
                attempts: row.callback_attempts.max(0) as u32,
                last_error: row.callback_last_error,
            },
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    line_offset: i64,
    stream: String,
    content: String,
    timestamp: DateTime<Utc>,
}

impl From<LogRow> for LogLine {
    fn from(row: LogRow) -> Self {
        LogLine {
            offset: row.line_offset as u64,
            timestamp: row.timestamp,
            stream: row.stream.parse().unwrap_or(LogStream::System),
            content: row.content,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WorkerRow {
    id: String,
    capacity: i32,
    active_jobs: i32,
    started_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl From<WorkerRow> for WorkerRegistration {
    fn from(row: WorkerRow) -> Self {
        WorkerRegistration {
            id: row.id,
            capacity: row.capacity.max(0) as u32,
            started_at: row.started_at,
            last_heartbeat: row.last_heartbeat,
            active_jobs: row.active_jobs.max(0) as u32,
        }
    }
}

fn parse_status(s: &str) -> QueueResult<JobStatus> {
    s.parse()
        .map_err(|e: depot_core::Error| QueueError::Serialization(e.to_string()))
}

/// Job queue backed by PostgreSQL.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool. Connection failures are reported as `Unavailable`.
    pub async fn connect(database_url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Distinguish a lost CAS from an unknown job after a conditional
    /// update matched no row.
    async fn conflict_for(&self, id: JobId, expected: JobStatus) -> QueueError {
        let current: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM build_jobs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await;

        match current {
            Ok(Some(status)) => match parse_status(&status) {
                Ok(actual) => QueueError::Conflict { expected, actual },
                Err(e) => e,
            },
            Ok(None) => QueueError::job_not_found(id),
            Err(e) => QueueError::Database(e),
        }
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(&self, job: NewJob) -> QueueResult<(Job, u64)> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO build_jobs (id, release_id, service_id, project_id, git_repo, git_sha,
                                    git_branch, build_config, callback_url, priority, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'queued', NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job.release_id)
        .bind(job.service_id)
        .bind(job.project_id)
        .bind(&job.source.git_repo)
        .bind(&job.source.git_sha)
        .bind(&job.source.git_branch)
        .bind(Json(&job.build_config))
        .bind(&job.callback_url)
        .bind(job.priority)
        .fetch_one(&mut *tx)
        .await?;

        let position: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM build_jobs WHERE status = 'queued'")
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok((Job::try_from(row)?, position.max(0) as u64))
    }

    async fn dequeue(&self, worker_id: &str) -> QueueResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE build_jobs
            SET status = 'building', worker_id = $1, started_at = NOW()
            WHERE id = (
                SELECT id FROM build_jobs
                WHERE status = 'queued'
                ORDER BY priority DESC, sequence ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let job = Job::try_from(row)?;
                debug!(job_id = %job.id, worker_id, "Dequeued job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait.min(Duration::from_secs(1))).await;
    }

    async fn get_job(&self, id: JobId) -> QueueResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM build_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| QueueError::job_not_found(id))?;
        Job::try_from(row)
    }

    async fn get_result(&self, id: JobId) -> QueueResult<Option<BuildResult>> {
        let result: Option<Option<Json<BuildResult>>> =
            sqlx::query_scalar("SELECT result FROM build_jobs WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        match result {
            Some(result) => Ok(result.map(|json| json.0)),
            None => Err(QueueError::job_not_found(id)),
        }
    }

    async fn update_status(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        result: Option<BuildResult>,
    ) -> QueueResult<Job> {
        if !from.can_transition_to(to) {
            return Err(QueueError::IllegalTransition { from, to });
        }

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE build_jobs
            SET status = $3,
                result = COALESCE($4, result),
                started_at = CASE WHEN $5 THEN NOW() ELSE started_at END,
                finished_at = CASE WHEN $6 THEN NOW() ELSE finished_at END,
                worker_id = CASE WHEN $6 THEN NULL ELSE worker_id END
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(result.map(Json))
        .bind(to == JobStatus::Building)
        .bind(to.is_terminal())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                info!(job_id = %id, from = %from, to = %to, "Job status updated");
                Job::try_from(row)
            }
            None => Err(self.conflict_for(id, from).await),
        }
    }

    async fn request_cancel(&self, id: JobId) -> QueueResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE build_jobs SET cancel_requested = TRUE
            WHERE id = $1 AND status = 'building'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Job::try_from(row),
            None => Err(self.conflict_for(id, JobStatus::Building).await),
        }
    }

    async fn cancel_requested(&self, id: JobId) -> QueueResult<bool> {
        sqlx::query_scalar("SELECT cancel_requested FROM build_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| QueueError::job_not_found(id))
    }

    async fn append_log(
        &self,
        id: JobId,
        stream: LogStream,
        content: String,
    ) -> QueueResult<LogLine> {
        // The row lock on build_jobs serializes writers, so offsets commit in order.
        let row = sqlx::query_as::<_, LogRow>(
            r#"
            WITH next AS (
                UPDATE build_jobs SET log_offset = log_offset + 1
                WHERE id = $1
                RETURNING log_offset
            )
            INSERT INTO build_logs (job_id, line_offset, stream, content, timestamp)
            SELECT $1, log_offset, $2, $3, NOW() FROM next
            RETURNING line_offset, stream, content, timestamp
            "#,
        )
        .bind(id.as_uuid())
        .bind(stream.as_str())
        .bind(&content)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| QueueError::job_not_found(id))?;

        Ok(row.into())
    }

    async fn stream_logs(
        &self,
        id: JobId,
        from_offset: u64,
    ) -> QueueResult<BoxStream<'static, LogLine>> {
        // Fail fast on unknown ids; the stream itself only polls.
        self.get_job(id).await?;

        let cursor = LogCursor {
            pool: self.pool.clone(),
            job_id: *id.as_uuid(),
            offset: i64::try_from(from_offset).unwrap_or(i64::MAX),
        };

        let stream = futures::stream::unfold(cursor, |mut cursor| async move {
            loop {
                // Status is read before the page: lines appended before the
                // terminal transition are always visible to the read that follows.
                let terminal = match cursor.is_terminal().await {
                    Ok(terminal) => terminal,
                    Err(e) => {
                        warn!(job_id = %cursor.job_id, error = %e, "Log stream poll failed");
                        return None;
                    }
                };

                let page = match cursor.next_page().await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(job_id = %cursor.job_id, error = %e, "Log stream poll failed");
                        return None;
                    }
                };

                if let Some(last) = page.last() {
                    cursor.offset = last.offset as i64;
                    return Some((page, cursor));
                }
                if terminal {
                    return None;
                }
                tokio::time::sleep(LOG_POLL_INTERVAL).await;
            }
        })
        .flat_map(futures::stream::iter)
        .boxed();

        Ok(stream)
    }

    async fn queue_length(&self) -> QueueResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM build_jobs WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM build_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY sequence DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM build_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(parse_status(&status)?, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn set_callback_state(&self, id: JobId, state: CallbackState) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE build_jobs
            SET callback_status = $2, callback_attempts = $3, callback_last_error = $4
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(state.status.as_str())
        .bind(i32::try_from(state.attempts).unwrap_or(i32::MAX))
        .bind(state.last_error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::job_not_found(id));
        }
        Ok(())
    }

    async fn register_worker(&self, registration: WorkerRegistration) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_workers (id, capacity, active_jobs, started_at, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET capacity = EXCLUDED.capacity,
                active_jobs = EXCLUDED.active_jobs,
                started_at = EXCLUDED.started_at,
                last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(&registration.id)
        .bind(i32::try_from(registration.capacity).unwrap_or(i32::MAX))
        .bind(i32::try_from(registration.active_jobs).unwrap_or(i32::MAX))
        .bind(registration.started_at)
        .bind(registration.last_heartbeat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, active_jobs: u32) -> QueueResult<()> {
        let result = sqlx::query(
            "UPDATE build_workers SET last_heartbeat = NOW(), active_jobs = $2 WHERE id = $1",
        )
        .bind(worker_id)
        .bind(i32::try_from(active_jobs).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(format!("worker {}", worker_id)));
        }
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> QueueResult<()> {
        sqlx::query("DELETE FROM build_workers WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_workers(&self) -> QueueResult<Vec<WorkerRegistration>> {
        let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM build_workers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn ping(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

struct LogCursor {
    pool: PgPool,
    job_id: Uuid,
    offset: i64,
}

impl LogCursor {
    async fn is_terminal(&self) -> QueueResult<bool> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM build_jobs WHERE id = $1")
                .bind(self.job_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(status) => Ok(parse_status(&status)?.is_terminal()),
            None => Ok(true),
        }
    }

    async fn next_page(&self) -> QueueResult<Vec<LogLine>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT line_offset, stream, content, timestamp FROM build_logs
            WHERE job_id = $1 AND line_offset > $2
            ORDER BY line_offset ASC
            LIMIT $3
            "#,
        )
        .bind(self.job_id)
        .bind(self.offset)
        .bind(LOG_PAGE_SIZE)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
