//! Postgres-backed job queue.
//!
//! Jobs live in the `jobs` table of the queue database. Claims use
//! `FOR UPDATE SKIP LOCKED` so several worker processes can share one queue
//! without handing the same job to two of them.
//!
//! A claim holds a lease measured from `updated_at`. Before claiming, rows
//! still `running` past their lease are failed as retryable, which hands a
//! crashed worker's job to the retry policy instead of stranding it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{instrument, warn};

use super::queue::{JobQueue, QueueError, DEFAULT_LEASE, LEASE_EXPIRED};
use super::types::{Job, JobFailure, JobId, JobStatus, RetryPolicy};
use crate::config::DbConfig;

const QUEUE_SCHEMA: &str = include_str!("../../schema/queue.sql");

const JOB_COLUMNS: &str =
    "id, type, payload, priority, status, attempt, last_error, scheduled_at, created_at, updated_at";

/// Postgres-backed job queue.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    retry_policy: RetryPolicy,
    lease: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, retry_policy: RetryPolicy) -> Self {
        Self {
            pool,
            retry_policy,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Connect to the queue database.
    #[instrument(skip_all, fields(host = %config.host, db = %config.database), err)]
    pub async fn connect(config: &DbConfig, retry_policy: RetryPolicy) -> Result<Self, QueueError> {
        PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(config.connect_options())
            .await
            .map(|pool| Self::new(pool, retry_policy))
            .map_err(|e| storage("connect", e))
    }

    /// Create the `jobs` table if it does not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(QUEUE_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("ensure_schema", e))?;
        Ok(())
    }

    /// Fail every `job_type` row whose claim outlived the lease.
    #[instrument(skip(self), err)]
    async fn expire_leases(&self, job_type: &str) -> Result<u64, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage("expire_leases", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE type = $1
              AND status = 'running'
              AND updated_at <= NOW() - make_interval(secs => $2)
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(job_type)
        .bind(self.lease.as_secs_f64())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| storage("expire_leases", e))?;

        let lapsed = JobFailure::retryable(LEASE_EXPIRED);
        for row in &rows {
            let mut job = job_from_row(row)?;
            job.mark_failed(&lapsed, &self.retry_policy);
            store_failure(&mut *tx, &job, &lapsed.message)
                .await
                .map_err(|e| storage("expire_leases", e))?;
            warn!(job_id = %job.id, attempt = job.attempt, status = job.status.as_str(), "claim lease expired");
        }

        tx.commit().await.map_err(|e| storage("expire_leases", e))?;
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let res = sqlx::query(
            r#"
            INSERT INTO jobs (id, type, payload, priority, status, attempt, scheduled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(i32::try_from(job.attempt).unwrap_or(i32::MAX))
        .bind(job.scheduled_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(job.id),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(QueueError::AlreadyExists(job.id))
            }
            Err(e) => Err(storage("enqueue", e)),
        }
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, job_type: &str, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.expire_leases(job_type).await?;

        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'running', attempt = attempt + 1, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE type = $1
                  AND status IN ('pending', 'failed')
                  AND (scheduled_at IS NULL OR scheduled_at <= NOW())
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let rows = sqlx::query(&query)
            .bind(job_type)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("claim", e))?;

        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery order.
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(jobs)
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', scheduled_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| storage("complete", e))?;

        if res.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self, failure), fields(kind = ?failure.kind), err)]
    async fn fail(&self, job_id: JobId, failure: &JobFailure) -> Result<JobStatus, QueueError> {
        let mut tx = self.pool.begin().await.map_err(|e| storage("fail", e))?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
            .bind(job_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| storage("fail", e))?
            .ok_or(QueueError::NotFound(job_id))?;

        let mut job = job_from_row(&row)?;
        job.mark_failed(failure, &self.retry_policy);
        store_failure(&mut *tx, &job, &failure.message)
            .await
            .map_err(|e| storage("fail", e))?;

        tx.commit().await.map_err(|e| storage("fail", e))?;
        Ok(job.status)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

async fn store_failure(conn: &mut PgConnection, job: &Job, message: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2, last_error = $3, scheduled_at = $4, updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(job.id.0)
    .bind(job.status.as_str())
    .bind(message)
    .bind(job.scheduled_at)
    .bind(job.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn job_from_row(row: &PgRow) -> Result<Job, QueueError> {
    let decode = |e: sqlx::Error| storage("decode_job", e);

    let status: String = row.try_get("status").map_err(decode)?;
    let attempt: i32 = row.try_get("attempt").map_err(decode)?;
    let attempt = u32::try_from(attempt).unwrap_or(0);
    let last_error: Option<String> = row.try_get("last_error").map_err(decode)?;
    let status = JobStatus::from_stored(&status, last_error, attempt)
        .ok_or_else(|| QueueError::Storage(format!("unknown job status '{status}'")))?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        job_type: row.try_get("type").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
        priority: row.try_get("priority").map_err(decode)?,
        status,
        attempt,
        scheduled_at: row
            .try_get::<Option<DateTime<Utc>>, _>("scheduled_at")
            .map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn storage(operation: &str, err: sqlx::Error) -> QueueError {
    QueueError::Storage(format!("{operation}: {err}"))
}
