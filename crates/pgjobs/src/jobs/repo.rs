// crates/pgjobs/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::jobs::model::{Job, JobStatus, NewJob, QueueStats};
use crate::jobs::store::{Failure, JobStore};

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    status: String,
    payload: Value,
    result: Option<Value>,
    attempts: i32,
    max_attempts: i32,
    run_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            status: row.status.parse()?,
            payload: row.payload,
            result: row.result,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            run_at: row.run_at,
            locked_at: row.locked_at,
            locked_by: row.locked_by,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_job(row: Option<JobRow>) -> Result<Option<Job>> {
    row.map(Job::try_from).transpose()
}

#[derive(FromRow)]
struct StatsRow {
    pending: i64,
    running: i64,
    failed: i64,
    done: i64,
}

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (
                id, job_type, status, payload, attempts, max_attempts,
                run_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&job.job_type)
        .bind(JobStatus::Pending.as_str())
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED inside one transaction.
    ///
    /// A second worker racing for the same row either skips it (still locked
    /// by our transaction) or, after commit, no longer sees it as pending.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let candidate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'pending'
              AND run_at <= $1
              AND locked_at IS NULL
            ORDER BY run_at ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let claimed = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'running',
                locked_at = $2,
                locked_by = $3,
                updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(claimed.try_into()?))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        into_job(row)
    }

    // A `failed` job stays failed; `done` and late completions of a swept
    // (`pending`) or re-claimed job are written. Rows left unchanged are
    // returned as they are so only unknown ids come back empty.
    async fn mark_done(
        &self,
        id: Uuid,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            WITH updated AS (
                UPDATE jobs
                SET status = 'done',
                    result = $2,
                    locked_at = NULL,
                    locked_by = NULL,
                    updated_at = $3
                WHERE id = $1
                  AND status <> 'failed'
                RETURNING *
            )
            SELECT * FROM updated
            UNION ALL
            SELECT * FROM jobs
            WHERE id = $1 AND NOT EXISTS (SELECT 1 FROM updated)
            "#,
        )
        .bind(id)
        .bind(result)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    // The retry-or-fail branch is evaluated against the row as it is locked
    // by this UPDATE, so concurrent failures can't both read the same count.
    // Only a `running` job takes a failure; a late report for a job that was
    // swept, finished or failed elsewhere returns the row untouched.
    async fn record_failure(
        &self,
        id: Uuid,
        failure: Failure<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            WITH updated AS (
                UPDATE jobs
                SET attempts = attempts + 1,
                    status = CASE
                        WHEN $3::timestamptz IS NOT NULL AND attempts + 1 < max_attempts
                            THEN 'pending'
                        ELSE 'failed'
                    END,
                    run_at = CASE
                        WHEN $3::timestamptz IS NOT NULL AND attempts + 1 < max_attempts
                            THEN $3::timestamptz
                        ELSE run_at
                    END,
                    error = $2,
                    locked_at = NULL,
                    locked_by = NULL,
                    updated_at = $4
                WHERE id = $1
                  AND status = 'running'
                RETURNING *
            )
            SELECT * FROM updated
            UNION ALL
            SELECT * FROM jobs
            WHERE id = $1 AND NOT EXISTS (SELECT 1 FROM updated)
            "#,
        )
        .bind(id)
        .bind(failure.error)
        .bind(failure.retry_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        into_job(row)
    }

    async fn release_stale(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                locked_at = NULL,
                locked_by = NULL,
                updated_at = $2
            WHERE status = 'running'
              AND locked_at IS NOT NULL
              AND locked_at < $1
            "#,
        )
        .bind(locked_before)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
              COUNT(*) FILTER (WHERE status = 'pending') AS pending,
              COUNT(*) FILTER (WHERE status = 'running') AS running,
              COUNT(*) FILTER (WHERE status = 'failed')  AS failed,
              COUNT(*) FILTER (WHERE status = 'done')    AS done
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.pending,
            running: row.running,
            failed: row.failed,
            done: row.done,
        })
    }
}
