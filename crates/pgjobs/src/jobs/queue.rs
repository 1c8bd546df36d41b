use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::jobs::model::{EnqueueOptions, Job, NewJob, QueueStats, DEFAULT_MAX_ATTEMPTS};
use crate::jobs::repo::JobsRepo;
use crate::jobs::store::{add_duration, sub_duration, Clock, Failure, JobStore, SystemClock};

pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Retries are never scheduled at the failure instant itself.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Producer and consumer operations over a `JobStore`.
///
/// Cheap to clone; clones share the store and the clock.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl Queue {
    pub fn new(store: impl JobStore) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self::new(JobsRepo::new(pool))
    }

    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<Job> {
        let now = self.now();
        let max_attempts = opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts < 1 {
            return Err(QueueError::InvalidOptions(format!(
                "max_attempts must be at least 1, got {max_attempts}"
            )));
        }
        if job_type.trim().is_empty() {
            return Err(QueueError::InvalidOptions("job type must not be empty".into()));
        }

        let run_at = match (opts.run_at, opts.delay) {
            (Some(at), _) => at,
            (None, Some(delay)) => add_duration(now, delay),
            (None, None) => now,
        };

        let job = self
            .store
            .insert(
                NewJob {
                    job_type: job_type.to_string(),
                    payload,
                    run_at,
                    max_attempts,
                },
                now,
            )
            .await?;

        debug!(job_id = %job.id, job_type = %job.job_type, run_at = %job.run_at, "job enqueued");
        Ok(job)
    }

    pub async fn enqueue_now(&self, job_type: &str, payload: Value) -> Result<Job> {
        self.enqueue(job_type, payload, EnqueueOptions::new()).await
    }

    pub async fn enqueue_in(&self, job_type: &str, payload: Value, delay: Duration) -> Result<Job> {
        self.enqueue(job_type, payload, EnqueueOptions::new().delay(delay))
            .await
    }

    pub async fn enqueue_at(
        &self,
        job_type: &str,
        payload: Value,
        run_at: DateTime<Utc>,
    ) -> Result<Job> {
        self.enqueue(job_type, payload, EnqueueOptions::new().run_at(run_at))
            .await
    }

    // ----------------------------
    // Dequeue
    // ----------------------------

    /// Claim one eligible job for `worker_id`, or `None` when nothing is
    /// runnable right now.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>> {
        let job = self.store.claim_next(worker_id, self.now()).await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, job_type = %job.job_type, worker_id, "job claimed");
        }
        Ok(job)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    /// Mark the job `done` with `result`. Completing an already completed job
    /// rewrites the same state.
    pub async fn complete_job(&self, job_id: Uuid, result: Value) -> Result<Job> {
        self.store
            .mark_done(job_id, result, self.now())
            .await?
            .ok_or(QueueError::JobNotFound(job_id))
    }

    /// Record a failed attempt. The job is retried `retry_delay` from now
    /// while attempts remain, otherwise it ends `failed`.
    pub async fn fail_job(&self, job_id: Uuid, error: &str, retry_delay: Duration) -> Result<Job> {
        let now = self.now();
        let retry_at = add_duration(now, retry_delay.max(MIN_RETRY_DELAY));
        self.record_failure(
            job_id,
            Failure {
                error,
                retry_at: Some(retry_at),
            },
            now,
        )
        .await
    }

    /// Record a failed attempt and end the job `failed` whatever its
    /// remaining budget.
    pub async fn fail_job_permanently(&self, job_id: Uuid, error: &str) -> Result<Job> {
        self.record_failure(
            job_id,
            Failure {
                error,
                retry_at: None,
            },
            self.now(),
        )
        .await
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        failure: Failure<'_>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = self
            .store
            .record_failure(job_id, failure, now)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

        debug!(
            job_id = %job.id,
            status = %job.status,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            "job attempt failed"
        );
        Ok(job)
    }

    // ----------------------------
    // Maintenance + reads
    // ----------------------------

    /// Return jobs whose lock is older than `stale_threshold` to `pending`.
    pub async fn cleanup_stale_locks(&self, stale_threshold: Duration) -> Result<u64> {
        let now = self.now();
        let released = self
            .store
            .release_stale(sub_duration(now, stale_threshold), now)
            .await?;
        if released > 0 {
            info!(released, "released stale job locks");
        }
        Ok(released)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        self.store.stats().await
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.store.get(job_id).await
    }
}
