use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::model::{Job, JobStatus, NewJob, QueueStats};
use crate::jobs::store::{Failure, JobStore};

/// In-process job store.
///
/// Every operation runs under one lock, which gives the same guarantee the
/// skip-locked claim gives in Postgres: a job is claimed by at most one
/// caller. Jobs are kept in insertion order so ties on `run_at` resolve
/// oldest-first.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<Vec<Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job, oldest first.
    pub async fn all(&self) -> Vec<Job> {
        self.jobs.lock().await.clone()
    }

    /// Edit a stored job in place without going through the queue.
    /// Returns false if the id is unknown.
    pub async fn update_raw(&self, id: Uuid, f: impl FnOnce(&mut Job)) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }
}

fn clear_lock(job: &mut Job) {
    job.locked_at = None;
    job.locked_by = None;
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let job = Job {
            id: Uuid::new_v4(),
            job_type: job.job_type,
            status: JobStatus::Pending,
            payload: job.payload,
            result: None,
            attempts: 0,
            max_attempts: job.max_attempts,
            run_at: job.run_at,
            locked_at: None,
            locked_by: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().await.push(job.clone());
        Ok(job)
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;

        // min_by_key keeps the first of equal keys, i.e. the oldest insert.
        let candidate = jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now && j.locked_at.is_none())
            .min_by_key(|j| (j.run_at, j.created_at));

        Ok(candidate.map(|job| {
            job.status = JobStatus::Running;
            job.locked_at = Some(now);
            job.locked_by = Some(worker_id.to_string());
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == id).cloned())
    }

    async fn mark_done(
        &self,
        id: Uuid,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        Ok(jobs.iter_mut().find(|j| j.id == id).map(|job| {
            if job.status == JobStatus::Failed {
                return job.clone();
            }
            job.status = JobStatus::Done;
            job.result = Some(result);
            clear_lock(job);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn record_failure(
        &self,
        id: Uuid,
        failure: Failure<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        Ok(jobs.iter_mut().find(|j| j.id == id).map(|job| {
            if job.status != JobStatus::Running {
                return job.clone();
            }
            job.attempts += 1;
            match failure.retry_at {
                Some(retry_at) if job.attempts < job.max_attempts => {
                    job.status = JobStatus::Pending;
                    job.run_at = retry_at;
                }
                _ => job.status = JobStatus::Failed,
            }
            job.error = Some(failure.error.to_string());
            clear_lock(job);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn release_stale(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let mut released = 0;
        for job in jobs.iter_mut() {
            let stale = job.status == JobStatus::Running
                && job.locked_at.is_some_and(|at| at < locked_before);
            if stale {
                job.status = JobStatus::Pending;
                clear_lock(job);
                job.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats::default();
        for job in jobs.iter() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Done => stats.done += 1,
            }
        }
        Ok(stats)
    }
}
