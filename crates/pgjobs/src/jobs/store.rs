use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::model::{Job, NewJob, QueueStats};

/// How a failed attempt should be recorded.
#[derive(Debug, Clone, Copy)]
pub struct Failure<'a> {
    pub error: &'a str,
    /// `Some` asks for a retry at that instant if the attempt budget allows
    /// it. `None` fails the job for good.
    pub retry_at: Option<DateTime<Utc>>,
}

/// The durable table of jobs and the atomic operations over it.
///
/// Every method is a single atomic step against the store. Callers pass
/// `now` so that all time comparisons use one clock.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job>;

    /// Claim the oldest eligible job (`pending`, `run_at <= now`, unlocked)
    /// for `worker_id`, marking it `running`.
    ///
    /// Rows being claimed by a concurrent caller are skipped, never waited
    /// on, and a row is handed to at most one caller.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Set `done`, store `result`, clear the lock. A `failed` job is returned
    /// unchanged. `None` if the id is unknown.
    async fn mark_done(&self, id: Uuid, result: Value, now: DateTime<Utc>)
        -> Result<Option<Job>>;

    /// Increment `attempts`, record the error and clear the lock. The job
    /// goes back to `pending` at `retry_at` when one is given and the new
    /// attempt count is still below `max_attempts`; otherwise it is `failed`
    /// and `run_at` is left alone.
    ///
    /// Only a `running` job takes the failure. Any other job is returned
    /// unchanged, so a late report from a worker whose lock was swept can't
    /// reopen a finished job or push `attempts` past `max_attempts`. `None`
    /// if the id is unknown.
    async fn record_failure(
        &self,
        id: Uuid,
        failure: Failure<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Return every `running` job locked before `locked_before` to `pending`
    /// without touching `attempts`. Returns the number of jobs released.
    async fn release_stale(&self, locked_before: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<u64>;

    async fn stats(&self) -> Result<QueueStats>;
}

pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = add_duration(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `at + by`, saturating at the largest representable instant.
pub fn add_duration(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - by`, saturating at the smallest representable instant.
pub fn sub_duration(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis)
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_clones_share_time() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();

        other.advance(Duration::from_secs(30));

        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));

        clock.set(start);
        assert_eq!(other.now(), start);
    }

    #[test]
    fn duration_math_saturates() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(add_duration(start, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(sub_duration(start, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            sub_duration(start, Duration::from_millis(1500)),
            start - chrono::Duration::milliseconds(1500)
        );
    }
}
