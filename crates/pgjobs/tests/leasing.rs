// Postgres-backed claim and lock tests. Each test returns early when
// TEST_DATABASE_URL is not set.
mod common;

use chrono::{SubsecRound, Utc};
use common::setup_db;
use pgjobs::jobs::{EnqueueOptions, JobStatus, ManualClock, Queue};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// A Postgres queue on a manual clock. Whole milliseconds keep timestamps
/// exact through timestamptz.
fn pg_queue(pool: &PgPool) -> (Queue, ManualClock) {
    let clock = ManualClock::new(Utc::now().trunc_subsecs(3));
    let queue = Queue::postgres(pool.clone()).with_clock(clock.clone());
    (queue, clock)
}

async fn status_and_locked_by(pool: &PgPool, id: Uuid) -> (String, Option<String>) {
    sqlx::query_as::<_, (String, Option<String>)>(
        "SELECT status, locked_by FROM jobs WHERE id = $1",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[tokio::test]
#[serial]
async fn two_workers_never_claim_the_same_job() {
    let Some(pool) = setup_db().await else { return };
    let (queue, _clock) = pg_queue(&pool);

    queue.enqueue_now("parseBook", json!({ "bookId": 1 })).await.unwrap();

    let (a, b) = tokio::join!(queue.dequeue("worker-a"), queue.dequeue("worker-b"));
    let got_a = a.unwrap().is_some();
    let got_b = b.unwrap().is_some();

    assert!(
        got_a ^ got_b,
        "expected exactly one worker to claim the job, got_a={got_a}, got_b={got_b}"
    );

    let (locked_by, status): (Option<String>, String) =
        sqlx::query_as("SELECT locked_by, status FROM jobs LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "running");
    assert!(matches!(locked_by.as_deref(), Some("worker-a") | Some("worker-b")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn concurrent_claims_hand_out_each_job_once() {
    let Some(pool) = setup_db().await else { return };
    let (queue, _clock) = pg_queue(&pool);

    for i in 0..30 {
        queue.enqueue_now("count", json!({ "n": i })).await.unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..6 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{w}");
            let mut claimed = Vec::new();
            while let Some(job) = queue.dequeue(&worker_id).await.unwrap() {
                assert_eq!(job.locked_by.as_deref(), Some(worker_id.as_str()));
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 30);
    assert_eq!(unique.len(), 30);

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.running, 30);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
#[serial]
async fn claims_oldest_runnable_job_first() {
    let Some(pool) = setup_db().await else { return };
    let (queue, clock) = pg_queue(&pool);

    let later = queue.enqueue_now("later", json!({})).await.unwrap();
    clock.advance(Duration::from_millis(10));
    let future = queue
        .enqueue_in("future", json!({}), Duration::from_secs(60))
        .await
        .unwrap();
    let earlier = queue
        .enqueue(
            "earlier",
            json!({}),
            EnqueueOptions::new().run_at(later.run_at - chrono::Duration::seconds(5)),
        )
        .await
        .unwrap();

    let first = queue.dequeue("w").await.unwrap().unwrap();
    let second = queue.dequeue("w").await.unwrap().unwrap();
    assert_eq!(first.id, earlier.id);
    assert_eq!(second.id, later.id);
    assert!(queue.dequeue("w").await.unwrap().is_none());

    let (status, locked_by) = status_and_locked_by(&pool, future.id).await;
    assert_eq!(status, "pending");
    assert_eq!(locked_by, None);
}

#[tokio::test]
#[serial]
async fn delayed_job_is_not_claimed_before_run_at() {
    let Some(pool) = setup_db().await else { return };
    let (queue, clock) = pg_queue(&pool);

    let delayed = queue
        .enqueue_in("delayed", json!({}), Duration::from_secs(2))
        .await
        .unwrap();

    assert!(queue.dequeue("w").await.unwrap().is_none());

    clock.advance(Duration::from_secs(2));
    let claimed = queue.dequeue("w").await.unwrap().unwrap();
    assert_eq!(claimed.id, delayed.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.locked_at, Some(queue.now()));
}

#[tokio::test]
#[serial]
async fn stale_lock_is_released_and_reclaimed() {
    let Some(pool) = setup_db().await else { return };
    let (queue, clock) = pg_queue(&pool);

    let job = queue.enqueue_now("parseBook", json!({ "bookId": 7 })).await.unwrap();
    let a = queue.dequeue("worker-a").await.unwrap().unwrap();
    assert_eq!(a.id, job.id);

    // worker-a dies without reporting
    clock.advance(Duration::from_secs(301));
    let released = queue
        .cleanup_stale_locks(Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(released, 1);

    let (status, locked_by) = status_and_locked_by(&pool, job.id).await;
    assert_eq!(status, "pending");
    assert_eq!(locked_by, None);

    let b = queue.dequeue("worker-b").await.unwrap().unwrap();
    assert_eq!(b.id, job.id);
    assert_eq!(b.locked_by.as_deref(), Some("worker-b"));
    assert_eq!(b.attempts, 0);
}

#[tokio::test]
#[serial]
async fn fresh_locks_survive_the_sweep() {
    let Some(pool) = setup_db().await else { return };
    let (queue, clock) = pg_queue(&pool);

    let job = queue.enqueue_now("t", json!({})).await.unwrap();
    queue.dequeue("worker-a").await.unwrap().unwrap();

    clock.advance(Duration::from_secs(299));
    let released = queue
        .cleanup_stale_locks(Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(released, 0);

    let (status, locked_by) = status_and_locked_by(&pool, job.id).await;
    assert_eq!(status, "running");
    assert_eq!(locked_by.as_deref(), Some("worker-a"));
}

#[tokio::test]
#[serial]
async fn failures_retry_then_fail_for_good() {
    let Some(pool) = setup_db().await else { return };
    let (queue, clock) = pg_queue(&pool);

    let job = queue
        .enqueue("flaky", json!({}), EnqueueOptions::new().max_attempts(2))
        .await
        .unwrap();

    queue.dequeue("w").await.unwrap().unwrap();
    let failed_at = queue.now();
    let first = queue
        .fail_job(job.id, "boom 1", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(first.status, JobStatus::Pending);
    assert_eq!(first.attempts, 1);
    assert_eq!(first.run_at, failed_at + chrono::Duration::seconds(30));
    assert_eq!(first.locked_at, None);
    assert_eq!(first.locked_by, None);

    assert!(queue.dequeue("w").await.unwrap().is_none());
    clock.advance(Duration::from_secs(30));
    queue.dequeue("w").await.unwrap().unwrap();

    let second = queue
        .fail_job(job.id, "boom 2", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(second.status, JobStatus::Failed);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.error.as_deref(), Some("boom 2"));
    assert_eq!(second.run_at, first.run_at);
}

#[tokio::test]
#[serial]
async fn complete_and_permanent_failure_clear_the_lock() {
    let Some(pool) = setup_db().await else { return };
    let (queue, _clock) = pg_queue(&pool);

    let ok = queue.enqueue_now("ok", json!({})).await.unwrap();
    let bad = queue.enqueue_now("bad", json!({})).await.unwrap();
    queue.dequeue("w").await.unwrap().unwrap();
    queue.dequeue("w").await.unwrap().unwrap();

    let done = queue
        .complete_job(ok.id, json!({ "chaptersCount": 12 }))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.result, Some(json!({ "chaptersCount": 12 })));
    assert_eq!(done.locked_by, None);

    let failed = queue
        .fail_job_permanently(bad.id, "no handler")
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.locked_at, None);

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!((stats.done, stats.failed, stats.total()), (1, 1, 2));
}

#[tokio::test]
#[serial]
async fn unknown_ids_are_reported() {
    let Some(pool) = setup_db().await else { return };
    let (queue, _clock) = pg_queue(&pool);

    let id = Uuid::new_v4();
    assert!(queue.get_job_status(id).await.unwrap().is_none());
    assert!(matches!(
        queue.complete_job(id, json!(null)).await,
        Err(pgjobs::QueueError::JobNotFound(got)) if got == id
    ));
}

#[tokio::test]
#[serial]
async fn late_failure_after_sweep_and_reclaim_is_ignored() {
    let Some(pool) = setup_db().await else { return };
    let (queue, clock) = pg_queue(&pool);

    let job = queue
        .enqueue("t", json!({}), EnqueueOptions::new().max_attempts(1))
        .await
        .unwrap();
    queue.dequeue("slow-a").await.unwrap().unwrap();

    clock.advance(Duration::from_secs(301));
    assert_eq!(
        queue.cleanup_stale_locks(Duration::from_secs(300)).await.unwrap(),
        1
    );
    queue.dequeue("b").await.unwrap().unwrap();

    let after_b = queue
        .fail_job(job.id, "b failed", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(after_b.status, JobStatus::Failed);
    assert_eq!(after_b.attempts, 1);

    // slow-a reports after the job already failed for good; this used to
    // trip the attempts CHECK constraint
    let after_a = queue
        .fail_job(job.id, "a failed", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(after_a, after_b);
    assert_eq!(after_a.error.as_deref(), Some("b failed"));
}

#[tokio::test]
#[serial]
async fn late_outcomes_never_reopen_finished_jobs() {
    let Some(pool) = setup_db().await else { return };
    let (queue, _clock) = pg_queue(&pool);

    let ok = queue.enqueue_now("ok", json!({})).await.unwrap();
    let bad = queue.enqueue_now("bad", json!({})).await.unwrap();
    queue.dequeue("w").await.unwrap().unwrap();
    queue.dequeue("w").await.unwrap().unwrap();
    queue.complete_job(ok.id, json!({ "ok": 1 })).await.unwrap();
    queue.fail_job_permanently(bad.id, "no handler").await.unwrap();

    let ok_after = queue
        .fail_job(ok.id, "late", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(ok_after.status, JobStatus::Done);
    assert_eq!(ok_after.attempts, 0);
    assert_eq!(ok_after.result, Some(json!({ "ok": 1 })));

    let bad_after = queue.complete_job(bad.id, json!({ "ok": 1 })).await.unwrap();
    assert_eq!(bad_after.status, JobStatus::Failed);
    assert_eq!(bad_after.result, None);
    assert_eq!(bad_after.attempts, 1);

    assert!(queue.dequeue("w").await.unwrap().is_none());
    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!((stats.done, stats.failed, stats.pending), (1, 1, 0));
}
