//! A durable job queue on PostgreSQL.
//!
//! Producers call [`Queue::enqueue`]. Any number of [`Worker`]s, in any
//! number of processes, poll the same `jobs` table; a job is claimed with
//! `SELECT ... FOR UPDATE SKIP LOCKED` so no two workers run it at once.
//! Failed jobs are retried after a delay until `max_attempts` is used up,
//! and jobs left locked by a crashed worker are returned to `pending` by the
//! stale-lock sweep. Delivery is at-least-once.

pub mod admin;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{QueueError, Result};
pub use jobs::{
    handler_fn, EnqueueOptions, ExecutionOutcome, HandlerRegistry, Job, JobHandler, JobRunner,
    JobStatus, MemoryJobStore, Queue, QueueStats, RetryPolicy, Worker, WorkerOptions,
};
