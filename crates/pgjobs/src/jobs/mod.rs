pub mod memory;
pub mod model;
pub mod queue;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod store;
pub mod worker;

pub use memory::MemoryJobStore;
pub use model::{EnqueueOptions, Job, JobStatus, NewJob, QueueStats, DEFAULT_MAX_ATTEMPTS};
pub use queue::{Queue, DEFAULT_STALE_THRESHOLD};
pub use repo::JobsRepo;
pub use retry::{BackoffConfig, RetryPolicy, DEFAULT_RETRY_DELAY};
pub use runner::{handler_fn, ExecutionOutcome, FnHandler, HandlerRegistry, JobHandler, JobRunner};
pub use store::{Clock, Failure, JobStore, ManualClock, SystemClock};
pub use worker::{generate_worker_id, Worker, WorkerOptions};
