use async_trait::async_trait;
use serde_json::Value;
use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::jobs::model::Job;
use crate::jobs::queue::Queue;
use crate::jobs::retry::RetryPolicy;

/// Application logic for one job type.
///
/// Handlers run at least once per job and may run again after a crash or a
/// stale-lock sweep, so their side effects must be safe to repeat.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn job_type(&self) -> &str;

    async fn handle(&self, payload: &Value, job: &Job) -> anyhow::Result<Value>;
}

/// A `JobHandler` backed by a closure. See [`handler_fn`].
pub struct FnHandler<F> {
    job_type: String,
    f: F,
}

/// Wrap `f(payload, job)` as a handler for `job_type`.
pub fn handler_fn<F, Fut>(job_type: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Value, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler {
        job_type: job_type.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn handle(&self, payload: &Value, job: &Job) -> anyhow::Result<Value> {
        (self.f)(payload.clone(), job.clone()).await
    }
}

/// Handlers keyed by job type. Registration may happen while workers run.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its job type, returning the handler it
    /// replaced, if any.
    pub fn register(&self, handler: impl JobHandler) -> Option<Arc<dyn JobHandler>> {
        let job_type = handler.job_type().to_string();
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type.clone(), Arc::new(handler));

        if previous.is_some() {
            warn!(job_type = %job_type, "handler re-registered; previous handler replaced");
        } else {
            debug!(job_type = %job_type, "handler registered");
        }
        previous
    }

    pub fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded { result: Value, elapsed: Duration },
    Failed { error: String, elapsed: Duration },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            ExecutionOutcome::Succeeded { result, .. } => Some(result),
            ExecutionOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Succeeded { .. } => None,
            ExecutionOutcome::Failed { error, .. } => Some(error),
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            ExecutionOutcome::Succeeded { elapsed, .. } | ExecutionOutcome::Failed { elapsed, .. } => {
                *elapsed
            }
        }
    }
}

/// Runs one claimed job through its handler and reports the outcome to the
/// queue.
#[derive(Clone)]
pub struct JobRunner {
    queue: Queue,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
}

impl JobRunner {
    pub fn new(queue: Queue, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            queue,
            registry,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Handler errors and panics become `Failed` outcomes; only store errors
    /// while recording the outcome are returned as `Err`.
    pub async fn execute_job(&self, job: &Job) -> Result<ExecutionOutcome> {
        let Some(handler) = self.registry.handler_for(&job.job_type) else {
            // No handler can appear for this job later in the run, so retrying is pointless.
            let error = format!("no handler registered for job type {:?}", job.job_type);
            warn!(job_id = %job.id, job_type = %job.job_type, "{error}");
            self.queue.fail_job_permanently(job.id, &error).await?;
            return Ok(ExecutionOutcome::Failed {
                error,
                elapsed: Duration::ZERO,
            });
        };

        let started = Instant::now();
        let task_job = job.clone();
        let joined =
            tokio::spawn(async move { handler.handle(&task_job.payload, &task_job).await }).await;
        let elapsed = started.elapsed();

        let outcome = match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(join_err) if join_err.is_panic() => {
                Err(format!("handler panicked: {}", panic_message(join_err.into_panic())))
            }
            Err(_) => Err("handler task was cancelled".to_string()),
        };

        match outcome {
            Ok(result) => {
                self.queue.complete_job(job.id, result.clone()).await?;
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "job succeeded"
                );
                Ok(ExecutionOutcome::Succeeded { result, elapsed })
            }
            Err(error) => {
                let delay = self.retry.delay_for(job.attempts + 1);
                let updated = self.queue.fail_job(job.id, &error, delay).await?;
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = updated.attempts,
                    max_attempts = updated.max_attempts,
                    status = %updated.status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %error,
                    "job failed"
                );
                Ok(ExecutionOutcome::Failed { error, elapsed })
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
