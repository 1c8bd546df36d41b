use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::model::Job;
use crate::jobs::queue::DEFAULT_STALE_THRESHOLD;
use crate::jobs::runner::JobRunner;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Recorded as `locked_by` on every job this worker claims.
    pub worker_id: String,
    pub poll_interval: Duration,
    /// Maximum number of jobs executing at once in this worker.
    pub concurrency: usize,
    pub stale_threshold: Duration,
    pub stale_sweep_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            poll_interval: Duration::from_millis(5_000),
            concurrency: 1,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            stale_sweep_interval: Duration::from_secs(5 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// `<host>-<pid>-<random>`, unique per process.
pub fn generate_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

struct Shared {
    running: AtomicBool,
    /// Number of in-flight jobs. Shutdown waits on this reaching zero.
    active: watch::Sender<usize>,
}

/// Keeps a job counted in `active` until dropped, however its task ends.
struct ActiveGuard {
    shared: Arc<Shared>,
}

impl ActiveGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.active.send_modify(|n| *n += 1);
        Self { shared }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.shared.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct Loops {
    cancel: CancellationToken,
    poll: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

/// Claims jobs from the queue and runs up to `concurrency` of them at once.
///
/// Many workers, in one process or many, can share a queue; they coordinate
/// only through the queue's claim.
pub struct Worker {
    runner: JobRunner,
    options: WorkerOptions,
    shared: Arc<Shared>,
    loops: Mutex<Option<Loops>>,
}

impl Worker {
    pub fn new(runner: JobRunner, mut options: WorkerOptions) -> Self {
        options.concurrency = options.concurrency.max(1);
        let (active, _) = watch::channel(0);
        Self {
            runner,
            options,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                active,
            }),
            loops: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.options.worker_id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn active_jobs(&self) -> usize {
        *self.shared.active.borrow()
    }

    /// Start polling. Calling this on a running worker only logs.
    pub async fn start(&self) {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            info!(worker_id = %self.options.worker_id, "worker already running");
            return;
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let poller = self.poller();
        let poll = tokio::spawn(poller.clone().poll_loop(cancel.clone()));
        let sweep = tokio::spawn(poller.sweep_loop(cancel.clone()));

        info!(
            worker_id = %self.options.worker_id,
            concurrency = self.options.concurrency,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            handlers = ?self.runner.registry().registered_types(),
            "worker started"
        );

        *loops = Some(Loops {
            cancel,
            poll,
            sweep,
        });
    }

    /// Stop claiming jobs and wait up to `shutdown_timeout` for in-flight
    /// jobs to finish. Returns false if jobs were still running at the
    /// deadline; those are left to another worker's stale-lock sweep.
    pub async fn stop(&self) -> bool {
        let Some(loops) = self.loops.lock().await.take() else {
            return true;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        loops.cancel.cancel();
        info!(
            worker_id = %self.options.worker_id,
            active_jobs = self.active_jobs(),
            "worker stopping"
        );

        let deadline = Instant::now() + self.options.shutdown_timeout;
        let mut active = self.shared.active.subscribe();
        let drained = time::timeout_at(deadline, async {
            // The poll loop has to be gone before counting, or it could
            // still dispatch a job it was claiming.
            let _ = loops.poll.await;
            let _ = loops.sweep.await;
            let _ = active.wait_for(|n| *n == 0).await.map(|_| ());
        })
        .await
        .is_ok();

        if drained {
            info!(worker_id = %self.options.worker_id, "worker stopped");
        } else {
            warn!(
                worker_id = %self.options.worker_id,
                active_jobs = self.active_jobs(),
                timeout_ms = self.options.shutdown_timeout.as_millis() as u64,
                "shutdown timed out with jobs still running"
            );
        }
        drained
    }

    /// Run one poll tick by hand. Returns the number of jobs dispatched.
    pub async fn tick(&self) -> Result<usize> {
        self.poller().tick().await
    }

    fn poller(&self) -> Poller {
        Poller {
            runner: self.runner.clone(),
            options: self.options.clone(),
            shared: self.shared.clone(),
        }
    }
}

#[derive(Clone)]
struct Poller {
    runner: JobRunner,
    options: WorkerOptions,
    shared: Arc<Shared>,
}

impl Poller {
    async fn poll_loop(self, cancel: CancellationToken) {
        loop {
            if let Err(err) = self.tick().await {
                error!(worker_id = %self.options.worker_id, error = %err, "poll tick failed");
            }

            // The next tick is scheduled after this one finishes, so a slow
            // dequeue delays polling instead of piling ticks up.
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(self.options.poll_interval) => {}
            }
        }
        debug!(worker_id = %self.options.worker_id, "poll loop exited");
    }

    async fn tick(&self) -> Result<usize> {
        let available = self
            .options
            .concurrency
            .saturating_sub(*self.shared.active.borrow());

        let mut dispatched = 0;
        for _ in 0..available {
            match self.runner.queue().dequeue(&self.options.worker_id).await? {
                Some(job) => {
                    self.dispatch(job);
                    dispatched += 1;
                }
                // queue is empty; don't hammer it
                None => break,
            }
        }
        Ok(dispatched)
    }

    fn dispatch(&self, job: Job) {
        let guard = ActiveGuard::new(self.shared.clone());
        let runner = self.runner.clone();
        let worker_id = self.options.worker_id.clone();

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = runner.execute_job(&job).await {
                error!(
                    worker_id = %worker_id,
                    job_id = %job.id,
                    error = %err,
                    "failed to record job outcome; the job will be recovered by the stale lock sweep"
                );
            }
        });
    }

    async fn sweep_loop(self, cancel: CancellationToken) {
        let period = self.options.stale_sweep_interval.max(Duration::from_millis(1));
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self
                        .runner
                        .queue()
                        .cleanup_stale_locks(self.options.stale_threshold)
                        .await
                    {
                        error!(worker_id = %self.options.worker_id, error = %err, "stale lock sweep failed");
                    }
                }
            }
        }
    }
}
