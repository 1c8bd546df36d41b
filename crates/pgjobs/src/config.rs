use std::time::Duration;

use crate::jobs::retry::{BackoffConfig, RetryPolicy};
use crate::jobs::worker::{generate_worker_id, WorkerOptions};

/// Runtime configuration, loaded from the environment (and `.env`).
///
/// Every `PGJOBS_*` variable also accepts its unprefixed name as a fallback.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub stale_threshold: Duration,
    pub stale_sweep_interval: Duration,
    pub shutdown_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        Self::from_lookup(database_url, |key| std::env::var(key).ok())
    }

    /// Build a config from `lookup` instead of the process environment.
    pub fn from_lookup(
        database_url: String,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let var = |name: &str| {
            let primary = format!("PGJOBS_{name}");
            lookup(&primary)
                .filter(|s| !s.trim().is_empty())
                .or_else(|| lookup(name).filter(|s| !s.trim().is_empty()))
        };
        let millis = |name: &str, default: u64| -> anyhow::Result<Duration> {
            match var(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| anyhow::anyhow!("{name}={raw:?} is not a number of milliseconds: {e}")),
                None => Ok(Duration::from_millis(default)),
            }
        };

        let worker_id = var("WORKER_ID").unwrap_or_else(generate_worker_id);

        let concurrency = match var("CONCURRENCY") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("CONCURRENCY={raw:?}: {e}"))?
                .max(1),
            None => 1,
        };

        let retry_delay = millis("RETRY_DELAY_MS", 30_000)?;
        let retry_policy = match var("RETRY_BACKOFF").as_deref().map(str::trim) {
            None | Some("fixed") => RetryPolicy::Fixed(retry_delay),
            Some("exponential") => RetryPolicy::Exponential(BackoffConfig {
                base: retry_delay,
                ..BackoffConfig::default()
            }),
            Some(other) => anyhow::bail!("RETRY_BACKOFF must be fixed or exponential, got {other:?}"),
        };

        let db_max_connections = var("DB_MAX_CONNECTIONS")
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(4)
            .clamp(1, 32);

        let db_acquire_timeout_secs = var("DB_ACQUIRE_TIMEOUT_SECS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(10)
            .clamp(1, 60);

        Ok(Self {
            database_url,
            worker_id,
            poll_interval: millis("POLL_INTERVAL_MS", 5_000)?,
            concurrency,
            stale_threshold: millis("STALE_THRESHOLD_MS", 300_000)?,
            stale_sweep_interval: millis("STALE_SWEEP_INTERVAL_MS", 300_000)?,
            shutdown_timeout: millis("SHUTDOWN_TIMEOUT_MS", 30_000)?,
            retry_policy,
            admin_addr: var("ADMIN_ADDR").and_then(|s| normalize_optional_addr(&s)),
            migrate_on_startup: var("MIGRATE_ON_STARTUP")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            db_max_connections,
            db_acquire_timeout_secs,
        })
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            worker_id: self.worker_id.clone(),
            poll_interval: self.poll_interval,
            concurrency: self.concurrency,
            stale_threshold: self.stale_threshold,
            stale_sweep_interval: self.stale_sweep_interval,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
