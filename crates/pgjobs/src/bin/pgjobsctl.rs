use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use pgjobs::config::Config;
use pgjobs::{db, telemetry, EnqueueOptions, Queue};

/// Operator tool for the pgjobs queue.
///
/// Uses DATABASE_URL (or TEST_DATABASE_URL) like the worker does.
#[derive(Parser)]
#[command(name = "pgjobsctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending schema migrations.
    Migrate,
    /// Insert a job.
    Enqueue {
        job_type: String,
        /// JSON payload, e.g. '{"bookId": 42}'
        #[arg(default_value = "{}")]
        payload: String,
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long)]
        max_attempts: Option<i32>,
    },
    /// Print one job as JSON.
    Status { job_id: Uuid },
    /// Print job counts by status.
    Stats,
    /// Release locks older than the threshold.
    Sweep {
        #[arg(long, default_value_t = 300_000)]
        threshold_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let cli = Cli::parse();

    if std::env::var("DATABASE_URL").is_err() {
        if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
            std::env::set_var("DATABASE_URL", url);
        }
    }
    let cfg = Config::from_env()?;
    let pool = db::make_pool(&cfg).await?;
    let queue = Queue::postgres(pool.clone());

    match cli.command {
        Command::Migrate => {
            db::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Command::Enqueue {
            job_type,
            payload,
            delay_ms,
            max_attempts,
        } => {
            let payload: Value = serde_json::from_str(&payload)
                .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {e}"))?;
            let mut opts = EnqueueOptions::new();
            if let Some(ms) = delay_ms {
                opts = opts.delay(Duration::from_millis(ms));
            }
            if let Some(n) = max_attempts {
                opts = opts.max_attempts(n);
            }
            let job = queue.enqueue(&job_type, payload, opts).await?;
            println!("+ enqueued job {} id={} run_at={}", job.job_type, job.id, job.run_at);
        }
        Command::Status { job_id } => match queue.get_job_status(job_id).await? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => {
                eprintln!("job {job_id} not found");
                std::process::exit(1);
            }
        },
        Command::Stats => {
            let s = queue.get_queue_stats().await?;
            println!(
                "jobs: pending={} running={} done={} failed={}",
                s.pending, s.running, s.done, s.failed
            );
        }
        Command::Sweep { threshold_ms } => {
            let released = queue
                .cleanup_stale_locks(Duration::from_millis(threshold_ms))
                .await?;
            println!("released {released} stale locks");
        }
    }

    Ok(())
}
