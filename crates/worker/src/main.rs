use pgjobs::admin::{self, AdminState};
use pgjobs::config;
use pgjobs::db;
use pgjobs::jobs::{JobRunner, Queue, Worker};
use pgjobs::telemetry;

use anyhow::Context as _;
use tracing::{error, info};

mod handlers;
use handlers::build_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let cfg = config::Config::from_env()?;

    info!(
        worker_id = %cfg.worker_id,
        concurrency = cfg.concurrency,
        poll_interval_ms = cfg.poll_interval.as_millis() as u64,
        stale_threshold_ms = cfg.stale_threshold.as_millis() as u64,
        retry_policy = ?cfg.retry_policy,
        admin = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "pgjobs worker starting"
    );

    let pool = db::make_pool(&cfg).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let queue = Queue::postgres(pool.clone());
    let runner =
        JobRunner::new(queue.clone(), build_registry()).with_retry_policy(cfg.retry_policy.clone());
    let worker = Worker::new(runner, cfg.worker_options());

    // ---- Admin API task ----
    let api_handle = cfg.admin_addr.clone().map(|addr| {
        let app = admin::router(AdminState {
            queue: queue.clone(),
        });
        tokio::spawn(async move {
            if let Err(e) = serve_admin(&addr, app).await {
                error!(addr = %addr, error = %format!("{e:#}"), "admin api stopped");
            }
        })
    });

    worker.start().await;

    shutdown_signal().await;
    info!("shutdown signal received");

    if !worker.stop().await {
        error!("exiting with jobs still in flight; they will be recovered by the stale lock sweep");
    }
    if let Some(handle) = api_handle {
        handle.abort();
    }

    Ok(())
}

async fn serve_admin(addr: &str, app: axum::Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding admin api to {addr}"))?;
    info!("admin api listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
