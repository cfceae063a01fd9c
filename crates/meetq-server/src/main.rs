//! meetq Server - runs the worker pool and the cron scheduler
//!
//! Reads its configuration from the environment (optionally a `.env` file),
//! processes jobs from the SQLite store until SIGINT/SIGTERM, then drains
//! in-flight jobs for the configured grace period.

mod cleanup;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use meetq_persist::{SqliteConfig, SqliteJobStore};
use meetq_queue::{
    EventBus, JobEventKind, JobStore, Queue, QueueConfig, RetryPolicies, Scheduler, WorkerPool,
};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }

    let config = QueueConfig::from_env().context("Invalid queue configuration")?;
    info!(
        queue = %config.queue_name,
        concurrency = config.concurrency,
        database = %config.database_url,
        "Starting meetq server"
    );

    let pool = meetq_persist::connect(&SqliteConfig::new(&config.database_url))
        .await
        .context("Failed to open job store")?;
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::with_policies(
        pool.clone(),
        RetryPolicies::new(config.retry_policy()),
    ));

    let events = EventBus::default();
    let queue = Queue::new(&config.queue_name, store.clone(), events.clone());
    let logger = spawn_event_logger(events.subscribe());

    let mut workers = WorkerPool::new(queue.clone(), config.worker_config());
    cleanup::register(&mut workers, store.clone(), &config);
    let workers = workers.start().map_err(|e| {
        error!("Failed to start worker pool: {}", e);
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = Scheduler::new(queue.clone()).with_tick(config.scheduler_tick());
    scheduler.add(cleanup::schedule(&config).context("Invalid CLEANUP_CRON_SCHEDULE")?);
    let scheduler = scheduler.start(shutdown_rx);

    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        error!(error = ?e, "Scheduler task panicked");
    }
    let abandoned = workers.shutdown().await;
    if abandoned > 0 {
        warn!(abandoned, "Jobs left active; they will be retried once their lease expires");
    }

    logger.abort();
    pool.close().await;
    info!("meetq server stopped");
    Ok(())
}

/// Log every job lifecycle event.
fn spawn_event_logger(mut rx: broadcast::Receiver<meetq_queue::JobEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match event.kind {
                    JobEventKind::Failed => warn!(
                        target: "meetq::events",
                        job_id = %event.job_id,
                        job_type = %event.job_type,
                        attempts = event.attempts,
                        error = event.error.as_deref().unwrap_or_default(),
                        "job failed"
                    ),
                    JobEventKind::Retried => info!(
                        target: "meetq::events",
                        job_id = %event.job_id,
                        job_type = %event.job_type,
                        attempts = event.attempts,
                        error = event.error.as_deref().unwrap_or_default(),
                        "job retry scheduled"
                    ),
                    kind => info!(
                        target: "meetq::events",
                        job_id = %event.job_id,
                        job_type = %event.job_type,
                        status = %event.status,
                        ?kind,
                        "job event"
                    ),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Initialize tracing subscriber; `LOG_FORMAT=json` switches to JSON lines
fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meetq_queue=debug"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}
