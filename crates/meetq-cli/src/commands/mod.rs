//! CLI subcommands

pub mod enqueue;
pub mod stats;
pub mod status;

use anyhow::{Context, Result};
use clap::Args;
use colored::{ColoredString, Colorize};
use std::sync::Arc;
use tracing::debug;

use meetq_persist::{SqliteConfig, SqliteJobStore};
use meetq_queue::{EventBus, JobStatus, Queue, QueueConfig, RetryPolicies};

/// Where the jobs live
#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Job database
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "sqlite:meetq.db?mode=rwc",
        global = true
    )]
    pub database_url: String,

    /// Queue name
    #[arg(long, env = "QUEUE_NAME", default_value = "meeting-jobs", global = true)]
    pub queue: String,
}

/// Open the job database and wrap it in a queue handle.
pub async fn open_queue(args: &StoreArgs) -> Result<Queue> {
    // Same retry defaults as the server so max_attempts matches
    let config = QueueConfig::from_env().context("Invalid queue configuration")?;
    debug!(url = %args.database_url, queue = %args.queue, "Opening job store");

    let pool = meetq_persist::connect(&SqliteConfig::new(&args.database_url))
        .await
        .with_context(|| format!("Failed to open {}", args.database_url))?;
    let store = SqliteJobStore::with_policies(pool, RetryPolicies::new(config.retry_policy()));

    Ok(Queue::new(&args.queue, Arc::new(store), EventBus::default()))
}

pub fn paint_status(status: JobStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        JobStatus::Pending => label.yellow(),
        JobStatus::Delayed => label.blue(),
        JobStatus::Active => label.cyan(),
        JobStatus::Completed => label.green(),
        JobStatus::Failed => label.red().bold(),
        JobStatus::RetryScheduled => label.magenta(),
    }
}
