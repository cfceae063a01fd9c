//! Enqueue command - add a job to the queue
//!
//! Usage:
//! ```bash
//! meetq enqueue process-recording '{"recording_id": "rec-42"}'
//! meetq enqueue cleanup-old-files --dedup-key manual-cleanup
//! ```

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::time::Duration;

use meetq_queue::{EnqueueOptions, JobType, QueueError};

use super::{open_queue, StoreArgs};
use crate::{print_success, print_warning};

/// Arguments for the enqueue command
#[derive(Args)]
pub struct EnqueueArgs {
    /// Job type (process-recording, transcribe-audio, generate-summary, cleanup-old-files)
    pub job_type: String,

    /// JSON payload passed to the handler
    #[arg(default_value = "{}")]
    pub payload: String,

    /// Seconds before the job becomes claimable
    #[arg(long)]
    pub delay_secs: Option<u64>,

    /// Override the default attempt ceiling
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Refuse if a live job already carries this key
    #[arg(long)]
    pub dedup_key: Option<String>,

    /// Print only the job id
    #[arg(long)]
    pub quiet: bool,
}

/// Run the enqueue command
pub async fn run(store: &StoreArgs, args: EnqueueArgs) -> Result<()> {
    let job_type: JobType = args.job_type.parse()?;
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("Payload is not valid JSON")?;

    let mut options = EnqueueOptions::default();
    if let Some(secs) = args.delay_secs {
        options = options.with_delay(Duration::from_secs(secs));
    }
    if let Some(max) = args.max_attempts {
        options = options.with_max_attempts(max);
    }
    if let Some(key) = args.dedup_key {
        options = options.with_dedup_key(key);
    }

    let queue = open_queue(store).await?;
    match queue.enqueue_value(job_type, payload, options).await {
        Ok(id) if args.quiet => println!("{}", id),
        Ok(id) => {
            let job = queue.get(id).await?;
            print_success(&format!(
                "Enqueued {} job {} on {} ({})",
                job_type.to_string().bold(),
                id.to_string().cyan(),
                queue.name(),
                super::paint_status(job.status)
            ));
        }
        Err(QueueError::Duplicate { dedup_key, existing }) => {
            print_warning(&format!(
                "Job {} with dedup key '{}' is still in flight, nothing enqueued",
                existing, dedup_key
            ));
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
