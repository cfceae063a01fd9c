//! Status command - show a single job

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use uuid::Uuid;

use meetq_queue::JobEntry;

use super::{open_queue, paint_status, StoreArgs};

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {
    /// Job id
    pub id: String,

    /// Output raw JSON (no formatting)
    #[arg(long)]
    pub json: bool,
}

/// Run the status command
pub async fn run(store: &StoreArgs, args: StatusArgs) -> Result<()> {
    let id = Uuid::parse_str(args.id.trim()).context("Job id must be a UUID")?;
    let queue = open_queue(store).await?;
    let job = queue.get(id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("{}", render(&job));
    Ok(())
}

fn render(job: &JobEntry) -> Table {
    let time = |t: chrono::DateTime<chrono::Utc>| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Field").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    let mut row = |field: &str, value: String| {
        table.add_row(vec![Cell::new(field), Cell::new(value)]);
    };
    row("id", job.id.to_string());
    row("queue", job.queue.clone());
    row("type", job.job_type.to_string());
    row("status", paint_status(job.status).to_string());
    row("attempts", format!("{} / {}", job.attempts, job.max_attempts));
    row("available at", time(job.available_at));
    row("created at", time(job.created_at));
    row("updated at", time(job.updated_at));
    if let Some(worker) = &job.locked_by {
        row("locked by", worker.clone());
    }
    if let Some(lease) = job.lease_expires_at {
        row("lease expires", time(lease));
    }
    if let Some(key) = &job.dedup_key {
        row("dedup key", key.clone());
    }
    if let Some(err) = &job.last_error {
        row("last error", err.clone());
    }
    row("payload", job.payload.to_string());

    table
}
