//! Stats command - job counts per status

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, CellAlignment, Color, Table};

use meetq_queue::JobStatus;

use super::{open_queue, paint_status, StoreArgs};

/// Arguments for the stats command
#[derive(Args)]
pub struct StatsArgs {
    /// Output raw JSON (no formatting)
    #[arg(long)]
    pub json: bool,
}

/// Run the stats command
pub async fn run(store: &StoreArgs, args: StatsArgs) -> Result<()> {
    let queue = open_queue(store).await?;
    let stats = queue.stats().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{} {}", "Queue".bold(), queue.name().cyan().bold());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Jobs").fg(Color::Cyan),
        ]);

    for (status, count) in [
        (JobStatus::Pending, stats.pending),
        (JobStatus::Delayed, stats.delayed),
        (JobStatus::RetryScheduled, stats.retry_scheduled),
        (JobStatus::Active, stats.active),
        (JobStatus::Completed, stats.completed),
        (JobStatus::Failed, stats.failed),
    ] {
        table.add_row(vec![
            Cell::new(paint_status(status)),
            Cell::new(count).set_alignment(CellAlignment::Right),
        ]);
    }

    println!("{table}");
    println!();
    println!("{} {}", "Waiting:".bold(), stats.depth());
    Ok(())
}
