//! meetq CLI - enqueue and inspect background jobs
//!
//! # Usage
//!
//! ```bash
//! # Queue a transcription
//! meetq enqueue transcribe-audio '{"recording_id": "rec-42"}'
//!
//! # Hold a job back for ten minutes
//! meetq enqueue generate-summary '{"transcript_id": "tr-9"}' --delay-secs 600
//!
//! # Inspect a job
//! meetq status 3f0c9a7e-1d2b-4c5e-8f90-123456789abc
//!
//! # Queue depth per status
//! meetq stats
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;

use commands::{enqueue, stats, status, StoreArgs};

/// meetq - background jobs for meeting recordings
#[derive(Parser)]
#[command(
    name = "meetq",
    version,
    about = "meetq CLI - enqueue and inspect background jobs",
    long_about = "Talks directly to the job database used by meetq-server.\n\n\
                  Jobs enqueued here are picked up by any running server\n\
                  that has a handler for the job type."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job to the queue
    #[command(name = "enqueue")]
    Enqueue(enqueue::EnqueueArgs),

    /// Show a single job
    #[command(name = "status")]
    Status(status::StatusArgs),

    /// Show job counts per status
    #[command(name = "stats")]
    Stats(stats::StatsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Before parsing so .env values can feed clap's env defaults
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Enqueue(args) => enqueue::run(&cli.store, args).await,
        Commands::Status(args) => status::run(&cli.store, args).await,
        Commands::Stats(args) => stats::run(&cli.store, args).await,
    };

    if let Err(e) = result {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message with an X
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}
