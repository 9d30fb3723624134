//! Tally CLI
//!
//! Command-line tools for inspecting and repairing a Tally client store.
//!
//! # Commands
//!
//! - `inspect` - Display entity counts, mode, ledger and queue state
//! - `ledger` - List pending changes in replay order
//! - `retry-failed` - Put failed queue items back in line
//! - `reset` - Clear pending changes, and optionally all entities
//! - `compact` - Rewrite the store as a single snapshot

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tally client store tools.
#[derive(Parser)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics and sync state
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List pending changes in replay order
    Ledger {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Reset failed queue items so the next drain retries them
    RetryFailed,

    /// Clear pending changes and local entities
    Reset {
        /// Keep challenges, entries and follows; clear only pending changes
        #[arg(short, long)]
        keep_entities: bool,
    },

    /// Compact the store into a single snapshot
    Compact,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, format)?;
        }
        Commands::Ledger { format } => {
            let path = cli.path.ok_or("Store path required for ledger")?;
            commands::ledger::run(&path, format)?;
        }
        Commands::RetryFailed => {
            let path = cli.path.ok_or("Store path required for retry-failed")?;
            commands::retry::run(&path)?;
        }
        Commands::Reset { keep_entities } => {
            let path = cli.path.ok_or("Store path required for reset")?;
            commands::reset::run(&path, keep_entities)?;
        }
        Commands::Compact => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path)?;
        }
        Commands::Version => {
            println!("Tally CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
