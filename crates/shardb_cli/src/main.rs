//! shardb CLI
//!
//! Offline tools for shardb shards. Every command takes the shard lock, so
//! a shard that is open in another process is refused.
//!
//! # Commands
//!
//! - `inspect` - Display storages, views and log statistics
//! - `verify` - Check log digests and transaction ordering
//! - `dump-wal` - Dump log entries for debugging
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// shardb command-line shard tools.
#[derive(Parser)]
#[command(name = "shardb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the shard directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display storages, views and log statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check log digests and transaction ordering
    Verify {
        /// Also open the shard and rebuild every driver (discards a torn
        /// log tail)
        #[arg(long)]
        open: bool,
    },

    /// Dump log entries for debugging
    DumpWal {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Shard path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify { open } => {
            let path = cli.path.ok_or("Shard path required for verify")?;
            commands::verify::run(&path, open)?;
        }
        Commands::DumpWal { limit, format } => {
            let path = cli.path.ok_or("Shard path required for dump-wal")?;
            commands::dump_wal::run(&path, limit, &format)?;
        }
        Commands::Version => {
            println!("shardb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("shardb core v{}", shardb_core::VERSION);
        }
    }

    Ok(())
}
