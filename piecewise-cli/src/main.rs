//! Piecewise CLI - scheduler simulation and planning
//!
//! Drives the piece scheduler against a deterministic fake engine so its
//! behaviour can be inspected without a real torrent.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use piecewise_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "piecewise")]
#[command(about = "Streaming-first piece scheduler for torrent downloads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
