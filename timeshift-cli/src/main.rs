//! Timeshift CLI - Command-line interface
//!
//! Plays a stream from a DVR backend through one of the buffering strategies,
//! or exercises a strategy against the in-process simulated DVR.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use timeshift_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "timeshift")]
#[command(about = "Timeshift buffering for a remote DVR backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// JSON configuration file; environment overrides are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full-trace log file
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let config = commands::load_config(cli.config.as_deref())?;
    commands::handle_command(cli.command, config).await
}
