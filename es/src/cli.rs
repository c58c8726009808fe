//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// EventSync - collector-driven event dispatch
#[derive(Parser)]
#[command(
    name = "es",
    about = "Collect model changes and dispatch them to event handlers",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run collectors and the dispatcher until interrupted
    Run {
        /// Poll each collector once, dispatch everything, then exit
        #[arg(long)]
        once: bool,
    },

    /// Validate config and show what would be loaded
    Check,
}

/// Path of the log file written by the binary
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eventsync")
        .join("logs")
        .join("eventsync.log")
}
