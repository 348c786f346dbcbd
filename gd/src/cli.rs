//! Command-line interface definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Background worker for asynchronous image-generation tasks
#[derive(Debug, Parser)]
#[command(name = "gd", version, about)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker loop (default)
    Run {
        /// Run a single iteration and exit
        #[arg(long)]
        once: bool,
    },

    /// Show task counts per status
    Status,

    /// Delete aged-out terminal tasks
    Cleanup {
        /// Age threshold in days (defaults to store.max-age-days)
        #[arg(long)]
        days: Option<u32>,
    },
}
