//! CLI argument parsing for objectstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "objectstore")]
#[command(author, version = env!("GIT_DESCRIBE"), about = "Inspect and edit objectstore slots", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Store directory (overrides the config file)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Debounce interval in milliseconds (overrides the config file)
    #[arg(long)]
    pub write_interval_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store a JSON value under a name
    Put {
        /// Store name
        #[arg(required = true)]
        name: String,

        /// JSON value to persist
        #[arg(required = true)]
        value: String,
    },

    /// Print the stored JSON value
    Get {
        /// Store name
        #[arg(required = true)]
        name: String,

        /// Print compact JSON instead of indented
        #[arg(long)]
        compact: bool,
    },

    /// Delete a stored value
    Clear {
        /// Store name
        #[arg(required = true)]
        name: String,
    },

    /// List stores that have a committed value
    List,

    /// Show file details for a store
    Info {
        /// Store name
        #[arg(required = true)]
        name: String,
    },
}
