//! Command line argument parsing for the chatsearch CLI using clap.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::context::UserId;

/// chatsearch - local chat message search
#[derive(Parser, Debug, Clone)]
#[command(name = "chatsearch")]
#[command(about = "Per-user local full-text search over chat messages")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct ChatSearchArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Configuration file (JSON)
    #[arg(short, long, value_name = "CONFIG_FILE", env = "CHATSEARCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the user data directory
    #[arg(short = 'd', long, value_name = "DIR", env = "CHATSEARCH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl ChatSearchArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Index messages from a JSONL file
    Index(IndexArgs),

    /// Search a user's messages
    Search(SearchArgs),

    /// Read or update a user's config record
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Check free space on a path
    #[command(name = "check-space")]
    CheckSpace(CheckSpaceArgs),

    /// Show the state of a user's index
    Health(UserArgs),

    /// Rebuild a user's index from a JSONL backfill
    Rebuild(IndexArgs),

    /// Delete a user's index and config record
    Wipe(UserArgs),
}

/// Arguments naming a single user
#[derive(Parser, Debug, Clone)]
pub struct UserArgs {
    /// User id
    #[arg(value_name = "USER_ID")]
    pub user_id: UserId,
}

/// Arguments for indexing or rebuilding
#[derive(Parser, Debug, Clone)]
pub struct IndexArgs {
    /// User id
    #[arg(value_name = "USER_ID")]
    pub user_id: UserId,

    /// Message file, one JSON message per line
    #[arg(value_name = "MESSAGES_FILE")]
    pub messages_file: PathBuf,

    /// Messages per batch sent to the worker
    #[arg(short, long, default_value = "1000")]
    pub batch_size: usize,
}

/// Arguments for searching
#[derive(Parser, Debug, Clone)]
pub struct SearchArgs {
    /// User id
    #[arg(value_name = "USER_ID")]
    pub user_id: UserId,

    /// Query text
    #[arg(value_name = "QUERY")]
    pub query: String,

    /// Only messages from this sender
    #[arg(short, long)]
    pub sender: Option<String>,

    /// Earliest timestamp (RFC 3339, YYYY-MM-DD or epoch milliseconds)
    #[arg(long, value_parser = parse_timestamp)]
    pub from: Option<i64>,

    /// Latest timestamp (RFC 3339, YYYY-MM-DD or epoch milliseconds)
    #[arg(long, value_parser = parse_timestamp)]
    pub to: Option<i64>,

    /// Maximum number of results
    #[arg(short, long)]
    pub limit: Option<usize>,
}

/// Config subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print the user's config record
    Get(UserArgs),

    /// Create or update the user's config record
    Set(ConfigSetArgs),
}

/// Arguments for `config set`
#[derive(Parser, Debug, Clone)]
pub struct ConfigSetArgs {
    /// User id
    #[arg(value_name = "USER_ID")]
    pub user_id: UserId,

    /// Rotation id (may not decrease)
    #[arg(long)]
    pub rotation_id: Option<u64>,

    /// Record version (may not decrease)
    #[arg(long)]
    pub version: Option<u32>,

    /// Analyzer language
    #[arg(long)]
    pub language: Option<String>,
}

/// Arguments for the free-space check
#[derive(Parser, Debug, Clone)]
pub struct CheckSpaceArgs {
    /// Path to check; defaults to the user data directory
    #[arg(value_name = "PATH")]
    pub path: Option<PathBuf>,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable format
    Human,
    /// JSON format
    Json,
}

/// Parse a timestamp argument into epoch milliseconds.
pub fn parse_timestamp(value: &str) -> Result<i64, String> {
    if let Ok(millis) = value.parse::<i64>() {
        return Ok(millis);
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Ok(datetime.timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        && let Some(datetime) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(datetime.and_utc().timestamp_millis());
    }
    Err(format!("invalid timestamp: {value}"))
}
