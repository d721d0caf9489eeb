//! CLI command definitions for the `parlor` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod admin;
pub mod user;

use clap::{Parser, Subcommand};

/// Operate a Parlor chat backend.
#[derive(Parser)]
#[command(name = "parlor", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending schema migrations.
    Migrate,

    /// Check that the database and the cache are reachable.
    Check,

    /// List registered users.
    #[command(alias = "ls")]
    Users,

    /// Show a user's recent questions and answers, oldest first.
    History {
        /// User id.
        user_id: i64,

        /// Number of exchanges to show (defaults to `history_window`).
        #[arg(long, short)]
        limit: Option<u32>,
    },
}
