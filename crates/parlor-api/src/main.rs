//! Parlor operator CLI entry point.
//!
//! Binary name: `parlor`
//!
//! Parses CLI arguments, opens the database and cache, dispatches to the
//! command handler and closes both again on the way out.

mod cli;
mod state;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity; RUST_LOG wins when set.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,parlor_core=debug,parlor_infra=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Migrate => cli::admin::migrate(&state, cli.json).await,
        Commands::Check => cli::admin::check(&state, cli.json).await,
        Commands::Users => cli::user::list_users(&state, cli.json).await,
        Commands::History { user_id, limit } => {
            cli::user::show_history(&state, user_id, limit, cli.json).await
        }
    };

    state.shutdown().await;
    result
}
