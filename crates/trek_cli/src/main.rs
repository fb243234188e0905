//! Trek CLI - operator tooling for the sync engine's on-disk state
//!
//! Usage: trek <command> [options]

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use trek_common::EXIT_ERROR;

#[derive(Parser)]
#[command(
    name = "trek",
    version = "0.1.0",
    about = "Inspect and manage Trek sync state"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Sync config file (default: .trek/config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or reset the durable pending-change queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// List local entities waiting to be uploaded
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sync configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show queued changes, oldest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop every queued change
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load and validate the config, then print the effective values
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    trek_common::telemetry::init_tracing(cli.verbose, false);
    tracing::debug!("Trek CLI started");

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Queue { action } => match action {
            QueueAction::List { json } => commands::queue::cmd_queue_list(config, json).await,
            QueueAction::Clear => commands::queue::cmd_queue_clear(config).await,
        },
        Commands::Pending { json } => commands::pending::cmd_pending(config, json).await,
        Commands::Config { action } => match action {
            ConfigAction::Check => commands::config::cmd_config_check(config).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(EXIT_ERROR);
    }
}
