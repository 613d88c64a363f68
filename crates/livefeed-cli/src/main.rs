//! livefeed CLI
//!
//! Command-line tool for following live `SUBSCRIBE` result sets.
//!
//! ## Quick Start
//!
//! ```bash
//! # Point at the database (default: localhost:6876)
//! export LIVEFEED_ADDR=localhost:6876
//!
//! # Follow a query, keyed by `id`
//! livefeed subscribe "SELECT id, total FROM orders" --key id
//!
//! # Print the statement without connecting
//! livefeed statement "SELECT id, total FROM orders" --key id
//!
//! # Write ~/.livefeed/config.toml with defaults
//! livefeed config init
//! ```
//!
//! ## Configuration
//!
//! Flags win over environment variables, which win over the config file:
//! - `LIVEFEED_ADDR`, `LIVEFEED_USER`, `LIVEFEED_PASSWORD`: connection
//! - `LIVEFEED_CONFIG`: config file path (default: `~/.livefeed/config.toml`)
//! - `RUST_LOG` or `--log-level`: tracing filter
//!
//! ## Exit Status
//!
//! Non-zero when the subscription latches a protocol error or cannot start.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;
mod format;

use config::Config;

#[derive(Parser)]
#[command(name = "livefeed", version)]
#[command(about = "Follow live SUBSCRIBE result sets", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(long, env = "LIVEFEED_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Tracing filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to a query and print its live result set
    Subscribe(commands::SubscribeArgs),
    /// Print the SUBSCRIBE statement for a query
    Statement(commands::StatementArgs),
    /// Config file management
    Config {
        #[command(subcommand)]
        command: commands::ConfigCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A subscriber may already be installed when embedded; that is fine.
    let _ = livefeed_observability::init_tracing(&cli.log_level);

    let config_path = cli.config.unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Subscribe(args) => {
            let config = Config::load_from(&config_path)?;
            let colored = config.colored && !cli.no_color;
            commands::subscribe::run(args, &config, colored).await?
        }
        Commands::Statement(args) => commands::statement::run(args)?,
        Commands::Config { command } => commands::config::run(command, &config_path)?,
    }

    Ok(())
}
