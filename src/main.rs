//! Tangle Account - conditional deposit address wallet
//!
//! # WARNING
//! - The seed controls every address of the account. Keep `TANGLE_SEED` out of shell history.
//! - A spent single-use address must never receive funds again.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

// Use the library crate
use tangle_account::cli::commands;
use tangle_account::config::Config;

/// Tangle Account - conditional deposit address wallet
#[derive(Parser)]
#[command(name = "account")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "account.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the account and attach pending bundles until interrupted
    Start,

    /// Generate a new conditional deposit address
    Generate {
        /// Seconds from now until the address expires
        #[arg(long, default_value = "86400")]
        timeout: u64,

        /// Accept deposits until expiry instead of a single one
        #[arg(long)]
        multi_use: bool,

        /// Amount the depositor is expected to send
        #[arg(long)]
        expected_amount: Option<u64>,

        /// Security level (1-3), defaults to the configured level
        #[arg(long)]
        security: Option<u8>,
    },

    /// Send funds to a conditional deposit address
    Send {
        /// CDA magnet link (iota://...)
        magnet: String,

        /// Amount to send
        value: u64,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Show included deposits and transfers
    History {
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Generate a new random seed
    Seed {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    let directive: tracing_subscriber::filter::Directive = "tangle_account=info".parse()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start => commands::start(&config).await,
        Commands::Generate {
            timeout,
            multi_use,
            expected_amount,
            security,
        } => commands::generate(&config, timeout, multi_use, expected_amount, security).await,
        Commands::Send { magnet, value, force } => commands::send(&config, &magnet, value, force).await,
        Commands::History { limit } => commands::history(&config, limit).await,
        Commands::Config => commands::show_config(&config),
        Commands::Seed { force } => commands::seed(force),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
