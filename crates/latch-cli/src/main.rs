//! Latch CLI - advisory locking for shared session records.
//!
//! # Usage
//!
//! ```bash
//! # Write a default configuration
//! latch config init
//!
//! # Show the effective configuration
//! latch config show
//!
//! # Hammer one session from many clients and check nothing was lost
//! latch contend --clients 8 --rounds 500
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use latch_cli::{commands, output};
use latch_core::config::LatchConfig;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "latch")]
#[command(about = "Latch - advisory locking for shared session records", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "LATCH_CONFIG_PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Run concurrent clients against one session and verify no update is lost
    Contend {
        /// Number of concurrent clients
        #[arg(long, default_value = "4")]
        clients: usize,

        /// Updates per client
        #[arg(long, default_value = "100")]
        rounds: usize,

        /// Session id to contend on
        #[arg(long, default_value = "demo")]
        session: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        output::error(format!("{:#}", e));
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => LatchConfig::config_path()?,
    };

    match cli.command {
        Commands::Config(ConfigCommands::Init { force }) => {
            init_logging(cli.verbose, "info");
            commands::config_init(&config_path, force).await?;
        }

        Commands::Config(ConfigCommands::Show) => {
            let config = commands::load_config(&config_path).await?;
            init_logging(cli.verbose, &config.general().log_level);
            commands::config_show(&config_path, &config).await?;
        }

        Commands::Contend {
            clients,
            rounds,
            session,
        } => {
            let config = commands::load_config(&config_path).await?;
            init_logging(cli.verbose, &config.general().log_level);
            commands::contend(config, session, clients, rounds).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if verbose {
        EnvFilter::new("latch=debug,latch_cli=debug,latch_core=debug,latch_store=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "latch={level},latch_cli={level},latch_core={level},latch_store={level},warn"
            ))
        })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
