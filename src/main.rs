use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slotcast::config::Config;

mod commands;

const DEFAULT_CONFIG_FILE: &str = "slotcast.toml";

#[derive(Parser)]
#[command(
    name = "slotcast",
    version,
    about = "Cron-driven publication scheduler that rotates posts across messaging channels",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./slotcast.toml, then SLOTCAST_* variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,

    /// Show which units would be scheduled and when they fire next
    Sync,

    /// Validate a cron expression and list its next firings
    Cron {
        /// Five-field cron expression, quoted
        expression: String,

        /// Number of firings to show
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },

    /// Run one publication cycle for a unit immediately
    Fire {
        /// Unit id
        #[arg(short, long)]
        unit: i64,
    },

    /// Remove every live post of a unit
    Clear {
        /// Unit id
        #[arg(short, long)]
        unit: i64,
    },

    /// Show recent audit records
    Audit {
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());

    // Initialize tracing/logging
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    config.validate()?;

    match cli.command {
        Commands::Run => {
            tracing::info!("Starting scheduler");
            commands::run(&config).await?;
        }

        Commands::Sync => {
            commands::sync(&config)?;
        }

        Commands::Cron { expression, count } => {
            commands::cron(&config, &expression, count)?;
        }

        Commands::Fire { unit } => {
            tracing::info!(unit_id = unit, "Firing unit");
            commands::fire(&config, unit).await?;
        }

        Commands::Clear { unit } => {
            tracing::info!(unit_id = unit, "Clearing unit");
            commands::clear(&config, unit).await?;
        }

        Commands::Audit { limit } => {
            commands::audit(&config, limit)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Config::from_file(Path::new(DEFAULT_CONFIG_FILE))
        }
        None => Config::from_env(),
    }
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("slotcast=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("slotcast={level},warn"))?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
