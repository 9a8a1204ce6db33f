//! Model lifecycle service.
//!
//! Trains random forest classifiers on CSV datasets and serves them over
//! HTTP, either as a single in-memory model or as a persistent registry.

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;

/// Model lifecycle service
#[derive(Parser)]
#[command(name = "model-api")]
#[command(about = "Train, store and serve tabular classification models")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the persistent multi-model API
    Serve {
        /// Address to bind (overrides `BIND_ADDR`)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Serve the single-model API without persistence
    ServeSingle {
        /// Address to bind (overrides `BIND_ADDR`)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run record store migrations
    Migrate,

    /// Settle records left by interrupted writes
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over the verbosity flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve { bind } => commands::serve::run_persistent(&config, bind).await?,
        Commands::ServeSingle { bind } => commands::serve::run_single(&config, bind).await?,
        Commands::Migrate => {
            let pool = database::create_pool(&config.database_url).await?;
            database::run_migrations(&pool).await?;
            info!("Migrations completed successfully");
        }
        Commands::Reconcile => commands::reconcile::run(&config).await?,
    }

    Ok(())
}
