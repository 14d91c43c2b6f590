// ABOUTME: CLI entry point for database-rollup
// ABOUTME: Parses commands, loads the config file and routes to command handlers

use clap::{Parser, Subcommand};
use database_rollup::commands;
use database_rollup::config::{RollupConfig, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "database-rollup")]
#[command(about = "Incrementally maintained PostgreSQL rollup tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the rollup configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Source database URL (overrides [database] source_url)
    #[arg(long, env = "ROLLUP_SOURCE_URL", global = true)]
    source: Option<String>,
    /// Target database URL holding the rollup tables (defaults to the source)
    #[arg(long, env = "ROLLUP_TARGET_URL", global = true)]
    target: Option<String>,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge changes into the rollup tables once and advance the watermarks
    Run {
        /// Run only this pipeline
        #[arg(long)]
        pipeline: Option<String>,
        /// Run even when the change log reports nothing new
        #[arg(long)]
        force: bool,
    },
    /// Run all pipelines continuously on a fixed interval
    Daemon {
        /// Seconds between cycles
        #[arg(long, default_value_t = 60)]
        interval: u64,
        /// Run every cycle even when the change log reports nothing new
        #[arg(long)]
        force: bool,
    },
    /// Show pipeline watermarks and pending changes
    Status,
    /// Compare one fact per key between the source and the rollup tables
    Validate {
        /// Run only this check
        #[arg(long)]
        check: Option<String>,
    },
    /// List rows missing on either side and rows whose facts differ
    Diff {
        /// Run only this check
        #[arg(long)]
        check: Option<String>,
        /// Maximum mismatches printed per kind
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Create the change log and capture triggers on tracked tables
    InstallTracking {
        /// Install only the tables tracked by this pipeline
        #[arg(long)]
        pipeline: Option<String>,
    },
    /// Delete change records that every pipeline has already merged
    Prune,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    database_rollup::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let config = RollupConfig::load(&cli.config)?.with_urls(cli.source, cli.target);

    match cli.command {
        Commands::Run { pipeline, force } => {
            commands::run(&config, pipeline.as_deref(), force).await
        }
        Commands::Daemon { interval, force } => {
            tracing::info!("Starting rollup daemon...");
            tracing::info!("Press Ctrl+C to stop");

            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

            let shutdown_tx_clone = shutdown_tx.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c()
                    .await
                    .expect("Failed to listen for Ctrl+C");
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx_clone.send(());
            });

            commands::daemon(
                &config,
                Duration::from_secs(interval),
                force,
                shutdown_rx,
            )
            .await
        }
        Commands::Status => commands::status(&config).await,
        Commands::Validate { check } => commands::validate(&config, check.as_deref()).await,
        Commands::Diff { check, limit } => {
            commands::diff(&config, check.as_deref(), limit).await
        }
        Commands::InstallTracking { pipeline } => {
            commands::install_tracking(&config, pipeline.as_deref()).await
        }
        Commands::Prune => commands::prune(&config).await,
    }
}
