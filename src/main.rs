//! Main entry point for the ATH tracker
//!
//! Resolves the post-call all-time-high of every pending call and reports
//! the run summary.

use anyhow::{Context, Result};
use ath_tracker::ath::{AthConfig, AthConfigBuilder, CallStore, SqliteCallStore};
use ath_tracker::cli::{Cli, Commands};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;

    match &cli.command {
        Commands::Run(_) => run(config).await,
        Commands::Pending(_) => {
            let store = SqliteCallStore::connect(&config.database_url).await?;
            println!("{}", store.pending_count().await?);
            Ok(())
        }
        Commands::Retrigger(args) => {
            let store = SqliteCallStore::connect(&config.database_url).await?;
            let cleared = store.clear_ath(&args.ids).await?;
            if cleared < args.ids.len() as u64 {
                warn!("{} of {} call ids were not found", args.ids.len() as u64 - cleared, args.ids.len());
            }
            println!("cleared {}", cleared);
            Ok(())
        }
    }
}

async fn run(config: AthConfig) -> Result<()> {
    info!(
        "Starting ATH run: {} workers, {} requests/min, batch size {}, {:?} execution",
        config.worker_count, config.requests_per_minute, config.batch_size, config.execution
    );

    let store: Arc<dyn CallStore> = Arc::new(SqliteCallStore::connect(&config.database_url).await?);
    if !store.health_check().await? {
        anyhow::bail!("Call store at {} is not healthy", config.database_url);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = AthConfigBuilder::from_config(config)
        .build(store)?
        .with_shutdown(shutdown_rx);

    scheduler
        .probe_provider()
        .await
        .context("Candle provider startup check failed")?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing in-flight calls");
            let _ = shutdown_tx.send(true);
        }
    });

    let summary = scheduler.run_until_exhausted().await?;
    println!("{}", summary);
    Ok(())
}
