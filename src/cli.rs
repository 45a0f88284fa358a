//! CLI interface for ath-tracker
//!
//! Provides subcommands for:
//! - `run`: Resolve the ATH of every pending call
//! - `pending`: Show how many calls still lack an ATH
//! - `retrigger`: Clear stored ATHs so the next run recomputes them

use crate::ath::{AthConfig, ExecutionMode};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

/// Environment variable holding the provider API key.
pub const API_KEY_ENV: &str = "ATH_PROVIDER_API_KEY";

#[derive(Parser, Debug)]
#[command(name = "ath-tracker")]
#[command(about = "Post-call all-time-high and ROI tracker for DEX pools")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum log level
    #[arg(long, default_value = "info")]
    pub log_level: Level,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve the ATH of every pending call
    Run(RunArgs),
    /// Show how many calls still lack an ATH
    Pending(StoreArgs),
    /// Clear the ATH of the given calls so the next run recomputes them
    Retrigger(RetriggerArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Concurrent workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Provider request budget shared by all workers
    #[arg(short, long)]
    pub requests_per_minute: Option<u32>,

    /// Pending calls pulled per batch
    #[arg(short, long)]
    pub batch_size: Option<u32>,

    /// Process calls one at a time instead of using the worker pool
    #[arg(long)]
    pub sequential: bool,

    #[command(flatten)]
    pub store: StoreArgs,
}

#[derive(Args, Debug, Default)]
pub struct StoreArgs {
    /// Call store connection string (overrides the config file)
    #[arg(long)]
    pub database: Option<String>,
}

#[derive(Args, Debug)]
pub struct RetriggerArgs {
    /// Call ids to recompute
    #[arg(required = true)]
    pub ids: Vec<i64>,

    #[command(flatten)]
    pub store: StoreArgs,
}

impl Cli {
    /// Configuration from the file (if any), the environment and the flags,
    /// in increasing precedence.
    pub fn load_config(&self) -> Result<AthConfig> {
        let mut config = match &self.config {
            Some(path) => AthConfig::from_file(path)?,
            None => AthConfig::default(),
        };

        if let Ok(api_key) = std::env::var(API_KEY_ENV) {
            if !api_key.trim().is_empty() {
                config.provider.api_key = Some(api_key);
            }
        }

        match &self.command {
            Commands::Run(args) => args.apply(&mut config),
            Commands::Pending(store) => store.apply(&mut config),
            Commands::Retrigger(args) => args.store.apply(&mut config),
        }

        config.validate()?;
        Ok(config)
    }
}

impl RunArgs {
    pub fn apply(&self, config: &mut AthConfig) {
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(rpm) = self.requests_per_minute {
            config.requests_per_minute = rpm;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if self.sequential {
            config.execution = ExecutionMode::Sequential;
        }
        self.store.apply(config);
    }
}

impl StoreArgs {
    pub fn apply(&self, config: &mut AthConfig) {
        if let Some(database) = &self.database {
            config.database_url = database.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::parse_from([
            "ath-tracker",
            "run",
            "--workers",
            "8",
            "--requests-per-minute",
            "120",
            "--batch-size",
            "10",
            "--sequential",
        ]);

        let Commands::Run(args) = &cli.command else {
            panic!("expected run command");
        };
        let mut config = AthConfig::default();
        args.apply(&mut config);

        assert_eq!(config.worker_count, 8);
        assert_eq!(config.requests_per_minute, 120);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.execution, ExecutionMode::Sequential);
        assert_eq!(cli.log_level, Level::INFO);
    }

    #[test]
    fn test_run_without_flags_keeps_config() {
        let cli = Cli::parse_from(["ath-tracker", "run"]);

        let Commands::Run(args) = &cli.command else {
            panic!("expected run command");
        };
        let mut config = AthConfig::default();
        args.apply(&mut config);

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.execution, ExecutionMode::Pool);
    }

    #[test]
    fn test_parse_retrigger_ids() {
        let cli = Cli::parse_from(["ath-tracker", "--log-level", "debug", "retrigger", "3", "7", "--database", "sqlite::memory:"]);

        let Commands::Retrigger(args) = &cli.command else {
            panic!("expected retrigger command");
        };
        assert_eq!(args.ids, vec![3, 7]);
        assert_eq!(args.store.database.as_deref(), Some("sqlite::memory:"));
        assert_eq!(cli.log_level, Level::DEBUG);
    }

    #[test]
    fn test_retrigger_requires_ids() {
        assert!(Cli::try_parse_from(["ath-tracker", "retrigger"]).is_err());
    }

    #[test]
    fn test_invalid_override_fails_validation() {
        let cli = Cli::parse_from(["ath-tracker", "run", "--workers", "0", "--database", "sqlite::memory:"]);

        assert!(cli.load_config().is_err());
    }
}
