//! # Command Line Interface
//!
//! Operator commands for the rotation engine. Exit codes:
//!
//! - `0`: every descriptor is healthy, or was due and rotated successfully
//! - `1`: a descriptor is overdue, failed or drifted, or the store is unusable
//! - `2`: configuration or catalog error

pub mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::engine::{RotationEngine, TickSummary};
use crate::errors::RotationError;
use crate::health::HealthRecord;
use crate::observability::{init_observability, log_config_info};
use crate::registry::DescriptorRegistry;
use crate::scheduler::TickOptions;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "secret-rotator")]
#[command(about = "Rotates secrets and certificates, re-renders dependent configuration and reloads consumers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Engine configuration file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Descriptor catalog, overriding `catalog_path` from the configuration
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate every descriptor now and rotate the ones that are due
    Rotate {
        /// Rotate every selected descriptor, even if it is not due
        #[arg(long)]
        force: bool,

        /// Only consider this descriptor (repeatable)
        #[arg(long = "only", value_name = "NAME")]
        only: Vec<String>,
    },

    /// Print the status of every descriptor without changing anything
    Check {
        /// Output format (table, json, yaml)
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Print a structured health report
    Report {
        /// Output format (json, yaml)
        #[arg(short, long, default_value = "json")]
        output: String,
    },

    /// Run the scheduler until interrupted
    Run,

    /// Load and validate the configuration and catalog only
    Validate,
}

/// Process exit status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Healthy,
    Unhealthy,
    ConfigError,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Healthy => 0,
            Self::Unhealthy => 1,
            Self::ConfigError => 2,
        }
    }

    /// Exit status of `rotate`. A descriptor found past its maximum TTL
    /// makes the run unhealthy even when the rotation then succeeded.
    pub fn after_rotation(summary: &TickSummary, records: &[HealthRecord]) -> Self {
        if !summary.overdue.is_empty() || summary.failed() > 0 || records.iter().any(|r| r.is_unhealthy()) {
            Self::Unhealthy
        } else {
            Self::Healthy
        }
    }

    /// Exit status for a command that failed with `error`.
    pub fn for_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<RotationError>() {
            Some(e) if e.is_config() || matches!(e, RotationError::NotFound { .. }) => Self::ConfigError,
            _ if error.downcast_ref::<clap::Error>().is_some() => Self::ConfigError,
            _ => Self::Unhealthy,
        }
    }
}

/// Parse arguments, run the command and return the process exit code.
pub async fn run_cli() -> i32 {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(status) => status.code(),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitStatus::for_error(&e).code()
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitStatus> {
    let config = EngineConfig::load(cli.config.as_deref())?;
    let _log_guard = init_observability(&config.observability, cli.verbose)?;
    log_config_info(&config);

    match cli.command {
        Commands::Validate => {
            let catalog = cli.catalog.as_deref().unwrap_or(&config.catalog_path);
            let registry = DescriptorRegistry::load(catalog)?;
            println!(
                "✅ Configuration valid: {} descriptor(s), {} service(s)",
                registry.len(),
                registry.services().len()
            );
            Ok(ExitStatus::Healthy)
        }
        Commands::Rotate { force, only } => {
            let engine = RotationEngine::from_config(&config, cli.catalog.as_deref()).await?;
            let options = TickOptions { force, only: if only.is_empty() { None } else { Some(only) } };
            let summary = engine.tick(&options, &CancellationToken::new()).await?;
            print_tick_summary(&summary);

            let records = engine.check().await?;
            output::print_health_table(&records);
            Ok(ExitStatus::after_rotation(&summary, &records))
        }
        Commands::Check { output } => {
            let format = OutputFormat::parse(&output)?;
            let engine = RotationEngine::from_config(&config, cli.catalog.as_deref()).await?;
            let records = engine.check().await?;
            match format {
                OutputFormat::Table => output::print_health_table(&records),
                structured => output::print_structured(&records, structured)?,
            }
            Ok(if records.iter().any(|r| r.is_unhealthy()) { ExitStatus::Unhealthy } else { ExitStatus::Healthy })
        }
        Commands::Report { output } => {
            let format = OutputFormat::parse(&output)?;
            let engine = RotationEngine::from_config(&config, cli.catalog.as_deref()).await?;
            let report = engine.report().await?;
            output::print_structured(&report, format)?;
            Ok(if report.is_healthy() { ExitStatus::Healthy } else { ExitStatus::Unhealthy })
        }
        Commands::Run => {
            let engine = RotationEngine::from_config(&config, cli.catalog.as_deref()).await?;
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    trigger.cancel();
                }
            });
            engine.run(cancel).await.context("rotation engine stopped with an error")?;
            Ok(ExitStatus::Healthy)
        }
    }
}

fn print_tick_summary(summary: &TickSummary) {
    if summary.tasks.is_empty() {
        println!("Nothing to rotate");
    }
    for task in &summary.tasks {
        match (&task.error, &task.committed) {
            (None, Some(meta)) => println!(
                "✅ {} rotated (version {}, next rotation {})",
                task.descriptor, meta.current_version, meta.next_rotation_at
            ),
            (None, None) if task.superseded => {
                println!("↪️  {} already rotated by another writer", task.descriptor)
            }
            (None, None) => println!("✅ {} rotated", task.descriptor),
            (Some(e), Some(_)) => println!("⚠️  {} rotated, consumers not updated: {}", task.descriptor, e),
            (Some(e), None) => println!("❌ {} failed: {}", task.descriptor, e),
        }
        for destination in &task.deferred {
            println!("    deferred: {}", destination.display());
        }
    }
    for name in &summary.overdue {
        println!("🚨 {} was past its maximum TTL", name);
    }
    for name in &summary.skipped_in_flight {
        println!("⏳ {} skipped, rotation already in progress", name);
    }
    for failure in &summary.reconcile.failed {
        println!("❌ service {} failed to reload after {} attempt(s): {}", failure.service, failure.attempts, failure.message);
    }
}
