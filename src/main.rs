//! # Stack Sync CLI (`stacksync`)
//!
//! ## Usage
//!
//! ```bash
//! stacksync --config ./config/stacksync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `stacksync run --family <f>` | One cycle of `backup`, `library`, `media` or `all` |
//! | `stacksync run --dry-run` | Same, against an in-memory catalog |
//! | `stacksync serve` | Scheduler plus dashboard API until interrupted |
//! | `stacksync sources` | Pipelines, entities and the sources feeding them |
//! | `stacksync device` | Resolved device identity and tenant partition name |
//!
//! `run` exits with status 1 when any run it started ends `failed`, and
//! with status 2 when none failed but at least one ended `partial`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stack_sync::catalog::MemoryCatalog;
use stack_sync::config::{self, Config};
use stack_sync::coordinator::RunCoordinator;
use stack_sync::device::{resolve_identity, IdentitySources};
use stack_sync::error::SyncError;
use stack_sync::logging::{init_logging, LogFormat};
use stack_sync::models::{PipelineFamily, RunStatus, RunSummary, TenancyMode};
use stack_sync::pipeline::PipelineRegistry;
use stack_sync::tenancy::sanitize_schema_name;
use stack_sync::{scheduler, server, sources};

/// Stack Sync: mirror a media-server stack's state into a remote catalog.
#[derive(Parser)]
#[command(name = "stacksync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/stacksync.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Log level for this crate. Ignored when `RUST_LOG` is set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one cycle of a pipeline family and print its summary.
    Run {
        /// `backup`, `library`, `media`, or `all`.
        #[arg(long, default_value = "all")]
        family: String,

        /// Print the summaries as JSON instead of a table.
        #[arg(long)]
        json: bool,

        /// Write to an in-memory catalog instead of the remote one.
        #[arg(long)]
        dry_run: bool,
    },

    /// Start the scheduler and the dashboard API.
    Serve {
        /// Override `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },

    /// List pipelines and the sources feeding them.
    Sources,

    /// Show the device identity and the partition it maps to.
    Device,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, &cli.log_level)?;

    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            family,
            json,
            dry_run,
        } => {
            let families = parse_families(&family)?;
            let code = run(&config, &families, json, dry_run).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            serve(&config, &bind).await?;
        }
        Commands::Sources => {
            sources::list_sources(&config)?;
        }
        Commands::Device => {
            show_device(&config);
        }
    }

    Ok(())
}

fn parse_families(raw: &str) -> Result<Vec<PipelineFamily>> {
    if raw == "all" {
        return Ok(PipelineFamily::ALL.to_vec());
    }
    match raw.parse::<PipelineFamily>() {
        Ok(family) => Ok(vec![family]),
        Err(e) => bail!("{}", e),
    }
}

/// Run each family once and return the process exit status.
async fn run(
    config: &Config,
    families: &[PipelineFamily],
    json: bool,
    dry_run: bool,
) -> Result<i32> {
    let coordinator = if dry_run {
        let registry = PipelineRegistry::from_config(config)?;
        let (identity, _) = resolve_identity(&IdentitySources::from_config(&config.device));
        RunCoordinator::new(
            config,
            Arc::new(MemoryCatalog::new()),
            registry,
            identity,
            CancellationToken::new(),
        )
    } else {
        RunCoordinator::from_config(config, CancellationToken::new())?
    };

    let mut summaries = Vec::with_capacity(families.len());
    for family in families {
        match coordinator.run_once(*family).await {
            Ok(summary) => summaries.push(summary),
            Err(SyncError::RunInProgress(f)) => warn!(family = %f, "run already in progress"),
            Err(e) => return Err(e).context("run failed"),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        for summary in &summaries {
            print_summary(summary);
        }
    }

    for summary in &summaries {
        if let Some(err) = summary.partial_failure() {
            eprintln!("{} run {}: {}", summary.family, summary.run_id, err);
        }
    }

    Ok(exit_code(&summaries))
}

fn exit_code(summaries: &[RunSummary]) -> i32 {
    if summaries.iter().any(|s| s.status == RunStatus::Failed) {
        1
    } else if summaries.iter().any(|s| s.status == RunStatus::Partial) {
        2
    } else {
        0
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} run {}: {} in {}s",
        summary.family,
        summary.run_id,
        summary.status,
        summary.duration_seconds()
    );
    if let Some(partition) = &summary.partition_ref {
        println!("  partition: {}", partition);
    }
    if !summary.entities.is_empty() {
        println!(
            "  {:<18} {:>9} {:>9} {:>7} {:>7} {:>11}",
            "ENTITY", "ATTEMPTED", "SUCCEEDED", "FAILED", "SKIPPED", "UNAVAILABLE"
        );
        for (entity, counts) in &summary.entities {
            println!(
                "  {:<18} {:>9} {:>9} {:>7} {:>7} {:>11}",
                entity.as_str(),
                counts.attempted,
                counts.succeeded,
                counts.failed,
                counts.skipped,
                counts.unavailable
            );
        }
    }
    if let Some(detail) = &summary.error_detail {
        println!("  error: {}", detail);
    }
}

async fn serve(config: &Config, bind: &str) -> Result<()> {
    let shutdown = CancellationToken::new();
    let coordinator = Arc::new(RunCoordinator::from_config(config, shutdown.clone())?);

    let handles = if config.schedule.enabled {
        let (families, heartbeat) = scheduler::cadences(&config.schedule);
        scheduler::spawn(coordinator.clone(), families, heartbeat, shutdown.clone())
    } else {
        info!("scheduler disabled, manual triggers only");
        Vec::new()
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        signal.cancel();
    });

    let served = server::run_server(bind, coordinator, shutdown.clone()).await;
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    served
}

fn show_device(config: &Config) {
    let (identity, origin) = resolve_identity(&IdentitySources::from_config(&config.device));
    println!("name:      {}", config.device.name);
    println!("identity:  {} ({})", identity, origin.as_str());
    match config.catalog.tenancy {
        TenancyMode::Schema => {
            println!("tenancy:   schema");
            println!("partition: {}", sanitize_schema_name(&config.device.name));
        }
        TenancyMode::DeviceRow => {
            println!("tenancy:   device_row");
            println!("partition: row in '{}'", config.catalog.devices_table);
        }
    }
}
