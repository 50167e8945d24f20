use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use evr_core::EventRecord;
use evr_sync::{maybe_build_scheduler, pipeline_from_config, PurgeOutcome, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evr-cli")]
#[command(about = "Event catalog refresher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Purge expired events, then generate and admit a fresh batch.
    Refresh,
    /// Delete events that ended before today.
    Purge,
    /// Generate and validate a batch without writing it.
    Generate,
    /// Refresh on the configured cron until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let pipeline = pipeline_from_config(&config)?;
            let summary = pipeline.run_once().await?;
            println!("{}", summary.summary_line());
        }
        Commands::Purge => {
            let pipeline = pipeline_from_config(&config)?;
            let outcome = pipeline.purge_expired(Utc::now().date_naive()).await;
            println!("{}", purge_report(&outcome)?);
        }
        Commands::Generate => {
            let pipeline = pipeline_from_config(&config)?;
            let records: Vec<EventRecord> = pipeline.preview().await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(pipeline_from_config(&config)?);
            let Some(mut sched) = maybe_build_scheduler(&config, pipeline).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            warn!("interrupt received, shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

/// A purge with any store error is a failure, whatever status came back.
fn purge_report(outcome: &PurgeOutcome) -> Result<String> {
    if let Some(error) = &outcome.error {
        anyhow::bail!("purge failed: {error}");
    }
    let status = outcome
        .status
        .map_or_else(|| "unknown".to_string(), |s| s.to_string());
    Ok(format!("purge complete: cutoff={} status={status}", outcome.cutoff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn outcome(status: Option<u16>, error: Option<&str>) -> PurgeOutcome {
        PurgeOutcome {
            cutoff: NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            status,
            error: error.map(ToOwned::to_owned),
        }
    }

    #[test]
    fn successful_purge_reports_status() {
        let line = purge_report(&outcome(Some(204), None)).unwrap();
        assert_eq!(line, "purge complete: cutoff=2026-10-18 status=204");
    }

    #[test]
    fn rejected_purge_fails_even_with_a_status() {
        let err = purge_report(&outcome(
            Some(401),
            Some("store returned http 401: invalid api key"),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
