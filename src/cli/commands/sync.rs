//! Sync commands: one cycle now (`sync`) or the polling loop (`run`).

use super::CommandContext;
use crate::error::{Error, Result};
use crate::source::{ConfiguredSource, ObservationSource};
use crate::sync::{CycleReport, Orchestrator, OrchestratorConfig, SyncCounters};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Per-request timeout for the REST source.
const SOURCE_TIMEOUT: Duration = Duration::from_secs(30);

fn build_orchestrator(
    ctx: &CommandContext,
    full_history: bool,
) -> Result<Orchestrator<ConfiguredSource>> {
    let storage = ctx.open_storage()?;
    let source = ConfiguredSource::from_settings(&ctx.settings.source, SOURCE_TIMEOUT)?;
    let mut config = OrchestratorConfig::from_settings(&ctx.settings);
    config.full_history |= full_history;
    Ok(Orchestrator::new(source, storage, config))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Other(format!("Failed to create async runtime: {e}")))
}

/// Run one cycle and report it.
///
/// # Errors
///
/// Returns the error that failed the cycle.
pub fn execute_once(
    db: Option<&PathBuf>,
    config: Option<&PathBuf>,
    full_history: bool,
    json: bool,
) -> Result<()> {
    let ctx = CommandContext::resolve(db, config)?;
    let mut orchestrator = build_orchestrator(&ctx, full_history)?;

    let report = runtime()?.block_on(async {
        let report = orchestrator.run_cycle().await;
        orchestrator.source_mut().close();
        report
    })?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

/// Poll until Ctrl-C.
///
/// # Errors
///
/// Returns an error only if setup fails; cycle failures are logged and
/// retried on the next tick.
pub fn execute_loop(
    db: Option<&PathBuf>,
    config: Option<&PathBuf>,
    full_history: bool,
    json: bool,
) -> Result<()> {
    let ctx = CommandContext::resolve(db, config)?;
    let mut orchestrator = build_orchestrator(&ctx, full_history)?;

    if !json {
        println!(
            "Syncing '{}' every {}s. Press Ctrl-C to stop.",
            ctx.settings.source.name, ctx.settings.interval_secs
        );
    }

    let counters = runtime()?.block_on(async {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    let _ = tx.send(true);
                }
                Err(e) => {
                    warn!(error = %e, "Cannot listen for Ctrl-C; stop the process to exit");
                    // Keep the sender alive so the loop keeps running
                    std::future::pending::<()>().await;
                    drop(tx);
                }
            }
        });
        orchestrator.run_until(rx).await
    });

    if json {
        println!("{}", serde_json::to_string(&counters)?);
    } else {
        print_counters(&counters);
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!(
        "{} {} in {}ms",
        "Sync cycle".bold(),
        report.status.as_str().green(),
        report.duration_ms()
    );
    if let Some(since) = report.since {
        println!("  Since:       {}", since.to_rfc3339());
    }
    println!("  Fetched:     {}", report.fetched);
    println!("  Synced:      {}", report.synced);
    println!("  Duplicates:  {}", report.duplicates);
    println!("  Skipped:     {}", report.skipped);
    println!("  Malformed:   {}", report.malformed);
    println!("  Errors:      {}", report.errors);
    if report.provisioned > 0 {
        println!("  Provisioned: {}", report.provisioned);
    }
}

fn print_counters(counters: &SyncCounters) {
    println!();
    println!("{}", "Stopped".bold());
    println!("  Cycles:  {} ({} failed)", counters.cycles_run, counters.cycles_failed);
    println!("  Synced:  {}", counters.items_synced);
    println!("  Skipped: {}", counters.items_skipped);
    println!("  Errors:  {}", counters.errors);
}
