//! Status command implementation.

use super::{format_timestamp, CommandContext};
use crate::error::Result;
use crate::storage::{RunStatus, RunTotals, StoreCounts, SyncRun};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

/// Output for status command.
#[derive(Serialize)]
struct StatusOutput {
    database: PathBuf,
    source: SourceInfo,
    totals: RunTotals,
    counts: StoreCounts,
    recent_runs: Vec<SyncRun>,
}

#[derive(Serialize)]
struct SourceInfo {
    name: String,
    kind: crate::config::SourceKind,
    last_successful_sync: Option<String>,
}

/// Execute status command.
///
/// # Errors
///
/// Returns `NotInitialized` if the database does not exist.
pub fn execute(
    db: Option<&PathBuf>,
    config: Option<&PathBuf>,
    runs: u32,
    json: bool,
) -> Result<()> {
    let ctx = CommandContext::resolve(db, config)?;
    let storage = ctx.open_storage()?;
    let source_name = ctx.settings.source.name.clone();

    let cursor = storage.get_cursor(&source_name)?;
    let totals = storage.run_totals(&source_name)?;
    let counts = storage.counts()?;
    let recent_runs = storage.recent_runs(Some(&source_name), runs)?;

    let source = SourceInfo {
        name: source_name,
        kind: ctx.settings.source.kind,
        last_successful_sync: cursor.map(|c| format_timestamp(c.last_successful_sync)),
    };

    if json {
        let output = StatusOutput {
            database: ctx.db_path,
            source,
            totals,
            counts,
            recent_runs,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("{}", "Passport Sync Status".bold());
    println!("====================");
    println!();
    println!("Database: {}", ctx.db_path.display());
    println!("Source:   {} ({:?})", source.name, source.kind);
    println!(
        "Cursor:   {}",
        source
            .last_successful_sync
            .as_deref()
            .unwrap_or("never synced")
    );
    println!();

    println!("{}", "Cycles".cyan().bold());
    println!("  Run:        {}", totals.cycles_run);
    println!("  Failed:     {}", totals.cycles_failed);
    println!("  Synced:     {}", totals.items_synced);
    println!("  Duplicates: {}", totals.items_duplicate);
    println!("  Skipped:    {}", totals.items_skipped);
    println!("  Errors:     {}", totals.errors);
    println!();

    println!("{}", "Portal".cyan().bold());
    println!(
        "  Patients: {} ({} active, {} provisioned by sync)",
        counts.patients, counts.active_patients, counts.provisioned_patients
    );
    println!("  Links:    {}", counts.identity_links);
    println!("  Records:  {}", counts.records);
    for (record_type, count) in &counts.records_by_type {
        println!("    {record_type:<11} {count}");
    }

    if !recent_runs.is_empty() {
        println!();
        println!("{}", "Recent cycles".cyan().bold());
        for run in &recent_runs {
            let status = match run.status {
                RunStatus::Completed => run.status.as_str().green(),
                RunStatus::Aborted => run.status.as_str().yellow(),
                RunStatus::Failed => run.status.as_str().red(),
            };
            println!(
                "  {} {:<9} fetched={} synced={} dup={} skipped={} errors={}",
                format_timestamp(run.started_at).dimmed(),
                status,
                run.fetched,
                run.synced,
                run.duplicates,
                run.skipped + run.malformed,
                run.errors
            );
            if let Some(message) = &run.message {
                println!("    {}", message.dimmed());
            }
        }
    }

    Ok(())
}
