//! Patient register commands.

use super::{format_timestamp, CommandContext, DEFAULT_ACTOR};
use crate::cli::PatientCommands;
use crate::error::{Error, Result};
use crate::model::TargetPatient;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct PatientListOutput {
    patients: Vec<TargetPatient>,
    count: usize,
}

#[derive(Serialize)]
struct PatientChangeOutput<'a> {
    id: &'a str,
    action: &'a str,
}

/// Execute patient commands.
///
/// # Errors
///
/// Returns `PatientNotFound` for unknown IDs, or a database error.
pub fn execute(
    command: &PatientCommands,
    db: Option<&PathBuf>,
    config: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let ctx = CommandContext::resolve(db, config)?;
    let mut storage = ctx.open_storage()?;
    let actor = actor.unwrap_or(DEFAULT_ACTOR);

    match command {
        PatientCommands::List { all, limit } => {
            let patients = storage.list_patients(!all, Some(*limit))?;
            if json {
                let output = PatientListOutput {
                    count: patients.len(),
                    patients,
                };
                println!("{}", serde_json::to_string(&output)?);
                return Ok(());
            }

            if patients.is_empty() {
                println!("No patients.");
                return Ok(());
            }
            for patient in &patients {
                let mut flags = Vec::new();
                if !patient.active {
                    flags.push("inactive");
                }
                if patient.provisioned_by_sync {
                    flags.push("provisioned");
                }
                println!(
                    "{}  {}  {}  {}",
                    patient.id.dimmed(),
                    patient.display_name.bold(),
                    patient.external_identifier.as_deref().unwrap_or("-"),
                    flags.join(",").yellow()
                );
            }
            println!("{} patient(s)", patients.len());
        }

        PatientCommands::Add { name, external_id } => {
            if name.trim().is_empty() {
                return Err(Error::InvalidArgument("Patient name cannot be empty".into()));
            }
            let patient = TargetPatient::new(name, external_id.as_deref());
            storage.create_patient(&patient, actor)?;

            if json {
                println!("{}", serde_json::to_string(&patient)?);
            } else {
                println!("Added patient {} ({})", patient.display_name.bold(), patient.id);
                println!("  Created: {}", format_timestamp(patient.created_at));
            }
        }

        PatientCommands::Rename { id, name } => {
            storage.rename_patient(id, name, actor)?;
            report_change(id, "renamed", json)?;
        }

        PatientCommands::Deactivate { id } => {
            storage.set_patient_active(id, false, actor)?;
            report_change(id, "deactivated", json)?;
        }

        PatientCommands::Activate { id } => {
            storage.set_patient_active(id, true, actor)?;
            report_change(id, "activated", json)?;
        }
    }

    Ok(())
}

fn report_change(id: &str, action: &str, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(&PatientChangeOutput { id, action })?);
    } else {
        println!("Patient {id} {action}");
    }
    Ok(())
}
