//! List a patient's synced records.

use super::{format_timestamp, CommandContext};
use crate::error::{Error, Result};
use crate::model::RecordType;
use crate::storage::StoredRecord;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize)]
struct RecordsOutput {
    patient_id: String,
    records: Vec<StoredRecord>,
    count: usize,
}

/// Execute the records command.
///
/// # Errors
///
/// Returns `PatientNotFound` if the patient does not exist.
pub fn execute(
    patient_id: &str,
    record_type: Option<RecordType>,
    limit: u32,
    db: Option<&PathBuf>,
    config: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let ctx = CommandContext::resolve(db, config)?;
    let storage = ctx.open_storage()?;

    let patient = storage
        .get_patient(patient_id)?
        .ok_or_else(|| Error::PatientNotFound {
            id: patient_id.to_string(),
        })?;
    let records = storage.list_records(&patient.id, record_type, Some(limit))?;

    if json {
        let output = RecordsOutput {
            patient_id: patient.id,
            count: records.len(),
            records,
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("{} ({})", patient.display_name.bold(), patient.id.dimmed());
    if records.is_empty() {
        println!("  No synced records.");
        return Ok(());
    }

    for record in &records {
        println!(
            "  [{}] {}: {}",
            record.record_type.as_str().cyan(),
            record.payload.title.bold(),
            record.payload.detail
        );
        println!(
            "      {} | {} | {} | obs {}",
            record.payload.recorded_at.to_rfc3339().dimmed(),
            record.payload.doctor,
            record.payload.hospital,
            record.source_observation_id
        );
        if let Some(notes) = &record.payload.notes {
            println!("      {}", notes.italic());
        }
        println!("      synced {}", format_timestamp(record.synced_at).dimmed());
    }
    println!("{} record(s)", records.len());

    Ok(())
}
