//! Record materialization.
//!
//! Turns one [`SourceObservation`] for a resolved patient into a
//! [`SyncedRecord`] and writes it exactly once. The payload is a pure
//! function of the source row, so concurrent writers agree on content and
//! the storage uniqueness constraint settles who wrote it.

pub mod classify;
pub mod hash;

pub use classify::{classify, Classification, GENERAL_CATEGORY};
pub use hash::content_hash;

use crate::error::{Error, Result};
use crate::identity::{Resolution, SYNC_ACTOR};
use crate::model::{
    Provenance, RecordPayload, RecordType, SourceObservation, SyncedRecord, TargetPatient,
};
use crate::storage::{InsertOutcome, SqliteStorage};
use tracing::{debug, warn};

/// Detail shown for an observation whose value columns were all empty.
pub const NO_VALUE_DETAIL: &str = "No value recorded";
pub const UNKNOWN_DOCTOR: &str = "Unknown Doctor";
pub const UNKNOWN_HOSPITAL: &str = "Unknown Hospital";

/// Why an observation was not materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnresolvedPatient,
    AmbiguousPatient,
}

impl SkipReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnresolvedPatient => "unresolved_patient",
            Self::AmbiguousPatient => "ambiguous_patient",
        }
    }
}

/// Outcome of materializing one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Inserted(RecordType),
    /// Already synced by an earlier or concurrent cycle.
    Duplicate,
    Skipped(SkipReason),
}

/// Builds and persists synced records.
#[derive(Debug, Clone)]
pub struct Materializer {
    write_retries: u32,
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Materializer {
    /// `write_retries` is the number of immediate retries after a failed write.
    #[must_use]
    pub const fn new(write_retries: u32) -> Self {
        Self { write_retries }
    }

    /// Build the record for an observation. Pure; never drops an observation.
    ///
    /// # Errors
    ///
    /// Returns an error only if the payload cannot be serialized for hashing.
    pub fn build(
        &self,
        observation: &SourceObservation,
        patient: &TargetPatient,
    ) -> Result<SyncedRecord> {
        let classification = classify(&observation.concept_label);
        let doctor = non_blank(observation.provider_name.as_deref())
            .unwrap_or(UNKNOWN_DOCTOR)
            .to_string();
        let hospital = non_blank(observation.location_name.as_deref())
            .unwrap_or(UNKNOWN_HOSPITAL)
            .to_string();

        let payload = RecordPayload {
            title: observation.concept_label.trim().to_string(),
            category: classification.category.to_string(),
            detail: observation
                .value
                .as_ref()
                .map_or_else(|| NO_VALUE_DETAIL.to_string(), |v| v.detail()),
            recorded_at: observation.recorded_at,
            notes: non_blank(observation.comments.as_deref()).map(String::from),
            encounter_ref: non_blank(observation.encounter_ref.as_deref()).map(String::from),
            doctor: doctor.clone(),
            hospital: hospital.clone(),
        };
        let provenance = Provenance {
            source_observation_id: observation.source_observation_id.clone(),
            captured_at: observation.captured_at,
            provider_name: doctor,
            location_name: hospital,
        };
        let content_hash = content_hash(&(&payload, &provenance))?;

        Ok(SyncedRecord {
            patient_id: patient.id.clone(),
            source_observation_id: observation.source_observation_id.clone(),
            record_type: classification.record_type,
            payload,
            provenance,
            content_hash,
        })
    }

    /// Materialize an observation for whatever the resolver returned.
    ///
    /// Unresolved subjects are skipped, not failed. A write that fails for a
    /// reason other than the dedup constraint is retried immediately.
    ///
    /// # Errors
    ///
    /// Returns `TargetWriteFailure` once retries are exhausted.
    pub fn materialize(
        &self,
        storage: &mut SqliteStorage,
        observation: &SourceObservation,
        resolution: &Resolution,
    ) -> Result<MaterializeOutcome> {
        let patient = match resolution {
            Resolution::Ambiguous { .. } => {
                return Ok(MaterializeOutcome::Skipped(SkipReason::AmbiguousPatient));
            }
            Resolution::NotFound => {
                return Ok(MaterializeOutcome::Skipped(SkipReason::UnresolvedPatient));
            }
            other => match other.patient() {
                Some(patient) => patient,
                None => return Ok(MaterializeOutcome::Skipped(SkipReason::UnresolvedPatient)),
            },
        };

        let record = self.build(observation, patient)?;
        let outcome = self.insert_with_retry(storage, &record)?;

        debug!(
            obs_id = %record.source_observation_id,
            patient = %record.patient_id,
            record_type = %record.record_type,
            duplicate = outcome == InsertOutcome::Duplicate,
            "Materialized observation"
        );

        Ok(match outcome {
            InsertOutcome::Inserted => MaterializeOutcome::Inserted(record.record_type),
            InsertOutcome::Duplicate => MaterializeOutcome::Duplicate,
        })
    }

    fn insert_with_retry(
        &self,
        storage: &mut SqliteStorage,
        record: &SyncedRecord,
    ) -> Result<InsertOutcome> {
        let mut attempt = 0;
        loop {
            match storage.insert_synced_record(record, SYNC_ACTOR) {
                Ok(outcome) => return Ok(outcome),
                Err(e @ Error::TargetWriteFailure { .. }) if attempt < self.write_retries => {
                    attempt += 1;
                    warn!(
                        obs_id = %record.source_observation_id,
                        attempt,
                        error = %e,
                        "Record write failed, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NameParts, ObservationValue};
    use chrono::{TimeZone, Utc};

    fn observation(id: &str, label: &str, value: Option<ObservationValue>) -> SourceObservation {
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        SourceObservation {
            source_observation_id: id.to_string(),
            subject_external_id: "100".into(),
            subject_name: NameParts::new("Alice", None, "Mwangi"),
            subject_national_id: None,
            concept_label: label.to_string(),
            value,
            comments: None,
            recorded_at: at,
            captured_at: at,
            provider_name: None,
            location_name: None,
            encounter_ref: None,
        }
    }

    fn patient_in(storage: &mut SqliteStorage) -> TargetPatient {
        let patient = TargetPatient::new("Alice Mwangi", None);
        storage.create_patient(&patient, "test").unwrap();
        patient
    }

    #[test]
    fn test_build_malarial_smear() {
        let patient = TargetPatient::new("Alice Mwangi", None);
        let obs = observation(
            "5303",
            "Malarial smear",
            Some(ObservationValue::Text("Positive".into())),
        );

        let record = Materializer::default().build(&obs, &patient).unwrap();
        assert_eq!(record.record_type, RecordType::Condition);
        assert_eq!(record.payload.title, "Malarial smear");
        assert_eq!(record.payload.detail, "Positive");
        assert_eq!(record.payload.doctor, UNKNOWN_DOCTOR);
        assert_eq!(record.payload.hospital, UNKNOWN_HOSPITAL);
        assert_eq!(record.provenance.source_observation_id, "5303");
        assert_eq!(record.content_hash.len(), 64);
    }

    #[test]
    fn test_build_is_deterministic() {
        let patient = TargetPatient::new("Alice Mwangi", None);
        let mut obs = observation("1", "Temperature", Some(ObservationValue::Numeric(38.0)));
        obs.provider_name = Some("Jake Doctor".into());
        obs.location_name = Some("Site 1".into());
        obs.comments = Some("  recheck tomorrow ".into());

        let a = Materializer::default().build(&obs, &patient).unwrap();
        let b = Materializer::default().build(&obs, &patient).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.payload.detail, "38");
        assert_eq!(a.payload.notes.as_deref(), Some("recheck tomorrow"));
        assert_eq!(a.provenance.provider_name, "Jake Doctor");
    }

    #[test]
    fn test_unknown_concept_and_missing_value_still_produce_record() {
        let patient = TargetPatient::new("Alice Mwangi", None);
        let obs = observation("2", "Weight (kg)", None);

        let record = Materializer::default().build(&obs, &patient).unwrap();
        assert_eq!(record.record_type, RecordType::Condition);
        assert_eq!(record.payload.category, GENERAL_CATEGORY);
        assert_eq!(record.payload.detail, NO_VALUE_DETAIL);
    }

    #[test]
    fn test_materialize_twice_yields_one_record() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let patient = patient_in(&mut storage);
        let obs = observation("5303", "Malarial smear", Some(ObservationValue::Text("Positive".into())));
        let resolution = Resolution::NameMatch(patient.clone());
        let materializer = Materializer::default();

        assert_eq!(
            materializer.materialize(&mut storage, &obs, &resolution).unwrap(),
            MaterializeOutcome::Inserted(RecordType::Condition)
        );
        assert_eq!(
            materializer.materialize(&mut storage, &obs, &resolution).unwrap(),
            MaterializeOutcome::Duplicate
        );
        assert_eq!(storage.count_records(&patient.id).unwrap(), 1);
    }

    #[test]
    fn test_unresolved_is_skipped() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let obs = observation("1", "Visit", None);
        let materializer = Materializer::default();

        assert_eq!(
            materializer
                .materialize(&mut storage, &obs, &Resolution::NotFound)
                .unwrap(),
            MaterializeOutcome::Skipped(SkipReason::UnresolvedPatient)
        );
        let ambiguous = Resolution::Ambiguous {
            level: crate::identity::MatchLevel::ExactName,
            candidates: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            materializer.materialize(&mut storage, &obs, &ambiguous).unwrap(),
            MaterializeOutcome::Skipped(SkipReason::AmbiguousPatient)
        );
    }

    #[test]
    fn test_write_failure_surfaces_after_retries() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        // Patient never stored: the foreign key rejects every attempt
        let ghost = TargetPatient::new("Ghost", None);
        let obs = observation("1", "Visit", None);

        let err = Materializer::new(1)
            .materialize(&mut storage, &obs, &Resolution::LinkedMatch(ghost))
            .unwrap_err();
        assert!(matches!(err, Error::TargetWriteFailure { .. }));
    }
}
