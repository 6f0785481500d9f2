//! Materialized clinical record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Portal record category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Condition,
    Medication,
    Test,
    Visit,
}

impl RecordType {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Condition => "condition",
            Self::Medication => "medication",
            Self::Test => "test",
            Self::Visit => "visit",
        }
    }

    /// All record types, in display order.
    pub const ALL: [Self; 4] = [Self::Condition, Self::Medication, Self::Test, Self::Visit];
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "condition" | "diagnosis" => Ok(Self::Condition),
            "medication" => Ok(Self::Medication),
            "test" => Ok(Self::Test),
            "visit" => Ok(Self::Visit),
            _ => Err(format!("Unknown record type: {s}")),
        }
    }
}

/// Where a record came from in the source system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub source_observation_id: String,
    pub captured_at: DateTime<Utc>,
    pub provider_name: String,
    pub location_name: String,
}

/// Display payload of a record, as the portal renders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPayload {
    /// Concept label from the source
    pub title: String,
    /// Vocabulary the classifier matched, or a generic label
    pub category: String,
    /// Single human-readable value
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encounter_ref: Option<String>,
    pub doctor: String,
    pub hospital: String,
}

/// A clinical record written by the sync path.
///
/// `(patient_id, source_observation_id)` is unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedRecord {
    pub patient_id: String,
    pub source_observation_id: String,
    pub record_type: RecordType,
    pub payload: RecordPayload,
    pub provenance: Provenance,
    /// SHA256 of the serialized payload and provenance
    pub content_hash: String,
}
