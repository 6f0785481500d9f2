//! Portal-side patient and identity-link models.

use serde::{Deserialize, Serialize};

/// Normalize a name for comparison: trim, lowercase, collapse inner whitespace.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A patient in the portal datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPatient {
    /// Unique identifier (`pat_` prefix)
    pub id: String,

    /// National ID or other stable identifier shared with the source system
    pub external_identifier: Option<String>,

    /// Name shown in the portal
    pub display_name: String,

    /// Portal user account owning this patient record
    pub linked_account_id: String,

    /// Inactive patients are never name-match candidates
    pub active: bool,

    /// Created by the sync engine rather than self-registration
    pub provisioned_by_sync: bool,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl TargetPatient {
    /// Create a new active patient with fresh patient and account IDs.
    pub fn new(display_name: &str, external_identifier: Option<&str>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("pat_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            external_identifier: external_identifier
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
            display_name: display_name.trim().to_string(),
            linked_account_id: format!("acct_{}", uuid::Uuid::new_v4().simple()),
            active: true,
            provisioned_by_sync: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark this patient as created by auto-provisioning.
    #[must_use]
    pub fn provisioned(mut self) -> Self {
        self.provisioned_by_sync = true;
        self
    }
}

/// How a subject came to be linked to a patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSource {
    ExternalId,
    ExactName,
    PartialName,
    AutoProvisioned,
    Manual,
}

impl LinkSource {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalId => "external_id",
            Self::ExactName => "exact_name",
            Self::PartialName => "partial_name",
            Self::AutoProvisioned => "auto_provisioned",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for LinkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external_id" => Ok(Self::ExternalId),
            "exact_name" => Ok(Self::ExactName),
            "partial_name" => Ok(Self::PartialName),
            "auto_provisioned" => Ok(Self::AutoProvisioned),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown link source: {s}")),
        }
    }
}

/// A persisted `subject_external_id -> patient_id` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub subject_external_id: String,
    pub patient_id: String,
    pub matched_by: LinkSource,
    /// Unix milliseconds
    pub linked_at: i64,
}
