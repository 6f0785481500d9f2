//! Data models for Passport Sync.
//!
//! This module contains the domain models on both sides of the sync:
//! - SourceObservation (hospital system)
//! - TargetPatient, IdentityLink (portal)
//! - SyncedRecord (portal, written by the sync path)

pub mod observation;
pub mod patient;
pub mod record;

pub use observation::{NameParts, ObservationValue, SourceObservation};
pub use patient::{normalize_name, IdentityLink, LinkSource, TargetPatient};
pub use record::{Provenance, RecordPayload, RecordType, SyncedRecord};
