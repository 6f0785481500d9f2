//! Identity resolution across the source and portal systems.
//!
//! A source subject is mapped to a portal patient with a fixed priority:
//!
//! 1. An existing identity link (authoritative, survives renames)
//! 2. An external stable identifier such as a national ID
//! 3. Exact normalized full name among active patients
//! 4. Given and family name both contained in an active patient's name
//! 5. Auto-provisioning a new patient
//!
//! Two or more candidates at the same level are never guessed between.
//! The cascade stops there, a data-quality warning is logged, and a new
//! patient is provisioned instead.

use crate::error::{Error, Result};
use crate::model::{normalize_name, LinkSource, NameParts, TargetPatient};
use crate::storage::SqliteStorage;
use tracing::{debug, info, warn};

/// Actor recorded on links and patients written by the resolver.
pub const SYNC_ACTOR: &str = "sync";

/// Candidate level at which a lookup was performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLevel {
    ExternalId,
    ExactName,
    PartialName,
}

impl MatchLevel {
    /// Get the string representation for logs and errors.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalId => "external_id",
            Self::ExactName => "exact_name",
            Self::PartialName => "partial_name",
        }
    }

    const fn link_source(self) -> LinkSource {
        match self {
            Self::ExternalId => LinkSource::ExternalId,
            Self::ExactName => LinkSource::ExactName,
            Self::PartialName => LinkSource::PartialName,
        }
    }
}

/// Why a subject resolved the way it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// An identity link already existed.
    LinkedMatch(TargetPatient),
    /// Matched on an external stable identifier.
    IdMatch(TargetPatient),
    /// Matched on the normalized full name.
    NameMatch(TargetPatient),
    /// Given and family name both found in the patient's name.
    PartialMatch(TargetPatient),
    /// A new patient was created for the subject.
    AutoProvisioned {
        patient: TargetPatient,
        /// Provisioned because several candidates tied at one level.
        after_ambiguity: bool,
    },
    /// Several candidates tied and provisioning is disabled.
    Ambiguous {
        level: MatchLevel,
        candidates: Vec<String>,
    },
    /// Nothing matched and no patient could be provisioned.
    NotFound,
}

impl Resolution {
    /// The resolved patient, if any.
    #[must_use]
    pub fn patient(&self) -> Option<&TargetPatient> {
        match self {
            Self::LinkedMatch(p)
            | Self::IdMatch(p)
            | Self::NameMatch(p)
            | Self::PartialMatch(p)
            | Self::AutoProvisioned { patient: p, .. } => Some(p),
            Self::Ambiguous { .. } | Self::NotFound => None,
        }
    }

    /// Short machine-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::LinkedMatch(_) => "linked",
            Self::IdMatch(_) => "external_id",
            Self::NameMatch(_) => "exact_name",
            Self::PartialMatch(_) => "partial_name",
            Self::AutoProvisioned { .. } => "auto_provisioned",
            Self::Ambiguous { .. } => "ambiguous",
            Self::NotFound => "not_found",
        }
    }

    /// Convert an unresolved outcome into the error describing it.
    ///
    /// Returns `None` for resolutions that carry a patient.
    #[must_use]
    pub fn into_error(self, subject: &str) -> Option<Error> {
        match self {
            Self::Ambiguous { level, candidates } => Some(Error::AmbiguousIdentity {
                subject: subject.to_string(),
                level: level.as_str().to_string(),
                candidates,
            }),
            Self::NotFound => Some(Error::LinkNotFound {
                subject: subject.to_string(),
            }),
            _ => None,
        }
    }
}

/// What the resolver knows about a source subject.
#[derive(Debug, Clone, Copy)]
pub struct SubjectIdentity<'a> {
    pub subject_external_id: &'a str,
    pub name: &'a NameParts,
    pub national_id: Option<&'a str>,
}

enum Lookup {
    None,
    One(TargetPatient),
    Many(Vec<String>),
}

impl From<Vec<TargetPatient>> for Lookup {
    fn from(mut candidates: Vec<TargetPatient>) -> Self {
        match candidates.len() {
            0 => Self::None,
            1 => candidates.pop().map_or(Self::None, Self::One),
            _ => Self::Many(candidates.into_iter().map(|p| p.id).collect()),
        }
    }
}

/// Prioritized subject-to-patient resolver.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    auto_provision: bool,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(true)
    }
}

impl IdentityResolver {
    /// Create a resolver. With `auto_provision` off, unmatched and ambiguous
    /// subjects come back as `NotFound` / `Ambiguous` instead.
    #[must_use]
    pub const fn new(auto_provision: bool) -> Self {
        Self { auto_provision }
    }

    /// Resolve a source subject to a portal patient.
    ///
    /// Any match below the link level is persisted as a link before
    /// returning, so the next call short-circuits.
    ///
    /// # Errors
    ///
    /// Returns an error if the portal store cannot be read or written.
    pub fn resolve(
        &self,
        storage: &mut SqliteStorage,
        subject: SubjectIdentity<'_>,
    ) -> Result<Resolution> {
        let subject_id = subject.subject_external_id;

        if let Some(link) = storage.get_link(subject_id)? {
            if let Some(patient) = storage.get_patient(&link.patient_id)? {
                debug!(subject = subject_id, patient = %patient.id, "Resolved via existing link");
                return Ok(Resolution::LinkedMatch(patient));
            }
        }

        for level in [MatchLevel::ExternalId, MatchLevel::ExactName, MatchLevel::PartialName] {
            match Self::lookup(storage, level, &subject)? {
                Lookup::None => {}
                Lookup::One(patient) => {
                    return Self::persist_match(storage, subject_id, patient, level);
                }
                Lookup::Many(candidates) => {
                    warn!(
                        subject = subject_id,
                        level = level.as_str(),
                        candidates = ?candidates,
                        "Ambiguous identity: several patients match, refusing to guess"
                    );
                    if self.auto_provision {
                        return Self::provision(storage, &subject, true);
                    }
                    return Ok(Resolution::Ambiguous { level, candidates });
                }
            }
        }

        if self.auto_provision {
            Self::provision(storage, &subject, false)
        } else {
            Ok(Resolution::NotFound)
        }
    }

    fn lookup(
        storage: &SqliteStorage,
        level: MatchLevel,
        subject: &SubjectIdentity<'_>,
    ) -> Result<Lookup> {
        let candidates = match level {
            MatchLevel::ExternalId => match subject.national_id.map(str::trim) {
                Some(id) if !id.is_empty() => storage.find_patients_by_external_id(id)?,
                _ => Vec::new(),
            },
            MatchLevel::ExactName => {
                let normalized = normalize_name(&subject.name.full_name());
                if normalized.is_empty() {
                    Vec::new()
                } else {
                    storage.find_patients_by_normalized_name(&normalized)?
                }
            }
            MatchLevel::PartialName => {
                let given = normalize_name(&subject.name.given);
                let family = normalize_name(&subject.name.family);
                if given.is_empty() || family.is_empty() {
                    Vec::new()
                } else {
                    storage.find_patients_by_name_parts(&given, &family)?
                }
            }
        };
        Ok(candidates.into())
    }

    fn persist_match(
        storage: &mut SqliteStorage,
        subject_id: &str,
        patient: TargetPatient,
        level: MatchLevel,
    ) -> Result<Resolution> {
        let link = storage.link_subject(subject_id, &patient.id, level.link_source(), SYNC_ACTOR)?;

        if link.patient_id != patient.id {
            // Another writer linked this subject first; its link wins
            return Self::linked(storage, subject_id, &link.patient_id);
        }

        info!(
            subject = subject_id,
            patient = %patient.id,
            matched_by = level.as_str(),
            "Linked subject to patient"
        );
        Ok(match level {
            MatchLevel::ExternalId => Resolution::IdMatch(patient),
            MatchLevel::ExactName => Resolution::NameMatch(patient),
            MatchLevel::PartialName => Resolution::PartialMatch(patient),
        })
    }

    fn provision(
        storage: &mut SqliteStorage,
        subject: &SubjectIdentity<'_>,
        after_ambiguity: bool,
    ) -> Result<Resolution> {
        let display_name = subject.name.full_name();
        if display_name.is_empty() {
            warn!(
                subject = subject.subject_external_id,
                "Subject has no usable name, cannot provision a patient"
            );
            return Ok(Resolution::NotFound);
        }

        let candidate = TargetPatient::new(&display_name, subject.national_id).provisioned();
        let link = storage.provision_patient(&candidate, subject.subject_external_id, SYNC_ACTOR)?;

        if link.patient_id != candidate.id {
            return Self::linked(storage, subject.subject_external_id, &link.patient_id);
        }

        let patient = storage
            .get_patient(&candidate.id)?
            .ok_or_else(|| Error::PatientNotFound {
                id: candidate.id.clone(),
            })?;

        info!(
            subject = subject.subject_external_id,
            patient = %patient.id,
            after_ambiguity,
            "Auto-provisioned patient"
        );
        Ok(Resolution::AutoProvisioned {
            patient,
            after_ambiguity,
        })
    }

    fn linked(storage: &SqliteStorage, subject_id: &str, patient_id: &str) -> Result<Resolution> {
        debug!(subject = subject_id, patient = patient_id, "Subject linked concurrently");
        storage
            .get_patient(patient_id)?
            .map(Resolution::LinkedMatch)
            .ok_or_else(|| Error::PatientNotFound {
                id: patient_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject<'a>(id: &'a str, name: &'a NameParts, national_id: Option<&'a str>) -> SubjectIdentity<'a> {
        SubjectIdentity {
            subject_external_id: id,
            name,
            national_id,
        }
    }

    fn add_patient(storage: &mut SqliteStorage, name: &str, external_id: Option<&str>) -> TargetPatient {
        let patient = TargetPatient::new(name, external_id);
        storage.create_patient(&patient, "test").unwrap();
        patient
    }

    #[test]
    fn test_exact_name_match_persists_link() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let alice = add_patient(&mut storage, "Alice Mwangi", None);
        let name = NameParts::new("alice", None, "MWANGI");

        let resolution = IdentityResolver::default()
            .resolve(&mut storage, subject("100", &name, None))
            .unwrap();
        assert_eq!(resolution, Resolution::NameMatch(alice.clone()));

        let link = storage.get_link("100").unwrap().unwrap();
        assert_eq!(link.patient_id, alice.id);
        assert_eq!(link.matched_by, LinkSource::ExactName);
    }

    #[test]
    fn test_link_is_sticky_across_renames() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let alice = add_patient(&mut storage, "Alice Mwangi", None);
        let resolver = IdentityResolver::default();

        let original = NameParts::new("Alice", None, "Mwangi");
        resolver
            .resolve(&mut storage, subject("100", &original, None))
            .unwrap();

        // The source renames the subject; a patient with the new name exists too
        add_patient(&mut storage, "Alice Otieno", None);
        let renamed = NameParts::new("Alice", None, "Otieno");
        let resolution = resolver
            .resolve(&mut storage, subject("100", &renamed, None))
            .unwrap();

        assert_eq!(resolution, Resolution::LinkedMatch(alice));
        assert_eq!(storage.counts().unwrap().provisioned_patients, 0);
    }

    #[test]
    fn test_external_id_beats_partial_name() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        // Partial-name candidate created first
        add_patient(&mut storage, "Grace Achieng Njeri", None);
        let by_id = add_patient(&mut storage, "G. Njeri", Some("NID-42"));

        let name = NameParts::new("Grace", None, "Njeri");
        let resolution = IdentityResolver::default()
            .resolve(&mut storage, subject("7", &name, Some("NID-42")))
            .unwrap();

        assert_eq!(resolution, Resolution::IdMatch(by_id));
        assert_eq!(
            storage.get_link("7").unwrap().unwrap().matched_by,
            LinkSource::ExternalId
        );
    }

    #[test]
    fn test_partial_name_match() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let patient = add_patient(&mut storage, "Grace Achieng Njeri", None);

        let name = NameParts::new("Grace", None, "Njeri");
        let resolution = IdentityResolver::default()
            .resolve(&mut storage, subject("8", &name, None))
            .unwrap();
        assert_eq!(resolution, Resolution::PartialMatch(patient));
    }

    #[test]
    fn test_duplicate_names_auto_provision() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let first = add_patient(&mut storage, "John Doe", None);
        let second = add_patient(&mut storage, "John Doe", None);

        let name = NameParts::new("John", None, "Doe");
        let resolution = IdentityResolver::default()
            .resolve(&mut storage, subject("55", &name, None))
            .unwrap();

        let Resolution::AutoProvisioned {
            patient,
            after_ambiguity,
        } = resolution
        else {
            panic!("expected auto-provisioning, got {resolution:?}");
        };
        assert!(after_ambiguity);
        assert_ne!(patient.id, first.id);
        assert_ne!(patient.id, second.id);
        assert!(patient.provisioned_by_sync);
        assert_eq!(storage.get_link("55").unwrap().unwrap().patient_id, patient.id);
    }

    #[test]
    fn test_ambiguous_without_provisioning() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        add_patient(&mut storage, "John Doe", None);
        add_patient(&mut storage, "john  doe", None);

        let name = NameParts::new("John", None, "Doe");
        let resolution = IdentityResolver::new(false)
            .resolve(&mut storage, subject("55", &name, None))
            .unwrap();

        match &resolution {
            Resolution::Ambiguous { level, candidates } => {
                assert_eq!(*level, MatchLevel::ExactName);
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
        assert!(storage.get_link("55").unwrap().is_none());
        assert!(matches!(
            resolution.into_error("55"),
            Some(Error::AmbiguousIdentity { .. })
        ));
    }

    #[test]
    fn test_unmatched_subject_is_provisioned_once() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let resolver = IdentityResolver::default();
        let name = NameParts::new("Amina", None, "Hassan");

        let first = resolver
            .resolve(&mut storage, subject("9", &name, Some("NID-9")))
            .unwrap();
        assert!(matches!(
            first,
            Resolution::AutoProvisioned {
                after_ambiguity: false,
                ..
            }
        ));
        let patient = first.patient().unwrap().clone();
        assert_eq!(patient.display_name, "Amina Hassan");
        assert_eq!(patient.external_identifier.as_deref(), Some("NID-9"));

        let second = resolver
            .resolve(&mut storage, subject("9", &name, Some("NID-9")))
            .unwrap();
        assert_eq!(second, Resolution::LinkedMatch(patient));
        assert_eq!(storage.counts().unwrap().patients, 1);
    }

    #[test]
    fn test_not_found_without_provisioning() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let name = NameParts::new("Nobody", None, "Known");
        let resolution = IdentityResolver::new(false)
            .resolve(&mut storage, subject("1", &name, None))
            .unwrap();
        assert_eq!(resolution, Resolution::NotFound);
        assert!(resolution.patient().is_none());
    }

    #[test]
    fn test_nameless_subject_is_not_provisioned() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let name = NameParts::default();
        let resolution = IdentityResolver::default()
            .resolve(&mut storage, subject("1", &name, None))
            .unwrap();
        assert_eq!(resolution, Resolution::NotFound);
        assert_eq!(storage.counts().unwrap().patients, 0);
    }

    #[test]
    fn test_inactive_patients_are_not_candidates() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let retired = add_patient(&mut storage, "Peter Kamau", None);
        storage.set_patient_active(&retired.id, false, "test").unwrap();

        let name = NameParts::new("Peter", None, "Kamau");
        let resolution = IdentityResolver::default()
            .resolve(&mut storage, subject("3", &name, None))
            .unwrap();
        assert_ne!(resolution.patient().unwrap().id, retired.id);
        assert_eq!(resolution.label(), "auto_provisioned");
    }
}
