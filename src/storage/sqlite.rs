//! SQLite storage implementation.
//!
//! This module provides the portal datastore backend using SQLite.
//! It follows the MutationContext pattern for transaction discipline and audit logging.

use crate::error::{Error, Result};
use crate::model::{
    normalize_name, IdentityLink, LinkSource, Provenance, RecordPayload, RecordType,
    SyncedRecord, TargetPatient,
};
use crate::storage::events::{get_events, insert_event, Event, EventType};
use crate::storage::schema::apply_schema;
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

/// Context for a mutation operation, tracking side effects.
///
/// Passed to mutation closures so they can record audit events that are
/// written in the same transaction as the change itself.
pub struct MutationContext {
    /// Name of the operation being performed.
    pub op_name: String,
    /// Actor performing the operation (`sync`, an operator name, ...).
    pub actor: String,
    /// Events to write at the end of the transaction.
    pub events: Vec<Event>,
}

impl MutationContext {
    /// Create a new mutation context.
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            events: Vec::new(),
        }
    }

    /// Record an event for this operation.
    pub fn record_event(&mut self, entity_type: &str, entity_id: &str, event_type: EventType) {
        self.events
            .push(Event::new(entity_type, entity_id, event_type, &self.actor));
    }

    /// Record an event with old/new values for field tracking.
    pub fn record_change(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        event_type: EventType,
        old_value: Option<String>,
        new_value: Option<String>,
    ) {
        self.events.push(
            Event::new(entity_type, entity_id, event_type, &self.actor)
                .with_values(old_value, new_value),
        );
    }
}

/// Result of attempting to write a synced record.
///
/// `Duplicate` is the expected outcome of an idempotent re-run, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

impl SqliteStorage {
    /// Open a database at the given path.
    ///
    /// Creates the database and applies schema if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;

        if let Some(timeout) = timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        } else {
            // Default 5 second timeout
            conn.busy_timeout(Duration::from_secs(5))?;
        }

        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Get a reference to the underlying connection (for read operations).
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Execute a mutation with the transaction protocol.
    ///
    /// This method:
    /// 1. Begins an IMMEDIATE transaction (for write locking)
    /// 2. Executes the mutation closure
    /// 3. Writes audit events
    /// 4. Commits (or rolls back on error)
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The transaction is rolled back on error.
    pub fn mutate<F, R>(&mut self, op: &str, actor: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let mut ctx = MutationContext::new(op, actor);

        let result = f(&tx, &mut ctx)?;

        for event in &ctx.events {
            insert_event(&tx, event)?;
        }

        tx.commit()?;

        Ok(result)
    }

    // ==================
    // Patient Operations
    // ==================

    /// Create a new patient.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (for example a reused account ID).
    pub fn create_patient(&mut self, patient: &TargetPatient, actor: &str) -> Result<()> {
        self.mutate("create_patient", actor, |tx, ctx| {
            insert_patient(tx, patient)?;
            ctx.record_change(
                "patient",
                &patient.id,
                EventType::PatientCreated,
                None,
                Some(patient.display_name.clone()),
            );
            Ok(())
        })
    }

    /// Get a patient by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_patient(&self, id: &str) -> Result<Option<TargetPatient>> {
        let patient = self
            .conn
            .query_row(
                &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = ?1"),
                [id],
                map_patient_row,
            )
            .optional()?;
        Ok(patient)
    }

    /// List patients, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_patients(&self, active_only: bool, limit: Option<u32>) -> Result<Vec<TargetPatient>> {
        let limit = limit.unwrap_or(100);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PATIENT_COLUMNS} FROM patients
             WHERE (?1 = 0 OR active = 1)
             ORDER BY created_at DESC, id
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![active_only, limit], map_patient_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Activate or deactivate a patient.
    ///
    /// Inactive patients keep their links and records but stop being
    /// candidates for name and identifier matching.
    ///
    /// # Errors
    ///
    /// Returns `PatientNotFound` if no such patient exists.
    pub fn set_patient_active(&mut self, id: &str, active: bool, actor: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.mutate("set_patient_active", actor, |tx, ctx| {
            let updated = tx.execute(
                "UPDATE patients SET active = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![active, now, id],
            )?;
            if updated == 0 {
                return Err(Error::PatientNotFound { id: id.to_string() });
            }
            let event_type = if active {
                EventType::PatientReactivated
            } else {
                EventType::PatientDeactivated
            };
            ctx.record_event("patient", id, event_type);
            Ok(())
        })
    }

    /// Change a patient's display name, keeping the normalized name in step.
    ///
    /// # Errors
    ///
    /// Returns `PatientNotFound` if no such patient exists.
    pub fn rename_patient(&mut self, id: &str, display_name: &str, actor: &str) -> Result<()> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(Error::InvalidArgument("Display name cannot be empty".into()));
        }
        let now = chrono::Utc::now().timestamp_millis();
        self.mutate("rename_patient", actor, |tx, ctx| {
            let old: Option<String> = tx
                .query_row(
                    "SELECT display_name FROM patients WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(old) = old else {
                return Err(Error::PatientNotFound { id: id.to_string() });
            };
            tx.execute(
                "UPDATE patients SET display_name = ?1, normalized_name = ?2, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![display_name, normalize_name(display_name), now, id],
            )?;
            ctx.record_change(
                "patient",
                id,
                EventType::PatientUpdated,
                Some(old),
                Some(display_name.to_string()),
            );
            Ok(())
        })
    }

    /// Active patients carrying the given external identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_patients_by_external_id(&self, external_id: &str) -> Result<Vec<TargetPatient>> {
        self.query_patients(
            "external_identifier = ?1 AND active = 1",
            &[&external_id.trim()],
        )
    }

    /// Active patients whose normalized full name equals `normalized`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_patients_by_normalized_name(&self, normalized: &str) -> Result<Vec<TargetPatient>> {
        self.query_patients("normalized_name = ?1 AND active = 1", &[&normalized])
    }

    /// Active patients whose normalized name contains both name fragments.
    ///
    /// Fragments are expected to be normalized already.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_patients_by_name_parts(
        &self,
        given: &str,
        family: &str,
    ) -> Result<Vec<TargetPatient>> {
        self.query_patients(
            "active = 1 AND instr(normalized_name, ?1) > 0 AND instr(normalized_name, ?2) > 0",
            &[&given, &family],
        )
    }

    fn query_patients(
        &self,
        predicate: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<TargetPatient>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PATIENT_COLUMNS} FROM patients WHERE {predicate} ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params, map_patient_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ========================
    // Identity Link Operations
    // ========================

    /// Get the persisted link for a source subject.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_link(&self, subject_external_id: &str) -> Result<Option<IdentityLink>> {
        read_link(&self.conn, subject_external_id).map_err(Into::into)
    }

    /// List links, optionally only those pointing at one patient.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_links(&self, patient_id: Option<&str>) -> Result<Vec<IdentityLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject_external_id, patient_id, matched_by, linked_at
             FROM identity_links
             WHERE (?1 IS NULL OR patient_id = ?1)
             ORDER BY linked_at DESC, subject_external_id",
        )?;
        let rows = stmt.query_map([patient_id], map_link_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Link a subject to an existing patient unless it is already linked.
    ///
    /// The first link written for a subject wins. The returned link is the
    /// one actually stored, which may point at a different patient if
    /// another writer got there first.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails (for example an unknown patient).
    pub fn link_subject(
        &mut self,
        subject_external_id: &str,
        patient_id: &str,
        matched_by: LinkSource,
        actor: &str,
    ) -> Result<IdentityLink> {
        let now = chrono::Utc::now().timestamp_millis();
        self.mutate("link_subject", actor, |tx, ctx| {
            let inserted = tx.execute(
                "INSERT INTO identity_links (subject_external_id, patient_id, matched_by, linked_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(subject_external_id) DO NOTHING",
                rusqlite::params![subject_external_id, patient_id, matched_by.as_str(), now],
            )?;
            if inserted > 0 {
                ctx.events.push(
                    Event::new(
                        "identity_link",
                        subject_external_id,
                        EventType::SubjectLinked,
                        &ctx.actor,
                    )
                    .with_values(None, Some(patient_id.to_string()))
                    .with_comment(matched_by.as_str()),
                );
            }
            read_link(tx, subject_external_id)?.ok_or_else(|| Error::LinkNotFound {
                subject: subject_external_id.to_string(),
            })
        })
    }

    /// Create a patient for a subject and link them, in one transaction.
    ///
    /// If the subject was linked in the meantime the existing link is
    /// returned and no patient is created. The patient's external identifier
    /// is dropped when another patient already carries it.
    ///
    /// # Errors
    ///
    /// Returns an error if the writes fail.
    pub fn provision_patient(
        &mut self,
        patient: &TargetPatient,
        subject_external_id: &str,
        actor: &str,
    ) -> Result<IdentityLink> {
        self.mutate("provision_patient", actor, |tx, ctx| {
            if let Some(existing) = read_link(tx, subject_external_id)? {
                return Ok(existing);
            }

            let mut patient = patient.clone();
            if let Some(external_id) = patient.external_identifier.as_deref() {
                let in_use: bool = tx
                    .prepare("SELECT 1 FROM patients WHERE external_identifier = ?1")?
                    .exists([external_id])?;
                if in_use {
                    patient.external_identifier = None;
                }
            }

            insert_patient(tx, &patient)?;
            tx.execute(
                "INSERT INTO identity_links (subject_external_id, patient_id, matched_by, linked_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    subject_external_id,
                    patient.id,
                    LinkSource::AutoProvisioned.as_str(),
                    patient.created_at
                ],
            )?;

            ctx.record_change(
                "patient",
                &patient.id,
                EventType::PatientCreated,
                None,
                Some(patient.display_name.clone()),
            );
            ctx.record_change(
                "identity_link",
                subject_external_id,
                EventType::SubjectLinked,
                None,
                Some(patient.id.clone()),
            );

            Ok(IdentityLink {
                subject_external_id: subject_external_id.to_string(),
                patient_id: patient.id.clone(),
                matched_by: LinkSource::AutoProvisioned,
                linked_at: patient.created_at,
            })
        })
    }

    /// Pin a subject to a patient, replacing any existing link.
    ///
    /// This is the operator repair path; the sync path never replaces links.
    ///
    /// # Errors
    ///
    /// Returns `PatientNotFound` if the patient does not exist.
    pub fn set_link(
        &mut self,
        subject_external_id: &str,
        patient_id: &str,
        actor: &str,
    ) -> Result<IdentityLink> {
        let now = chrono::Utc::now().timestamp_millis();
        self.mutate("set_link", actor, |tx, ctx| {
            let exists = tx
                .prepare("SELECT 1 FROM patients WHERE id = ?1")?
                .exists([patient_id])?;
            if !exists {
                return Err(Error::PatientNotFound {
                    id: patient_id.to_string(),
                });
            }

            let previous = read_link(tx, subject_external_id)?;
            tx.execute(
                "INSERT INTO identity_links (subject_external_id, patient_id, matched_by, linked_at)
                 VALUES (?1, ?2, 'manual', ?3)
                 ON CONFLICT(subject_external_id) DO UPDATE SET
                    patient_id = excluded.patient_id,
                    matched_by = excluded.matched_by,
                    linked_at = excluded.linked_at",
                rusqlite::params![subject_external_id, patient_id, now],
            )?;

            let event_type = if previous.is_some() {
                EventType::LinkReplaced
            } else {
                EventType::SubjectLinked
            };
            ctx.record_change(
                "identity_link",
                subject_external_id,
                event_type,
                previous.map(|link| link.patient_id),
                Some(patient_id.to_string()),
            );

            Ok(IdentityLink {
                subject_external_id: subject_external_id.to_string(),
                patient_id: patient_id.to_string(),
                matched_by: LinkSource::Manual,
                linked_at: now,
            })
        })
    }

    /// Remove a subject's link so the next sync resolves it afresh.
    ///
    /// # Errors
    ///
    /// Returns `LinkNotFound` if the subject has no link.
    pub fn remove_link(&mut self, subject_external_id: &str, actor: &str) -> Result<IdentityLink> {
        self.mutate("remove_link", actor, |tx, ctx| {
            let Some(link) = read_link(tx, subject_external_id)? else {
                return Err(Error::LinkNotFound {
                    subject: subject_external_id.to_string(),
                });
            };
            tx.execute(
                "DELETE FROM identity_links WHERE subject_external_id = ?1",
                [subject_external_id],
            )?;
            ctx.record_change(
                "identity_link",
                subject_external_id,
                EventType::LinkRemoved,
                Some(link.patient_id.clone()),
                None,
            );
            Ok(link)
        })
    }

    // =================
    // Record Operations
    // =================

    /// Insert a synced record, treating the dedup constraint as success.
    ///
    /// Existing records are never touched.
    ///
    /// # Errors
    ///
    /// Returns `TargetWriteFailure` for any storage failure other than the
    /// uniqueness constraint.
    pub fn insert_synced_record(
        &mut self,
        record: &SyncedRecord,
        actor: &str,
    ) -> Result<InsertOutcome> {
        let write_failure = |message: String| Error::TargetWriteFailure {
            obs_id: record.source_observation_id.clone(),
            message,
        };
        let payload = serde_json::to_string(&record.payload)?;
        let provenance = serde_json::to_string(&record.provenance)?;
        let now = chrono::Utc::now().timestamp_millis();

        self.mutate("insert_synced_record", actor, |tx, ctx| {
            let result = tx.execute(
                "INSERT INTO clinical_records
                 (patient_id, source_observation_id, record_type, payload, provenance, content_hash, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.patient_id,
                    record.source_observation_id,
                    record.record_type.as_str(),
                    payload,
                    provenance,
                    record.content_hash,
                    now,
                ],
            );

            match result {
                Ok(_) => {
                    ctx.events.push(
                        Event::new(
                            "clinical_record",
                            &tx.last_insert_rowid().to_string(),
                            EventType::RecordSynced,
                            &ctx.actor,
                        )
                        .with_values(None, Some(record.source_observation_id.clone()))
                        .with_comment(record.record_type.as_str()),
                    );
                    Ok(InsertOutcome::Inserted)
                }
                Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
                Err(e) => Err(write_failure(e.to_string())),
            }
        })
        .map_err(|e| match e {
            Error::Database(db) => write_failure(db.to_string()),
            other => other,
        })
    }

    /// List a patient's records, optionally of one type, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored payload is not valid JSON.
    pub fn list_records(
        &self,
        patient_id: &str,
        record_type: Option<RecordType>,
        limit: Option<u32>,
    ) -> Result<Vec<StoredRecord>> {
        let limit = limit.unwrap_or(100);
        let mut stmt = self.conn.prepare(
            "SELECT id, patient_id, source_observation_id, record_type, payload, provenance,
                    content_hash, synced_at
             FROM clinical_records
             WHERE patient_id = ?1 AND (?2 IS NULL OR record_type = ?2)
             ORDER BY synced_at DESC, id DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(
            rusqlite::params![patient_id, record_type.map(|t| t.as_str()), limit],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (id, patient_id, obs_id, record_type, payload, provenance, content_hash, synced_at) =
                row?;
            records.push(StoredRecord {
                id,
                patient_id,
                source_observation_id: obs_id,
                record_type: record_type.parse().map_err(Error::Other)?,
                payload: serde_json::from_str(&payload)?,
                provenance: serde_json::from_str(&provenance)?,
                content_hash,
                synced_at,
            });
        }
        Ok(records)
    }

    /// Number of records materialized for a patient.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_records(&self, patient_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM clinical_records WHERE patient_id = ?1",
            [patient_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================
    // Cursor and Run Operations
    // ========================

    /// Get the sync cursor for a source.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_cursor(&self, source_name: &str) -> Result<Option<SyncCursor>> {
        let cursor = self
            .conn
            .query_row(
                "SELECT source_name, last_successful_sync, updated_at
                 FROM sync_cursors WHERE source_name = ?1",
                [source_name],
                |row| {
                    Ok(SyncCursor {
                        source_name: row.get(0)?,
                        last_successful_sync: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    /// Move a source's cursor forward. It never moves backward.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn advance_cursor(&mut self, source_name: &str, to_millis: i64, actor: &str) -> Result<SyncCursor> {
        let now = chrono::Utc::now().timestamp_millis();
        self.mutate("advance_cursor", actor, |tx, ctx| {
            let previous: Option<i64> = tx
                .query_row(
                    "SELECT last_successful_sync FROM sync_cursors WHERE source_name = ?1",
                    [source_name],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO sync_cursors (source_name, last_successful_sync, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_name) DO UPDATE SET
                    last_successful_sync = MAX(last_successful_sync, excluded.last_successful_sync),
                    updated_at = excluded.updated_at",
                rusqlite::params![source_name, to_millis, now],
            )?;

            let current = previous.map_or(to_millis, |p| p.max(to_millis));
            if previous != Some(current) {
                ctx.record_change(
                    "sync_cursor",
                    source_name,
                    EventType::CursorAdvanced,
                    previous.map(|p| p.to_string()),
                    Some(current.to_string()),
                );
            }

            Ok(SyncCursor {
                source_name: source_name.to_string(),
                last_successful_sync: current,
                updated_at: now,
            })
        })
    }

    /// Persist one cycle's report.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn record_run(&mut self, run: &SyncRun) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_runs
             (source_name, started_at, finished_at, status, fetched, synced, duplicates,
              skipped, malformed, errors, cutoff_advanced, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                run.source_name,
                run.started_at,
                run.finished_at,
                run.status.as_str(),
                run.fetched,
                run.synced,
                run.duplicates,
                run.skipped,
                run.malformed,
                run.errors,
                run.cutoff_advanced,
                run.message,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent cycle reports, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn recent_runs(&self, source_name: Option<&str>, limit: u32) -> Result<Vec<SyncRun>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source_name, started_at, finished_at, status, fetched, synced, duplicates,
                    skipped, malformed, errors, cutoff_advanced, message
             FROM sync_runs
             WHERE (?1 IS NULL OR source_name = ?1)
             ORDER BY started_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![source_name, limit], map_run_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Cumulative counters for a source across every persisted cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn run_totals(&self, source_name: &str) -> Result<RunTotals> {
        let totals = self
            .conn
            .query_row(
                "SELECT source_name, cycles_run, cycles_failed, items_fetched, items_synced,
                        items_duplicate, items_skipped, errors, last_finished_at
                 FROM source_run_totals WHERE source_name = ?1",
                [source_name],
                |row| {
                    Ok(RunTotals {
                        source_name: row.get(0)?,
                        cycles_run: row.get(1)?,
                        cycles_failed: row.get(2)?,
                        items_fetched: row.get(3)?,
                        items_synced: row.get(4)?,
                        items_duplicate: row.get(5)?,
                        items_skipped: row.get(6)?,
                        errors: row.get(7)?,
                        last_finished_at: row.get(8)?,
                    })
                },
            )
            .optional()?;

        Ok(totals.unwrap_or_else(|| RunTotals {
            source_name: source_name.to_string(),
            ..RunTotals::default()
        }))
    }

    // =======
    // Summary
    // =======

    /// Row counts across the portal datastore.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub fn counts(&self) -> Result<StoreCounts> {
        let (patients, active, provisioned): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(active), 0),
                    COALESCE(SUM(provisioned_by_sync), 0)
             FROM patients",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let links: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM identity_links", [], |row| row.get(0))?;

        let mut stmt = self.conn.prepare(
            "SELECT record_type, COUNT(*) FROM clinical_records GROUP BY record_type",
        )?;
        let records_by_type = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        Ok(StoreCounts {
            patients: patients as usize,
            active_patients: active as usize,
            provisioned_patients: provisioned as usize,
            identity_links: links as usize,
            records: records_by_type.values().sum::<i64>() as usize,
            records_by_type: records_by_type
                .into_iter()
                .map(|(k, v)| (k, v as usize))
                .collect(),
        })
    }

    /// Audit events for one entity, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn events_for(&self, entity_type: &str, entity_id: &str, limit: Option<u32>) -> Result<Vec<Event>> {
        get_events(&self.conn, entity_type, entity_id, limit).map_err(Into::into)
    }
}

const PATIENT_COLUMNS: &str = "id, external_identifier, display_name, linked_account_id, active, \
                               provisioned_by_sync, created_at, updated_at";

fn insert_patient(tx: &Transaction, patient: &TargetPatient) -> Result<()> {
    tx.execute(
        "INSERT INTO patients (id, external_identifier, display_name, normalized_name,
                               linked_account_id, active, provisioned_by_sync, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            patient.id,
            patient.external_identifier,
            patient.display_name,
            normalize_name(&patient.display_name),
            patient.linked_account_id,
            patient.active,
            patient.provisioned_by_sync,
            patient.created_at,
            patient.updated_at,
        ],
    )?;
    Ok(())
}

fn read_link(conn: &Connection, subject_external_id: &str) -> rusqlite::Result<Option<IdentityLink>> {
    conn.query_row(
        "SELECT subject_external_id, patient_id, matched_by, linked_at
         FROM identity_links WHERE subject_external_id = ?1",
        [subject_external_id],
        map_link_row,
    )
    .optional()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

// Helper to map patient rows
fn map_patient_row(row: &rusqlite::Row) -> rusqlite::Result<TargetPatient> {
    Ok(TargetPatient {
        id: row.get(0)?,
        external_identifier: row.get(1)?,
        display_name: row.get(2)?,
        linked_account_id: row.get(3)?,
        active: row.get(4)?,
        provisioned_by_sync: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

// Helper to map identity link rows
fn map_link_row(row: &rusqlite::Row) -> rusqlite::Result<IdentityLink> {
    let matched_by: String = row.get(2)?;
    Ok(IdentityLink {
        subject_external_id: row.get(0)?,
        patient_id: row.get(1)?,
        // The CHECK constraint keeps unknown values out
        matched_by: matched_by.parse().unwrap_or(LinkSource::Manual),
        linked_at: row.get(3)?,
    })
}

// Helper to map sync run rows
fn map_run_row(row: &rusqlite::Row) -> rusqlite::Result<SyncRun> {
    let status: String = row.get(4)?;
    Ok(SyncRun {
        id: row.get(0)?,
        source_name: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: RunStatus::from_str(&status),
        fetched: row.get(5)?,
        synced: row.get(6)?,
        duplicates: row.get(7)?,
        skipped: row.get(8)?,
        malformed: row.get(9)?,
        errors: row.get(10)?,
        cutoff_advanced: row.get(11)?,
        message: row.get(12)?,
    })
}

// ==================
// Data Structures
// ==================

/// A clinical record as read back from the portal datastore.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    pub patient_id: String,
    pub source_observation_id: String,
    pub record_type: RecordType,
    pub payload: RecordPayload,
    pub provenance: Provenance,
    pub content_hash: Option<String>,
    pub synced_at: i64,
}

/// Persisted "last successful sync" for one source.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SyncCursor {
    pub source_name: String,
    /// Unix milliseconds
    pub last_successful_sync: i64,
    pub updated_at: i64,
}

impl SyncCursor {
    /// The cursor as a UTC timestamp.
    #[must_use]
    pub fn last_sync_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.last_successful_sync)
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Parse from storage, treating anything unknown as failed.
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "aborted" => Self::Aborted,
            _ => Self::Failed,
        }
    }
}

/// One persisted cycle report.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub source_name: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub status: RunStatus,
    pub fetched: u32,
    pub synced: u32,
    pub duplicates: u32,
    pub skipped: u32,
    pub malformed: u32,
    pub errors: u32,
    pub cutoff_advanced: bool,
    pub message: Option<String>,
}

/// Cumulative operator counters for one source.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RunTotals {
    pub source_name: String,
    pub cycles_run: i64,
    pub cycles_failed: i64,
    pub items_fetched: i64,
    pub items_synced: i64,
    pub items_duplicate: i64,
    /// Unresolved and malformed items
    pub items_skipped: i64,
    pub errors: i64,
    pub last_finished_at: Option<i64>,
}

/// Row counts across the portal datastore.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StoreCounts {
    pub patients: usize,
    pub active_patients: usize,
    pub provisioned_patients: usize,
    pub identity_links: usize,
    pub records: usize,
    pub records_by_type: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record(patient_id: &str, obs_id: &str) -> SyncedRecord {
        let at = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        SyncedRecord {
            patient_id: patient_id.to_string(),
            source_observation_id: obs_id.to_string(),
            record_type: RecordType::Condition,
            payload: RecordPayload {
                title: "Malarial smear".into(),
                category: "condition".into(),
                detail: "Positive".into(),
                recorded_at: at,
                notes: None,
                encounter_ref: None,
                doctor: "Unknown Doctor".into(),
                hospital: "Unknown Hospital".into(),
            },
            provenance: Provenance {
                source_observation_id: obs_id.to_string(),
                captured_at: at,
                provider_name: "Unknown Doctor".into(),
                location_name: "Unknown Hospital".into(),
            },
            content_hash: "abc".into(),
        }
    }

    fn storage_with_patient(name: &str) -> (SqliteStorage, TargetPatient) {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let patient = TargetPatient::new(name, None);
        storage.create_patient(&patient, "test").unwrap();
        (storage, patient)
    }

    #[test]
    fn test_open_memory() {
        assert!(SqliteStorage::open_memory().is_ok());
    }

    #[test]
    fn test_patient_crud() {
        let (mut storage, patient) = storage_with_patient("Alice  Mwangi");

        let fetched = storage.get_patient(&patient.id).unwrap().unwrap();
        assert_eq!(fetched, patient);

        let by_name = storage.find_patients_by_normalized_name("alice mwangi").unwrap();
        assert_eq!(by_name.len(), 1);

        storage.rename_patient(&patient.id, "Alice W. Mwangi", "test").unwrap();
        assert!(storage.find_patients_by_normalized_name("alice mwangi").unwrap().is_empty());
        assert_eq!(
            storage.find_patients_by_normalized_name("alice w. mwangi").unwrap().len(),
            1
        );

        storage.set_patient_active(&patient.id, false, "test").unwrap();
        assert!(storage.find_patients_by_normalized_name("alice w. mwangi").unwrap().is_empty());
        assert_eq!(storage.list_patients(true, None).unwrap().len(), 0);
        assert_eq!(storage.list_patients(false, None).unwrap().len(), 1);

        let events = storage.events_for("patient", &patient.id, None).unwrap();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_set_active_unknown_patient() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let err = storage.set_patient_active("pat_nope", false, "test").unwrap_err();
        assert!(matches!(err, Error::PatientNotFound { .. }));
    }

    #[test]
    fn test_find_by_name_parts() {
        let (mut storage, patient) = storage_with_patient("Alice Wanjiru Mwangi");
        storage
            .create_patient(&TargetPatient::new("Bob Otieno", None), "test")
            .unwrap();

        let found = storage.find_patients_by_name_parts("alice", "mwangi").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, patient.id);
        assert!(storage.find_patients_by_name_parts("alice", "otieno").unwrap().is_empty());
    }

    #[test]
    fn test_insert_duplicate_is_not_error() {
        let (mut storage, patient) = storage_with_patient("Alice Mwangi");
        let record = sample_record(&patient.id, "5303");

        assert_eq!(
            storage.insert_synced_record(&record, "sync").unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            storage.insert_synced_record(&record, "sync").unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(storage.count_records(&patient.id).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_never_overwrites() {
        let (mut storage, patient) = storage_with_patient("Alice Mwangi");
        let record = sample_record(&patient.id, "5303");
        storage.insert_synced_record(&record, "sync").unwrap();

        let mut changed = record.clone();
        changed.payload.detail = "Negative".into();
        assert_eq!(
            storage.insert_synced_record(&changed, "sync").unwrap(),
            InsertOutcome::Duplicate
        );

        let records = storage.list_records(&patient.id, None, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload.detail, "Positive");
        assert_eq!(records[0].content_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn test_record_for_unknown_patient_is_write_failure() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let err = storage
            .insert_synced_record(&sample_record("pat_missing", "1"), "sync")
            .unwrap_err();
        assert!(matches!(err, Error::TargetWriteFailure { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_list_records_by_type() {
        let (mut storage, patient) = storage_with_patient("Alice Mwangi");
        storage.insert_synced_record(&sample_record(&patient.id, "1"), "sync").unwrap();
        let mut visit = sample_record(&patient.id, "2");
        visit.record_type = RecordType::Visit;
        storage.insert_synced_record(&visit, "sync").unwrap();

        assert_eq!(storage.list_records(&patient.id, None, None).unwrap().len(), 2);
        let visits = storage
            .list_records(&patient.id, Some(RecordType::Visit), None)
            .unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].source_observation_id, "2");
    }

    #[test]
    fn test_link_is_sticky() {
        let (mut storage, first) = storage_with_patient("John Doe");
        let second = TargetPatient::new("Johnny Doe", None);
        storage.create_patient(&second, "test").unwrap();

        let link = storage
            .link_subject("42", &first.id, LinkSource::ExactName, "sync")
            .unwrap();
        assert_eq!(link.patient_id, first.id);

        // A later writer cannot steal the subject
        let again = storage
            .link_subject("42", &second.id, LinkSource::PartialName, "sync")
            .unwrap();
        assert_eq!(again.patient_id, first.id);
        assert_eq!(again.matched_by, LinkSource::ExactName);
    }

    #[test]
    fn test_provision_patient_links_atomically() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let patient = TargetPatient::new("New Person", Some("NID-1")).provisioned();

        let link = storage.provision_patient(&patient, "77", "sync").unwrap();
        assert_eq!(link.patient_id, patient.id);
        assert_eq!(link.matched_by, LinkSource::AutoProvisioned);

        let stored = storage.get_patient(&patient.id).unwrap().unwrap();
        assert!(stored.provisioned_by_sync);
        assert_eq!(stored.external_identifier.as_deref(), Some("NID-1"));

        // Already linked: nothing new is created
        let other = TargetPatient::new("New Person", Some("NID-1")).provisioned();
        let link = storage.provision_patient(&other, "77", "sync").unwrap();
        assert_eq!(link.patient_id, patient.id);
        assert!(storage.get_patient(&other.id).unwrap().is_none());
    }

    #[test]
    fn test_provision_drops_taken_external_id() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let holder = TargetPatient::new("Holder", Some("NID-9"));
        storage.create_patient(&holder, "test").unwrap();
        storage.set_patient_active(&holder.id, false, "test").unwrap();

        let patient = TargetPatient::new("Someone Else", Some("NID-9")).provisioned();
        storage.provision_patient(&patient, "5", "sync").unwrap();

        let stored = storage.get_patient(&patient.id).unwrap().unwrap();
        assert_eq!(stored.external_identifier, None);
    }

    #[test]
    fn test_manual_link_repair() {
        let (mut storage, first) = storage_with_patient("John Doe");
        let second = TargetPatient::new("John Doe", None);
        storage.create_patient(&second, "test").unwrap();

        storage.link_subject("9", &first.id, LinkSource::ExactName, "sync").unwrap();
        let link = storage.set_link("9", &second.id, "operator").unwrap();
        assert_eq!(link.matched_by, LinkSource::Manual);
        assert_eq!(storage.get_link("9").unwrap().unwrap().patient_id, second.id);

        let events = storage.events_for("identity_link", "9", None).unwrap();
        assert_eq!(events[0].event_type, EventType::LinkReplaced);
        assert_eq!(events[0].old_value.as_deref(), Some(first.id.as_str()));

        assert!(matches!(
            storage.set_link("9", "pat_missing", "operator"),
            Err(Error::PatientNotFound { .. })
        ));

        storage.remove_link("9", "operator").unwrap();
        assert!(storage.get_link("9").unwrap().is_none());
        assert!(matches!(
            storage.remove_link("9", "operator"),
            Err(Error::LinkNotFound { .. })
        ));
    }

    #[test]
    fn test_cursor_never_moves_backward() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        assert!(storage.get_cursor("openmrs").unwrap().is_none());

        storage.advance_cursor("openmrs", 2_000, "sync").unwrap();
        let cursor = storage.advance_cursor("openmrs", 1_000, "sync").unwrap();
        assert_eq!(cursor.last_successful_sync, 2_000);
        assert_eq!(
            storage.get_cursor("openmrs").unwrap().unwrap().last_successful_sync,
            2_000
        );

        storage.advance_cursor("openmrs", 3_000, "sync").unwrap();
        assert_eq!(
            storage.get_cursor("openmrs").unwrap().unwrap().last_successful_sync,
            3_000
        );

        // Cursors are per source
        assert!(storage.get_cursor("other").unwrap().is_none());
    }

    #[test]
    fn test_run_totals() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let run = |status: RunStatus, synced: u32, errors: u32| SyncRun {
            id: 0,
            source_name: "openmrs".into(),
            started_at: 1,
            finished_at: 2,
            status,
            fetched: 10,
            synced,
            duplicates: 1,
            skipped: 1,
            malformed: 1,
            errors,
            cutoff_advanced: status == RunStatus::Completed,
            message: None,
        };
        storage.record_run(&run(RunStatus::Completed, 7, 0)).unwrap();
        storage.record_run(&run(RunStatus::Failed, 0, 1)).unwrap();

        let totals = storage.run_totals("openmrs").unwrap();
        assert_eq!(totals.cycles_run, 2);
        assert_eq!(totals.cycles_failed, 1);
        assert_eq!(totals.items_synced, 7);
        assert_eq!(totals.items_skipped, 4);
        assert_eq!(totals.errors, 1);

        let recent = storage.recent_runs(Some("openmrs"), 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status, RunStatus::Failed);

        let empty = storage.run_totals("nowhere").unwrap();
        assert_eq!(empty.cycles_run, 0);
        assert_eq!(empty.source_name, "nowhere");
    }

    #[test]
    fn test_counts() {
        let (mut storage, patient) = storage_with_patient("Alice Mwangi");
        storage.link_subject("1", &patient.id, LinkSource::ExactName, "sync").unwrap();
        storage.insert_synced_record(&sample_record(&patient.id, "1"), "sync").unwrap();

        let counts = storage.counts().unwrap();
        assert_eq!(counts.patients, 1);
        assert_eq!(counts.active_patients, 1);
        assert_eq!(counts.provisioned_patients, 0);
        assert_eq!(counts.identity_links, 1);
        assert_eq!(counts.records, 1);
        assert_eq!(counts.records_by_type.get("condition"), Some(&1));
    }
}
