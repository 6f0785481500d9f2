//! Portal datastore schema.
//!
//! The base DDL creates every table the sync engine and the portal
//! collaborators share. Incremental changes live in `migrations/` and are
//! applied by [`super::migrations::run_migrations`].

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the portal database.
///
/// Note: Timestamps are stored as INTEGER (Unix milliseconds).
pub const SCHEMA_SQL: &str = r#"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Core Tables
-- ====================

-- Patients: portal-side identities (self-registered or auto-provisioned)
CREATE TABLE IF NOT EXISTS patients (
    id TEXT PRIMARY KEY,
    external_identifier TEXT,
    display_name TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    linked_account_id TEXT NOT NULL UNIQUE,
    active INTEGER NOT NULL DEFAULT 1,
    provisioned_by_sync INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_patients_normalized_name ON patients(normalized_name, active);
CREATE INDEX IF NOT EXISTS idx_patients_external_identifier ON patients(external_identifier);

-- Identity links: source subject -> portal patient, sticky once written
CREATE TABLE IF NOT EXISTS identity_links (
    subject_external_id TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL,
    matched_by TEXT NOT NULL CHECK (matched_by IN (
        'external_id', 'exact_name', 'partial_name', 'auto_provisioned', 'manual'
    )),
    linked_at INTEGER NOT NULL,
    FOREIGN KEY (patient_id) REFERENCES patients(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_identity_links_patient ON identity_links(patient_id);

-- Clinical records: write-once from the sync path.
-- The UNIQUE constraint is the dedup mechanism.
CREATE TABLE IF NOT EXISTS clinical_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id TEXT NOT NULL,
    source_observation_id TEXT NOT NULL,
    record_type TEXT NOT NULL CHECK (record_type IN ('condition', 'medication', 'test', 'visit')),
    payload TEXT NOT NULL,
    provenance TEXT NOT NULL,
    content_hash TEXT,
    synced_at INTEGER NOT NULL,
    UNIQUE (patient_id, source_observation_id),
    FOREIGN KEY (patient_id) REFERENCES patients(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_clinical_records_patient_type ON clinical_records(patient_id, record_type);
CREATE INDEX IF NOT EXISTS idx_clinical_records_synced ON clinical_records(synced_at DESC);

-- Sync cursors: last successful sync per source
CREATE TABLE IF NOT EXISTS sync_cursors (
    source_name TEXT PRIMARY KEY,
    last_successful_sync INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Sync runs: one row per polling cycle
CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('completed', 'failed', 'aborted')),
    fetched INTEGER NOT NULL DEFAULT 0,
    synced INTEGER NOT NULL DEFAULT 0,
    duplicates INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    malformed INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    cutoff_advanced INTEGER NOT NULL DEFAULT 0,
    message TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_runs_source ON sync_runs(source_name, started_at DESC);

-- ====================
-- Audit Events
-- ====================

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    comment TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at DESC);

-- ====================
-- Triggers
-- ====================

-- Touch the patient when a record lands for it
CREATE TRIGGER IF NOT EXISTS touch_patient_on_record
AFTER INSERT ON clinical_records
BEGIN
    UPDATE patients
    SET updated_at = NEW.synced_at
    WHERE id = NEW.patient_id AND updated_at < NEW.synced_at;
END;

-- ====================
-- Views
-- ====================

-- Cumulative operator counters per source
CREATE VIEW IF NOT EXISTS source_run_totals AS
SELECT
    source_name,
    COUNT(*) as cycles_run,
    COUNT(CASE WHEN status = 'failed' THEN 1 END) as cycles_failed,
    COALESCE(SUM(fetched), 0) as items_fetched,
    COALESCE(SUM(synced), 0) as items_synced,
    COALESCE(SUM(duplicates), 0) as items_duplicate,
    COALESCE(SUM(skipped + malformed), 0) as items_skipped,
    COALESCE(SUM(errors), 0) as errors,
    MAX(finished_at) as last_finished_at
FROM sync_runs
GROUP BY source_name;
"#;

/// Apply the schema to the database.
///
/// This uses `execute_batch` to run the entire DDL script.
/// It is idempotent because all statements use `IF NOT EXISTS`.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    // Set pragmas before schema creation
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    conn.execute_batch(SCHEMA_SQL)?;

    // Run migrations for existing databases
    super::migrations::run_migrations(conn)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            format!("v{CURRENT_SCHEMA_VERSION}"),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}
