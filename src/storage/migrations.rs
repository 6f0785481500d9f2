//! Database migrations embedded at compile time.
//!
//! Migrations are sourced from `migrations/` at the crate root and
//! embedded into the binary using `include_str!`, so the binary carries
//! no runtime file dependencies.

use rusqlite::{Connection, Result};
use tracing::info;

/// A single migration with version identifier and SQL content.
struct Migration {
    version: &'static str,
    sql: &'static str,
}

/// All migrations in order, embedded at compile time.
///
/// Version names match the SQL filenames (without .sql extension).
/// The `schema_migrations` table tracks which have been applied.
const MIGRATIONS: &[Migration] = &[Migration {
    version: "001_index_records_by_patient_synced",
    sql: include_str!("../../migrations/001_index_records_by_patient_synced.sql"),
}];

/// Run all pending migrations on the database.
///
/// Migrations are applied in order. Already-applied migrations (tracked in
/// the `schema_migrations` table) are skipped, so this runs on every open.
///
/// # Errors
///
/// Returns an error if a migration fails to apply.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let applied: std::collections::HashSet<String> = conn
        .prepare("SELECT version FROM schema_migrations")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    for migration in MIGRATIONS {
        if applied.contains(migration.version) {
            continue;
        }

        info!(version = migration.version, "Applying migration");

        conn.execute_batch(migration.sql)?;

        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, chrono::Utc::now().timestamp_millis()],
        )?;

        info!(version = migration.version, "Migration complete");
    }

    Ok(())
}

/// Number of embedded migrations recorded as applied.
///
/// # Errors
///
/// Returns an error if `schema_migrations` cannot be read.
pub fn applied_count(conn: &Connection) -> Result<usize> {
    let applied: std::collections::HashSet<String> = conn
        .prepare("SELECT version FROM schema_migrations")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    Ok(MIGRATIONS
        .iter()
        .filter(|m| applied.contains(m.version))
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::SCHEMA_SQL;

    fn migration_count(conn: &Connection) -> usize {
        applied_count(conn).unwrap()
    }

    #[test]
    fn test_migrations_compile() {
        assert_eq!(MIGRATIONS.len(), 1);
    }

    #[test]
    fn test_run_migrations_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).expect("Base schema should apply");
        run_migrations(&conn).expect("Migrations should apply to fresh database");
        assert_eq!(migration_count(&conn), MIGRATIONS.len());
    }

    #[test]
    fn test_run_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();

        run_migrations(&conn).expect("First run should succeed");
        run_migrations(&conn).expect("Second run should succeed (idempotent)");
        assert_eq!(migration_count(&conn), MIGRATIONS.len());
    }

    #[test]
    fn test_record_timeline_index_created() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        run_migrations(&conn).unwrap();

        let has_index: bool = conn
            .prepare(
                "SELECT 1 FROM sqlite_master
                 WHERE type = 'index' AND name = 'idx_clinical_records_patient_synced'",
            )
            .unwrap()
            .exists([])
            .unwrap();
        assert!(has_index);
    }
}
