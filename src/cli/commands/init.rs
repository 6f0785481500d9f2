//! Initialize the portal database and settings file.
//!
//! Creates `~/.passport-sync/data/passport.db` (or the `--db` path) with the
//! full schema applied, and writes a default `config.json` if none exists.
//! `--force` recreates the database but never overwrites settings.

use super::CommandContext;
use crate::error::{Error, Result};
use crate::storage::schema::CURRENT_SCHEMA_VERSION;
use crate::storage::SqliteStorage;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct InitOutput {
    database: PathBuf,
    config: PathBuf,
    config_created: bool,
    schema_version: i32,
    migrations_applied: usize,
}

/// Execute the init command.
///
/// # Errors
///
/// Returns `AlreadyInitialized` if the database exists and `force` is not
/// set, or an error if the files cannot be created.
pub fn execute(db: Option<&PathBuf>, config: Option<&PathBuf>, force: bool, json: bool) -> Result<()> {
    let ctx = CommandContext::resolve(db, config)?;
    let db_path = ctx.db_path.clone();

    if db_path.exists() {
        if !force {
            return Err(Error::AlreadyInitialized { path: db_path });
        }
        remove_database(&db_path)?;
    }

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let storage = SqliteStorage::open(&db_path)?;
    let migrations = crate::storage::migrations::applied_count(storage.conn())?;

    let config_created = !ctx.config_path.exists();
    if config_created {
        let mut settings = ctx.settings.clone();
        if db.is_some() {
            settings.db = Some(db_path.clone());
        }
        settings.save(&ctx.config_path)?;
    }

    if json {
        let output = InitOutput {
            database: db_path,
            config: ctx.config_path,
            config_created,
            schema_version: CURRENT_SCHEMA_VERSION,
            migrations_applied: migrations,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Initialized Passport Sync");
        println!("  Database: {}", db_path.display());
        if config_created {
            println!("  Settings: {} (created)", ctx.config_path.display());
        } else {
            println!("  Settings: {}", ctx.config_path.display());
        }
        println!();
        println!("Next: set OPENMRS_DB_PATH (or source.database_path) and run 'psync sync'.");
    }

    Ok(())
}

/// Remove a database file together with its WAL sidecars.
fn remove_database(path: &Path) -> Result<()> {
    fs::remove_file(path)?;
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            fs::remove_file(sidecar)?;
        }
    }
    Ok(())
}
