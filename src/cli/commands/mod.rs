//! Command implementations.

pub mod completions;
pub mod init;
pub mod link;
pub mod patient;
pub mod records;
pub mod status;
pub mod sync;
pub mod version;

use crate::config::{resolve_config_path, resolve_db_path, SyncSettings};
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;
use std::path::PathBuf;

/// Actor recorded when `--actor` is not given.
pub const DEFAULT_ACTOR: &str = "operator";

/// Resolved settings and paths shared by every command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub settings: SyncSettings,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
}

impl CommandContext {
    /// Resolve the settings file and portal database path.
    ///
    /// # Errors
    ///
    /// Returns `FatalConfig` if no home directory can be found or the
    /// settings are invalid.
    pub fn resolve(db: Option<&PathBuf>, config: Option<&PathBuf>) -> Result<Self> {
        let config_path = resolve_config_path(config.map(PathBuf::as_path)).ok_or_else(|| {
            Error::FatalConfig("Could not determine the Passport Sync directory".into())
        })?;
        let settings = SyncSettings::resolve(&config_path)?;
        let db_path = resolve_db_path(db.map(PathBuf::as_path), Some(&settings)).ok_or_else(
            || Error::FatalConfig("Could not determine the portal database path".into()),
        )?;

        Ok(Self {
            settings,
            config_path,
            db_path,
        })
    }

    /// Open the portal database, which must already exist.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` if `psync init` has not been run.
    pub fn open_storage(&self) -> Result<SqliteStorage> {
        if !self.db_path.exists() {
            return Err(Error::NotInitialized);
        }
        SqliteStorage::open(&self.db_path)
    }
}

/// Render Unix milliseconds as RFC 3339.
pub(crate) fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}
