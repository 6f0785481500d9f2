//! Configuration management.
//!
//! This module provides functions for locating the Passport Sync home
//! directory, resolving the portal database and config file paths, and
//! loading sync settings.
//!
//! Everything lives under `~/.passport-sync/`:
//! - **Database**: `~/.passport-sync/data/passport.db`
//! - **Settings**: `~/.passport-sync/config.json`

mod settings;

pub use settings::{RetryStrategy, SourceKind, SourceSettings, SyncSettings};

use std::path::{Path, PathBuf};

/// Get the global Passport Sync directory (`~/.passport-sync`).
#[must_use]
pub fn global_psync_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".passport-sync"))
}

/// Resolve the settings file path.
///
/// Priority:
/// 1. If `explicit_path` is provided, use it directly
/// 2. `PSYNC_CONFIG` environment variable
/// 3. `~/.passport-sync/config.json`
#[must_use]
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("PSYNC_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    global_psync_dir().map(|dir| dir.join("config.json"))
}

/// Resolve the portal database path.
///
/// Priority:
/// 1. If `explicit_path` is provided, use it directly
/// 2. `PSYNC_DB` environment variable
/// 3. `db` from the settings file
/// 4. `~/.passport-sync/data/passport.db`
#[must_use]
pub fn resolve_db_path(explicit_path: Option<&Path>, settings: Option<&SyncSettings>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }

    if let Ok(db_path) = std::env::var("PSYNC_DB") {
        if !db_path.trim().is_empty() {
            return Some(PathBuf::from(db_path));
        }
    }

    if let Some(db) = settings.and_then(|s| s.db.clone()) {
        return Some(db);
    }

    global_psync_dir().map(|dir| dir.join("data").join("passport.db"))
}
