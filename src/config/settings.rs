//! Sync engine settings.
//!
//! Settings live in a JSON file (default `~/.passport-sync/config.json`).
//! Every field has a default, and the commonly deployed ones can be
//! overridden through environment variables:
//!
//! | Field | Environment |
//! |---|---|
//! | `db` | `PSYNC_DB` |
//! | `source.kind` | `PSYNC_SOURCE_KIND` |
//! | `source.name` | `PSYNC_SOURCE_NAME` |
//! | `source.database_path` | `OPENMRS_DB_PATH` |
//! | `source.base_url` | `OPENMRS_BASE_URL` |
//! | `source.username` / `source.password` | `OPENMRS_USERNAME` / `OPENMRS_PASSWORD` |
//! | `interval_secs` | `OPENMRS_SYNC_INTERVAL_SECONDS` |
//! | `page_size` | `PSYNC_PAGE_SIZE` |

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which connector reads the clinical store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Direct read-only access to an OpenMRS-shaped database file.
    #[default]
    Database,
    /// The OpenMRS REST API.
    Rest,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "database" | "db" | "sqlite" => Ok(Self::Database),
            "rest" | "http" | "api" => Ok(Self::Rest),
            _ => Err(format!("Unknown source kind: {s}")),
        }
    }
}

/// Delay growth between connection attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Fixed,
}

/// Source connector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub kind: SourceKind,
    /// Key for the persisted cursor; one cursor per source
    pub name: String,
    pub database_path: Option<PathBuf>,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Identifier type carrying the national ID
    pub national_id_type: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            kind: SourceKind::Database,
            name: "openmrs".to_string(),
            database_path: None,
            base_url: "http://localhost:8080/openmrs".to_string(),
            username: None,
            password: None,
            national_id_type: "National ID".to_string(),
        }
    }
}

/// Longest cold-start lookback: 100 years.
pub const MAX_LOOKBACK_HOURS: u64 = 100 * 365 * 24;

/// Longest re-fetch overlap: one week.
pub const MAX_OVERLAP_SECS: u64 = 7 * 24 * 3600;

/// All sync engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Portal database path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<PathBuf>,
    pub source: SourceSettings,
    pub interval_secs: u64,
    pub page_size: u32,
    pub max_connect_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_strategy: RetryStrategy,
    pub overlap_secs: u64,
    pub initial_lookback_hours: u64,
    pub full_history: bool,
    pub auto_provision: bool,
    pub item_write_retries: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            db: None,
            source: SourceSettings::default(),
            interval_secs: 10,
            page_size: 100,
            max_connect_attempts: 5,
            retry_base_delay_ms: 3_000,
            retry_max_delay_ms: 60_000,
            retry_strategy: RetryStrategy::Exponential,
            overlap_secs: 60,
            initial_lookback_hours: 24,
            full_history: false,
            auto_provision: true,
            item_write_retries: 2,
        }
    }
}

impl SyncSettings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `FatalConfig` if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::FatalConfig(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            Error::FatalConfig(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Write settings as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns `FatalConfig` if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FatalConfig(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::FatalConfig(format!("Failed to serialize config: {e}")))?;

        fs::write(path, content)
            .map_err(|e| Error::FatalConfig(format!("Failed to write config file: {e}")))
    }

    /// Load from file, apply process environment overrides, then validate.
    ///
    /// # Errors
    ///
    /// Returns `FatalConfig` on unreadable files, bad env values, or
    /// failed validation.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut settings = Self::load(path)?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Override fields from environment variables.
    ///
    /// `lookup` returns the value of a variable; blank values are ignored.
    ///
    /// # Errors
    ///
    /// Returns `FatalConfig` if a numeric or enum variable does not parse.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(db) = var("PSYNC_DB") {
            self.db = Some(PathBuf::from(db));
        }
        if let Some(kind) = var("PSYNC_SOURCE_KIND") {
            self.source.kind = kind.parse().map_err(Error::FatalConfig)?;
        }
        if let Some(name) = var("PSYNC_SOURCE_NAME") {
            self.source.name = name;
        }
        if let Some(path) = var("OPENMRS_DB_PATH") {
            self.source.database_path = Some(PathBuf::from(path));
        }
        if let Some(url) = var("OPENMRS_BASE_URL") {
            self.source.base_url = url;
        }
        if let Some(username) = var("OPENMRS_USERNAME") {
            self.source.username = Some(username);
        }
        if let Some(password) = var("OPENMRS_PASSWORD") {
            self.source.password = Some(password);
        }
        if let Some(interval) = var("OPENMRS_SYNC_INTERVAL_SECONDS") {
            self.interval_secs = parse_number("OPENMRS_SYNC_INTERVAL_SECONDS", &interval)?;
        }
        if let Some(page_size) = var("PSYNC_PAGE_SIZE") {
            self.page_size = parse_number("PSYNC_PAGE_SIZE", &page_size)?;
        }
        Ok(())
    }

    /// Check invariants the orchestrator relies on.
    ///
    /// # Errors
    ///
    /// Returns `FatalConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::FatalConfig("page_size must be > 0".into()));
        }
        if self.interval_secs == 0 {
            return Err(Error::FatalConfig("interval_secs must be > 0".into()));
        }
        if self.max_connect_attempts == 0 {
            return Err(Error::FatalConfig("max_connect_attempts must be > 0".into()));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(Error::FatalConfig(
                "retry_max_delay_ms must be >= retry_base_delay_ms".into(),
            ));
        }
        if self.initial_lookback_hours > MAX_LOOKBACK_HOURS {
            return Err(Error::FatalConfig(format!(
                "initial_lookback_hours must be <= {MAX_LOOKBACK_HOURS} (use full_history for everything)"
            )));
        }
        if self.overlap_secs > MAX_OVERLAP_SECS {
            return Err(Error::FatalConfig(format!(
                "overlap_secs must be <= {MAX_OVERLAP_SECS}"
            )));
        }
        if self.source.name.trim().is_empty() {
            return Err(Error::FatalConfig("source.name cannot be empty".into()));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::FatalConfig(format!("{key} must be a positive integer, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.interval_secs, 10);
        assert_eq!(settings.page_size, 100);
        assert_eq!(settings.overlap_secs, 60);
        assert_eq!(settings.initial_lookback_hours, 24);
        assert!(settings.auto_provision);
        assert_eq!(settings.source.kind, SourceKind::Database);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SyncSettings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"page_size": 25, "source": {"kind": "rest"}}"#).unwrap();

        let settings = SyncSettings::load(&path).unwrap();
        assert_eq!(settings.page_size, 25);
        assert_eq!(settings.source.kind, SourceKind::Rest);
        assert_eq!(settings.source.name, "openmrs");
        assert_eq!(settings.interval_secs, 10);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut settings = SyncSettings::default();
        settings.full_history = true;
        settings.save(&path).unwrap();

        assert_eq!(SyncSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_bad_json_is_fatal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(SyncSettings::load(&path), Err(Error::FatalConfig(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut settings = SyncSettings::default();
        settings
            .apply_env(env(&[
                ("OPENMRS_SYNC_INTERVAL_SECONDS", "30"),
                ("PSYNC_SOURCE_KIND", "rest"),
                ("OPENMRS_USERNAME", "admin"),
                ("OPENMRS_DB_PATH", "  "),
            ]))
            .unwrap();

        assert_eq!(settings.interval_secs, 30);
        assert_eq!(settings.source.kind, SourceKind::Rest);
        assert_eq!(settings.source.username.as_deref(), Some("admin"));
        assert_eq!(settings.source.database_path, None);
    }

    #[test]
    fn test_bad_env_number_is_fatal() {
        let mut settings = SyncSettings::default();
        let err = settings
            .apply_env(env(&[("PSYNC_PAGE_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::FatalConfig(_)));
    }

    #[test]
    fn test_validation() {
        let mut settings = SyncSettings::default();
        settings.page_size = 0;
        assert!(matches!(settings.validate(), Err(Error::FatalConfig(_))));

        let mut settings = SyncSettings::default();
        settings.max_connect_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = SyncSettings::default();
        settings.retry_max_delay_ms = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_window_bounds() {
        let mut settings = SyncSettings::default();
        settings.initial_lookback_hours = MAX_LOOKBACK_HOURS;
        settings.overlap_secs = MAX_OVERLAP_SECS;
        assert!(settings.validate().is_ok());

        let mut settings = SyncSettings::default();
        settings.initial_lookback_hours = u64::MAX;
        assert!(matches!(settings.validate(), Err(Error::FatalConfig(_))));

        let mut settings = SyncSettings::default();
        settings.overlap_secs = MAX_OVERLAP_SECS + 1;
        assert!(matches!(settings.validate(), Err(Error::FatalConfig(_))));
    }
}
