//! Error types for Passport Sync.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, 6=source, etc.)
//! - Retryability flags used by the orchestrator's backoff and item retry
//! - Context-aware recovery hints for operators
//! - Structured JSON output for piped / non-TTY consumers
//!
//! A duplicate observation is intentionally absent from this taxonomy: hitting
//! the dedup constraint is a successful outcome, reported as
//! [`InsertOutcome::Duplicate`](crate::storage::InsertOutcome).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Passport Sync operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    AlreadyInitialized,
    DatabaseError,
    TargetWriteFailure,

    // Not Found (exit 3)
    PatientNotFound,
    LinkNotFound,

    // Validation (exit 4)
    InvalidArgument,
    MalformedObservation,
    AmbiguousIdentity,

    // Source (exit 6)
    SourceUnavailable,

    // Config (exit 7)
    FatalConfig,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::TargetWriteFailure => "TARGET_WRITE_FAILURE",
            Self::PatientNotFound => "PATIENT_NOT_FOUND",
            Self::LinkNotFound => "LINK_NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::MalformedObservation => "MALFORMED_OBSERVATION",
            Self::AmbiguousIdentity => "AMBIGUOUS_IDENTITY",
            Self::SourceUnavailable => "SOURCE_UNAVAILABLE",
            Self::FatalConfig => "FATAL_CONFIG",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::DatabaseError
            | Self::TargetWriteFailure => 2,
            Self::PatientNotFound | Self::LinkNotFound => 3,
            Self::InvalidArgument | Self::MalformedObservation | Self::AmbiguousIdentity => 4,
            Self::SourceUnavailable => 6,
            Self::FatalConfig => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether the failed operation may succeed if attempted again unchanged.
    ///
    /// The orchestrator backs off on retryable source errors and retries
    /// item writes on retryable target errors. Everything else is either
    /// skipped (malformed rows) or surfaced.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable | Self::TargetWriteFailure | Self::DatabaseError
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in Passport Sync operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: run `psync init` first")]
    NotInitialized,

    #[error("Already initialized at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("Source unavailable ({source_name}): {message}")]
    SourceUnavailable { source_name: String, message: String },

    #[error("Malformed observation {obs_id}: {reason}")]
    MalformedObservation { obs_id: String, reason: String },

    #[error("Ambiguous identity for subject {subject}: {} candidates at {level}", candidates.len())]
    AmbiguousIdentity {
        subject: String,
        level: String,
        candidates: Vec<String>,
    },

    #[error("Failed to write record for observation {obs_id}: {message}")]
    TargetWriteFailure { obs_id: String, message: String },

    #[error("Configuration error: {0}")]
    FatalConfig(String),

    #[error("Patient not found: {id}")]
    PatientNotFound { id: String },

    #[error("No identity link for subject: {subject}")]
    LinkNotFound { subject: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyInitialized { .. } => ErrorCode::AlreadyInitialized,
            Self::SourceUnavailable { .. } => ErrorCode::SourceUnavailable,
            Self::MalformedObservation { .. } => ErrorCode::MalformedObservation,
            Self::AmbiguousIdentity { .. } => ErrorCode::AmbiguousIdentity,
            Self::TargetWriteFailure { .. } => ErrorCode::TargetWriteFailure,
            Self::FatalConfig(_) => ErrorCode::FatalConfig,
            Self::PatientNotFound { .. } => ErrorCode::PatientNotFound,
            Self::LinkNotFound { .. } => ErrorCode::LinkNotFound,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Shortcut for `self.error_code().is_retryable()`.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }

    /// Build a `SourceUnavailable` from any displayable cause.
    pub fn source_unavailable(source_name: &str, cause: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            source_name: source_name.to_string(),
            message: cause.to_string(),
        }
    }

    /// Context-aware recovery hint for operators.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => {
                Some("Run `psync init` to create the portal database".to_string())
            }

            Self::AlreadyInitialized { path } => Some(format!(
                "Database already exists at {}. Use `--force` to reinitialize.",
                path.display()
            )),

            Self::SourceUnavailable { source_name, .. } => Some(format!(
                "Check that the '{source_name}' clinical store is reachable. \
                 The next polling cycle retries automatically."
            )),

            Self::FatalConfig(_) => Some(
                "Review the config file (`psync init` writes a default) or the \
                 OPENMRS_* / PSYNC_* environment variables."
                    .to_string(),
            ),

            Self::PatientNotFound { id } => Some(format!(
                "No patient with ID '{id}'. Use `psync patient list` to see patients."
            )),

            Self::LinkNotFound { subject } => Some(format!(
                "Subject '{subject}' has never been resolved. Run `psync sync` or \
                 `psync link set {subject} <patient-id>`."
            )),

            Self::AmbiguousIdentity { subject, .. } => Some(format!(
                "Several patients match subject '{subject}'. Pin the right one with \
                 `psync link set {subject} <patient-id>`."
            )),

            Self::MalformedObservation { .. }
            | Self::TargetWriteFailure { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::InvalidArgument(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
