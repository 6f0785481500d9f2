//! SQLite storage layer for the portal datastore.
//!
//! This module provides the persistence layer using SQLite with:
//! - WAL mode and a busy timeout so concurrent sync processes serialize writes
//! - Transaction discipline for atomic writes
//! - A uniqueness constraint on `(patient, source observation)` as the dedup mechanism
//! - Audit events for history
//!
//! # Submodules
//!
//! - [`events`] - Audit event storage
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main SQLite storage implementation

pub mod events;
pub mod migrations;
pub mod schema;
pub mod sqlite;

pub use sqlite::{
    InsertOutcome, MutationContext, RunStatus, RunTotals, SqliteStorage, StoreCounts,
    StoredRecord, SyncCursor, SyncRun,
};
