//! Sync orchestration.
//!
//! The orchestrator polls one source on a fixed interval and pushes every
//! observation through identity resolution and materialization:
//!
//! ```text
//! Idle -> Connecting -> Fetching <-> Processing -> Idle
//!             |
//!             +-> Backoff -> Connecting (bounded attempts)
//! ```
//!
//! # Cursor
//!
//! The persisted cursor is the newest `captured_at` the source has handed
//! over, read off the source's own clock. Each cycle fetches from
//! `cursor - overlap`, so rows committed late are picked up again and
//! deduplicated by the store. A cold start pins its lookback floor as the
//! cursor. A cycle that fails to connect or is aborted by shutdown leaves
//! the cursor untouched. Item failures do not.
//!
//! # Example
//!
//! ```ignore
//! use psync::sync::{Orchestrator, OrchestratorConfig};
//!
//! let mut orchestrator = Orchestrator::new(source, storage, OrchestratorConfig::default());
//! let report = orchestrator.run_cycle().await?;
//! println!("synced {} observations", report.synced);
//! ```

mod orchestrator;
mod report;
mod retry;

pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use report::{CycleReport, SyncCounters, SyncPhase};
pub use retry::RetryPolicy;
