//! Cycle reports and in-process counters.

use crate::storage::{RunStatus, SyncRun};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where the orchestrator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Connecting,
    Backoff,
    Fetching,
    Processing,
}

impl SyncPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Backoff => "backoff",
            Self::Fetching => "fetching",
            Self::Processing => "processing",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub source_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Lower bound the source was queried from
    pub since: Option<DateTime<Utc>>,
    pub connect_attempts: u32,
    pub fetched: u32,
    pub synced: u32,
    pub duplicates: u32,
    /// Observations whose subject could not be resolved
    pub skipped: u32,
    pub malformed: u32,
    pub errors: u32,
    pub provisioned: u32,
    pub cutoff_advanced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CycleReport {
    pub(crate) fn start(source_name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            source_name: source_name.to_string(),
            status: RunStatus::Failed,
            started_at,
            finished_at: started_at,
            since: None,
            connect_attempts: 0,
            fetched: 0,
            synced: 0,
            duplicates: 0,
            skipped: 0,
            malformed: 0,
            errors: 0,
            provisioned: 0,
            cutoff_advanced: false,
            message: None,
        }
    }

    /// The persisted form of this report.
    #[must_use]
    pub fn to_run(&self) -> SyncRun {
        SyncRun {
            id: 0,
            source_name: self.source_name.clone(),
            started_at: self.started_at.timestamp_millis(),
            finished_at: self.finished_at.timestamp_millis(),
            status: self.status,
            fetched: self.fetched,
            synced: self.synced,
            duplicates: self.duplicates,
            skipped: self.skipped,
            malformed: self.malformed,
            errors: self.errors,
            cutoff_advanced: self.cutoff_advanced,
            message: self.message.clone(),
        }
    }

    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Cumulative counters for this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
    pub cycles_run: u64,
    pub cycles_failed: u64,
    pub items_synced: u64,
    pub items_duplicate: u64,
    /// Unresolved and malformed items
    pub items_skipped: u64,
    pub errors: u64,
}

impl SyncCounters {
    pub fn absorb(&mut self, report: &CycleReport) {
        self.cycles_run += 1;
        if report.status == RunStatus::Failed {
            self.cycles_failed += 1;
        }
        self.items_synced += u64::from(report.synced);
        self.items_duplicate += u64::from(report.duplicates);
        self.items_skipped += u64::from(report.skipped) + u64::from(report.malformed);
        self.errors += u64::from(report.errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_absorb() {
        let mut report = CycleReport::start("openmrs", Utc::now());
        report.status = RunStatus::Completed;
        report.synced = 9;
        report.skipped = 1;
        report.malformed = 2;

        let mut counters = SyncCounters::default();
        counters.absorb(&report);
        report.status = RunStatus::Failed;
        counters.absorb(&report);

        assert_eq!(counters.cycles_run, 2);
        assert_eq!(counters.cycles_failed, 1);
        assert_eq!(counters.items_synced, 18);
        assert_eq!(counters.items_skipped, 6);
    }

    #[test]
    fn test_to_run_carries_counts() {
        let mut report = CycleReport::start("openmrs", Utc::now());
        report.fetched = 4;
        report.cutoff_advanced = true;
        let run = report.to_run();
        assert_eq!(run.source_name, "openmrs");
        assert_eq!(run.fetched, 4);
        assert!(run.cutoff_advanced);
        assert_eq!(run.status, RunStatus::Failed);
    }
}
