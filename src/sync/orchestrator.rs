//! The polling sync loop.

use super::report::{CycleReport, SyncCounters, SyncPhase};
use super::retry::RetryPolicy;
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::identity::{IdentityResolver, Resolution, SubjectIdentity, SYNC_ACTOR};
use crate::materialize::{MaterializeOutcome, Materializer};
use crate::model::SourceObservation;
use crate::source::{FeedItem, ObservationFeed, ObservationSource};
use crate::storage::{RunStatus, SqliteStorage};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Orchestrator tuning, usually built from [`SyncSettings`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub interval: Duration,
    pub page_size: u32,
    pub retry: RetryPolicy,
    /// Re-fetch window behind the cursor for late-committed rows
    pub overlap: Duration,
    /// Cold-start window when no cursor exists
    pub initial_lookback: Duration,
    pub full_history: bool,
    pub auto_provision: bool,
    pub item_write_retries: u32,
}

impl OrchestratorConfig {
    #[must_use]
    pub const fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            page_size: settings.page_size,
            retry: RetryPolicy::from_settings(settings),
            overlap: Duration::from_secs(settings.overlap_secs),
            initial_lookback: Duration::from_secs(settings.initial_lookback_hours.saturating_mul(3600)),
            full_history: settings.full_history,
            auto_provision: settings.auto_provision,
            item_write_retries: settings.item_write_retries,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

/// Drives one source into the portal store, one cycle at a time.
pub struct Orchestrator<S: ObservationSource> {
    source: S,
    storage: SqliteStorage,
    config: OrchestratorConfig,
    resolver: IdentityResolver,
    materializer: Materializer,
    phase: SyncPhase,
    counters: SyncCounters,
}

impl<S: ObservationSource> Orchestrator<S> {
    pub fn new(source: S, storage: SqliteStorage, config: OrchestratorConfig) -> Self {
        Self {
            resolver: IdentityResolver::new(config.auto_provision),
            materializer: Materializer::new(config.item_write_retries),
            source,
            storage,
            config,
            phase: SyncPhase::Idle,
            counters: SyncCounters::default(),
        }
    }

    #[must_use]
    pub const fn phase(&self) -> SyncPhase {
        self.phase
    }

    #[must_use]
    pub const fn counters(&self) -> SyncCounters {
        self.counters
    }

    #[must_use]
    pub const fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Run exactly one cycle now.
    ///
    /// This is the manual "sync now" entry point. The report is persisted
    /// whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the error that failed the cycle (source unreachable after
    /// retries, bad configuration, portal store failure). Item-level
    /// failures do not fail the cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let (_keep_open, mut shutdown) = watch::channel(false);
        let result = self.cycle(&mut shutdown).await;
        self.source.release();
        result
    }

    /// Poll until `shutdown` turns true, returning the process counters.
    ///
    /// A cycle error is logged and the loop carries on at the next tick.
    /// Shutdown aborts between items without advancing the cursor and wakes
    /// any sleep immediately. Dropping the sender also stops the loop.
    pub async fn run_until(&mut self, mut shutdown: watch::Receiver<bool>) -> SyncCounters {
        info!(
            source = self.source.name(),
            interval_secs = self.config.interval.as_secs(),
            "Starting sync loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.cycle(&mut shutdown).await {
                Ok(report) if report.status == RunStatus::Aborted => {
                    self.source.release();
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(source = self.source.name(), error = %e, "Sync cycle failed");
                }
            }
            self.source.release();

            if sleep_or_shutdown(self.config.interval, &mut shutdown).await {
                break;
            }
        }

        self.source.close();
        self.phase = SyncPhase::Idle;
        info!(
            source = self.source.name(),
            cycles = self.counters.cycles_run,
            synced = self.counters.items_synced,
            "Sync loop stopped"
        );
        self.counters
    }

    async fn cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<CycleReport> {
        let started = Utc::now();
        let mut report = CycleReport::start(self.source.name(), started);

        let outcome = self.execute(started, &mut report, shutdown).await;
        self.phase = SyncPhase::Idle;
        report.finished_at = Utc::now();

        match &outcome {
            Ok(status) => report.status = *status,
            Err(e) => {
                report.status = RunStatus::Failed;
                report.message = Some(e.to_string());
            }
        }

        self.counters.absorb(&report);
        if let Err(e) = self.storage.record_run(&report.to_run()) {
            warn!(error = %e, "Failed to persist sync run");
        }

        info!(
            source = %report.source_name,
            status = report.status.as_str(),
            fetched = report.fetched,
            synced = report.synced,
            duplicates = report.duplicates,
            skipped = report.skipped,
            malformed = report.malformed,
            errors = report.errors,
            duration_ms = report.duration_ms(),
            "Sync cycle finished"
        );

        outcome.map(|_| report)
    }

    async fn execute(
        &mut self,
        started: DateTime<Utc>,
        report: &mut CycleReport,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RunStatus> {
        if !self.connect(report, shutdown).await? {
            return Ok(RunStatus::Aborted);
        }

        let window = self.fetch_window(started)?;
        report.since = Some(window.since);
        debug!(source = %report.source_name, since = %window.since, "Fetching observations");

        let Self {
            source,
            storage,
            resolver,
            materializer,
            phase,
            config,
            ..
        } = self;

        // Newest source-side timestamp seen this cycle
        let mut high_water: Option<DateTime<Utc>> = None;
        let mut feed = ObservationFeed::new(source, window.since, config.page_size);
        loop {
            if *shutdown.borrow() {
                info!(source = %report.source_name, "Shutdown requested, aborting cycle");
                return Ok(RunStatus::Aborted);
            }

            *phase = SyncPhase::Fetching;
            let Some(item) = feed.next().await? else {
                break;
            };
            *phase = SyncPhase::Processing;
            report.fetched += 1;

            let observation = match item.into_observation() {
                Ok(observation) => observation,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed observation");
                    report.malformed += 1;
                    continue;
                }
            };

            high_water = high_water.max(Some(observation.captured_at));
            if let Err(e) =
                process_observation(storage, resolver, materializer, &observation, report)
            {
                warn!(
                    obs_id = %observation.source_observation_id,
                    subject = %observation.subject_external_id,
                    error = %e,
                    "Failed to sync observation"
                );
                report.errors += 1;
            }
        }

        // A cold start pins its floor so an empty source does not slide it
        let Some(cutoff) = high_water.or(window.previous.is_none().then_some(window.since)) else {
            return Ok(RunStatus::Completed);
        };
        let cursor =
            storage.advance_cursor(&report.source_name, cutoff.timestamp_millis(), SYNC_ACTOR)?;
        report.cutoff_advanced = window
            .previous
            .is_none_or(|previous| cursor.last_successful_sync > previous);
        Ok(RunStatus::Completed)
    }

    /// Acquire the source, backing off between retryable failures.
    ///
    /// Returns `Ok(false)` if shutdown arrived while backing off.
    async fn connect(
        &mut self,
        report: &mut CycleReport,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let policy = self.config.retry;
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.phase = SyncPhase::Connecting;
            report.connect_attempts = attempt;

            match self.source.acquire().await {
                Ok(()) => return Ok(true),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!(
                        source = self.source.name(),
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Source unavailable, backing off"
                    );
                    self.phase = SyncPhase::Backoff;
                    if sleep_or_shutdown(delay, shutdown).await {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::source_unavailable(
            self.source.name(),
            format!("gave up after {max_attempts} attempts"),
        ))
    }

    /// Lower bound for this cycle's fetch.
    ///
    /// The cursor holds the newest `captured_at` the source has handed over,
    /// so the window follows the source's clock rather than ours.
    fn fetch_window(&self, started: DateTime<Utc>) -> Result<FetchWindow> {
        let cursor = self.storage.get_cursor(self.source.name())?;
        let previous = cursor.as_ref().map(|c| c.last_successful_sync);

        let since = match cursor.as_ref().and_then(|c| c.last_sync_at()) {
            Some(last) => last.checked_sub_signed(to_delta(self.config.overlap)?),
            None if self.config.full_history => Some(DateTime::<Utc>::UNIX_EPOCH),
            None => started.checked_sub_signed(to_delta(self.config.initial_lookback)?),
        };
        let since = since.ok_or_else(|| {
            Error::FatalConfig("Sync window reaches past the earliest supported date".into())
        })?;

        Ok(FetchWindow { since, previous })
    }
}

/// Where a cycle starts reading, and the cursor it started from.
struct FetchWindow {
    since: DateTime<Utc>,
    /// Unix milliseconds; `None` on a cold start
    previous: Option<i64>,
}

/// Resolve and materialize one observation, updating the report.
fn process_observation(
    storage: &mut SqliteStorage,
    resolver: &IdentityResolver,
    materializer: &Materializer,
    observation: &SourceObservation,
    report: &mut CycleReport,
) -> Result<()> {
    let resolution = resolver.resolve(
        storage,
        SubjectIdentity {
            subject_external_id: &observation.subject_external_id,
            name: &observation.subject_name,
            national_id: observation.subject_national_id.as_deref(),
        },
    )?;

    if matches!(resolution, Resolution::AutoProvisioned { .. }) {
        report.provisioned += 1;
    }

    match materializer.materialize(storage, observation, &resolution)? {
        MaterializeOutcome::Inserted(_) => report.synced += 1,
        MaterializeOutcome::Duplicate => report.duplicates += 1,
        MaterializeOutcome::Skipped(reason) => {
            let detail = resolution
                .into_error(&observation.subject_external_id)
                .map(|e| e.to_string())
                .unwrap_or_default();
            warn!(
                obs_id = %observation.source_observation_id,
                subject = %observation.subject_external_id,
                reason = reason.as_str(),
                detail = %detail,
                "Skipping observation"
            );
            report.skipped += 1;
        }
    }
    Ok(())
}

/// Sleep for `delay`, returning `true` early if shutdown is signalled.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        _ = shutdown.wait_for(|stop| *stop) => true,
    }
}

fn to_delta(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| Error::FatalConfig(format!("Sync window of {duration:?} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinkSource, RecordType, TargetPatient};
    use crate::source::{PageCursor, SourcePage, SqliteSource};

    fn stamp(secs_ago: i64) -> String {
        (Utc::now() - chrono::Duration::seconds(secs_ago))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    const PEOPLE: &str = "
        INSERT INTO person (person_id) VALUES (100), (101), (102);
        INSERT INTO person_name (person_id, given_name, family_name)
            VALUES (100, 'Alice', 'Mwangi'), (101, 'John', 'Doe'), (102, 'Zed', 'Unknown');
        INSERT INTO concept_name (concept_id, name, concept_name_type)
            VALUES (32, 'Malarial smear', 'FULLY_SPECIFIED'),
                   (5089, 'Weight (kg)', 'FULLY_SPECIFIED');
    ";

    fn obs_sql(obs_id: i64, person_id: i64, concept_id: i64, value: &str, secs_ago: i64) -> String {
        format!(
            "INSERT INTO obs (obs_id, person_id, concept_id, value_text, obs_datetime, date_created)
             VALUES ({obs_id}, {person_id}, {concept_id}, '{value}', '{at}', '{at}');",
            at = stamp(secs_ago)
        )
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            ..OrchestratorConfig::default()
        }
    }

    fn storage_with(names: &[&str]) -> SqliteStorage {
        let mut storage = SqliteStorage::open_memory().unwrap();
        for name in names {
            storage
                .create_patient(&TargetPatient::new(name, None), "test")
                .unwrap();
        }
        storage
    }

    fn orchestrator(seed: &str, storage: SqliteStorage, config: OrchestratorConfig) -> Orchestrator<SqliteSource> {
        let source =
            SqliteSource::open_memory_with_fixture("openmrs", &format!("{PEOPLE}{seed}")).unwrap();
        Orchestrator::new(source, storage, config)
    }

    /// Fails `acquire` a set number of times before delegating.
    struct FlakySource {
        inner: SqliteSource,
        failures_left: u32,
        fatal: bool,
    }

    impl ObservationSource for FlakySource {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn acquire(&mut self) -> Result<()> {
            if self.fatal {
                return Err(Error::FatalConfig("bad credentials".into()));
            }
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(Error::source_unavailable("openmrs", "connection refused"));
            }
            self.inner.acquire().await
        }

        async fn fetch_page(
            &mut self,
            since: DateTime<Utc>,
            after: Option<&PageCursor>,
            limit: u32,
        ) -> Result<SourcePage> {
            self.inner.fetch_page(since, after, limit).await
        }

        fn release(&mut self) {
            self.inner.release();
        }

        fn close(&mut self) {
            self.inner.close();
        }
    }

    fn flaky(failures: u32, fatal: bool, seed: &str) -> FlakySource {
        FlakySource {
            inner: SqliteSource::open_memory_with_fixture("openmrs", &format!("{PEOPLE}{seed}"))
                .unwrap(),
            failures_left: failures,
            fatal,
        }
    }

    #[tokio::test]
    async fn test_scenario_a_one_condition_record_and_link() {
        let storage = storage_with(&["Alice Mwangi"]);
        let alice = storage.list_patients(true, None).unwrap().remove(0);
        let mut orch = orchestrator(&obs_sql(5303, 100, 32, "Positive", 5), storage, fast_config());

        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.fetched, 1);
        assert_eq!(report.synced, 1);
        assert!(report.cutoff_advanced);

        let records = orch.storage().list_records(&alice.id, None, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type, RecordType::Condition);
        assert_eq!(records[0].payload.detail, "Positive");
        assert_eq!(records[0].source_observation_id, "5303");

        let link = orch.storage().get_link("100").unwrap().unwrap();
        assert_eq!(link.patient_id, alice.id);
        assert_eq!(link.matched_by, LinkSource::ExactName);

        // The overlap window re-fetches the row; it dedupes
        let again = orch.run_cycle().await.unwrap();
        assert_eq!(again.fetched, 1);
        assert_eq!(again.synced, 0);
        assert_eq!(again.duplicates, 1);
        assert_eq!(orch.storage().count_records(&alice.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let seed: String = (0..9)
            .map(|i| obs_sql(6000 + i, 100, 5089, &format!("{}", 60 + i), 30 - i))
            .chain(std::iter::once(obs_sql(6100, 102, 5089, "80", 3)))
            .collect();
        let config = OrchestratorConfig {
            auto_provision: false,
            ..fast_config()
        };
        let mut orch = orchestrator(&seed, storage_with(&["Alice Mwangi"]), config);

        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.fetched, 10);
        assert_eq!(report.synced, 9);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors, 0);
        assert!(report.cutoff_advanced);
        assert!(orch.storage().get_cursor("openmrs").unwrap().is_some());
        assert_eq!(orch.storage().counts().unwrap().records, 9);
    }

    #[tokio::test]
    async fn test_unknown_subject_is_provisioned() {
        let mut orch = orchestrator(&obs_sql(7000, 102, 32, "Negative", 5), storage_with(&[]), fast_config());

        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.provisioned, 1);

        let link = orch.storage().get_link("102").unwrap().unwrap();
        assert_eq!(link.matched_by, LinkSource::AutoProvisioned);
        let patient = orch.storage().get_patient(&link.patient_id).unwrap().unwrap();
        assert_eq!(patient.display_name, "Zed Unknown");
    }

    #[tokio::test]
    async fn test_malformed_rows_counted_and_cursor_advances() {
        let seed = format!(
            "{}{}",
            obs_sql(8000, 100, 9999, "orphan", 10),
            obs_sql(8001, 100, 32, "Positive", 5)
        );
        let mut orch = orchestrator(&seed, storage_with(&["Alice Mwangi"]), fast_config());

        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(report.synced, 1);
        assert!(report.cutoff_advanced);
        assert_eq!(orch.counters().items_skipped, 1);
    }

    #[tokio::test]
    async fn test_pages_cover_every_row() {
        let seed: String = (0..5).map(|i| obs_sql(9000 + i, 100, 32, "x", 10)).collect();
        let config = OrchestratorConfig {
            page_size: 2,
            ..fast_config()
        };
        let mut orch = orchestrator(&seed, storage_with(&["Alice Mwangi"]), config);

        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.fetched, 5);
        assert_eq!(report.synced, 5);
    }

    #[tokio::test]
    async fn test_cold_start_respects_lookback() {
        let seed = format!(
            "{}{}",
            obs_sql(1, 100, 32, "old", 3 * 86_400),
            obs_sql(2, 100, 32, "new", 60)
        );
        let mut orch = orchestrator(&seed, storage_with(&["Alice Mwangi"]), fast_config());
        assert_eq!(orch.run_cycle().await.unwrap().fetched, 1);

        let full = OrchestratorConfig {
            full_history: true,
            ..fast_config()
        };
        let mut orch = orchestrator(&seed, storage_with(&["Alice Mwangi"]), full);
        assert_eq!(orch.run_cycle().await.unwrap().fetched, 2);
    }

    #[tokio::test]
    async fn test_later_rows_picked_up_next_cycle() {
        let mut orch = orchestrator(&obs_sql(1, 100, 32, "a", 5), storage_with(&["Alice Mwangi"]), fast_config());
        assert_eq!(orch.run_cycle().await.unwrap().synced, 1);

        orch.source_mut().seed(&obs_sql(2, 100, 32, "b", 0)).unwrap();
        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn test_source_clock_behind_loses_nothing() {
        // Source stamps run ten minutes behind the orchestrator
        let mut orch = orchestrator(&obs_sql(1, 100, 32, "a", 700), storage_with(&["Alice Mwangi"]), fast_config());
        assert_eq!(orch.run_cycle().await.unwrap().synced, 1);

        // Committed after the first cycle, stamped long before it started
        orch.source_mut().seed(&obs_sql(2, 100, 32, "b", 650)).unwrap();
        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.duplicates, 1);
        assert!(report.cutoff_advanced);

        let alice = orch.storage().list_patients(true, None).unwrap().remove(0);
        assert_eq!(orch.storage().count_records(&alice.id).unwrap(), 2);

        let cursor = orch.storage().get_cursor("openmrs").unwrap().unwrap();
        assert!(cursor.last_sync_at().unwrap() < Utc::now() - chrono::Duration::seconds(600));
    }

    #[tokio::test]
    async fn test_overlap_covers_late_commits() {
        let config = OrchestratorConfig {
            overlap: Duration::from_secs(600),
            ..fast_config()
        };
        let mut orch = orchestrator(&obs_sql(1, 100, 32, "a", 5), storage_with(&["Alice Mwangi"]), config);
        assert_eq!(orch.run_cycle().await.unwrap().synced, 1);

        orch.source_mut().seed(&obs_sql(2, 100, 32, "b", 300)).unwrap();
        assert_eq!(orch.run_cycle().await.unwrap().synced, 1);
    }

    #[tokio::test]
    async fn test_empty_cold_start_pins_floor() {
        let mut orch = orchestrator("", storage_with(&[]), fast_config());

        let first = orch.run_cycle().await.unwrap();
        assert_eq!(first.fetched, 0);
        assert!(first.cutoff_advanced);
        let floor = orch.storage().get_cursor("openmrs").unwrap().unwrap();
        assert_eq!(first.since.unwrap().timestamp_millis(), floor.last_successful_sync);

        let second = orch.run_cycle().await.unwrap();
        assert_eq!(second.status, RunStatus::Completed);
        assert!(!second.cutoff_advanced);
        let cursor = orch.storage().get_cursor("openmrs").unwrap().unwrap();
        assert_eq!(cursor.last_successful_sync, floor.last_successful_sync);
    }

    #[tokio::test]
    async fn test_out_of_range_window_fails_cycle() {
        for lookback in [Duration::from_secs(u64::MAX), Duration::from_secs(300_000 * 365 * 86_400)] {
            let config = OrchestratorConfig {
                initial_lookback: lookback,
                ..fast_config()
            };
            let mut orch = orchestrator("", storage_with(&[]), config);

            let err = orch.run_cycle().await.unwrap_err();
            assert!(matches!(err, Error::FatalConfig(_)));
            assert!(orch.storage().get_cursor("openmrs").unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_unavailable_source_does_not_advance_cursor() {
        let source = SqliteSource::new("openmrs", "/nonexistent/openmrs.db");
        let mut orch = Orchestrator::new(source, storage_with(&[]), fast_config());

        let err = orch.run_cycle().await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
        assert!(orch.storage().get_cursor("openmrs").unwrap().is_none());

        let runs = orch.storage().recent_runs(Some("openmrs"), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(!runs[0].cutoff_advanced);
        assert_eq!(orch.counters().cycles_failed, 1);
        assert_eq!(orch.storage().run_totals("openmrs").unwrap().cycles_failed, 1);
    }

    #[tokio::test]
    async fn test_backoff_recovers_within_attempts() {
        let source = flaky(2, false, &obs_sql(1, 100, 32, "x", 5));
        let mut orch = Orchestrator::new(source, storage_with(&["Alice Mwangi"]), fast_config());

        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.connect_attempts, 3);
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_fatal_config_is_not_retried() {
        let source = flaky(0, true, "");
        let mut orch = Orchestrator::new(source, storage_with(&[]), fast_config());

        let err = orch.run_cycle().await.unwrap_err();
        assert!(matches!(err, Error::FatalConfig(_)));
        assert_eq!(orch.counters().cycles_failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_without_advancing() {
        let mut orch = orchestrator(&obs_sql(1, 100, 32, "x", 5), storage_with(&["Alice Mwangi"]), fast_config());
        let (_tx, mut rx) = watch::channel(true);

        let report = orch.cycle(&mut rx).await.unwrap();
        assert_eq!(report.status, RunStatus::Aborted);
        assert!(!report.cutoff_advanced);
        assert!(orch.storage().get_cursor("openmrs").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_until_stops_on_signal() {
        let config = OrchestratorConfig {
            interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let mut orch = orchestrator(&obs_sql(1, 100, 32, "x", 5), storage_with(&["Alice Mwangi"]), config);
        let (tx, rx) = watch::channel(false);

        let (counters, sent) = tokio::join!(orch.run_until(rx), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true)
        });
        assert!(sent.is_ok());
        assert_eq!(counters.cycles_run, 1);
        assert_eq!(counters.items_synced, 1);
        assert_eq!(orch.phase(), SyncPhase::Idle);
    }
}
