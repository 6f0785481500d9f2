//! Source connectors.
//!
//! A connector reads observations from the hospital's clinical store,
//! oldest first, one bounded page at a time. [`ObservationFeed`] turns those
//! pages into a lazy sequence so a cold first run never holds the whole
//! history in memory.
//!
//! Connectors are read-only. A row that cannot be turned into a
//! [`SourceObservation`] is yielded as [`FeedItem::Malformed`] so the caller
//! can count it and move on.

pub mod rest;
pub mod sqlite;

pub use rest::RestSource;
pub use sqlite::{SqliteSource, OPENMRS_FIXTURE_SCHEMA};

use crate::config::{SourceKind, SourceSettings};
use crate::error::{Error, Result};
use crate::model::SourceObservation;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Position after the last row of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// Keyset position for stores ordered by `(date_created, obs_id)`.
    Keyset { date_created: String, obs_id: i64 },
    /// Row offset for APIs that page by index.
    Offset(u32),
}

/// One row from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Observation(SourceObservation),
    /// A row that could not be mapped; skipped by the orchestrator.
    Malformed { obs_id: String, reason: String },
}

impl FeedItem {
    /// Source identifier of the row, malformed or not.
    #[must_use]
    pub fn obs_id(&self) -> &str {
        match self {
            Self::Observation(obs) => &obs.source_observation_id,
            Self::Malformed { obs_id, .. } => obs_id,
        }
    }

    /// The observation, or `MalformedObservation` for a row that could not
    /// be mapped.
    ///
    /// # Errors
    ///
    /// Returns `MalformedObservation` for [`FeedItem::Malformed`].
    pub fn into_observation(self) -> Result<SourceObservation> {
        match self {
            Self::Observation(obs) => Ok(obs),
            Self::Malformed { obs_id, reason } => {
                Err(Error::MalformedObservation { obs_id, reason })
            }
        }
    }
}

/// A bounded page of rows.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub items: Vec<FeedItem>,
    /// `None` when this was the last page.
    pub next: Option<PageCursor>,
}

/// Trait for observation sources.
///
/// Implemented by the direct database connector and the REST connector.
/// Connections are scoped per cycle: `acquire` at the start, `release` at
/// the end, `close` on shutdown.
pub trait ObservationSource: Send {
    /// Name used as the cursor key.
    fn name(&self) -> &str;

    /// Open, or health-check and reuse, the connection for this cycle.
    ///
    /// Connectivity failures are `SourceUnavailable`; bad credentials or a
    /// missing database path are `FatalConfig`.
    fn acquire(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Fetch up to `limit` rows created at or after `since`, strictly after
    /// `after`, in `(date_created, obs_id)` order. Voided rows are excluded.
    fn fetch_page(
        &mut self,
        since: DateTime<Utc>,
        after: Option<&PageCursor>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<SourcePage>> + Send;

    /// Return the connection to the idle slot at cycle end.
    fn release(&mut self);

    /// Drop all connections.
    fn close(&mut self);
}

/// Lazy, page-bounded sequence of rows from a source.
pub struct ObservationFeed<'a, S: ObservationSource> {
    source: &'a mut S,
    since: DateTime<Utc>,
    page_size: u32,
    cursor: Option<PageCursor>,
    buffer: VecDeque<FeedItem>,
    exhausted: bool,
    pages_fetched: u32,
}

impl<'a, S: ObservationSource> ObservationFeed<'a, S> {
    pub fn new(source: &'a mut S, since: DateTime<Utc>, page_size: u32) -> Self {
        Self {
            source,
            since,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            pages_fetched: 0,
        }
    }

    /// Next row, fetching a new page only once the current one is drained.
    ///
    /// # Errors
    ///
    /// Propagates the source's page fetch error.
    pub async fn next(&mut self) -> Result<Option<FeedItem>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }

            let page = self
                .source
                .fetch_page(self.since, self.cursor.as_ref(), self.page_size)
                .await?;
            self.pages_fetched += 1;
            debug!(
                source = self.source.name(),
                page = self.pages_fetched,
                rows = page.items.len(),
                "Fetched page"
            );

            if page.items.is_empty() {
                self.exhausted = true;
            }
            match page.next {
                Some(next) => self.cursor = Some(next),
                None => self.exhausted = true,
            }
            self.buffer.extend(page.items);
        }
    }

    #[must_use]
    pub const fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }
}

/// Parse a timestamp as written by OpenMRS.
///
/// Accepts RFC 3339, the REST form `2024-03-04T10:00:00.000+0300`, and the
/// database form `2024-03-04 10:00:00[.fff]` which is taken as UTC.
#[must_use]
pub fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// The connector chosen by configuration.
pub enum ConfiguredSource {
    Database(SqliteSource),
    Rest(RestSource),
}

impl ConfiguredSource {
    /// Build the connector named by `settings.kind`.
    ///
    /// # Errors
    ///
    /// Returns `FatalConfig` when the chosen connector is missing a required
    /// setting (database path, REST credentials).
    pub fn from_settings(settings: &SourceSettings, timeout: Duration) -> Result<Self> {
        match settings.kind {
            SourceKind::Database => {
                let path = settings.database_path.clone().ok_or_else(|| {
                    Error::FatalConfig(
                        "source.database_path (OPENMRS_DB_PATH) is required for the database source"
                            .into(),
                    )
                })?;
                Ok(Self::Database(
                    SqliteSource::new(&settings.name, path)
                        .with_national_id_type(&settings.national_id_type),
                ))
            }
            SourceKind::Rest => Ok(Self::Rest(RestSource::from_settings(settings, timeout)?)),
        }
    }
}

impl ObservationSource for ConfiguredSource {
    fn name(&self) -> &str {
        match self {
            Self::Database(s) => s.name(),
            Self::Rest(s) => s.name(),
        }
    }

    async fn acquire(&mut self) -> Result<()> {
        match self {
            Self::Database(s) => s.acquire().await,
            Self::Rest(s) => s.acquire().await,
        }
    }

    async fn fetch_page(
        &mut self,
        since: DateTime<Utc>,
        after: Option<&PageCursor>,
        limit: u32,
    ) -> Result<SourcePage> {
        match self {
            Self::Database(s) => s.fetch_page(since, after, limit).await,
            Self::Rest(s) => s.fetch_page(since, after, limit).await,
        }
    }

    fn release(&mut self) {
        match self {
            Self::Database(s) => s.release(),
            Self::Rest(s) => s.release(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Database(s) => s.close(),
            Self::Rest(s) => s.close(),
        }
    }
}
