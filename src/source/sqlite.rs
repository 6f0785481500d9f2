//! Direct database connector for an OpenMRS-shaped schema.
//!
//! Opens the clinical database read-only and pages through `obs` by
//! `(date_created, obs_id)`. Names, identifiers, providers and locations are
//! joined in the same query so each page is a single round trip.

use super::{parse_source_timestamp, FeedItem, ObservationSource, PageCursor, SourcePage};
use crate::error::{Error, Result};
use crate::model::{NameParts, ObservationValue, SourceObservation};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Minimal OpenMRS tables read by [`SqliteSource`].
///
/// Used for local fixtures and tests; production databases already carry
/// a superset of these columns.
pub const OPENMRS_FIXTURE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS person (
    person_id INTEGER PRIMARY KEY,
    uuid TEXT,
    voided INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS person_name (
    person_name_id INTEGER PRIMARY KEY,
    person_id INTEGER NOT NULL,
    preferred INTEGER NOT NULL DEFAULT 1,
    given_name TEXT,
    middle_name TEXT,
    family_name TEXT,
    voided INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS patient_identifier_type (
    patient_identifier_type_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS patient_identifier (
    patient_identifier_id INTEGER PRIMARY KEY,
    patient_id INTEGER NOT NULL,
    identifier TEXT NOT NULL,
    identifier_type INTEGER NOT NULL,
    preferred INTEGER NOT NULL DEFAULT 0,
    voided INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS concept_name (
    concept_name_id INTEGER PRIMARY KEY,
    concept_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    locale TEXT NOT NULL DEFAULT 'en',
    concept_name_type TEXT,
    voided INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS location (
    location_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    person_id INTEGER,
    username TEXT
);

CREATE TABLE IF NOT EXISTS provider (
    provider_id INTEGER PRIMARY KEY,
    person_id INTEGER,
    name TEXT
);

CREATE TABLE IF NOT EXISTS encounter (
    encounter_id INTEGER PRIMARY KEY,
    uuid TEXT,
    patient_id INTEGER,
    location_id INTEGER,
    creator INTEGER,
    voided INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS encounter_provider (
    encounter_provider_id INTEGER PRIMARY KEY,
    encounter_id INTEGER NOT NULL,
    provider_id INTEGER NOT NULL,
    voided INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS obs (
    obs_id INTEGER PRIMARY KEY,
    person_id INTEGER NOT NULL,
    concept_id INTEGER NOT NULL,
    encounter_id INTEGER,
    location_id INTEGER,
    obs_datetime TEXT,
    value_text TEXT,
    value_numeric REAL,
    value_coded INTEGER,
    comments TEXT,
    creator INTEGER,
    date_created TEXT,
    voided INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_obs_date_created ON obs(date_created, obs_id);
";

const PAGE_SQL: &str = "
SELECT
    o.obs_id,
    o.person_id,
    o.date_created,
    o.obs_datetime,
    o.value_text,
    o.value_numeric,
    (SELECT cn.name FROM concept_name cn
      WHERE cn.concept_id = o.value_coded AND cn.locale = 'en'
        AND cn.concept_name_type = 'FULLY_SPECIFIED' AND cn.voided = 0
      LIMIT 1) AS coded_label,
    o.comments,
    (SELECT cn.name FROM concept_name cn
      WHERE cn.concept_id = o.concept_id AND cn.locale = 'en'
        AND cn.concept_name_type = 'FULLY_SPECIFIED' AND cn.voided = 0
      LIMIT 1) AS concept_label,
    pn.given_name,
    pn.middle_name,
    pn.family_name,
    (SELECT pi.identifier FROM patient_identifier pi
       JOIN patient_identifier_type pit
         ON pit.patient_identifier_type_id = pi.identifier_type
      WHERE pi.patient_id = o.person_id AND pi.voided = 0 AND pit.name = ?1
      ORDER BY pi.preferred DESC, pi.patient_identifier_id
      LIMIT 1) AS national_id,
    COALESCE(
        (SELECT TRIM(ppn.given_name || ' ' || ppn.family_name)
           FROM encounter_provider ep
           JOIN provider pr ON pr.provider_id = ep.provider_id
           JOIN person_name ppn ON ppn.person_id = pr.person_id AND ppn.voided = 0
          WHERE ep.encounter_id = o.encounter_id AND ep.voided = 0
          ORDER BY ppn.preferred DESC, ep.encounter_provider_id
          LIMIT 1),
        (SELECT pr.name
           FROM encounter_provider ep
           JOIN provider pr ON pr.provider_id = ep.provider_id
          WHERE ep.encounter_id = o.encounter_id AND ep.voided = 0
          ORDER BY ep.encounter_provider_id
          LIMIT 1),
        (SELECT TRIM(cpn.given_name || ' ' || cpn.family_name)
           FROM users u
           JOIN person_name cpn ON cpn.person_id = u.person_id AND cpn.voided = 0
          WHERE u.user_id = COALESCE(e.creator, o.creator)
          ORDER BY cpn.preferred DESC
          LIMIT 1),
        (SELECT u.username FROM users u WHERE u.user_id = COALESCE(e.creator, o.creator))
    ) AS provider_name,
    COALESCE(el.name, ol.name) AS location_name,
    e.uuid AS encounter_ref
FROM obs o
LEFT JOIN encounter e ON e.encounter_id = o.encounter_id
LEFT JOIN location el ON el.location_id = e.location_id
LEFT JOIN location ol ON ol.location_id = o.location_id
LEFT JOIN person_name pn ON pn.person_name_id = (
    SELECT pn2.person_name_id FROM person_name pn2
     WHERE pn2.person_id = o.person_id AND pn2.voided = 0
     ORDER BY pn2.preferred DESC, pn2.person_name_id
     LIMIT 1)
WHERE o.voided = 0
  AND o.date_created >= ?2
  AND (?3 IS NULL OR (o.date_created, o.obs_id) > (?3, ?4))
ORDER BY o.date_created, o.obs_id
LIMIT ?5
";

/// Raw columns of one `obs` row before validation.
#[derive(Debug, Default)]
struct ObsRow {
    obs_id: i64,
    person_id: i64,
    date_created: Option<String>,
    obs_datetime: Option<String>,
    value_text: Option<String>,
    value_numeric: Option<f64>,
    coded_label: Option<String>,
    comments: Option<String>,
    concept_label: Option<String>,
    given_name: Option<String>,
    middle_name: Option<String>,
    family_name: Option<String>,
    national_id: Option<String>,
    provider_name: Option<String>,
    location_name: Option<String>,
    encounter_ref: Option<String>,
}

impl ObsRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            obs_id: row.get(0)?,
            person_id: row.get(1)?,
            date_created: row.get(2)?,
            obs_datetime: row.get(3)?,
            value_text: row.get(4)?,
            value_numeric: row.get(5)?,
            coded_label: row.get(6)?,
            comments: row.get(7)?,
            concept_label: row.get(8)?,
            given_name: row.get(9)?,
            middle_name: row.get(10)?,
            family_name: row.get(11)?,
            national_id: row.get(12)?,
            provider_name: row.get(13)?,
            location_name: row.get(14)?,
            encounter_ref: row.get(15)?,
        })
    }

    /// Validate and map into a feed item.
    fn into_item(self) -> FeedItem {
        let obs_id = self.obs_id.to_string();
        let malformed = |reason: &str| FeedItem::Malformed {
            obs_id: obs_id.clone(),
            reason: reason.to_string(),
        };

        let Some(concept_label) = self
            .concept_label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
        else {
            return malformed("missing concept label");
        };

        let Some(captured_at) = self.date_created.as_deref().and_then(parse_source_timestamp)
        else {
            return malformed("unparsable date_created");
        };

        let recorded_at = match self.obs_datetime.as_deref() {
            None => captured_at,
            Some(raw) => match parse_source_timestamp(raw) {
                Some(at) => at,
                None => return malformed("unparsable obs_datetime"),
            },
        };

        let subject_name = NameParts::new(
            self.given_name.as_deref().unwrap_or_default(),
            self.middle_name.as_deref(),
            self.family_name.as_deref().unwrap_or_default(),
        );

        FeedItem::Observation(SourceObservation {
            source_observation_id: obs_id.clone(),
            subject_external_id: self.person_id.to_string(),
            subject_name,
            subject_national_id: self
                .national_id
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            concept_label,
            value: ObservationValue::from_columns(
                self.value_text,
                self.value_numeric,
                self.coded_label,
            ),
            comments: self.comments,
            recorded_at,
            captured_at,
            provider_name: self.provider_name,
            location_name: self.location_name,
            encounter_ref: self.encounter_ref,
        })
    }
}

/// Read-only connector for an OpenMRS database file.
pub struct SqliteSource {
    name: String,
    /// `None` for in-memory fixtures, which cannot be reopened.
    path: Option<PathBuf>,
    national_id_type: String,
    /// Connection checked out for the current cycle
    active: Option<Connection>,
    /// Connection kept between cycles
    idle: Option<Connection>,
}

impl SqliteSource {
    /// Create a connector for the database at `path`. Nothing is opened
    /// until [`acquire`](ObservationSource::acquire).
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: Some(path.into()),
            national_id_type: "National ID".to_string(),
            active: None,
            idle: None,
        }
    }

    /// Identifier type whose value is exposed as the national ID.
    #[must_use]
    pub fn with_national_id_type(mut self, name: &str) -> Self {
        self.national_id_type = name.to_string();
        self
    }

    /// Open an in-memory source with the fixture schema and `seed_sql` applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema or seed SQL fails.
    pub fn open_memory_with_fixture(name: &str, seed_sql: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(OPENMRS_FIXTURE_SCHEMA)?;
        conn.execute_batch(seed_sql)?;
        Ok(Self {
            name: name.to_string(),
            path: None,
            national_id_type: "National ID".to_string(),
            active: None,
            idle: Some(conn),
        })
    }

    /// Run extra SQL against an in-memory fixture.
    #[cfg(test)]
    pub(crate) fn seed(&self, sql: &str) -> Result<()> {
        let conn = self
            .active
            .as_ref()
            .or(self.idle.as_ref())
            .ok_or_else(|| Error::Other("fixture connection is closed".into()))?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        let Some(path) = &self.path else {
            return Err(Error::source_unavailable(
                &self.name,
                "in-memory source has been closed",
            ));
        };
        if !path.exists() {
            return Err(Error::source_unavailable(
                &self.name,
                format!("database not found at {}", path.display()),
            ));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::source_unavailable(&self.name, e))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| Error::source_unavailable(&self.name, e))?;
        Ok(conn)
    }

    fn query_page(
        &self,
        since: DateTime<Utc>,
        after: Option<&PageCursor>,
        limit: u32,
    ) -> Result<SourcePage> {
        let conn = self.active.as_ref().ok_or_else(|| {
            Error::source_unavailable(&self.name, "fetch without an acquired connection")
        })?;

        let since = since.format("%Y-%m-%d %H:%M:%S").to_string();
        let (after_created, after_id) = match after {
            Some(PageCursor::Keyset { date_created, obs_id }) => {
                (Some(date_created.as_str()), *obs_id)
            }
            Some(PageCursor::Offset(_)) | None => (None, 0),
        };

        let mut stmt = conn
            .prepare_cached(PAGE_SQL)
            .map_err(|e| Error::source_unavailable(&self.name, e))?;
        let rows = stmt
            .query_map(
                params![self.national_id_type, since, after_created, after_id, limit],
                ObsRow::from_row,
            )
            .map_err(|e| Error::source_unavailable(&self.name, e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::source_unavailable(&self.name, e))?;

        let next = if rows.len() as u32 == limit {
            rows.last().and_then(|last| {
                last.date_created.clone().map(|date_created| PageCursor::Keyset {
                    date_created,
                    obs_id: last.obs_id,
                })
            })
        } else {
            None
        };

        let items = rows.into_iter().map(ObsRow::into_item).collect();
        Ok(SourcePage { items, next })
    }
}

impl ObservationSource for SqliteSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        if let Some(conn) = self.idle.take() {
            match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
                Ok(_) => {
                    self.active = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    warn!(source = %self.name, error = %e, "Idle connection failed health check, reopening");
                }
            }
        }

        let conn = self.open()?;
        debug!(source = %self.name, "Opened source connection");
        self.active = Some(conn);
        Ok(())
    }

    async fn fetch_page(
        &mut self,
        since: DateTime<Utc>,
        after: Option<&PageCursor>,
        limit: u32,
    ) -> Result<SourcePage> {
        self.query_page(since, after, limit)
    }

    fn release(&mut self) {
        if let Some(conn) = self.active.take() {
            self.idle = Some(conn);
        }
    }

    fn close(&mut self) {
        self.active = None;
        if self.path.is_some() {
            self.idle = None;
        }
    }
}
