//! Audit event storage and retrieval.
//!
//! Every mutation of patients, links, records and cursors leaves an event
//! behind so operators can reconstruct why a record landed where it did.

use rusqlite::{Connection, Result};

/// Event types for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    // Patient events
    PatientCreated,
    PatientUpdated,
    PatientDeactivated,
    PatientReactivated,

    // Identity link events
    SubjectLinked,
    LinkReplaced,
    LinkRemoved,

    // Record events
    RecordSynced,

    // Cursor events
    CursorAdvanced,
}

impl EventType {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PatientCreated => "patient_created",
            Self::PatientUpdated => "patient_updated",
            Self::PatientDeactivated => "patient_deactivated",
            Self::PatientReactivated => "patient_reactivated",
            Self::SubjectLinked => "subject_linked",
            Self::LinkReplaced => "link_replaced",
            Self::LinkRemoved => "link_removed",
            Self::RecordSynced => "record_synced",
            Self::CursorAdvanced => "cursor_advanced",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "patient_created" => Ok(Self::PatientCreated),
            "patient_updated" => Ok(Self::PatientUpdated),
            "patient_deactivated" => Ok(Self::PatientDeactivated),
            "patient_reactivated" => Ok(Self::PatientReactivated),
            "subject_linked" => Ok(Self::SubjectLinked),
            "link_replaced" => Ok(Self::LinkReplaced),
            "link_removed" => Ok(Self::LinkRemoved),
            "record_synced" => Ok(Self::RecordSynced),
            "cursor_advanced" => Ok(Self::CursorAdvanced),
            _ => Err(format!("Unknown event type: {s}")),
        }
    }
}

/// An audit event record.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub event_type: EventType,
    pub actor: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub comment: Option<String>,
    pub created_at: i64,
}

impl Event {
    /// Create a new event (id will be assigned by database).
    #[must_use]
    pub fn new(entity_type: &str, entity_id: &str, event_type: EventType, actor: &str) -> Self {
        Self {
            id: 0,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            event_type,
            actor: actor.to_string(),
            old_value: None,
            new_value: None,
            comment: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Add old/new values for field change tracking.
    #[must_use]
    pub fn with_values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    /// Add a comment to the event.
    #[must_use]
    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }
}

/// Insert an event into the database.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_event(conn: &Connection, event: &Event) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (entity_type, entity_id, event_type, actor, old_value, new_value, comment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            event.entity_type,
            event.entity_id,
            event.event_type.as_str(),
            event.actor,
            event.old_value,
            event.new_value,
            event.comment,
            event.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Get events for an entity, newest first.
///
/// Rows with an event type this build does not know are skipped.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_events(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    limit: Option<u32>,
) -> Result<Vec<Event>> {
    let limit = limit.unwrap_or(100);
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, event_type, actor, old_value, new_value, comment, created_at
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at DESC, id DESC
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(rusqlite::params![entity_type, entity_id, limit], |row| {
        let event_type: String = row.get(3)?;
        let Ok(event_type) = event_type.parse::<EventType>() else {
            return Ok(None);
        };
        Ok(Some(Event {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            event_type,
            actor: row.get(4)?,
            old_value: row.get(5)?,
            new_value: row.get(6)?,
            comment: row.get(7)?,
            created_at: row.get(8)?,
        }))
    })?;

    let mut events = Vec::new();
    for row in rows {
        if let Some(event) = row? {
            events.push(event);
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::apply_schema;

    #[test]
    fn test_event_insert_and_get() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let event = Event::new("identity_link", "5303", EventType::SubjectLinked, "sync")
            .with_values(None, Some("pat_1".into()))
            .with_comment("exact_name");

        let id = insert_event(&conn, &event).unwrap();
        assert!(id > 0);

        let events = get_events(&conn, "identity_link", "5303", Some(10)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::SubjectLinked);
        assert_eq!(events[0].actor, "sync");
        assert_eq!(events[0].new_value.as_deref(), Some("pat_1"));
        assert_eq!(events[0].comment.as_deref(), Some("exact_name"));
    }

    #[test]
    fn test_unknown_event_types_are_skipped() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO events (entity_type, entity_id, event_type, actor, created_at)
             VALUES ('patient', 'pat_1', 'legacy_thing', 'x', 1)",
            [],
        )
        .unwrap();
        insert_event(
            &conn,
            &Event::new("patient", "pat_1", EventType::PatientCreated, "x"),
        )
        .unwrap();

        let events = get_events(&conn, "patient", "pat_1", None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::PatientCreated);
    }
}
