//! Durable append and replay of event rows.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::errors::StoreError;
use crate::model::Event;

/// Append one event row. Rows are never updated or deleted.
pub fn append_event(db: &DbHandle, event: &Event, seq: i64) -> Result<(), StoreError> {
    let data = serde_json::to_string(&event.data)?;
    db.with(|conn| {
        conn.execute(
            "INSERT INTO events (id, log_id, timestamp, event_type, plan_id, phase_id, step_id, data, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id.to_string(),
                event.log_id.to_string(),
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.plan_id.map(|u| u.to_string()),
                event.phase_id.map(|u| u.to_string()),
                event.step_id.map(|u| u.to_string()),
                data,
                seq,
            ],
        )?;
        Ok(())
    })
}

/// All persisted events for one session, in append order.
pub fn events_for_log(db: &DbHandle, log_id: Uuid) -> Result<Vec<Event>, StoreError> {
    db.with(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, log_id, timestamp, event_type, plan_id, phase_id, step_id, data
             FROM events WHERE log_id = ?1 ORDER BY timestamp, seq",
        )?;
        let rows = stmt.query_map(params![log_id.to_string()], |row| {
            Ok(EventRow {
                id: row.get(0)?,
                log_id: row.get(1)?,
                timestamp: row.get(2)?,
                event_type: row.get(3)?,
                plan_id: row.get(4)?,
                phase_id: row.get(5)?,
                step_id: row.get(6)?,
                data: row.get(7)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_event()?);
        }
        Ok(events)
    })
}

/// Intermediate row struct converting TEXT columns back into typed values.
struct EventRow {
    id: String,
    log_id: String,
    timestamp: String,
    event_type: String,
    plan_id: Option<String>,
    phase_id: Option<String>,
    step_id: Option<String>,
    data: String,
}

impl EventRow {
    fn into_event(self) -> Result<Event, StoreError> {
        Ok(Event {
            id: parse_uuid(&self.id)?,
            log_id: parse_uuid(&self.log_id)?,
            timestamp: parse_timestamp(&self.timestamp)?,
            event_type: self.event_type,
            plan_id: self.plan_id.as_deref().map(parse_uuid).transpose()?,
            phase_id: self.phase_id.as_deref().map(parse_uuid).transpose()?,
            step_id: self.step_id.as_deref().map(parse_uuid).transpose()?,
            data: serde_json::from_str(&self.data)?,
        })
    }
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|_| {
        StoreError::Database(rusqlite::Error::InvalidColumnName(format!(
            "invalid uuid '{text}'"
        )))
    })
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            StoreError::Database(rusqlite::Error::InvalidColumnName(format!(
                "invalid timestamp '{text}'"
            )))
        })
}
