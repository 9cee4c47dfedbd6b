//! Audit trail persistence.
//!
//! # Responsibility
//! - Append one event inside the caller's transition transaction.
//! - Serve the ordered trail of any record id, purged ones included.
//!
//! # Invariants
//! - `append_event` never opens or commits a transaction of its own.
//! - `audit_events` rows are never updated or deleted; schema triggers abort
//!   any attempt.
//! - Trails are ordered by `seq`, the insertion sequence.

use crate::model::actor::ActorId;
use crate::model::audit::{AuditAction, AuditEvent};
use crate::model::record::{LifecycleState, RecordId};
use crate::repo::record_repo::{ensure_schema_ready, RepoError, RepoResult};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

const AUDIT_SELECT_SQL: &str = "SELECT
    seq,
    event_id,
    record_id,
    actor_id,
    action,
    previous_state,
    new_state,
    occurred_at
FROM audit_events";

/// Read-side audit interface.
pub trait AuditRepository {
    fn list_events_for_record(&self, record_id: RecordId) -> RepoResult<Vec<AuditEvent>>;
    fn count_events(&self) -> RepoResult<u64>;
}

/// SQLite-backed audit reader.
pub struct SqliteAuditRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteAuditRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_schema_ready(conn)?;
        Ok(Self { conn })
    }
}

impl AuditRepository for SqliteAuditRepository<'_> {
    fn list_events_for_record(&self, record_id: RecordId) -> RepoResult<Vec<AuditEvent>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{AUDIT_SELECT_SQL} WHERE record_id = ?1 ORDER BY seq ASC;"))?;
        let mut rows = stmt.query([record_id.to_string()])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(parse_event_row(row)?);
        }
        Ok(events)
    }

    fn count_events(&self) -> RepoResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM audit_events;", [], |row| row.get(0))?;
        u64::try_from(count).map_err(|_| RepoError::InvalidData(format!("negative count {count}")))
    }
}

/// Appends `event` using the caller's open transaction and returns it with
/// its assigned sequence number.
pub(crate) fn append_event(conn: &Connection, mut event: AuditEvent) -> RepoResult<AuditEvent> {
    conn.execute(
        "INSERT INTO audit_events (
            event_id,
            record_id,
            actor_id,
            action,
            previous_state,
            new_state,
            occurred_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
        params![
            event.event_id.to_string(),
            event.record_id.to_string(),
            event.actor_id.as_str(),
            event.action.as_str(),
            event.previous_state.as_str(),
            event.new_state.as_str(),
            event.timestamp,
        ],
    )?;
    event.sequence = conn.last_insert_rowid();
    Ok(event)
}

fn parse_event_row(row: &Row<'_>) -> RepoResult<AuditEvent> {
    let event_id_text: String = row.get("event_id")?;
    let record_id_text: String = row.get("record_id")?;
    let action_text: String = row.get("action")?;
    let previous_text: String = row.get("previous_state")?;
    let new_text: String = row.get("new_state")?;

    Ok(AuditEvent {
        sequence: row.get("seq")?,
        event_id: parse_uuid(&event_id_text, "audit_events.event_id")?,
        record_id: parse_uuid(&record_id_text, "audit_events.record_id")?,
        actor_id: ActorId::from_stored(row.get("actor_id")?),
        action: AuditAction::parse(&action_text).ok_or_else(|| {
            RepoError::InvalidData(format!("invalid action `{action_text}` in audit_events.action"))
        })?,
        previous_state: parse_state(&previous_text, "audit_events.previous_state")?,
        new_state: parse_state(&new_text, "audit_events.new_state")?,
        timestamp: row.get("occurred_at")?,
    })
}

fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

fn parse_state(value: &str, column: &'static str) -> RepoResult<LifecycleState> {
    LifecycleState::parse(value)
        .ok_or_else(|| RepoError::InvalidData(format!("invalid state `{value}` in {column}")))
}
