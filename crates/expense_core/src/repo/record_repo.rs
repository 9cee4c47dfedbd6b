//! Record repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide owner-scoped reads over the `records` table.
//! - Execute lifecycle transitions as one immediate transaction per record:
//!   re-read, plan, mutate, append audit event, commit.
//!
//! # Invariants
//! - `state`, `deleted_at` and `deleted_by` are written only by
//!   `apply_transition`.
//! - `owner_id` and `created_at` are never updated.
//! - Read paths reject rows whose deletion metadata disagrees with `state`.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::lifecycle::{plan_transition, Transition, TransitionEffect, TransitionError};
use crate::model::actor::ActorId;
use crate::model::audit::AuditEvent;
use crate::model::record::{
    Lifecycle, LifecycleState, NewExpense, Record, RecordId, RecordValidationError,
};
use crate::repo::audit_repo::append_event;
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, Row, Transaction, TransactionBehavior,
};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const RECORD_SELECT_SQL: &str = "SELECT
    id,
    owner_id,
    description,
    amount_cents,
    category,
    state,
    deleted_at,
    deleted_by,
    created_at,
    updated_at
FROM records";

// Keeps `IN (...)` lists well below SQLite's bound parameter limit.
const ID_CHUNK_SIZE: usize = 500;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for record persistence and lifecycle transitions.
#[derive(Debug)]
pub enum RepoError {
    Validation(RecordValidationError),
    Db(DbError),
    /// Missing, purged, or owned by someone else.
    NotFound(RecordId),
    InvalidState {
        record_id: RecordId,
        source: TransitionError,
    },
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    InvalidData(String),
}

impl RepoError {
    /// Whether this is a storage-level failure rather than a domain outcome.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Db(_)
                | Self::UninitializedConnection { .. }
                | Self::MissingRequiredTable(_)
                | Self::InvalidData(_)
        )
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::InvalidState { record_id, source } => write!(f, "record {record_id}: {source}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "record repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "record repository requires table `{table}`")
            }
            Self::InvalidData(message) => write!(f, "invalid persisted record data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::InvalidState { source, .. } => Some(source),
            Self::NotFound(_) => None,
            Self::UninitializedConnection { .. } => None,
            Self::MissingRequiredTable(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<RecordValidationError> for RepoError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Owner-scoped listing options.
#[derive(Debug, Clone)]
pub struct RecordListQuery {
    pub owner_id: ActorId,
    pub state: LifecycleState,
}

impl RecordListQuery {
    pub fn new(owner_id: ActorId, state: LifecycleState) -> Self {
        Self { owner_id, state }
    }
}

/// One transition to execute against a stored record.
#[derive(Debug, Clone)]
pub struct TransitionRequest<'a> {
    pub record_id: RecordId,
    pub transition: Transition,
    pub actor: &'a ActorId,
    /// When set, rows owned by anyone else are reported as `NotFound`.
    pub expected_owner: Option<&'a ActorId>,
    pub now: i64,
}

/// Committed transition: the appended event and the post-state record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransition {
    pub event: AuditEvent,
    /// `None` once the row has been permanently deleted.
    pub record: Option<Record>,
}

/// Repository interface for record lifecycle persistence.
pub trait RecordRepository {
    fn create_record(&self, owner: &ActorId, input: &NewExpense, now: i64) -> RepoResult<Record>;
    fn get_record(&self, id: RecordId) -> RepoResult<Option<Record>>;
    fn list_records(&self, query: &RecordListQuery) -> RepoResult<Vec<Record>>;
    /// Returns the subset of `ids` that exist and belong to `owner`.
    fn owned_record_ids(&self, owner: &ActorId, ids: &[RecordId]) -> RepoResult<HashSet<RecordId>>;
    /// Current state of each id in `ids` that still exists.
    fn record_states(&self, ids: &[RecordId]) -> RepoResult<HashMap<RecordId, LifecycleState>>;
    fn apply_transition(&self, request: &TransitionRequest<'_>) -> RepoResult<AppliedTransition>;
    /// Soft-deleted ids with `deleted_at < cutoff`, oldest first.
    fn list_retention_candidates(&self, cutoff: i64, limit: u32) -> RepoResult<Vec<RecordId>>;
    /// Counts soft-deleted rows with `deleted_at` in `[since, before)`.
    fn count_soft_deleted(&self, since: Option<i64>, before: Option<i64>) -> RepoResult<u64>;
}

/// SQLite-backed record repository.
pub struct SqliteRecordRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRecordRepository<'conn> {
    /// Wraps a migrated connection.
    ///
    /// Fails with `UninitializedConnection` when the schema version does not
    /// match this binary.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_schema_ready(conn)?;
        Ok(Self { conn })
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn create_record(&self, owner: &ActorId, input: &NewExpense, now: i64) -> RepoResult<Record> {
        let (description, amount_cents, category) = input.normalized()?;
        let record = Record {
            id: Uuid::new_v4(),
            owner_id: owner.clone(),
            description,
            amount_cents,
            category,
            lifecycle: Lifecycle::Active,
            created_at: now,
            updated_at: now,
        };

        self.conn.execute(
            "INSERT INTO records (
                id,
                owner_id,
                description,
                amount_cents,
                category,
                state,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                record.id.to_string(),
                record.owner_id.as_str(),
                record.description.as_str(),
                record.amount_cents,
                record.category.as_str(),
                LifecycleState::Active.as_str(),
                record.created_at,
                record.updated_at,
            ],
        )?;

        Ok(record)
    }

    fn get_record(&self, id: RecordId) -> RepoResult<Option<Record>> {
        load_record(self.conn, id)
    }

    fn list_records(&self, query: &RecordListQuery) -> RepoResult<Vec<Record>> {
        let order_by = match query.state {
            LifecycleState::Active => "updated_at DESC, id ASC",
            LifecycleState::SoftDeleted => "deleted_at DESC, id ASC",
            LifecycleState::PermanentlyDeleted => return Ok(Vec::new()),
        };

        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT_SQL} WHERE owner_id = ?1 AND state = ?2 ORDER BY {order_by};"
        ))?;
        let mut rows = stmt.query(params![query.owner_id.as_str(), query.state.as_str()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }

        Ok(records)
    }

    fn owned_record_ids(&self, owner: &ActorId, ids: &[RecordId]) -> RepoResult<HashSet<RecordId>> {
        let mut owned = HashSet::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let sql = format!(
                "SELECT id FROM records WHERE owner_id = ? AND id IN ({});",
                placeholders(chunk.len())
            );
            let mut bind_values = vec![Value::Text(owner.as_str().to_string())];
            bind_values.extend(chunk.iter().map(|id| Value::Text(id.to_string())));
            collect_ids(self.conn, &sql, bind_values, &mut owned)?;
        }
        Ok(owned)
    }

    fn record_states(&self, ids: &[RecordId]) -> RepoResult<HashMap<RecordId, LifecycleState>> {
        let mut states = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let sql = format!(
                "SELECT id, state FROM records WHERE id IN ({});",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(chunk.iter().map(|id| id.to_string())))?;
            while let Some(row) = rows.next()? {
                let id_text: String = row.get(0)?;
                let state_text: String = row.get(1)?;
                let state = LifecycleState::parse(&state_text).ok_or_else(|| {
                    RepoError::InvalidData(format!("invalid state `{state_text}` in records.state"))
                })?;
                states.insert(parse_record_id(&id_text)?, state);
            }
        }
        Ok(states)
    }

    fn apply_transition(&self, request: &TransitionRequest<'_>) -> RepoResult<AppliedTransition> {
        // Immediate: take the write lock before re-reading state, so a
        // concurrent transition on the same row is observed, not overwritten.
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;

        let Some(mut record) = load_record(&tx, request.record_id)? else {
            return Err(RepoError::NotFound(request.record_id));
        };
        if let Some(owner) = request.expected_owner {
            if record.owner_id != *owner {
                return Err(RepoError::NotFound(request.record_id));
            }
        }

        let plan = plan_transition(&record, request.transition, request.actor, request.now)
            .map_err(|source| RepoError::InvalidState {
                record_id: request.record_id,
                source,
            })?;

        let post_state = match plan.effect {
            TransitionEffect::Update(lifecycle) => {
                write_lifecycle(&tx, request.record_id, &lifecycle, request.now)?;
                record.lifecycle = lifecycle;
                record.updated_at = request.now;
                Some(record)
            }
            TransitionEffect::Remove => {
                delete_row(&tx, request.record_id)?;
                None
            }
        };

        let event = append_event(&tx, plan.event)?;
        tx.commit()?;

        Ok(AppliedTransition {
            event,
            record: post_state,
        })
    }

    fn list_retention_candidates(&self, cutoff: i64, limit: u32) -> RepoResult<Vec<RecordId>> {
        let mut stmt = self.conn.prepare(
            "SELECT id
             FROM records
             WHERE state = 'soft_deleted' AND deleted_at < ?1
             ORDER BY deleted_at ASC, id ASC
             LIMIT ?2;",
        )?;
        let mut rows = stmt.query(params![cutoff, i64::from(limit)])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            ids.push(parse_record_id(&text)?);
        }
        Ok(ids)
    }

    fn count_soft_deleted(&self, since: Option<i64>, before: Option<i64>) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*)
             FROM records
             WHERE state = 'soft_deleted'
               AND (?1 IS NULL OR deleted_at >= ?1)
               AND (?2 IS NULL OR deleted_at < ?2);",
            params![since, before],
            |row| row.get(0),
        )?;
        u64::try_from(count).map_err(|_| RepoError::InvalidData(format!("negative count {count}")))
    }
}

fn load_record(conn: &Connection, id: RecordId) -> RepoResult<Option<Record>> {
    let mut stmt = conn.prepare(&format!("{RECORD_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id.to_string()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_record_row(row)?));
    }
    Ok(None)
}

fn write_lifecycle(conn: &Connection, id: RecordId, lifecycle: &Lifecycle, now: i64) -> RepoResult<()> {
    let changed = conn.execute(
        "UPDATE records
         SET
            state = ?1,
            deleted_at = ?2,
            deleted_by = ?3,
            updated_at = ?4
         WHERE id = ?5;",
        params![
            lifecycle.state().as_str(),
            lifecycle.deleted_at(),
            lifecycle.deleted_by().map(ActorId::as_str),
            now,
            id.to_string(),
        ],
    )?;
    if changed == 0 {
        return Err(RepoError::NotFound(id));
    }
    Ok(())
}

fn delete_row(conn: &Connection, id: RecordId) -> RepoResult<()> {
    let changed = conn.execute("DELETE FROM records WHERE id = ?1;", [id.to_string()])?;
    if changed == 0 {
        return Err(RepoError::NotFound(id));
    }
    Ok(())
}

fn parse_record_row(row: &Row<'_>) -> RepoResult<Record> {
    let id_text: String = row.get("id")?;
    let id = parse_record_id(&id_text)?;

    let state_text: String = row.get("state")?;
    let deleted_at: Option<i64> = row.get("deleted_at")?;
    let deleted_by: Option<String> = row.get("deleted_by")?;
    let lifecycle = match (LifecycleState::parse(&state_text), deleted_at, deleted_by) {
        (Some(LifecycleState::Active), None, None) => Lifecycle::Active,
        (Some(LifecycleState::SoftDeleted), Some(deleted_at), Some(deleted_by)) => {
            Lifecycle::SoftDeleted {
                deleted_at,
                deleted_by: ActorId::from_stored(deleted_by),
            }
        }
        _ => {
            return Err(RepoError::InvalidData(format!(
                "state `{state_text}` disagrees with deletion metadata for record {id}"
            )));
        }
    };

    Ok(Record {
        id,
        owner_id: ActorId::from_stored(row.get("owner_id")?),
        description: row.get("description")?,
        amount_cents: row.get("amount_cents")?,
        category: row.get("category")?,
        lifecycle,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn parse_record_id(value: &str) -> RepoResult<RecordId> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid value `{value}` in records.id")))
}

fn collect_ids(
    conn: &Connection,
    sql: &str,
    bind_values: Vec<Value>,
    out: &mut HashSet<RecordId>,
) -> RepoResult<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    while let Some(row) = rows.next()? {
        let text: String = row.get(0)?;
        out.insert(parse_record_id(&text)?);
    }
    Ok(())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Verifies the connection is migrated to the version this binary expects.
pub(crate) fn ensure_schema_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in ["records", "audit_events"] {
        if !table_exists(conn, table)? {
            return Err(RepoError::MissingRequiredTable(table));
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
