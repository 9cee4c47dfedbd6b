//! Record lifecycle use-case service.
//!
//! # Responsibility
//! - Expose single and bulk soft delete, restore and permanent delete.
//! - Enforce request bounds, quotas and ownership before any mutation.
//! - Report one explicit status per requested id.
//!
//! # Invariants
//! - `TooManyTargets` and `RateLimited` abort before the store is touched.
//! - Once admitted, a request always yields one status per distinct id; a
//!   storage failure while screening targets marks every id `failed`.
//! - Ownership and per-record failures never abort sibling records.
//! - Each record is transitioned in its own transaction; nothing is rolled
//!   back across records.
//! - The retention system actor cannot drive user-facing operations.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::guard::{dedup_ids, partition_by_owner};
use crate::lifecycle::{Transition, TransitionError};
use crate::model::actor::ActorId;
use crate::model::audit::AuditEvent;
use crate::model::record::{LifecycleState, NewExpense, Record, RecordId, RecordValidationError};
use crate::rate_limit::{FixedWindowRateLimiter, OperationClass, RateDecision};
use crate::repo::audit_repo::AuditRepository;
use crate::repo::record_repo::{RecordListQuery, RecordRepository, RepoError, TransitionRequest};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

/// Bulk operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperation {
    SoftDelete,
    Restore,
    PermanentDelete,
}

impl BulkOperation {
    pub fn transition(self) -> Transition {
        match self {
            Self::SoftDelete => Transition::SoftDelete,
            Self::Restore => Transition::Restore,
            Self::PermanentDelete => Transition::PermanentDelete,
        }
    }

    pub fn operation_class(self) -> OperationClass {
        match self {
            Self::SoftDelete => OperationClass::BulkSoftDelete,
            Self::Restore => OperationClass::BulkRestore,
            Self::PermanentDelete => OperationClass::BulkPermanentDelete,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.operation_class().as_str()
    }
}

/// Per-id status in a bulk response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    /// Missing, purged, or owned by another actor.
    SkippedNotOwned,
    SkippedInvalidState { current: LifecycleState },
    /// Storage error or lock timeout for this id only.
    Failed { reason: String },
}

/// Payload-free discriminant of [`ItemStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatusKind {
    Succeeded,
    SkippedNotOwned,
    SkippedInvalidState,
    Failed,
}

impl ItemStatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::SkippedNotOwned => "skipped_not_owned",
            Self::SkippedInvalidState => "skipped_invalid_state",
            Self::Failed => "failed",
        }
    }
}

impl ItemStatus {
    pub fn kind(&self) -> ItemStatusKind {
        match self {
            Self::Succeeded => ItemStatusKind::Succeeded,
            Self::SkippedNotOwned => ItemStatusKind::SkippedNotOwned,
            Self::SkippedInvalidState { .. } => ItemStatusKind::SkippedInvalidState,
            Self::Failed { .. } => ItemStatusKind::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.kind().as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkItemResult {
    pub record_id: RecordId,
    #[serde(flatten)]
    pub status: ItemStatus,
}

/// Bulk response: one item per distinct requested id, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub operation: BulkOperation,
    pub items: Vec<BulkItemResult>,
}

impl BulkOutcome {
    pub fn status_of(&self, record_id: RecordId) -> Option<&ItemStatus> {
        self.items
            .iter()
            .find(|item| item.record_id == record_id)
            .map(|item| &item.status)
    }

    pub fn succeeded_ids(&self) -> Vec<RecordId> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Succeeded)
            .map(|item| item.record_id)
            .collect()
    }

    pub fn count(&self, kind: ItemStatusKind) -> usize {
        self.items
            .iter()
            .filter(|item| item.status.kind() == kind)
            .count()
    }
}

/// Request-level failures of the lifecycle service.
#[derive(Debug)]
pub enum LifecycleServiceError {
    RateLimited {
        class: OperationClass,
        retry_after_secs: u64,
    },
    TooManyTargets {
        requested: usize,
        max: usize,
    },
    ReservedActor(ActorId),
    /// Not found or not owned by the caller; the two are reported alike.
    NotFound(RecordId),
    InvalidState {
        record_id: RecordId,
        source: TransitionError,
    },
    Validation(RecordValidationError),
    Storage(RepoError),
}

impl Display for LifecycleServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited {
                class,
                retry_after_secs,
            } => write!(
                f,
                "rate limit exceeded for {class}; retry after {retry_after_secs}s"
            ),
            Self::TooManyTargets { requested, max } => {
                write!(f, "too many targets: {requested} requested, at most {max} allowed")
            }
            Self::ReservedActor(actor) => write!(f, "actor `{actor}` cannot perform user operations"),
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::InvalidState { record_id, source } => write!(f, "record {record_id}: {source}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "storage failure: {err}"),
        }
    }
}

impl Error for LifecycleServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidState { source, .. } => Some(source),
            Self::Validation(err) => Some(err),
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for LifecycleServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(id) => Self::NotFound(id),
            RepoError::InvalidState { record_id, source } => Self::InvalidState { record_id, source },
            RepoError::Validation(err) => Self::Validation(err),
            other => Self::Storage(other),
        }
    }
}

/// Lifecycle facade over record and audit repositories.
pub struct LifecycleService<R: RecordRepository, A: AuditRepository> {
    records: R,
    audit: A,
    limiter: Arc<FixedWindowRateLimiter>,
    clock: Arc<dyn Clock>,
    max_bulk_targets: usize,
}

impl<R: RecordRepository, A: AuditRepository> LifecycleService<R, A> {
    /// Creates a service. The limiter is shared across all services of the
    /// process so quotas hold regardless of which connection serves a call.
    pub fn new(
        records: R,
        audit: A,
        limiter: Arc<FixedWindowRateLimiter>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            records,
            audit,
            limiter,
            clock,
            max_bulk_targets: config.max_bulk_targets,
        }
    }

    /// Records a new active expense owned by `actor`.
    pub fn record_expense(
        &self,
        actor: &ActorId,
        input: &NewExpense,
    ) -> Result<Record, LifecycleServiceError> {
        ensure_user_actor(actor)?;
        let record = self.records.create_record(actor, input, self.clock.now_ms())?;
        info!(
            "event=record_create module=service status=ok actor={} record_id={}",
            actor, record.id
        );
        Ok(record)
    }

    /// Owner-scoped lookup that includes soft-deleted records.
    pub fn get_record(
        &self,
        actor: &ActorId,
        record_id: RecordId,
    ) -> Result<Option<Record>, LifecycleServiceError> {
        let record = self.records.get_record(record_id)?;
        Ok(record.filter(|record| record.owner_id == *actor))
    }

    pub fn list_active(&self, actor: &ActorId) -> Result<Vec<Record>, LifecycleServiceError> {
        let query = RecordListQuery::new(actor.clone(), LifecycleState::Active);
        Ok(self.records.list_records(&query)?)
    }

    /// Soft-deleted records of `actor`, most recently deleted first.
    pub fn list_deleted(&self, actor: &ActorId) -> Result<Vec<Record>, LifecycleServiceError> {
        let query = RecordListQuery::new(actor.clone(), LifecycleState::SoftDeleted);
        Ok(self.records.list_records(&query)?)
    }

    /// Full ordered trail, available after permanent deletion too.
    pub fn get_audit_trail(
        &self,
        record_id: RecordId,
    ) -> Result<Vec<AuditEvent>, LifecycleServiceError> {
        Ok(self.audit.list_events_for_record(record_id)?)
    }

    pub fn soft_delete(
        &self,
        actor: &ActorId,
        record_id: RecordId,
    ) -> Result<Record, LifecycleServiceError> {
        self.single(actor, record_id, Transition::SoftDelete)
    }

    pub fn restore(
        &self,
        actor: &ActorId,
        record_id: RecordId,
    ) -> Result<Record, LifecycleServiceError> {
        self.single(actor, record_id, Transition::Restore)
    }

    pub fn bulk_soft_delete(
        &self,
        actor: &ActorId,
        record_ids: &[RecordId],
    ) -> Result<BulkOutcome, LifecycleServiceError> {
        self.bulk(actor, BulkOperation::SoftDelete, record_ids)
    }

    pub fn bulk_restore(
        &self,
        actor: &ActorId,
        record_ids: &[RecordId],
    ) -> Result<BulkOutcome, LifecycleServiceError> {
        self.bulk(actor, BulkOperation::Restore, record_ids)
    }

    /// Purges soft-deleted records. Active targets are skipped, never
    /// escalated through soft delete.
    pub fn bulk_permanent_delete(
        &self,
        actor: &ActorId,
        record_ids: &[RecordId],
    ) -> Result<BulkOutcome, LifecycleServiceError> {
        self.bulk(actor, BulkOperation::PermanentDelete, record_ids)
    }

    fn single(
        &self,
        actor: &ActorId,
        record_id: RecordId,
        transition: Transition,
    ) -> Result<Record, LifecycleServiceError> {
        ensure_user_actor(actor)?;
        self.admit(actor, OperationClass::SingleMutation)?;

        let applied = self.records.apply_transition(&TransitionRequest {
            record_id,
            transition,
            actor,
            expected_owner: Some(actor),
            now: self.clock.now_ms(),
        });

        match applied {
            Ok(applied) => {
                info!(
                    "event=record_transition module=service status=ok action={} actor={} record_id={} seq={}",
                    transition.as_str(),
                    actor,
                    record_id,
                    applied.event.sequence
                );
                applied.record.ok_or_else(|| {
                    LifecycleServiceError::Storage(RepoError::InvalidData(format!(
                        "record {record_id} missing after `{}`",
                        transition.as_str()
                    )))
                })
            }
            Err(err) => {
                warn!(
                    "event=record_transition module=service status=error action={} actor={} record_id={} error={}",
                    transition.as_str(),
                    actor,
                    record_id,
                    err
                );
                Err(err.into())
            }
        }
    }

    fn bulk(
        &self,
        actor: &ActorId,
        operation: BulkOperation,
        record_ids: &[RecordId],
    ) -> Result<BulkOutcome, LifecycleServiceError> {
        let started_at = Instant::now();
        ensure_user_actor(actor)?;

        let targets = dedup_ids(record_ids);
        if targets.len() > self.max_bulk_targets {
            warn!(
                "event=bulk_mutation module=service status=rejected operation={} actor={} requested={} max={}",
                operation.as_str(),
                actor,
                targets.len(),
                self.max_bulk_targets
            );
            return Err(LifecycleServiceError::TooManyTargets {
                requested: targets.len(),
                max: self.max_bulk_targets,
            });
        }

        self.admit(actor, operation.operation_class())?;

        let (mut statuses, pending) = match self.screen_targets(actor, operation, &targets) {
            Ok(screened) => screened,
            Err(err) => {
                error!(
                    "event=bulk_mutation module=service status=error stage=screen operation={} actor={} requested={} error={}",
                    operation.as_str(),
                    actor,
                    targets.len(),
                    err
                );
                let reason = err.to_string();
                let statuses = targets
                    .iter()
                    .map(|id| {
                        (
                            *id,
                            ItemStatus::Failed {
                                reason: reason.clone(),
                            },
                        )
                    })
                    .collect();
                (statuses, Vec::new())
            }
        };

        for record_id in pending {
            let status = self.transition_item(actor, record_id, operation.transition());
            statuses.insert(record_id, status);
        }

        let items = targets
            .into_iter()
            .map(|record_id| BulkItemResult {
                record_id,
                status: statuses
                    .remove(&record_id)
                    .unwrap_or(ItemStatus::SkippedNotOwned),
            })
            .collect();
        let outcome = BulkOutcome { operation, items };

        info!(
            "event=bulk_mutation module=service status=ok operation={} actor={} requested={} succeeded={} skipped_not_owned={} skipped_invalid_state={} failed={} duration_ms={}",
            operation.as_str(),
            actor,
            outcome.items.len(),
            outcome.count(ItemStatusKind::Succeeded),
            outcome.count(ItemStatusKind::SkippedNotOwned),
            outcome.count(ItemStatusKind::SkippedInvalidState),
            outcome.count(ItemStatusKind::Failed),
            started_at.elapsed().as_millis()
        );
        Ok(outcome)
    }

    /// Resolves ownership and, for permanent delete, current state. Returns
    /// the statuses decided up front and the ids still to transition.
    fn screen_targets(
        &self,
        actor: &ActorId,
        operation: BulkOperation,
        targets: &[RecordId],
    ) -> Result<(HashMap<RecordId, ItemStatus>, Vec<RecordId>), RepoError> {
        let partition = partition_by_owner(&self.records, actor, targets)?;
        let mut statuses: HashMap<RecordId, ItemStatus> = partition
            .rejected
            .iter()
            .map(|id| (*id, ItemStatus::SkippedNotOwned))
            .collect();

        let mut pending = partition.authorized;
        if operation == BulkOperation::PermanentDelete {
            let states = self.records.record_states(&pending)?;
            pending.retain(|id| match states.get(id) {
                Some(LifecycleState::SoftDeleted) => true,
                Some(current) => {
                    statuses.insert(*id, ItemStatus::SkippedInvalidState { current: *current });
                    false
                }
                None => {
                    statuses.insert(*id, ItemStatus::SkippedNotOwned);
                    false
                }
            });
        }
        Ok((statuses, pending))
    }

    fn transition_item(&self, actor: &ActorId, record_id: RecordId, transition: Transition) -> ItemStatus {
        let result = self.records.apply_transition(&TransitionRequest {
            record_id,
            transition,
            actor,
            expected_owner: Some(actor),
            now: self.clock.now_ms(),
        });

        match result {
            Ok(_) => ItemStatus::Succeeded,
            Err(RepoError::NotFound(_)) => ItemStatus::SkippedNotOwned,
            Err(RepoError::InvalidState { source, .. }) => ItemStatus::SkippedInvalidState {
                current: source.current,
            },
            Err(err) => {
                warn!(
                    "event=bulk_item module=service status=error action={} actor={} record_id={} busy={} error={}",
                    transition.as_str(),
                    actor,
                    record_id,
                    matches!(&err, RepoError::Db(db) if db.is_busy()),
                    err
                );
                ItemStatus::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn admit(&self, actor: &ActorId, class: OperationClass) -> Result<(), LifecycleServiceError> {
        match self.limiter.check(actor, class) {
            RateDecision::Admitted { .. } => Ok(()),
            RateDecision::Denied { retry_after_secs } => {
                warn!(
                    "event=rate_limit module=service status=denied class={} actor={} retry_after_secs={}",
                    class, actor, retry_after_secs
                );
                Err(LifecycleServiceError::RateLimited {
                    class,
                    retry_after_secs,
                })
            }
        }
    }
}

fn ensure_user_actor(actor: &ActorId) -> Result<(), LifecycleServiceError> {
    if actor.is_system() {
        return Err(LifecycleServiceError::ReservedActor(actor.clone()));
    }
    Ok(())
}
