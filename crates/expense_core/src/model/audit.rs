//! Audit event model.
//!
//! # Invariants
//! - One event describes exactly one committed lifecycle transition.
//! - Events are never updated or deleted once persisted.

use crate::model::actor::ActorId;
use crate::model::record::{LifecycleState, RecordId};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Lifecycle action recorded by an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SoftDelete,
    Restore,
    PermanentDelete,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SoftDelete => "soft_delete",
            Self::Restore => "restore",
            Self::PermanentDelete => "permanent_delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "soft_delete" => Some(Self::SoftDelete),
            "restore" => Some(Self::Restore),
            "permanent_delete" => Some(Self::PermanentDelete),
            _ => None,
        }
    }
}

impl Display for AuditAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Storage sequence number; `0` until the event is appended.
    pub sequence: i64,
    pub event_id: Uuid,
    pub record_id: RecordId,
    pub actor_id: ActorId,
    pub action: AuditAction,
    pub previous_state: LifecycleState,
    pub new_state: LifecycleState,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl AuditEvent {
    /// Builds an unsequenced event with a fresh event id.
    pub fn new(
        record_id: RecordId,
        actor_id: ActorId,
        action: AuditAction,
        previous_state: LifecycleState,
        new_state: LifecycleState,
        timestamp: i64,
    ) -> Self {
        Self {
            sequence: 0,
            event_id: Uuid::new_v4(),
            record_id,
            actor_id,
            action,
            previous_state,
            new_state,
            timestamp,
        }
    }
}
