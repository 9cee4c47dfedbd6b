//! Record lifecycle state machine.
//!
//! # Responsibility
//! - Own the exhaustive transition table over `LifecycleState`.
//! - Describe each accepted transition as a storage effect plus the audit
//!   event that must be committed with it.
//!
//! # Invariants
//! - `Active -> SoftDeleted -> PermanentlyDeleted` is the only path to
//!   permanent deletion.
//! - `PermanentlyDeleted` accepts no transition.
//! - Planning is pure; callers execute the effect and the audit append in
//!   one transaction.

use crate::model::actor::ActorId;
use crate::model::audit::{AuditAction, AuditEvent};
use crate::model::record::{Lifecycle, LifecycleState, Record};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Lifecycle transition requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    SoftDelete,
    Restore,
    PermanentDelete,
}

impl Transition {
    pub fn action(self) -> AuditAction {
        match self {
            Self::SoftDelete => AuditAction::SoftDelete,
            Self::Restore => AuditAction::Restore,
            Self::PermanentDelete => AuditAction::PermanentDelete,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.action().as_str()
    }
}

/// Transition not permitted from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub transition: Transition,
    pub current: LifecycleState,
}

impl Display for TransitionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid state: `{}` is not permitted from `{}`",
            self.transition.as_str(),
            self.current
        )
    }
}

impl Error for TransitionError {}

/// Returns the state reached by applying `transition` to `current`.
pub fn target_state(
    current: LifecycleState,
    transition: Transition,
) -> Result<LifecycleState, TransitionError> {
    use LifecycleState::{Active, PermanentlyDeleted, SoftDeleted};

    match (current, transition) {
        (Active, Transition::SoftDelete) => Ok(SoftDeleted),
        (SoftDeleted, Transition::Restore) => Ok(Active),
        (SoftDeleted, Transition::PermanentDelete) => Ok(PermanentlyDeleted),
        (Active, Transition::Restore | Transition::PermanentDelete)
        | (SoftDeleted, Transition::SoftDelete)
        | (PermanentlyDeleted, _) => Err(TransitionError {
            transition,
            current,
        }),
    }
}

/// Storage effect of an accepted transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEffect {
    /// Persist the new lifecycle on the existing row.
    Update(Lifecycle),
    /// Physically remove the row.
    Remove,
}

/// Accepted transition ready to be committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTransition {
    pub effect: TransitionEffect,
    pub event: AuditEvent,
}

/// Validates `transition` against `record` and plans its side effects.
pub fn plan_transition(
    record: &Record,
    transition: Transition,
    actor: &ActorId,
    now: i64,
) -> Result<PlannedTransition, TransitionError> {
    let previous = record.state();
    let next = target_state(previous, transition)?;

    let effect = match next {
        LifecycleState::Active => TransitionEffect::Update(Lifecycle::Active),
        LifecycleState::SoftDeleted => TransitionEffect::Update(Lifecycle::SoftDeleted {
            deleted_at: now,
            deleted_by: actor.clone(),
        }),
        LifecycleState::PermanentlyDeleted => TransitionEffect::Remove,
    };

    Ok(PlannedTransition {
        effect,
        event: AuditEvent::new(
            record.id,
            actor.clone(),
            transition.action(),
            previous,
            next,
            now,
        ),
    })
}
