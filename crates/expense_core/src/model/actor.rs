//! Actor identity value type.
//!
//! # Responsibility
//! - Carry the authenticated caller identity by value through every layer.
//! - Reserve one identity for background retention work.
//!
//! # Invariants
//! - Actor ids are 1..=128 chars from `[A-Za-z0-9_.:@-]`.
//! - `system:retention` can only be obtained through `ActorId::retention_system()`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Actor recorded on audit events produced by the retention sweeper.
pub const RETENTION_SYSTEM_ACTOR: &str = "system:retention";

static ACTOR_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.:@-]{1,128}$").expect("valid actor id regex"));

/// Validated identifier of the actor performing an operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

/// Errors from actor id parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorIdError {
    Empty,
    Malformed(String),
    Reserved(String),
}

impl Display for ActorIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "actor id must not be empty"),
            Self::Malformed(value) => write!(f, "actor id is malformed: `{value}`"),
            Self::Reserved(value) => write!(f, "actor id is reserved: `{value}`"),
        }
    }
}

impl Error for ActorIdError {}

impl ActorId {
    /// Parses a caller-supplied actor id.
    ///
    /// Rejects the reserved retention identity so user traffic can never
    /// impersonate the sweeper in the audit trail.
    pub fn parse(value: &str) -> Result<Self, ActorIdError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ActorIdError::Empty);
        }
        if !ACTOR_ID_RE.is_match(trimmed) {
            return Err(ActorIdError::Malformed(trimmed.to_string()));
        }
        if trimmed == RETENTION_SYSTEM_ACTOR {
            return Err(ActorIdError::Reserved(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Identity used by the retention sweeper.
    pub fn retention_system() -> Self {
        Self(RETENTION_SYSTEM_ACTOR.to_string())
    }

    /// Rebuilds an id read back from storage without re-validation.
    pub(crate) fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_system(&self) -> bool {
        self.0 == RETENTION_SYSTEM_ACTOR
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
