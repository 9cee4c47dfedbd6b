//! Expense record domain model.
//!
//! # Responsibility
//! - Define the record shape persisted in the `records` table.
//! - Define lifecycle states shared by the state machine and audit trail.
//!
//! # Invariants
//! - `id` and `owner_id` never change after creation.
//! - `deleted_at`/`deleted_by` exist iff the lifecycle is `SoftDeleted`.
//! - `PermanentlyDeleted` is never held by a `Record`; it only appears in
//!   audit events after the row is gone.

use crate::model::actor::ActorId;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier of one expense record.
pub type RecordId = Uuid;

/// Category stored when the caller does not provide one.
pub const DEFAULT_CATEGORY: &str = "uncategorized";
const MAX_CATEGORY_CHARS: usize = 100;

/// Flat lifecycle state, as recorded in audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Initial state; visible in active listings.
    Active,
    /// Tombstoned; restorable until purged.
    SoftDeleted,
    /// Terminal; the row no longer exists.
    PermanentlyDeleted,
}

impl LifecycleState {
    /// Stable storage/log representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::SoftDeleted => "soft_deleted",
            Self::PermanentlyDeleted => "permanently_deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "soft_deleted" => Some(Self::SoftDeleted),
            "permanently_deleted" => Some(Self::PermanentlyDeleted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::PermanentlyDeleted)
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a record that still exists in the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    SoftDeleted {
        /// Unix epoch milliseconds.
        deleted_at: i64,
        deleted_by: ActorId,
    },
}

impl Lifecycle {
    pub fn state(&self) -> LifecycleState {
        match self {
            Self::Active => LifecycleState::Active,
            Self::SoftDeleted { .. } => LifecycleState::SoftDeleted,
        }
    }

    pub fn deleted_at(&self) -> Option<i64> {
        match self {
            Self::Active => None,
            Self::SoftDeleted { deleted_at, .. } => Some(*deleted_at),
        }
    }

    pub fn deleted_by(&self) -> Option<&ActorId> {
        match self {
            Self::Active => None,
            Self::SoftDeleted { deleted_by, .. } => Some(deleted_by),
        }
    }
}

/// Canonical expense record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub owner_id: ActorId,
    pub description: String,
    /// Minor currency units; `None` when the amount is unknown.
    pub amount_cents: Option<i64>,
    pub category: String,
    pub lifecycle: Lifecycle,
    /// Unix epoch milliseconds, set by the repository on insert.
    pub created_at: i64,
    /// Unix epoch milliseconds, touched by every transition.
    pub updated_at: i64,
}

impl Record {
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Active)
    }

    pub fn deleted_at(&self) -> Option<i64> {
        self.lifecycle.deleted_at()
    }

    pub fn deleted_by(&self) -> Option<&ActorId> {
        self.lifecycle.deleted_by()
    }
}

/// Input for recording a new expense.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewExpense {
    pub description: String,
    pub amount_cents: Option<i64>,
    /// Category assigned by the external categorizer, if any.
    pub category: Option<String>,
}

impl NewExpense {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_amount_cents(mut self, amount_cents: i64) -> Self {
        self.amount_cents = Some(amount_cents);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Validates input and returns `(description, amount_cents, category)`
    /// in their stored form.
    pub fn normalized(&self) -> Result<(String, Option<i64>, String), RecordValidationError> {
        let description = self.description.trim();
        if description.is_empty() {
            return Err(RecordValidationError::EmptyDescription);
        }
        if let Some(amount) = self.amount_cents {
            if amount < 0 {
                return Err(RecordValidationError::NegativeAmount(amount));
            }
        }
        let category = normalize_category(self.category.as_deref())?;
        Ok((description.to_string(), self.amount_cents, category))
    }
}

/// Normalizes a category label to trimmed lowercase.
pub fn normalize_category(value: Option<&str>) -> Result<String, RecordValidationError> {
    let trimmed = value.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Ok(DEFAULT_CATEGORY.to_string());
    }
    if trimmed.chars().count() > MAX_CATEGORY_CHARS {
        return Err(RecordValidationError::CategoryTooLong(
            trimmed.chars().count(),
        ));
    }
    Ok(trimmed.to_lowercase())
}

/// Validation errors for expense input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    EmptyDescription,
    NegativeAmount(i64),
    CategoryTooLong(usize),
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDescription => write!(f, "expense description must not be empty"),
            Self::NegativeAmount(value) => {
                write!(f, "expense amount must not be negative, got {value}")
            }
            Self::CategoryTooLong(len) => write!(
                f,
                "expense category exceeds {MAX_CATEGORY_CHARS} chars, got {len}"
            ),
        }
    }
}

impl Error for RecordValidationError {}
