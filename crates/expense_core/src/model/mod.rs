//! Domain model for expense records under lifecycle control.
//!
//! # Responsibility
//! - Define canonical data structures shared by repositories and services.
//! - Encode the record lifecycle as a tagged enum instead of boolean flags.
//!
//! # Invariants
//! - Every record is identified by a stable `RecordId`.
//! - Deletion metadata exists only on soft-deleted records.
//! - Audit events are values; nothing in the model mutates them.

pub mod actor;
pub mod audit;
pub mod record;
