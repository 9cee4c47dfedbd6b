//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Lifecycle writes and their audit events share one transaction.
//! - Repository APIs return semantic errors (`NotFound`, `InvalidState`) in
//!   addition to DB transport errors.

pub mod audit_repo;
pub mod record_repo;
