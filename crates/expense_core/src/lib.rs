//! Core record lifecycle engine for expense tracking.
//! This crate is the single source of truth for deletion, restoration,
//! retention and audit invariants.

pub mod clock;
pub mod config;
pub mod db;
pub mod guard;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod rate_limit;
pub mod repo;
pub mod service;

pub use clock::{Clock, ManualClock, SystemClock, DAY_MS};
pub use config::{
    ConfigError, EngineConfig, LoggingConfig, RateLimitPolicy, RateLimitsConfig, RetentionConfig,
};
pub use guard::{partition_by_owner, OwnershipPartition};
pub use lifecycle::{plan_transition, target_state, Transition, TransitionError};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::actor::{ActorId, ActorIdError, RETENTION_SYSTEM_ACTOR};
pub use model::audit::{AuditAction, AuditEvent};
pub use model::record::{
    Lifecycle, LifecycleState, NewExpense, Record, RecordId, RecordValidationError,
};
pub use rate_limit::{FixedWindowRateLimiter, OperationClass, RateDecision};
pub use repo::audit_repo::{AuditRepository, SqliteAuditRepository};
pub use repo::record_repo::{
    AppliedTransition, RecordListQuery, RecordRepository, RepoError, RepoResult,
    SqliteRecordRepository, TransitionRequest,
};
pub use service::lifecycle_service::{
    BulkItemResult, BulkOperation, BulkOutcome, ItemStatus, ItemStatusKind, LifecycleService,
    LifecycleServiceError,
};
pub use service::retention_service::{
    RetentionError, RetentionStats, RetentionSweeper, SweepReport,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
