use expense_core::db::{open_db, open_db_in_memory, open_db_with_timeout};
use expense_core::{
    ActorId, AppliedTransition, AuditRepository, BulkOperation, Clock, EngineConfig,
    FixedWindowRateLimiter, ItemStatus, ItemStatusKind, LifecycleService, LifecycleServiceError,
    LifecycleState, ManualClock, NewExpense, OperationClass, RateLimitPolicy, Record, RecordId,
    RecordListQuery, RecordRepository, RepoError, RepoResult, SqliteAuditRepository,
    SqliteRecordRepository, Transition, TransitionRequest,
};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

const NOW: i64 = 1_760_000_000_000;

type Service<'conn> = LifecycleService<SqliteRecordRepository<'conn>, SqliteAuditRepository<'conn>>;

fn service_with_config<'conn>(
    conn: &'conn Connection,
    clock: &Arc<ManualClock>,
    config: &EngineConfig,
) -> Service<'conn> {
    let shared_clock: Arc<dyn Clock> = clock.clone();
    let limiter = Arc::new(FixedWindowRateLimiter::new(
        config.rate_limits,
        shared_clock.clone(),
    ));
    LifecycleService::new(
        SqliteRecordRepository::try_new(conn).unwrap(),
        SqliteAuditRepository::try_new(conn).unwrap(),
        limiter,
        shared_clock,
        config,
    )
}

fn service<'conn>(conn: &'conn Connection, clock: &Arc<ManualClock>) -> Service<'conn> {
    let mut config = EngineConfig::default();
    config.rate_limits.single = RateLimitPolicy::new(1_000, 60);
    service_with_config(conn, clock, &config)
}

fn actor(value: &str) -> ActorId {
    ActorId::parse(value).unwrap()
}

fn create(service: &Service<'_>, owner: &ActorId, description: &str) -> RecordId {
    service
        .record_expense(owner, &NewExpense::new(description))
        .unwrap()
        .id
}

fn event_count(conn: &Connection) -> u64 {
    SqliteAuditRepository::try_new(conn)
        .unwrap()
        .count_events()
        .unwrap()
}

fn state_of(service: &Service<'_>, owner: &ActorId, id: RecordId) -> Option<LifecycleState> {
    service
        .get_record(owner, id)
        .unwrap()
        .map(|record| record.state())
}

#[test]
fn bulk_soft_delete_reports_each_target_and_audits_only_successes() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let service = service(&conn, &clock);
    let alice = actor("alice");
    let bob = actor("bob");

    let r1 = create(&service, &alice, "groceries");
    let r2 = create(&service, &alice, "fuel");
    let r3 = create(&service, &bob, "cinema");
    service.soft_delete(&alice, r2).unwrap();
    let events_before = event_count(&conn);

    let outcome = service.bulk_soft_delete(&alice, &[r1, r2, r3]).unwrap();

    assert_eq!(outcome.operation, BulkOperation::SoftDelete);
    assert_eq!(outcome.status_of(r1), Some(&ItemStatus::Succeeded));
    assert_eq!(
        outcome.status_of(r2),
        Some(&ItemStatus::SkippedInvalidState {
            current: LifecycleState::SoftDeleted
        })
    );
    assert_eq!(outcome.status_of(r3), Some(&ItemStatus::SkippedNotOwned));
    assert_eq!(
        outcome
            .items
            .iter()
            .map(|item| item.record_id)
            .collect::<Vec<_>>(),
        vec![r1, r2, r3]
    );

    assert_eq!(event_count(&conn), events_before + 1);
    assert_eq!(service.get_audit_trail(r1).unwrap().len(), 1);
    assert_eq!(state_of(&service, &bob, r3), Some(LifecycleState::Active));
}

#[test]
fn foreign_and_missing_ids_are_reported_identically() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let service = service(&conn, &clock);
    let alice = actor("alice");
    let bob = actor("bob");

    let alice_records = (0..3)
        .map(|index| create(&service, &alice, &format!("alice expense {index}")))
        .collect::<Vec<_>>();
    let missing = Uuid::new_v4();
    let mut requested = alice_records.clone();
    requested.push(missing);

    let outcome = service.bulk_soft_delete(&bob, &requested).unwrap();

    assert!(outcome
        .items
        .iter()
        .all(|item| item.status == ItemStatus::SkippedNotOwned));
    assert_eq!(outcome.items.len(), 4);
    for id in alice_records {
        assert_eq!(state_of(&service, &alice, id), Some(LifecycleState::Active));
        assert!(service.get_audit_trail(id).unwrap().is_empty());
    }
    assert_eq!(event_count(&conn), 0);
}

#[test]
fn sixth_bulk_request_in_window_is_rate_limited_without_mutation() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let service = service(&conn, &clock);
    let alice = actor("alice");

    for index in 0..5 {
        let id = create(&service, &alice, &format!("expense {index}"));
        let outcome = service.bulk_soft_delete(&alice, &[id]).unwrap();
        assert_eq!(outcome.succeeded_ids(), vec![id]);
        clock.advance_secs(5);
    }

    let sixth = create(&service, &alice, "expense 6");
    let events_before = event_count(&conn);
    let err = service.bulk_soft_delete(&alice, &[sixth]).unwrap_err();

    match err {
        LifecycleServiceError::RateLimited {
            class,
            retry_after_secs,
        } => {
            assert_eq!(class, OperationClass::BulkSoftDelete);
            assert_eq!(retry_after_secs, 35);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(state_of(&service, &alice, sixth), Some(LifecycleState::Active));
    assert_eq!(event_count(&conn), events_before);

    // Separate class, separate quota.
    assert!(service.bulk_restore(&alice, &[sixth]).is_ok());

    clock.advance_secs(35);
    let outcome = service.bulk_soft_delete(&alice, &[sixth]).unwrap();
    assert_eq!(outcome.succeeded_ids(), vec![sixth]);
}

#[test]
fn oversized_request_fails_before_quota_or_store() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let mut config = EngineConfig::default();
    config.max_bulk_targets = 2;
    config.rate_limits.bulk = RateLimitPolicy::new(1, 60);
    let service = service_with_config(&conn, &clock, &config);
    let alice = actor("alice");

    let ids = (0..3)
        .map(|index| create(&service, &alice, &format!("expense {index}")))
        .collect::<Vec<_>>();

    let err = service.bulk_soft_delete(&alice, &ids).unwrap_err();
    assert!(matches!(
        err,
        LifecycleServiceError::TooManyTargets {
            requested: 3,
            max: 2
        }
    ));
    assert_eq!(event_count(&conn), 0);

    // Duplicates collapse before the bound is checked, and the rejected
    // request did not consume the single allowed bulk call.
    let outcome = service
        .bulk_soft_delete(&alice, &[ids[0], ids[1], ids[0]])
        .unwrap();
    assert_eq!(outcome.items.len(), 2);
    assert_eq!(outcome.succeeded_ids(), vec![ids[0], ids[1]]);
}

#[test]
fn bulk_permanent_delete_never_escalates_active_records() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let service = service(&conn, &clock);
    let alice = actor("alice");

    let active = create(&service, &alice, "still needed");
    let deleted = create(&service, &alice, "mistake");
    service.soft_delete(&alice, deleted).unwrap();

    let outcome = service
        .bulk_permanent_delete(&alice, &[active, deleted])
        .unwrap();

    assert_eq!(
        outcome.status_of(active),
        Some(&ItemStatus::SkippedInvalidState {
            current: LifecycleState::Active
        })
    );
    assert_eq!(outcome.status_of(deleted), Some(&ItemStatus::Succeeded));
    assert_eq!(state_of(&service, &alice, active), Some(LifecycleState::Active));
    assert_eq!(state_of(&service, &alice, deleted), None);
    assert!(service.get_audit_trail(active).unwrap().is_empty());
}

#[test]
fn bulk_restore_recovers_only_soft_deleted_records() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let service = service(&conn, &clock);
    let alice = actor("alice");

    let a = create(&service, &alice, "a");
    let b = create(&service, &alice, "b");
    let c = create(&service, &alice, "c");
    service.bulk_soft_delete(&alice, &[a, b]).unwrap();

    let outcome = service.bulk_restore(&alice, &[a, b, c]).unwrap();
    assert_eq!(outcome.succeeded_ids(), vec![a, b]);
    assert_eq!(outcome.count(ItemStatusKind::SkippedInvalidState), 1);

    assert_eq!(service.list_active(&alice).unwrap().len(), 3);
    assert!(service.list_deleted(&alice).unwrap().is_empty());
}

#[test]
fn empty_bulk_request_returns_empty_outcome() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let service = service(&conn, &clock);

    let outcome = service.bulk_soft_delete(&actor("alice"), &[]).unwrap();
    assert!(outcome.items.is_empty());
}

#[test]
fn outcome_serializes_with_explicit_status_per_id() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let service = service(&conn, &clock);
    let alice = actor("alice");
    let id = create(&service, &alice, "lunch");
    let missing = Uuid::new_v4();

    let outcome = service.bulk_soft_delete(&alice, &[id, missing]).unwrap();
    let json = serde_json::to_value(&outcome).unwrap();

    assert_eq!(json["operation"], "soft_delete");
    assert_eq!(json["items"][0]["record_id"], id.to_string());
    assert_eq!(json["items"][0]["status"], "succeeded");
    assert_eq!(json["items"][1]["status"], "skipped_not_owned");
}

/// Record repository that runs `after_ownership` once the ownership lookup
/// has returned, to interleave other work with a bulk request.
struct InterleavedRepository<'conn> {
    inner: SqliteRecordRepository<'conn>,
    after_ownership: Box<dyn Fn(&SqliteRecordRepository<'conn>) -> RepoResult<()> + 'conn>,
}

impl RecordRepository for InterleavedRepository<'_> {
    fn create_record(&self, owner: &ActorId, input: &NewExpense, now: i64) -> RepoResult<Record> {
        self.inner.create_record(owner, input, now)
    }

    fn get_record(&self, id: RecordId) -> RepoResult<Option<Record>> {
        self.inner.get_record(id)
    }

    fn list_records(&self, query: &RecordListQuery) -> RepoResult<Vec<Record>> {
        self.inner.list_records(query)
    }

    fn owned_record_ids(&self, owner: &ActorId, ids: &[RecordId]) -> RepoResult<HashSet<RecordId>> {
        let owned = self.inner.owned_record_ids(owner, ids)?;
        (self.after_ownership)(&self.inner)?;
        Ok(owned)
    }

    fn record_states(&self, ids: &[RecordId]) -> RepoResult<HashMap<RecordId, LifecycleState>> {
        self.inner.record_states(ids)
    }

    fn apply_transition(&self, request: &TransitionRequest<'_>) -> RepoResult<AppliedTransition> {
        self.inner.apply_transition(request)
    }

    fn list_retention_candidates(&self, cutoff: i64, limit: u32) -> RepoResult<Vec<RecordId>> {
        self.inner.list_retention_candidates(cutoff, limit)
    }

    fn count_soft_deleted(&self, since: Option<i64>, before: Option<i64>) -> RepoResult<u64> {
        self.inner.count_soft_deleted(since, before)
    }
}

fn interleaved_service<'conn>(
    conn: &'conn Connection,
    clock: &Arc<ManualClock>,
    after_ownership: impl Fn(&SqliteRecordRepository<'conn>) -> RepoResult<()> + 'conn,
) -> LifecycleService<InterleavedRepository<'conn>, SqliteAuditRepository<'conn>> {
    let config = EngineConfig::default();
    let shared_clock: Arc<dyn Clock> = clock.clone();
    let limiter = Arc::new(FixedWindowRateLimiter::new(
        config.rate_limits,
        shared_clock.clone(),
    ));
    LifecycleService::new(
        InterleavedRepository {
            inner: SqliteRecordRepository::try_new(conn).unwrap(),
            after_ownership: Box::new(after_ownership),
        },
        SqliteAuditRepository::try_new(conn).unwrap(),
        limiter,
        shared_clock,
        &config,
    )
}

#[test]
fn permanent_delete_reports_record_purged_mid_request_as_not_found() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let alice = actor("alice");
    let plain = service(&conn, &clock);
    let id = create(&plain, &alice, "purged underneath");
    plain.soft_delete(&alice, id).unwrap();

    let system = ActorId::retention_system();
    let service = interleaved_service(&conn, &clock, move |repo| {
        repo.apply_transition(&TransitionRequest {
            record_id: id,
            transition: Transition::PermanentDelete,
            actor: &system,
            expected_owner: None,
            now: NOW,
        })
        .map(|_| ())
    });

    let outcome = service.bulk_permanent_delete(&alice, &[id]).unwrap();

    assert_eq!(outcome.status_of(id), Some(&ItemStatus::SkippedNotOwned));
    let trail = plain.get_audit_trail(id).unwrap();
    assert_eq!(trail.len(), 2);
    assert!(trail[1].actor_id.is_system());
}

#[test]
fn screening_failure_marks_every_target_failed() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(NOW));
    let alice = actor("alice");
    let plain = service(&conn, &clock);
    let ids = (0..3)
        .map(|index| create(&plain, &alice, &format!("expense {index}")))
        .collect::<Vec<_>>();

    let service = interleaved_service(&conn, &clock, |_| {
        Err(RepoError::InvalidData("ownership lookup failed".to_string()))
    });
    let outcome = service.bulk_soft_delete(&alice, &ids).unwrap();

    assert_eq!(outcome.items.len(), 3);
    assert_eq!(outcome.count(ItemStatusKind::Failed), 3);
    assert!(outcome.items.iter().all(|item| matches!(
        &item.status,
        ItemStatus::Failed { reason } if reason.contains("ownership lookup failed")
    )));
    assert_eq!(event_count(&conn), 0);
    for id in ids {
        assert_eq!(state_of(&plain, &alice, id), Some(LifecycleState::Active));
    }
}

#[test]
fn lock_timeout_fails_each_item_without_failing_the_request() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("expenses.db");
    let clock = Arc::new(ManualClock::new(NOW));
    let alice = actor("alice");

    let conn = open_db_with_timeout(&path, Duration::from_millis(50)).unwrap();
    let service = service(&conn, &clock);
    let ids = (0..3)
        .map(|index| create(&service, &alice, &format!("expense {index}")))
        .collect::<Vec<_>>();

    let blocker = open_db(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let outcome = service.bulk_soft_delete(&alice, &ids).unwrap();
    assert_eq!(outcome.items.len(), 3);
    assert!(outcome
        .items
        .iter()
        .all(|item| item.status.kind() == ItemStatusKind::Failed));

    blocker.execute_batch("ROLLBACK;").unwrap();
    assert_eq!(event_count(&conn), 0);

    let retry = service.bulk_soft_delete(&alice, &ids).unwrap();
    assert_eq!(retry.succeeded_ids(), ids);
}
