use expense_core::db::open_db;
use expense_core::{
    ActorId, AuditAction, AuditRepository, BulkOutcome, Clock, EngineConfig,
    FixedWindowRateLimiter, ItemStatus, LifecycleService, LifecycleState, ManualClock, NewExpense,
    RecordId, RecordRepository, RetentionSweeper, SqliteAuditRepository, SqliteRecordRepository,
    Transition, TransitionRequest, DAY_MS,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

const NOW: i64 = 1_760_000_000_000;

fn actor(value: &str) -> ActorId {
    ActorId::parse(value).unwrap()
}

fn seed(path: &Path, owner: &ActorId, count: usize, deleted_at: Option<i64>) -> Vec<RecordId> {
    let conn = open_db(path).unwrap();
    let repo = SqliteRecordRepository::try_new(&conn).unwrap();
    (0..count)
        .map(|index| {
            let id = repo
                .create_record(owner, &NewExpense::new(format!("expense {index}")), NOW - 90 * DAY_MS)
                .unwrap()
                .id;
            if let Some(at) = deleted_at {
                repo.apply_transition(&TransitionRequest {
                    record_id: id,
                    transition: Transition::SoftDelete,
                    actor: owner,
                    expected_owner: Some(owner),
                    now: at,
                })
                .unwrap();
            }
            id
        })
        .collect()
}

fn run_bulk(
    path: PathBuf,
    limiter: Arc<FixedWindowRateLimiter>,
    clock: Arc<dyn Clock>,
    actor: ActorId,
    ids: Vec<RecordId>,
    transition: Transition,
) -> BulkOutcome {
    let conn = open_db(&path).unwrap();
    let service = LifecycleService::new(
        SqliteRecordRepository::try_new(&conn).unwrap(),
        SqliteAuditRepository::try_new(&conn).unwrap(),
        limiter,
        clock,
        &EngineConfig::default(),
    );
    match transition {
        Transition::SoftDelete => service.bulk_soft_delete(&actor, &ids).unwrap(),
        Transition::Restore => service.bulk_restore(&actor, &ids).unwrap(),
        Transition::PermanentDelete => service.bulk_permanent_delete(&actor, &ids).unwrap(),
    }
}

#[test]
fn concurrent_bulk_soft_deletes_apply_each_transition_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("expenses.db");
    let alice = actor("alice");
    let ids = seed(&path, &alice, 12, None);

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
    let limiter = Arc::new(FixedWindowRateLimiter::new(
        EngineConfig::default().rate_limits,
        clock.clone(),
    ));
    let barrier = Arc::new(Barrier::new(4));

    let handles = (0..4)
        .map(|_| {
            let path = path.clone();
            let limiter = limiter.clone();
            let clock = clock.clone();
            let alice = alice.clone();
            let ids = ids.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                run_bulk(path, limiter, clock, alice, ids, Transition::SoftDelete)
            })
        })
        .collect::<Vec<_>>();
    let outcomes = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();

    for id in &ids {
        let statuses = outcomes
            .iter()
            .filter_map(|outcome| outcome.status_of(*id))
            .collect::<Vec<_>>();
        assert_eq!(statuses.len(), 4);
        assert_eq!(
            statuses
                .iter()
                .filter(|status| ***status == ItemStatus::Succeeded)
                .count(),
            1,
            "record {id} must be soft-deleted exactly once"
        );
        assert!(statuses.iter().all(|status| matches!(
            status,
            ItemStatus::Succeeded
                | ItemStatus::SkippedInvalidState {
                    current: LifecycleState::SoftDeleted
                }
        )));
    }

    let conn = open_db(&path).unwrap();
    let audit = SqliteAuditRepository::try_new(&conn).unwrap();
    assert_eq!(audit.count_events().unwrap(), ids.len() as u64);
}

#[test]
fn restore_racing_the_sweeper_has_a_single_winner_per_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("expenses.db");
    let alice = actor("alice");
    let ids = seed(&path, &alice, 20, Some(NOW - 40 * DAY_MS));

    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW));
    let limiter = Arc::new(FixedWindowRateLimiter::new(
        EngineConfig::default().rate_limits,
        clock.clone(),
    ));
    let barrier = Arc::new(Barrier::new(2));

    let restorer = {
        let path = path.clone();
        let clock = clock.clone();
        let alice = alice.clone();
        let ids = ids.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            run_bulk(path, limiter, clock, alice, ids, Transition::Restore)
        })
    };
    let sweeper = {
        let path = path.clone();
        let clock = clock.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            let conn = open_db(&path).unwrap();
            let sweeper = RetentionSweeper::new(
                SqliteRecordRepository::try_new(&conn).unwrap(),
                clock,
                EngineConfig::default().retention,
            );
            barrier.wait();
            sweeper.run_retention_sweep().unwrap()
        })
    };
    let outcome = restorer.join().unwrap();
    let report = sweeper.join().unwrap();

    assert!(!report.interrupted);
    let restored = outcome.succeeded_ids();
    assert_eq!(restored.len() as u64 + report.purged, ids.len() as u64);

    let conn = open_db(&path).unwrap();
    let records = SqliteRecordRepository::try_new(&conn).unwrap();
    let audit = SqliteAuditRepository::try_new(&conn).unwrap();
    for id in &ids {
        let trail = audit.list_events_for_record(*id).unwrap();
        assert_eq!(trail.len(), 2, "record {id} must have exactly one winner");
        match records.get_record(*id).unwrap() {
            Some(record) => {
                assert!(record.is_active());
                assert!(restored.contains(id));
                assert_eq!(trail[1].action, AuditAction::Restore);
            }
            None => {
                assert!(!restored.contains(id));
                assert_eq!(trail[1].action, AuditAction::PermanentDelete);
                assert!(trail[1].actor_id.is_system());
            }
        }
    }
}
