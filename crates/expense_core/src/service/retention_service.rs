//! Retention sweep over soft-deleted records.
//!
//! # Responsibility
//! - Permanently delete records soft-deleted longer than the retention window.
//! - Report purge statistics for operators.
//!
//! # Invariants
//! - Eligibility is recomputed from `deleted_at` on every cycle; the sweep
//!   keeps no progress state, so repeating or resuming it is safe.
//! - Purges use the same `permanent_delete` transition as user requests and
//!   are audited under the retention system actor.
//! - One cycle purges at most `max_records_per_sweep` records.
//! - A storage failure stops the cycle; purges already committed stay.

use crate::clock::{Clock, DAY_MS};
use crate::config::RetentionConfig;
use crate::lifecycle::Transition;
use crate::model::actor::ActorId;
use crate::repo::record_repo::{RecordRepository, RepoError, TransitionRequest};
use log::{error, info};
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

/// Result of one sweep cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records with `deleted_at` before this instant were eligible.
    pub cutoff: i64,
    pub purged: u64,
    /// Restored or purged concurrently after being selected.
    pub skipped: u64,
    pub failed: u64,
    pub batches: u32,
    /// Eligible records remain because the per-cycle cap was hit.
    pub limit_reached: bool,
    /// The cycle stopped early on a storage failure.
    pub interrupted: bool,
}

/// Soft-delete age statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionStats {
    pub total_deleted: u64,
    pub deleted_last_7_days: u64,
    pub deleted_last_30_days: u64,
    pub eligible_for_purge: u64,
}

#[derive(Debug)]
pub enum RetentionError {
    Storage(RepoError),
}

impl Display for RetentionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(err) => write!(f, "retention sweep storage failure: {err}"),
        }
    }
}

impl Error for RetentionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
        }
    }
}

impl From<RepoError> for RetentionError {
    fn from(value: RepoError) -> Self {
        Self::Storage(value)
    }
}

/// Retention sweeper bound to one repository connection.
pub struct RetentionSweeper<R: RecordRepository> {
    records: R,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
    system_actor: ActorId,
}

impl<R: RecordRepository> RetentionSweeper<R> {
    pub fn new(records: R, clock: Arc<dyn Clock>, config: RetentionConfig) -> Self {
        Self {
            records,
            clock,
            config,
            system_actor: ActorId::retention_system(),
        }
    }

    /// Runs one sweep cycle at the clock's current time.
    pub fn run_retention_sweep(&self) -> Result<SweepReport, RetentionError> {
        self.run_sweep_at(self.clock.now_ms())
    }

    /// Runs one sweep cycle as of `now`.
    pub fn run_sweep_at(&self, now: i64) -> Result<SweepReport, RetentionError> {
        let started_at = Instant::now();
        let cutoff = self.cutoff(now);
        let mut report = SweepReport {
            cutoff,
            ..SweepReport::default()
        };
        info!(
            "event=retention_sweep module=retention status=start cutoff={} retention_days={}",
            cutoff, self.config.retention_days
        );

        let mut budget = self.config.max_records_per_sweep;
        while budget > 0 {
            let limit = self.config.batch_size.min(budget);
            let batch = match self.records.list_retention_candidates(cutoff, limit) {
                Ok(batch) => batch,
                Err(err) => {
                    error!(
                        "event=retention_sweep module=retention status=error stage=select purged={} error={}",
                        report.purged, err
                    );
                    return Err(err.into());
                }
            };
            if batch.is_empty() {
                break;
            }
            report.batches += 1;
            let full_batch = batch.len() == limit as usize;

            for record_id in batch {
                budget -= 1;
                let result = self.records.apply_transition(&TransitionRequest {
                    record_id,
                    transition: Transition::PermanentDelete,
                    actor: &self.system_actor,
                    expected_owner: None,
                    now,
                });
                match result {
                    Ok(_) => report.purged += 1,
                    Err(RepoError::NotFound(_) | RepoError::InvalidState { .. }) => {
                        report.skipped += 1;
                    }
                    Err(err) => {
                        report.failed += 1;
                        report.interrupted = true;
                        error!(
                            "event=retention_sweep module=retention status=interrupted record_id={} purged={} error={}",
                            record_id, report.purged, err
                        );
                        return Ok(report);
                    }
                }
            }

            if !full_batch {
                break;
            }
        }

        if budget == 0 {
            report.limit_reached = !self
                .records
                .list_retention_candidates(cutoff, 1)?
                .is_empty();
        }

        info!(
            "event=retention_sweep module=retention status=ok purged={} skipped={} batches={} limit_reached={} duration_ms={}",
            report.purged,
            report.skipped,
            report.batches,
            report.limit_reached,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    /// Soft-delete age statistics as of `now`.
    pub fn retention_stats(&self, now: i64) -> Result<RetentionStats, RetentionError> {
        Ok(RetentionStats {
            total_deleted: self.records.count_soft_deleted(None, None)?,
            deleted_last_7_days: self.records.count_soft_deleted(Some(now - 7 * DAY_MS), None)?,
            deleted_last_30_days: self
                .records
                .count_soft_deleted(Some(now - 30 * DAY_MS), None)?,
            eligible_for_purge: self.records.count_soft_deleted(None, Some(self.cutoff(now)))?,
        })
    }

    fn cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(i64::from(self.config.retention_days) * DAY_MS)
    }
}
