//! Ownership guard for record-scoped requests.
//!
//! # Responsibility
//! - Split requested ids into those the actor may act on and the rest.
//!
//! # Invariants
//! - Missing and foreign-owned ids land in the same `rejected` bucket; callers
//!   cannot tell them apart.
//! - Never fails for missing records; only storage errors surface.
//! - Output preserves first-occurrence request order and drops duplicates.

use crate::model::actor::ActorId;
use crate::model::record::RecordId;
use crate::repo::record_repo::{RecordRepository, RepoResult};
use std::collections::HashSet;

/// Partition of requested ids by ownership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipPartition {
    pub authorized: Vec<RecordId>,
    /// Not found or not owned.
    pub rejected: Vec<RecordId>,
}

/// Returns `ids` without duplicates, keeping first occurrences in order.
pub fn dedup_ids(ids: &[RecordId]) -> Vec<RecordId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Partitions `ids` into owned and rejected subsets for `actor`.
pub fn partition_by_owner<R: RecordRepository + ?Sized>(
    repo: &R,
    actor: &ActorId,
    ids: &[RecordId],
) -> RepoResult<OwnershipPartition> {
    let unique = dedup_ids(ids);
    let owned = repo.owned_record_ids(actor, &unique)?;

    let (authorized, rejected) = unique.into_iter().partition(|id| owned.contains(id));
    Ok(OwnershipPartition {
        authorized,
        rejected,
    })
}
