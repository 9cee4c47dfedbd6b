//! Fixed-window rate limiter for mutation requests.
//!
//! # Responsibility
//! - Bound mutation requests per `(actor, operation class)`.
//!
//! # Invariants
//! - Check-then-increment happens under a single lock acquisition.
//! - A denied check leaves the bucket unchanged.
//! - Buckets are process-local and may be lost on restart.

use crate::clock::Clock;
use crate::config::{RateLimitPolicy, RateLimitsConfig};
use crate::model::actor::ActorId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

// Above this many buckets, expired ones are dropped on the next check.
const PRUNE_THRESHOLD: usize = 4_096;

/// Quota class of a mutation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    /// Single-record soft delete or restore.
    SingleMutation,
    BulkSoftDelete,
    BulkRestore,
    BulkPermanentDelete,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleMutation => "single_mutation",
            Self::BulkSoftDelete => "bulk_soft_delete",
            Self::BulkRestore => "bulk_restore",
            Self::BulkPermanentDelete => "bulk_permanent_delete",
        }
    }

    pub fn is_bulk(self) -> bool {
        !matches!(self, Self::SingleMutation)
    }
}

impl Display for OperationClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admitted {
        /// Requests still available in the current window.
        remaining: u32,
    },
    Denied {
        /// Whole seconds until the current window ends, at least 1.
        retry_after_secs: u64,
    },
}

impl RateDecision {
    pub fn is_admitted(self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start_ms: i64,
    count: u32,
}

/// Process-wide fixed-window counters, shared behind an `Arc`.
pub struct FixedWindowRateLimiter {
    limits: RateLimitsConfig,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<(ActorId, OperationClass), Bucket>>,
}

impl FixedWindowRateLimiter {
    pub fn new(limits: RateLimitsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy_for(&self, class: OperationClass) -> RateLimitPolicy {
        if class.is_bulk() {
            self.limits.bulk
        } else {
            self.limits.single
        }
    }

    /// Admits and charges one request, or denies without charging.
    pub fn check(&self, actor: &ActorId, class: OperationClass) -> RateDecision {
        let policy = self.policy_for(class);
        let window_ms = window_ms(policy);
        let now = self.clock.now_ms();

        let mut buckets = self.buckets.lock();
        if buckets.len() > PRUNE_THRESHOLD {
            buckets.retain(|_, bucket| now.saturating_sub(bucket.window_start_ms) < window_ms);
        }

        let bucket = buckets
            .entry((actor.clone(), class))
            .or_insert(Bucket {
                window_start_ms: now,
                count: 0,
            });
        if now.saturating_sub(bucket.window_start_ms) >= window_ms {
            *bucket = Bucket {
                window_start_ms: now,
                count: 0,
            };
        }

        if bucket.count >= policy.max_requests {
            let window_end = bucket.window_start_ms.saturating_add(window_ms);
            let remaining_ms = window_end.saturating_sub(now).max(1);
            let retry_after_secs = u64::try_from((remaining_ms + 999) / 1000).unwrap_or(1);
            return RateDecision::Denied { retry_after_secs };
        }

        bucket.count += 1;
        RateDecision::Admitted {
            remaining: policy.max_requests - bucket.count,
        }
    }

    /// Number of live buckets, including expired ones not yet pruned.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Drops all counters.
    pub fn reset(&self) {
        self.buckets.lock().clear();
    }
}

fn window_ms(policy: RateLimitPolicy) -> i64 {
    i64::try_from(policy.window_seconds)
        .unwrap_or(i64::MAX / 1000)
        .saturating_mul(1000)
}

#[cfg(test)]
mod tests {
    use super::{FixedWindowRateLimiter, OperationClass, RateDecision};
    use crate::clock::{Clock, ManualClock};
    use crate::config::{RateLimitPolicy, RateLimitsConfig};
    use crate::model::actor::ActorId;
    use std::sync::Arc;
    use std::thread;

    fn limiter(bulk: RateLimitPolicy) -> (Arc<ManualClock>, FixedWindowRateLimiter) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let limits = RateLimitsConfig {
            bulk,
            single: RateLimitPolicy::new(10, 60),
        };
        let shared: Arc<dyn Clock> = clock.clone();
        (clock, FixedWindowRateLimiter::new(limits, shared))
    }

    #[test]
    fn sixth_request_in_window_is_denied_with_retry_hint() {
        let (clock, limiter) = limiter(RateLimitPolicy::new(5, 60));
        let actor = ActorId::parse("alice").unwrap();

        for expected_remaining in (0..5).rev() {
            assert_eq!(
                limiter.check(&actor, OperationClass::BulkSoftDelete),
                RateDecision::Admitted {
                    remaining: expected_remaining
                }
            );
        }

        clock.advance_secs(20);
        assert_eq!(
            limiter.check(&actor, OperationClass::BulkSoftDelete),
            RateDecision::Denied {
                retry_after_secs: 40
            }
        );
    }

    #[test]
    fn window_elapse_starts_fresh_window() {
        let (clock, limiter) = limiter(RateLimitPolicy::new(1, 60));
        let actor = ActorId::parse("alice").unwrap();

        assert!(limiter.check(&actor, OperationClass::BulkRestore).is_admitted());
        assert!(!limiter.check(&actor, OperationClass::BulkRestore).is_admitted());

        clock.advance_secs(60);
        assert!(limiter.check(&actor, OperationClass::BulkRestore).is_admitted());
    }

    #[test]
    fn buckets_are_keyed_by_actor_and_class() {
        let (_clock, limiter) = limiter(RateLimitPolicy::new(1, 60));
        let alice = ActorId::parse("alice").unwrap();
        let bob = ActorId::parse("bob").unwrap();

        assert!(limiter.check(&alice, OperationClass::BulkSoftDelete).is_admitted());
        assert!(limiter.check(&alice, OperationClass::BulkRestore).is_admitted());
        assert!(limiter.check(&bob, OperationClass::BulkSoftDelete).is_admitted());
        assert!(!limiter.check(&alice, OperationClass::BulkSoftDelete).is_admitted());
        assert_eq!(limiter.bucket_count(), 3);

        limiter.reset();
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn zero_quota_denies_everything() {
        let (_clock, limiter) = limiter(RateLimitPolicy::new(0, 60));
        let actor = ActorId::parse("alice").unwrap();
        assert_eq!(
            limiter.check(&actor, OperationClass::BulkPermanentDelete),
            RateDecision::Denied {
                retry_after_secs: 60
            }
        );
    }

    #[test]
    fn concurrent_checks_never_over_admit() {
        let (_clock, limiter) = limiter(RateLimitPolicy::new(5, 60));
        let limiter = Arc::new(limiter);
        let actor = ActorId::parse("alice").unwrap();

        let handles = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let actor = actor.clone();
                thread::spawn(move || limiter.check(&actor, OperationClass::BulkSoftDelete))
            })
            .collect::<Vec<_>>();

        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|decision| decision.is_admitted())
            .count();
        assert_eq!(admitted, 5);
    }
}
