//! Keyed token buckets with bounded memory.

use super::bucket::TokenBucket;
use super::config::{BucketConfig, LimitPolicy, LimiterOptions};
use super::{BucketKey, Decision, RateLimiter};
use crate::clock::{Clock, MonotonicClock};
use crate::error::ContextError;
use crate::tenant::{self, BranchId, TenantId};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Candidates examined per insert into a full table.
const EVICTION_SAMPLE: usize = 8;

#[derive(Debug)]
struct Slot {
    bucket: Mutex<TokenBucket>,
    last_seen: AtomicU64,
}

impl Slot {
    fn new(config: &BucketConfig, now: u64) -> Self {
        Self { bucket: Mutex::new(TokenBucket::full(config, now)), last_seen: AtomicU64::new(now) }
    }

    // Refill and take happen under one lock acquisition.
    fn decide(&self, config: &BucketConfig, now: u64) -> Decision {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let decision = bucket.try_acquire(config, now);
        self.last_seen.fetch_max(now, Ordering::Relaxed);
        decision
    }

    fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_seen.load(Ordering::Relaxed))
    }

    fn is_saturated(&self, config: &BucketConfig, now: u64) -> bool {
        let bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.is_saturated(config, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Eviction {
    examined: usize,
    evicted: bool,
}

/// Token buckets keyed by (tenant, branch, feature).
///
/// Buckets are created lazily on first use and live in a sharded map; each one
/// has its own mutex, so decisions on different keys only meet at shard read
/// locks. Every decision runs while holding its shard's read lock, and
/// eviction needs the write lock, so a bucket is never removed mid-decision.
///
/// `max_buckets` is a soft bound. Inserting into a full table examines a few
/// of the oldest buckets and evicts one that has refilled to capacity; if none
/// has, the table grows past the bound until the sweeper or a later insert
/// catches up. A partially drained bucket is never evicted, so forgetting a
/// key never hands out extra tokens.
///
/// ```rust
/// use tenantguard::rate_limit::{BucketConfig, KeyedRateLimiter, LimitPolicy};
/// use tenantguard::tenant::{BranchId, TenantId};
///
/// let limiter = KeyedRateLimiter::new(LimitPolicy::uniform(BucketConfig::per_minute(2, 1.0).unwrap()));
/// let tenant = TenantId::new("clinic-7").unwrap();
/// let branch = BranchId::new("downtown").unwrap();
///
/// assert!(limiter.try_acquire(&tenant, &branch, "ai_note").is_allowed());
/// assert!(limiter.try_acquire(&tenant, &branch, "ai_note").is_allowed());
/// assert!(limiter.try_acquire(&tenant, &branch, "ai_note").is_denied());
/// ```
#[derive(Debug)]
pub struct KeyedRateLimiter {
    buckets: DashMap<BucketKey, Slot>,
    // Insertion order, rotated as candidates survive eviction. Never locked
    // while a shard guard is held.
    eviction_queue: Mutex<VecDeque<BucketKey>>,
    policy: ArcSwap<LimitPolicy>,
    options: LimiterOptions,
    clock: Arc<dyn Clock>,
}

impl KeyedRateLimiter {
    pub fn new(policy: LimitPolicy) -> Self {
        Self::with_options(policy, LimiterOptions::default())
    }

    pub fn with_options(policy: LimitPolicy, options: LimiterOptions) -> Self {
        Self {
            buckets: DashMap::new(),
            eviction_queue: Mutex::new(VecDeque::new()),
            policy: ArcSwap::from_pointee(policy),
            options,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Snapshot of the active policy.
    pub fn policy(&self) -> Arc<LimitPolicy> {
        self.policy.load_full()
    }

    /// Swap the policy. Existing buckets keep their token counts and pick up
    /// the new capacity and rate on their next decision.
    pub fn set_policy(&self, policy: LimitPolicy) {
        self.policy.store(Arc::new(policy));
        debug!(target: "tenantguard::rate_limit", "limit policy replaced");
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Admit or reject one call of `feature` for the given tenant and branch.
    pub fn try_acquire(&self, tenant_id: &TenantId, branch_id: &BranchId, feature: &str) -> Decision {
        let key = BucketKey::new(tenant_id.clone(), branch_id.clone(), feature);
        self.try_acquire_key(&key)
    }

    /// Like [`try_acquire`](Self::try_acquire), with tenant and branch taken
    /// from the active [`TenantContext`](crate::tenant::TenantContext).
    pub fn try_acquire_current(&self, feature: &str) -> Result<Decision, ContextError> {
        let ctx = tenant::require_current()?;
        Ok(self.try_acquire(ctx.tenant_id(), ctx.branch_id(), feature))
    }

    fn decide(&self, key: &BucketKey) -> Decision {
        let now = self.clock.now_nanos();
        let policy = self.policy.load();
        let config = policy.resolve(key.tenant_id(), key.feature());

        let existing = self.buckets.get(key).map(|slot| slot.decide(config, now));
        if let Some(decision) = existing {
            return decision;
        }

        if self.buckets.len() >= self.options.max_buckets() {
            let outcome = self.make_room(now, &policy);
            if !outcome.evicted {
                debug!(
                    target: "tenantguard::rate_limit",
                    buckets = self.buckets.len(),
                    max_buckets = self.options.max_buckets(),
                    examined = outcome.examined,
                    "no saturated bucket to evict; exceeding max_buckets"
                );
            }
        }
        // `entry` serializes concurrent first requests for the same key: one
        // inserts, the rest decide against the bucket it created.
        let mut inserted = false;
        let decision = {
            let slot = self.buckets.entry(key.clone()).or_insert_with(|| {
                inserted = true;
                debug!(target: "tenantguard::rate_limit", key = %key, capacity = config.capacity(), "created bucket");
                Slot::new(config, now)
            });
            slot.decide(config, now)
        };
        if inserted {
            self.eviction_queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(key.clone());
        }
        decision
    }

    /// Evict at most one saturated bucket, examining at most
    /// [`EVICTION_SAMPLE`] candidates from the front of the queue.
    fn make_room(&self, now: u64, policy: &LimitPolicy) -> Eviction {
        let mut outcome = Eviction { examined: 0, evicted: false };
        while outcome.examined < EVICTION_SAMPLE {
            let candidate = self.eviction_queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            let Some(candidate) = candidate else { break };
            outcome.examined += 1;

            let config = policy.resolve(candidate.tenant_id(), candidate.feature());
            if self.buckets.remove_if(&candidate, |_, slot| slot.is_saturated(config, now)).is_some() {
                debug!(target: "tenantguard::rate_limit", key = %candidate, "evicted saturated bucket");
                outcome.evicted = true;
                break;
            }
            if self.buckets.contains_key(&candidate) {
                self.eviction_queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(candidate);
            }
        }
        outcome
    }

    /// Drop buckets idle for longer than the configured TTL.
    ///
    /// Only buckets that have refilled to capacity are dropped; recreating one
    /// of those later yields the same state, so sweeping never changes an
    /// admission outcome. Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(self.clock.now_nanos())
    }

    fn sweep_at(&self, now: u64) -> usize {
        let ttl = u64::try_from(self.options.idle_ttl().as_nanos()).unwrap_or(u64::MAX);
        let policy = self.policy.load();
        let before = self.buckets.len();
        self.buckets.retain(|key, slot| {
            if slot.idle_for(now) < ttl {
                return true;
            }
            let config = policy.resolve(key.tenant_id(), key.feature());
            let bucket = slot.bucket.lock().unwrap_or_else(PoisonError::into_inner);
            !bucket.is_saturated(config, now)
        });
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            let mut queue = self.eviction_queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.retain(|key| self.buckets.contains_key(key));
            drop(queue);
            debug!(target: "tenantguard::rate_limit", removed, remaining = self.buckets.len(), "swept idle buckets");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `every` on the tokio runtime.
    ///
    /// The task holds a weak reference and exits once the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else { break };
                limiter.sweep();
            }
        })
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Whole tokens available for `key` right now, without consuming any.
    ///
    /// Unknown keys report their full configured capacity.
    pub fn remaining(&self, key: &BucketKey) -> u32 {
        let now = self.clock.now_nanos();
        let policy = self.policy.load();
        let config = policy.resolve(key.tenant_id(), key.feature());
        match self.buckets.get(key) {
            Some(slot) => {
                let bucket = slot.bucket.lock().unwrap_or_else(PoisonError::into_inner);
                bucket.available(config, now).floor() as u32
            }
            None => config.capacity(),
        }
    }
}

impl Default for KeyedRateLimiter {
    fn default() -> Self {
        Self::new(LimitPolicy::default())
    }
}

impl RateLimiter for KeyedRateLimiter {
    fn try_acquire_key(&self, key: &BucketKey) -> Decision {
        let decision = self.decide(key);
        if let Decision::Denied { retry_after } = decision {
            debug!(target: "tenantguard::rate_limit", key = %key, ?retry_after, "rejected");
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn key(tenant: &str, branch: &str, feature: &str) -> BucketKey {
        BucketKey::new(TenantId::new(tenant).unwrap(), BranchId::new(branch).unwrap(), feature)
    }

    fn limiter(capacity: u32, options: LimiterOptions) -> (KeyedRateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let policy = LimitPolicy::uniform(BucketConfig::per_second(capacity, 1.0).unwrap());
        (KeyedRateLimiter::with_options(policy, options).with_clock(clock.clone()), clock)
    }

    #[test]
    fn buckets_are_created_lazily() {
        let (limiter, _clock) = limiter(2, LimiterOptions::default());
        assert_eq!(limiter.bucket_count(), 0);
        assert_eq!(limiter.remaining(&key("t", "b", "f")), 2);
        assert_eq!(limiter.bucket_count(), 0);
        assert!(limiter.try_acquire_key(&key("t", "b", "f")).is_allowed());
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(limiter.remaining(&key("t", "b", "f")), 1);
    }

    #[test]
    fn sweep_drops_only_idle_buckets() {
        let options = LimiterOptions::new(100, Duration::from_secs(60)).unwrap();
        let (limiter, clock) = limiter(2, options);
        limiter.try_acquire_key(&key("t", "b", "old"));
        clock.advance(Duration::from_secs(45));
        limiter.try_acquire_key(&key("t", "b", "fresh"));
        clock.advance(Duration::from_secs(30));

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(limiter.eviction_queue.lock().unwrap().len(), 1);
        assert_eq!(limiter.remaining(&key("t", "b", "fresh")), 2);
    }

    #[test]
    fn sweep_keeps_idle_buckets_that_are_still_refilling() {
        let clock = ManualClock::new();
        let policy = LimitPolicy::uniform(BucketConfig::per_minute(10, 1.0).unwrap());
        let options = LimiterOptions::new(100, Duration::from_secs(60)).unwrap();
        let limiter = KeyedRateLimiter::with_options(policy, options).with_clock(clock.clone());
        let k = key("t", "b", "slow");
        for _ in 0..10 {
            assert!(limiter.try_acquire_key(&k).is_allowed());
        }
        clock.advance(Duration::from_secs(120));

        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.remaining(&k), 2);
    }

    #[test]
    fn full_table_never_evicts_a_drained_bucket() {
        let options = LimiterOptions::new(1, Duration::from_secs(3600)).unwrap();
        let (limiter, clock) = limiter(5, options);
        let drained = key("t", "b", "a");
        for _ in 0..5 {
            assert!(limiter.try_acquire_key(&drained).is_allowed());
        }

        assert!(limiter.try_acquire_key(&key("t", "b", "b")).is_allowed());
        assert_eq!(limiter.bucket_count(), 2);
        assert!(limiter.try_acquire_key(&drained).is_denied());

        // Both buckets refill to capacity; the next insert evicts the oldest.
        clock.advance(Duration::from_secs(5));
        assert!(limiter.try_acquire_key(&key("t", "b", "c")).is_allowed());
        assert_eq!(limiter.bucket_count(), 2);
        assert!(!limiter.buckets.contains_key(&drained));
        assert!(limiter.buckets.contains_key(&key("t", "b", "b")));
        assert_eq!(limiter.remaining(&drained), 5);
    }

    #[test]
    fn full_table_evicts_one_saturated_bucket_per_insert() {
        let options = LimiterOptions::new(3, Duration::from_secs(3600)).unwrap();
        let (limiter, clock) = limiter(2, options);
        for name in ["a", "b", "c"] {
            limiter.try_acquire_key(&key("t", "b", name));
        }
        clock.advance(Duration::from_secs(1));

        limiter.try_acquire_key(&key("t", "b", "d"));
        assert_eq!(limiter.bucket_count(), 3);
        assert!(!limiter.buckets.contains_key(&key("t", "b", "a")));
        limiter.try_acquire_key(&key("t", "b", "e"));
        assert_eq!(limiter.bucket_count(), 3);
        assert!(!limiter.buckets.contains_key(&key("t", "b", "b")));
    }

    #[test]
    fn insert_into_full_table_examines_a_bounded_sample() {
        let clock = ManualClock::new();
        let policy = LimitPolicy::uniform(BucketConfig::per_minute(5, 1.0).unwrap());
        let options = LimiterOptions::new(64, Duration::from_secs(3600)).unwrap();
        let limiter = KeyedRateLimiter::with_options(policy, options).with_clock(clock.clone());
        for i in 0..64 {
            limiter.try_acquire_key(&key("t", "b", &format!("f{i}")));
        }

        let outcome = limiter.make_room(clock.now_nanos(), &limiter.policy());
        assert_eq!(outcome, Eviction { examined: EVICTION_SAMPLE, evicted: false });
        assert_eq!(limiter.bucket_count(), 64);
        assert_eq!(limiter.eviction_queue.lock().unwrap().len(), 64);

        // Nothing is saturated, so the bound is exceeded rather than waiting.
        assert!(limiter.try_acquire_key(&key("t", "b", "late")).is_allowed());
        assert_eq!(limiter.bucket_count(), 65);
    }

    #[test]
    fn policy_swap_applies_to_existing_buckets() {
        let (limiter, _clock) = limiter(10, LimiterOptions::default());
        let k = key("t", "b", "f");
        assert!(limiter.try_acquire_key(&k).is_allowed());
        assert_eq!(limiter.remaining(&k), 9);

        limiter.set_policy(LimitPolicy::uniform(BucketConfig::per_second(3, 1.0).unwrap()));
        assert_eq!(limiter.remaining(&k), 3);
        for _ in 0..3 {
            assert!(limiter.try_acquire_key(&k).is_allowed());
        }
        assert!(limiter.try_acquire_key(&k).is_denied());
    }

    #[test]
    fn acquire_current_requires_context() {
        let (limiter, _clock) = limiter(1, LimiterOptions::default());
        assert_eq!(limiter.try_acquire_current("f").unwrap_err(), ContextError::NotInitialized);

        let ctx = crate::tenant::TenantContext::parse("t", "b").unwrap();
        crate::tenant::sync_scope(ctx, || {
            assert!(limiter.try_acquire_current("f").unwrap().is_allowed());
            assert!(limiter.try_acquire_current("f").unwrap().is_denied());
        })
        .unwrap();
        assert!(limiter.try_acquire_key(&key("t", "b", "f")).is_denied());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_stops_with_limiter() {
        let options = LimiterOptions::new(10, Duration::from_secs(1)).unwrap();
        let (limiter, clock) = limiter(1, options);
        let limiter = Arc::new(limiter);
        limiter.try_acquire_key(&key("t", "b", "f"));
        let handle = limiter.spawn_sweeper(Duration::from_secs(5));

        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(limiter.bucket_count(), 0);

        drop(limiter);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
    }
}
