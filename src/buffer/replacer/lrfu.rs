//! LRFU (Least Recently/Frequently Used) replacement policy.
//!
//! Every access moves an entry's ordering value to the current clock plus a
//! credit for how often it has been used recently:
//!
//! ```text
//! delta  = now - last_access
//! value  = now                                          if delta > max_interval
//!        = now + floor(2^(-λ·delta) · (prev - last_access + FREQUENCY_INCREMENT))
//! value  = max(value, prev + 1)
//! ```
//!
//! A small λ lets frequency dominate; a large λ decays credit quickly and the
//! policy approaches LRU. The lowest ordering value is evicted first.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::CacheKey;

/// Credit, in clock ticks, that one access contributes.
pub const FREQUENCY_INCREMENT: i64 = 1000;

#[derive(Debug, Clone, Copy)]
struct Tracked {
    key: CacheKey,
    last_access: i64,
    evictable: bool,
}

/// LRFU eviction queue.
///
/// Like the other replacers it is not internally synchronized; the owner
/// wraps it in a lock. Several queues can share one clock so their ordering
/// values stay comparable.
#[derive(Debug)]
pub struct LrfuEvictionQueue {
    clock: Arc<AtomicI64>,
    crf_lambda: f64,
    max_interval: i64,
    next_tiebreak: i64,

    /// Every tracked id.
    entries: HashMap<i64, Tracked>,

    /// Keys of evictable entries, lowest first.
    evictable: BTreeSet<CacheKey>,
}

impl LrfuEvictionQueue {
    /// Create a queue ticking `clock` on every access.
    ///
    /// # Panics
    /// Panics if `crf_lambda` is not positive and finite.
    pub fn new(clock: Arc<AtomicI64>, crf_lambda: f64) -> Self {
        assert!(
            crf_lambda > 0.0 && crf_lambda.is_finite(),
            "crf_lambda must be positive, got {}",
            crf_lambda
        );
        Self {
            clock,
            crf_lambda,
            max_interval: max_interval(crf_lambda),
            next_tiebreak: 0,
            entries: HashMap::new(),
            evictable: BTreeSet::new(),
        }
    }

    /// Change the decay constant. Existing ordering values are kept.
    pub fn set_crf_lambda(&mut self, crf_lambda: f64) {
        assert!(
            crf_lambda > 0.0 && crf_lambda.is_finite(),
            "crf_lambda must be positive, got {}",
            crf_lambda
        );
        self.crf_lambda = crf_lambda;
        self.max_interval = max_interval(crf_lambda);
    }

    /// Largest access gap that still earns frequency credit.
    pub fn max_interval(&self) -> i64 {
        self.max_interval
    }

    /// Record an access to `id`, tracking it if new. Returns its new
    /// ordering value.
    ///
    /// New entries start out not evictable.
    pub fn record_access(&mut self, id: i64) -> i64 {
        let now = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let tiebreak = self.next_tiebreak;
        self.next_tiebreak += 1;

        let value = match self.entries.get(&id).copied() {
            Some(tracked) => {
                self.compute_next_ordering_value(now, tracked.last_access, tracked.key.ordering_value)
            }
            None => now,
        };
        let key = CacheKey::new(value, tiebreak, id);

        let evictable = match self.entries.get(&id) {
            Some(tracked) => {
                if tracked.evictable {
                    self.evictable.remove(&tracked.key);
                    self.evictable.insert(key);
                }
                tracked.evictable
            }
            None => false,
        };
        self.entries.insert(
            id,
            Tracked {
                key,
                last_access: now,
                evictable,
            },
        );
        value
    }

    /// The LRFU update rule, saturating and never lower than `previous + 1`.
    pub fn compute_next_ordering_value(&self, now: i64, last_access: i64, previous: i64) -> i64 {
        let delta = now.saturating_sub(last_access);
        let value = if delta > self.max_interval {
            now
        } else {
            let decay = 2f64.powf(-self.crf_lambda * delta as f64);
            let base = previous
                .saturating_sub(last_access)
                .saturating_add(FREQUENCY_INCREMENT);
            now.saturating_add((decay * base as f64).floor() as i64)
        };
        value.max(previous.saturating_add(1))
    }

    /// Mark a tracked id as evictable or pinned. Unknown ids are ignored.
    pub fn set_evictable(&mut self, id: i64, evictable: bool) {
        let Some(tracked) = self.entries.get_mut(&id) else {
            return;
        };
        if tracked.evictable == evictable {
            return;
        }
        tracked.evictable = evictable;
        if evictable {
            self.evictable.insert(tracked.key);
        } else {
            self.evictable.remove(&tracked.key);
        }
    }

    /// Remove and return the lowest-ranked evictable id.
    pub fn evict(&mut self) -> Option<i64> {
        let key = self.evictable.pop_first()?;
        self.entries.remove(&key.id);
        Some(key.id)
    }

    /// Lowest-ranked evictable key, without removing it.
    pub fn peek_lowest(&self) -> Option<CacheKey> {
        self.evictable.first().copied()
    }

    /// Stop tracking `id`.
    pub fn remove(&mut self, id: i64) {
        if let Some(tracked) = self.entries.remove(&id) {
            if tracked.evictable {
                self.evictable.remove(&tracked.key);
            }
        }
    }

    /// Current ordering value of `id`.
    pub fn ordering_value(&self, id: i64) -> Option<i64> {
        self.entries.get(&id).map(|t| t.key.ordering_value)
    }

    /// Current key of `id`.
    pub fn key(&self, id: i64) -> Option<CacheKey> {
        self.entries.get(&id).map(|t| t.key)
    }

    /// Number of evictable entries.
    pub fn size(&self) -> usize {
        self.evictable.len()
    }

    /// Number of tracked entries, pinned or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Largest power of two for which `2^(-λ·interval)` is still non-zero as f32.
fn max_interval(crf_lambda: f64) -> i64 {
    let mut interval: i64 = 1;
    while interval < (1 << 62) && 2f32.powf(-(crf_lambda * (interval * 2) as f64) as f32) > 0.0 {
        interval *= 2;
    }
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn queue(lambda: f64) -> LrfuEvictionQueue {
        LrfuEvictionQueue::new(Arc::new(AtomicI64::new(0)), lambda)
    }

    #[test]
    fn test_max_interval() {
        let q = queue(0.0002);
        let m = q.max_interval();
        assert!((m as u64).is_power_of_two());
        assert!(2f32.powf(-(0.0002 * m as f64) as f32) > 0.0);
        assert_eq!(2f32.powf(-(0.0002 * (m * 2) as f64) as f32), 0.0);
    }

    #[test]
    fn test_evicts_lowest_first() {
        let mut q = queue(0.5);
        for id in [10, 20, 30] {
            q.record_access(id);
            q.set_evictable(id, true);
        }
        assert_eq!(q.size(), 3);
        assert_eq!(q.peek_lowest().map(|k| k.id), Some(10));
        assert_eq!(q.evict(), Some(10));
        assert_eq!(q.evict(), Some(20));
        assert_eq!(q.evict(), Some(30));
        assert_eq!(q.evict(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_pinned_entries_skipped() {
        let mut q = queue(0.5);
        q.record_access(1);
        q.record_access(2);
        q.set_evictable(2, true);
        assert_eq!(q.size(), 1);
        assert_eq!(q.len(), 2);
        assert_eq!(q.evict(), Some(2));
        assert_eq!(q.evict(), None);
        q.set_evictable(1, true);
        assert_eq!(q.evict(), Some(1));
    }

    #[test]
    fn test_frequency_outranks_single_recent_access() {
        let mut q = queue(0.0002);
        for _ in 0..5 {
            q.record_access(1);
        }
        q.record_access(2);
        q.set_evictable(1, true);
        q.set_evictable(2, true);
        assert_eq!(q.evict(), Some(2));
    }

    #[test]
    fn test_larger_lambda_gives_less_credit() {
        let mut slow = queue(0.0002);
        let mut fast = queue(1.0);
        slow.record_access(1);
        fast.record_access(1);
        let slow_value = slow.record_access(1);
        let fast_value = fast.record_access(1);
        // 2 + floor(2^-0.0002 * 1000) vs 2 + floor(2^-1 * 1000)
        assert_eq!(slow_value, 1001);
        assert_eq!(fast_value, 502);
    }

    #[test]
    fn test_compute_beyond_max_interval_resets() {
        let q = queue(0.0002);
        let now = q.max_interval() * 4;
        assert_eq!(q.compute_next_ordering_value(now, 0, 5), now);
    }

    #[test]
    fn test_compute_saturates() {
        let q = queue(0.0002);
        let v = q.compute_next_ordering_value(i64::MAX, i64::MAX - 1, i64::MAX - 1);
        assert_eq!(v, i64::MAX);
        let v = q.compute_next_ordering_value(10, 9, i64::MAX);
        assert_eq!(v, i64::MAX);
    }

    #[test]
    fn test_remove_untracks() {
        let mut q = queue(0.1);
        q.record_access(7);
        q.set_evictable(7, true);
        q.remove(7);
        assert_eq!(q.size(), 0);
        assert_eq!(q.ordering_value(7), None);
        q.set_evictable(7, true);
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_shared_clock() {
        let clock = Arc::new(AtomicI64::new(0));
        let mut a = LrfuEvictionQueue::new(Arc::clone(&clock), 0.1);
        let mut b = LrfuEvictionQueue::new(Arc::clone(&clock), 0.1);
        let first = a.record_access(1);
        let second = b.record_access(1);
        assert!(second > first);
        assert_eq!(clock.load(Ordering::Relaxed), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]
        #[test]
        fn prop_ordering_strictly_increases(
            lambda in 0.00001f64..2.0,
            accesses in prop::collection::vec(0i64..8, 1..300),
        ) {
            let mut q = queue(lambda);
            let mut last: HashMap<i64, i64> = HashMap::new();
            for id in accesses {
                let value = q.record_access(id);
                if let Some(prev) = last.insert(id, value) {
                    prop_assert!(value > prev);
                }
                prop_assert_eq!(q.ordering_value(id), Some(value));
            }
        }

        #[test]
        fn prop_compute_never_decreases(
            now in any::<i64>(),
            last in any::<i64>(),
            prev in any::<i64>(),
        ) {
            let q = queue(0.0002);
            let v = q.compute_next_ordering_value(now, last, prev);
            prop_assert!(v > prev || prev == i64::MAX);
        }
    }
}
