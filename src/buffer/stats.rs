//! Cache statistics tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by the front-end cache.
///
/// All fields are atomic and updated with `Ordering::Relaxed`: each counter
/// only needs to be exact on its own, never consistent with the others.
///
/// # Example
/// ```
/// use spillcache::buffer::CacheStats;
/// use std::sync::atomic::Ordering;
///
/// let stats = CacheStats::new();
/// stats.memory_hits.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(stats.snapshot().memory_hits, 1);
/// ```
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Gets answered from the memory buffer.
    pub memory_hits: AtomicU64,

    /// Gets answered by reading the object store.
    pub disk_reads: AtomicU64,

    /// Gets that found nothing.
    pub misses: AtomicU64,

    /// Gets that reused a value another holder of the load lock produced.
    pub shared_loads: AtomicU64,

    /// Entries pushed out of memory.
    pub evictions: AtomicU64,

    /// Evicted entries written to the object store.
    pub spills: AtomicU64,

    /// Evicted entries discarded because the store would not take them.
    pub dropped: AtomicU64,
}

impl CacheStats {
    /// Create a stats tracker with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of gets that found a value (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        self.snapshot().hit_rate()
    }

    /// Non-atomic copy for display and logging.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            shared_loads: self.shared_loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            spills: self.spills.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.disk_reads,
            &self.misses,
            &self.shared_loads,
            &self.evictions,
            &self.spills,
            &self.dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub memory_hits: u64,
    pub disk_reads: u64,
    pub misses: u64,
    pub shared_loads: u64,
    pub evictions: u64,
    pub spills: u64,
    pub dropped: u64,
}

impl StatsSnapshot {
    /// Fraction of gets that found a value (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_reads + self.shared_loads;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats {{ memory: {}, disk: {}, misses: {}, evictions: {}, spills: {}, dropped: {}, hit_rate: {:.2}% }}",
            self.memory_hits,
            self.disk_reads,
            self.misses,
            self.evictions,
            self.spills,
            self.dropped,
            self.hit_rate() * 100.0
        )
    }
}
