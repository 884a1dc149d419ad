//! Segmented, lock-striped bit allocator.
//!
//! ```text
//!  bit space [0, max_bits)
//! ┌──────────────┬──────────────┬──────────────┬─────────┐
//! │  segment 0   │  segment 1   │  segment 2   │ seg 3   │
//! │ Mutex<tree>  │ Mutex<tree>  │ Mutex<tree>  │ (short) │
//! └──────────────┴──────────────┴──────────────┴─────────┘
//!        ▲ cursor rotates the starting segment per allocation
//! ```
//!
//! Each segment is an independent [`BitSetTree`] behind its own lock, so
//! threads allocating through different segments never contend.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::bitset::BitSetTree;

struct Segment {
    bits: BitSetTree,
    /// Where the next in-segment search starts (normal mode).
    start_search: usize,
    /// Highest set bit, segment-relative. Only maintained in compact mode.
    highest_bit_set: Option<usize>,
}

/// Concurrent bit allocator over `[0, max_bits)`.
///
/// In normal mode each segment searches from a moving hint, spreading
/// allocations. In compact mode each segment searches from its first bit and
/// tracks its highest set bit, keeping allocations packed low so the owner can
/// truncate whatever sits above the high-water mark.
pub struct ConcurrentBitSet {
    segments: Vec<Mutex<Segment>>,
    bits_per_segment: usize,
    max_bits: usize,
    compact: bool,
    cursor: AtomicUsize,
    bits_set: AtomicUsize,
}

impl ConcurrentBitSet {
    /// Create an allocator of `max_bits` clear bits split into at most
    /// `concurrency_level` segments.
    ///
    /// # Panics
    /// Panics if `concurrency_level` is 0.
    pub fn new(max_bits: usize, concurrency_level: usize) -> Self {
        assert!(concurrency_level > 0, "concurrency_level must be > 0");
        let bits_per_segment = max_bits.div_ceil(concurrency_level).max(1);
        let segment_count = max_bits.div_ceil(bits_per_segment).max(1);
        let segments = (0..segment_count)
            .map(|s| {
                let start = s * bits_per_segment;
                let len = (max_bits - start.min(max_bits)).min(bits_per_segment);
                Mutex::new(Segment {
                    bits: BitSetTree::new(len),
                    start_search: 0,
                    highest_bit_set: None,
                })
            })
            .collect();
        Self {
            segments,
            bits_per_segment,
            max_bits,
            compact: false,
            cursor: AtomicUsize::new(0),
            bits_set: AtomicUsize::new(0),
        }
    }

    /// Switch compact mode on or off. Choose before the first allocation.
    pub fn set_compact(&mut self, compact: bool) {
        self.compact = compact;
    }

    /// Whether compact mode is on.
    pub fn is_compact(&self) -> bool {
        self.compact
    }

    /// Total number of bits.
    pub fn max_bits(&self) -> usize {
        self.max_bits
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Bits per segment (the last segment may be shorter).
    pub fn bits_per_segment(&self) -> usize {
        self.bits_per_segment
    }

    /// Number of set bits across all segments.
    pub fn bits_set(&self) -> usize {
        self.bits_set.load(Ordering::Relaxed)
    }

    /// Allocate a clear bit, starting from the next segment in rotation.
    ///
    /// Returns `None` only when every bit is set.
    pub fn get_and_set_next_clear_bit(&self) -> Option<usize> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % self.segments.len();
        self.get_and_set_next_clear_bit_from(start)
    }

    /// Allocate a clear bit, starting at `start_segment` and wrapping.
    pub fn get_and_set_next_clear_bit_from(&self, start_segment: usize) -> Option<usize> {
        let n = self.segments.len();
        for i in 0..n {
            let s = (start_segment + i) % n;
            if let Some(bit) = self.allocate_in(s) {
                self.bits_set.fetch_add(1, Ordering::Relaxed);
                return Some(s * self.bits_per_segment + bit);
            }
        }
        None
    }

    fn allocate_in(&self, s: usize) -> Option<usize> {
        let mut seg = self.segments[s].lock();
        let seg = &mut *seg;
        let bit = if self.compact {
            seg.bits.next_clear_bit(0)?
        } else {
            let from = seg.start_search;
            match seg.bits.next_clear_bit(from) {
                Some(bit) => bit,
                None if from > 0 => seg.bits.next_clear_bit(0)?,
                None => return None,
            }
        };
        seg.bits.set(bit, true);
        if self.compact {
            seg.highest_bit_set = seg.highest_bit_set.max(Some(bit));
        } else {
            seg.start_search = if bit + 1 < seg.bits.len() { bit + 1 } else { 0 };
        }
        Some(bit)
    }

    /// Clear a set bit.
    ///
    /// # Panics
    /// Panics if `index` is out of range or the bit is already clear.
    pub fn clear(&self, index: usize) {
        assert!(index < self.max_bits, "bit {} out of range {}", index, self.max_bits);
        let (s, bit) = self.locate(index);
        let was_set = self.segments[s].lock().bits.set(bit, false);
        assert!(was_set, "bit {} cleared twice", index);
        self.bits_set.fetch_sub(1, Ordering::Relaxed);
    }

    /// Read bit `index`.
    pub fn get(&self, index: usize) -> bool {
        let (s, bit) = self.locate(index);
        self.segments[s].lock().bits.get(bit)
    }

    /// Tracked high-water mark of `segment` as a global index.
    ///
    /// Only meaningful in compact mode. Frees do not lower the mark; call
    /// [`compact_highest_bit_set`](Self::compact_highest_bit_set) for that.
    pub fn highest_bit_set(&self, segment: usize) -> Option<usize> {
        let seg = self.segments[segment].lock();
        seg.highest_bit_set.map(|b| segment * self.bits_per_segment + b)
    }

    /// Recompute the high-water mark of `segment` after frees at its tail.
    ///
    /// Must not run while another thread allocates or clears bits in the same
    /// segment: the result may be stale by the time the caller acts on it.
    pub fn compact_highest_bit_set(&self, segment: usize) -> Option<usize> {
        let mut seg = self.segments[segment].lock();
        let highest = match seg.highest_bit_set {
            Some(h) => seg.bits.previous_set_bit(h),
            None => None,
        };
        seg.highest_bit_set = highest;
        highest.map(|b| segment * self.bits_per_segment + b)
    }

    #[inline]
    fn locate(&self, index: usize) -> (usize, usize) {
        (index / self.bits_per_segment, index % self.bits_per_segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocates_every_bit_once() {
        let bits = ConcurrentBitSet::new(100, 7);
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let b = bits.get_and_set_next_clear_bit().unwrap();
            assert!(b < 100);
            assert!(seen.insert(b), "bit {} handed out twice", b);
        }
        assert_eq!(bits.get_and_set_next_clear_bit(), None);
        assert_eq!(bits.bits_set(), 100);
    }

    #[test]
    fn test_short_last_segment() {
        let bits = ConcurrentBitSet::new(10, 4);
        assert_eq!(bits.bits_per_segment(), 3);
        assert_eq!(bits.segment_count(), 4);
        for _ in 0..10 {
            bits.get_and_set_next_clear_bit().unwrap();
        }
        assert_eq!(bits.get_and_set_next_clear_bit(), None);
    }

    #[test]
    fn test_clear_makes_bit_reusable() {
        let bits = ConcurrentBitSet::new(4, 1);
        for _ in 0..4 {
            bits.get_and_set_next_clear_bit().unwrap();
        }
        bits.clear(2);
        assert!(!bits.get(2));
        assert_eq!(bits.get_and_set_next_clear_bit(), Some(2));
    }

    #[test]
    #[should_panic(expected = "cleared twice")]
    fn test_clear_of_clear_bit_panics() {
        let bits = ConcurrentBitSet::new(16, 2);
        bits.clear(3);
    }

    #[test]
    fn test_compact_mode_packs_low() {
        let mut bits = ConcurrentBitSet::new(64, 1);
        bits.set_compact(true);
        for i in 0..10 {
            assert_eq!(bits.get_and_set_next_clear_bit(), Some(i));
        }
        bits.clear(3);
        assert_eq!(bits.get_and_set_next_clear_bit(), Some(3));
        assert_eq!(bits.highest_bit_set(0), Some(9));
    }

    #[test]
    fn test_compact_highest_after_tail_frees() {
        let mut bits = ConcurrentBitSet::new(64, 2);
        bits.set_compact(true);
        for _ in 0..6 {
            bits.get_and_set_next_clear_bit_from(1);
        }
        // Segment 1 covers [32, 64).
        assert_eq!(bits.highest_bit_set(1), Some(37));
        bits.clear(37);
        bits.clear(36);
        assert_eq!(bits.highest_bit_set(1), Some(37));
        assert_eq!(bits.compact_highest_bit_set(1), Some(35));
        assert_eq!(bits.highest_bit_set(0), None);
        assert_eq!(bits.compact_highest_bit_set(0), None);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let bits = Arc::new(ConcurrentBitSet::new(4000, 8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bits = Arc::clone(&bits);
                thread::spawn(move || {
                    (0..500)
                        .map(|_| bits.get_and_set_next_clear_bit().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for b in h.join().unwrap() {
                assert!(all.insert(b));
            }
        }
        assert_eq!(all.len(), 4000);
        assert_eq!(bits.bits_set(), 4000);
        assert_eq!(bits.get_and_set_next_clear_bit(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]
        #[test]
        fn prop_allocate_free_consistent(
            max_bits in 1usize..300,
            level in 1usize..9,
            compact in any::<bool>(),
            ops in prop::collection::vec(any::<(bool, u16)>(), 0..400),
        ) {
            let mut bits = ConcurrentBitSet::new(max_bits, level);
            bits.set_compact(compact);
            let mut live: Vec<usize> = Vec::new();
            for (alloc, pick) in ops {
                if alloc || live.is_empty() {
                    match bits.get_and_set_next_clear_bit() {
                        Some(b) => {
                            prop_assert!(!live.contains(&b));
                            live.push(b);
                        }
                        None => prop_assert_eq!(live.len(), max_bits),
                    }
                } else {
                    let b = live.swap_remove(pick as usize % live.len());
                    bits.clear(b);
                }
                prop_assert_eq!(bits.bits_set(), live.len());
            }
            for b in &live {
                prop_assert!(bits.get(*b));
            }
        }
    }
}
