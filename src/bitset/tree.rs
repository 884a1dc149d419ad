//! In-memory hierarchical bitmap.
//!
//! A [`BitSetTree`] is a flat bitset plus a stack of summary levels that let
//! `next_set_bit` / `next_clear_bit` skip whole empty (or full) regions:
//!
//! ```text
//! level 2   [any]                          1 word
//! level 1   [any][any]...                  1 bit per leaf word
//! leaves    [w0][w1][w2]...[wN]            64 bits per word
//! ```
//!
//! Each summary level is kept twice: once answering "does this child hold a
//! set bit?" and once answering "does this child hold a clear bit?".

/// Bits per word.
pub(crate) const WORD_BITS: usize = 64;

/// Which kind of bit a scan is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitKind {
    Set,
    Clear,
}

/// Summary levels over a sequence of leaf words.
///
/// Shared by [`BitSetTree`] and [`BlockBitSetTree`](super::BlockBitSetTree);
/// only the leaf storage differs between the two.
#[derive(Debug, Clone)]
pub(crate) struct Summary {
    /// `any[0]` has one bit per leaf word: set if the word is non-zero.
    any: Vec<Vec<u64>>,
    /// `not_full[0]` has one bit per leaf word: set if the word has a clear bit.
    not_full: Vec<Vec<u64>>,
    leaf_words: usize,
}

impl Summary {
    /// Summaries for `leaf_words` all-zero leaf words.
    pub(crate) fn new(leaf_words: usize) -> Self {
        let mut any = Vec::new();
        let mut not_full = Vec::new();
        let mut bits = leaf_words.max(1);
        loop {
            let words = bits.div_ceil(WORD_BITS);
            any.push(vec![0u64; words]);
            not_full.push(ones_prefix(bits, words));
            if words == 1 {
                break;
            }
            bits = words;
        }
        if leaf_words == 0 {
            not_full[0][0] = 0;
        }
        Self {
            any,
            not_full,
            leaf_words,
        }
    }

    /// Record the new value of leaf word `index`, propagating upwards.
    pub(crate) fn update(&mut self, index: usize, leaf_word: u64, full_word: u64) {
        Self::propagate(&mut self.any, index, leaf_word != 0);
        Self::propagate(&mut self.not_full, index, leaf_word != full_word);
    }

    fn propagate(levels: &mut [Vec<u64>], mut index: usize, mut value: bool) {
        for level in levels.iter_mut() {
            let w = index / WORD_BITS;
            let mask = 1u64 << (index % WORD_BITS);
            let before = level[w];
            let after = if value { before | mask } else { before & !mask };
            if before == after {
                return;
            }
            level[w] = after;
            value = after != 0;
            index = w;
        }
    }

    /// First leaf word at or after `from` that may hold a bit of `kind`.
    pub(crate) fn next_word(&self, from: usize, kind: BitKind) -> Option<usize> {
        if from >= self.leaf_words {
            return None;
        }
        let levels = match kind {
            BitKind::Set => &self.any,
            BitKind::Clear => &self.not_full,
        };
        find_in_levels(levels, from)
    }
}

/// A word with the low `bits` bits set, for the last word of a level.
fn ones_prefix(bits: usize, words: usize) -> Vec<u64> {
    let mut v = vec![!0u64; words];
    let rem = bits % WORD_BITS;
    if rem != 0 {
        v[words - 1] = (1u64 << rem) - 1;
    }
    v
}

/// Ascend until a word has a candidate at or after `pos`, then descend.
fn find_in_levels(levels: &[Vec<u64>], from: usize) -> Option<usize> {
    let mut level = 0;
    let mut pos = from;
    loop {
        let words = &levels[level];
        let w = pos / WORD_BITS;
        if w >= words.len() {
            return None;
        }
        let masked = words[w] & (!0u64 << (pos % WORD_BITS));
        if masked != 0 {
            pos = w * WORD_BITS + masked.trailing_zeros() as usize;
            break;
        }
        if level + 1 == levels.len() {
            return None;
        }
        level += 1;
        pos = w + 1;
    }
    while level > 0 {
        level -= 1;
        let word = levels[level][pos];
        debug_assert!(word != 0, "summary bit set over an empty word");
        pos = pos * WORD_BITS + word.trailing_zeros() as usize;
    }
    Some(pos)
}

/// Mask of the valid bits in leaf word `w` of a bitmap of `len` bits.
#[inline]
pub(crate) fn full_word(len: usize, w: usize) -> u64 {
    let end = (w + 1) * WORD_BITS;
    if end <= len {
        !0u64
    } else {
        (1u64 << (len - w * WORD_BITS)) - 1
    }
}

/// Index of the first `kind` bit at or after `bit` in `word` (word `w`).
#[inline]
pub(crate) fn scan_word(word: u64, w: usize, from_bit: usize, kind: BitKind) -> Option<usize> {
    let word = match kind {
        BitKind::Set => word,
        BitKind::Clear => !word,
    };
    let masked = word & (!0u64 << from_bit);
    (masked != 0).then(|| w * WORD_BITS + masked.trailing_zeros() as usize)
}

/// Hierarchical bitmap held entirely in memory.
///
/// # Example
/// ```
/// use spillcache::bitset::BitSetTree;
///
/// let mut bits = BitSetTree::new(1_000_000);
/// bits.set(999_000, true);
/// assert_eq!(bits.next_set_bit(0), Some(999_000));
/// assert_eq!(bits.next_clear_bit(999_000), Some(999_001));
/// ```
#[derive(Debug, Clone)]
pub struct BitSetTree {
    words: Vec<u64>,
    summary: Summary,
    len: usize,
    bits_set: usize,
}

impl BitSetTree {
    /// Create a bitmap of `len` clear bits.
    pub fn new(len: usize) -> Self {
        let leaf_words = len.div_ceil(WORD_BITS);
        Self {
            words: vec![0u64; leaf_words],
            summary: Summary::new(leaf_words),
            len,
            bits_set: 0,
        }
    }

    /// Number of addressable bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap has zero addressable bits.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits.
    #[inline]
    pub fn bits_set(&self) -> usize {
        self.bits_set
    }

    /// Read bit `index`.
    ///
    /// # Panics
    /// Panics if `index >= len`.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    /// Set or clear bit `index`. Returns the previous value.
    ///
    /// # Panics
    /// Panics if `index >= len`.
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        let w = index / WORD_BITS;
        let mask = 1u64 << (index % WORD_BITS);
        let before = self.words[w];
        let previous = before & mask != 0;
        if previous == value {
            return previous;
        }
        let after = if value { before | mask } else { before & !mask };
        self.words[w] = after;
        if value {
            self.bits_set += 1;
        } else {
            self.bits_set -= 1;
        }
        self.summary.update(w, after, full_word(self.len, w));
        previous
    }

    /// First set bit at or after `from`.
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        self.next(from, BitKind::Set)
    }

    /// First clear bit at or after `from`.
    pub fn next_clear_bit(&self, from: usize) -> Option<usize> {
        self.next(from, BitKind::Clear)
    }

    /// Last set bit at or before `from`.
    ///
    /// Linear in the distance scanned; used for occasional compaction only.
    pub fn previous_set_bit(&self, from: usize) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let from = from.min(self.len - 1);
        let mut w = from / WORD_BITS;
        let shift = WORD_BITS - 1 - from % WORD_BITS;
        let mut word = (self.words[w] << shift) >> shift;
        loop {
            if word != 0 {
                return Some(w * WORD_BITS + (WORD_BITS - 1 - word.leading_zeros() as usize));
            }
            if w == 0 {
                return None;
            }
            w -= 1;
            word = self.words[w];
        }
    }

    fn next(&self, from: usize, kind: BitKind) -> Option<usize> {
        if from >= self.len {
            return None;
        }
        let w = from / WORD_BITS;
        let found = scan_word(self.words[w], w, from % WORD_BITS, kind).or_else(|| {
            let next = self.summary.next_word(w + 1, kind)?;
            scan_word(self.words[next], next, 0, kind)
        });
        found.filter(|&i| i < self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Linear reference implementation.
    fn reference_next(bits: &[bool], from: usize, value: bool) -> Option<usize> {
        (from..bits.len()).find(|&i| bits[i] == value)
    }

    #[test]
    fn test_empty_tree() {
        let bits = BitSetTree::new(0);
        assert!(bits.is_empty());
        assert_eq!(bits.next_set_bit(0), None);
        assert_eq!(bits.next_clear_bit(0), None);
    }

    #[test]
    fn test_set_and_get() {
        let mut bits = BitSetTree::new(200);
        assert!(!bits.set(3, true));
        assert!(bits.set(3, true));
        assert!(bits.get(3));
        assert_eq!(bits.bits_set(), 1);
        assert!(bits.set(3, false));
        assert_eq!(bits.bits_set(), 0);
    }

    #[test]
    fn test_next_clear_skips_full_words() {
        let mut bits = BitSetTree::new(64 * 64 * 3);
        for i in 0..64 * 64 * 2 {
            bits.set(i, true);
        }
        assert_eq!(bits.next_clear_bit(0), Some(64 * 64 * 2));
        assert_eq!(bits.next_set_bit(64 * 64 * 2), None);
    }

    #[test]
    fn test_next_clear_respects_length() {
        let mut bits = BitSetTree::new(70);
        for i in 0..70 {
            bits.set(i, true);
        }
        // Bits 70..128 of the last word are padding, never reported.
        assert_eq!(bits.next_clear_bit(0), None);
        bits.set(69, false);
        assert_eq!(bits.next_clear_bit(0), Some(69));
    }

    #[test]
    fn test_far_apart_bits() {
        let mut bits = BitSetTree::new(10_000_000);
        bits.set(5, true);
        bits.set(9_999_999, true);
        assert_eq!(bits.next_set_bit(6), Some(9_999_999));
        assert_eq!(bits.next_set_bit(0), Some(5));
        assert_eq!(bits.previous_set_bit(9_999_998), Some(5));
    }

    #[test]
    fn test_previous_set_bit() {
        let mut bits = BitSetTree::new(300);
        assert_eq!(bits.previous_set_bit(299), None);
        bits.set(0, true);
        bits.set(130, true);
        assert_eq!(bits.previous_set_bit(299), Some(130));
        assert_eq!(bits.previous_set_bit(130), Some(130));
        assert_eq!(bits.previous_set_bit(129), Some(0));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]
        #[test]
        fn prop_matches_flat_bitset(
            len in 1usize..20_000,
            ops in prop::collection::vec((any::<u32>(), any::<bool>()), 0..400),
            probes in prop::collection::vec(any::<u32>(), 1..50),
        ) {
            let mut tree = BitSetTree::new(len);
            let mut flat = vec![false; len];
            for (i, v) in ops {
                let i = i as usize % len;
                prop_assert_eq!(tree.set(i, v), flat[i]);
                flat[i] = v;
            }
            prop_assert_eq!(tree.bits_set(), flat.iter().filter(|b| **b).count());
            for p in probes {
                let from = p as usize % (len + 1);
                prop_assert_eq!(tree.next_set_bit(from), reference_next(&flat, from, true));
                prop_assert_eq!(tree.next_clear_bit(from), reference_next(&flat, from, false));
            }
        }
    }
}
