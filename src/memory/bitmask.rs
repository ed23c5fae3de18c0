use crate::sync::atomic::{AtomicUsize, Ordering};

const WORD_BITS: usize = usize::BITS as usize;

/// Fixed-width atomic bit vector, one bit per bin.
///
/// Set/clear use `Relaxed` ordering and are deliberately performed outside
/// the owning bin's lock: the mask is a *hint* for scan shortcuts, never a
/// correctness-critical structure. A reader may momentarily see a bit set
/// for an empty bin (resolved by re-checking under the bin lock) or clear
/// for a non-empty one (resolved by periodic re-scans). The lock-protected
/// lists stay authoritative.
pub(crate) struct BinBitMask<const WORDS: usize> {
    words: [AtomicUsize; WORDS],
}

impl<const WORDS: usize> BinBitMask<WORDS> {
    pub const CAPACITY: usize = WORDS * WORD_BITS;

    pub fn new() -> Self {
        Self {
            words: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn set(&self, idx: usize) {
        debug_assert!(idx < Self::CAPACITY);
        self.words[idx / WORD_BITS].fetch_or(1 << (idx % WORD_BITS), Ordering::Relaxed);
    }

    #[inline]
    pub fn clear(&self, idx: usize) {
        debug_assert!(idx < Self::CAPACITY);
        self.words[idx / WORD_BITS].fetch_and(!(1 << (idx % WORD_BITS)), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn is_set(&self, idx: usize) -> bool {
        self.words[idx / WORD_BITS].load(Ordering::Relaxed) & (1 << (idx % WORD_BITS)) != 0
    }

    /// Highest set bit at or below `start`, scanning one word per step.
    pub fn max_true_le(&self, start: usize) -> Option<usize> {
        debug_assert!(start < Self::CAPACITY);
        let mut word = start / WORD_BITS;
        let low = start % WORD_BITS;
        // Bits above `start` in the first word are masked off.
        let mut mask = if low == WORD_BITS - 1 {
            !0
        } else {
            (1usize << (low + 1)) - 1
        };
        loop {
            let bits = self.words[word].load(Ordering::Relaxed) & mask;
            if bits != 0 {
                return Some(word * WORD_BITS + (WORD_BITS - 1 - bits.leading_zeros() as usize));
            }
            if word == 0 {
                return None;
            }
            word -= 1;
            mask = !0;
        }
    }

    /// Lowest set bit at or above `start`, scanning one word per step.
    pub fn min_true_ge(&self, start: usize) -> Option<usize> {
        if start >= Self::CAPACITY {
            return None;
        }
        let mut word = start / WORD_BITS;
        let mut mask = !0usize << (start % WORD_BITS);
        while word < WORDS {
            let bits = self.words[word].load(Ordering::Relaxed) & mask;
            if bits != 0 {
                return Some(word * WORD_BITS + bits.trailing_zeros() as usize);
            }
            word += 1;
            mask = !0;
        }
        None
    }
}
