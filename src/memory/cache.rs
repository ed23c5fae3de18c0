use super::bitmask::BinBitMask;
use super::block::{EvictedList, LargeBlockHeader};
use super::raw::MemError;
use super::stats;
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::ptr::NonNull;

/// Upper bound on the number of size classes; the bitmask is sized for this.
pub(crate) const MAX_CACHE_BINS: usize = 1024;

/// Lock-protected per-bin state. The free list is doubly linked: puts push at
/// the head (most-recently-freed first), eviction walks from the tail
/// (oldest first), so ages are monotonically increasing toward the head.
struct BinState {
    head: *mut LargeBlockHeader,
    tail: *mut LargeBlockHeader,
    /// Age of the tail block; zero when the list is empty.
    oldest_age: u64,
    /// Age of the most recently evicted (or declined-first) block. Zero
    /// means this class has never cached anything.
    last_cleaned_age: u64,
    /// Adaptive eviction bar, in logical-time units. Zero means the class
    /// has not been calibrated yet and nothing is evicted.
    age_threshold: u64,
    /// Bytes currently allocated out to callers for this size class.
    used_size: usize,
    /// Bytes sitting in the free list.
    cached_size: usize,
    /// Moving average of the logical time between cache hits.
    last_hit_interval: u64,
    last_access_time: u64,
}

// Safety: the raw list pointers are only touched under the bin lock, and the
// blocks they reference are owned by the pool.
unsafe impl Send for BinState {}

pub(crate) enum PutOutcome {
    Cached { was_empty: bool },
    /// The bin declined the block; the caller must return it to the backend.
    Declined,
}

pub(crate) enum GetOutcome {
    Hit {
        block: NonNull<LargeBlockHeader>,
        now_empty: bool,
    },
    Miss,
}

pub(crate) struct BinCleanup {
    pub used: usize,
    pub cached: usize,
    pub now_empty: bool,
    pub evicted: EvictedList,
}

/// One size-class bucket of the large object cache.
pub(crate) struct CacheBin {
    state: Mutex<BinState>,
}

impl CacheBin {
    fn new() -> Self {
        Self {
            state: Mutex::new(BinState {
                head: std::ptr::null_mut(),
                tail: std::ptr::null_mut(),
                oldest_age: 0,
                last_cleaned_age: 0,
                age_threshold: 0,
                used_size: 0,
                cached_size: 0,
                last_hit_interval: 0,
                last_access_time: 0,
            }),
        }
    }

    /// Offer a freed block to this bin.
    fn put(&self, block: NonNull<LargeBlockHeader>, now: u64) -> PutOutcome {
        // Safety: the block is exclusively owned by the caller until cached.
        let size = unsafe { block.as_ref().unaligned_size };
        let mut s = self.state.lock().unwrap();

        debug_assert!(s.used_size >= size, "put without a matching get");
        s.used_size -= size;
        stats::CACHE_USED_BYTES.sub(size);

        if s.last_cleaned_age == 0 {
            // The very first freed block of a class is not cached. This
            // seeds the low-water mark, so classes that are used exactly
            // once never skew the miss-rate heuristics.
            s.last_cleaned_age = now;
            return PutOutcome::Declined;
        }

        let was_empty = s.head.is_null();
        // Safety: list surgery under the bin lock; `block` is unlinked.
        unsafe {
            let b = block.as_ptr();
            (*b).age = now;
            (*b).prev = std::ptr::null_mut();
            (*b).next = s.head;
            if let Some(head) = s.head.as_mut() {
                head.prev = b;
            } else {
                s.tail = b;
                s.oldest_age = now;
            }
            s.head = b;
        }
        s.cached_size += size;
        stats::CACHE_CACHED_BYTES.add(size);
        PutOutcome::Cached { was_empty }
    }

    /// Try to satisfy a request from this bin's free list.
    fn get(&self, size: usize, now: u64) -> GetOutcome {
        let mut s = self.state.lock().unwrap();

        if let Some(head) = NonNull::new(s.head) {
            // Safety: list surgery under the bin lock.
            unsafe {
                let next = head.as_ref().next;
                s.head = next;
                if let Some(next) = next.as_mut() {
                    next.prev = std::ptr::null_mut();
                } else {
                    s.tail = std::ptr::null_mut();
                    s.oldest_age = 0;
                }
                debug_assert_eq!(head.as_ref().unaligned_size, size);
            }
            s.cached_size -= size;
            s.used_size += size;
            stats::CACHE_CACHED_BYTES.sub(size);
            stats::CACHE_USED_BYTES.add(size);

            let gap = now.saturating_sub(s.last_access_time);
            s.last_hit_interval = if s.last_hit_interval == 0 {
                gap
            } else {
                (s.last_hit_interval + gap) / 2
            };
            s.last_access_time = now;

            GetOutcome::Hit {
                block: head,
                now_empty: s.head.is_null(),
            }
        } else {
            if s.last_cleaned_age != 0 {
                // Sustained misses raise the eviction bar: a class being
                // reused faster than it is evicted ages out later.
                s.age_threshold = 2 * now.saturating_sub(s.last_cleaned_age);
            }
            // Optimistic: the backend is expected to supply this block.
            // Undone by `rollback` if it cannot.
            s.used_size += size;
            stats::CACHE_USED_BYTES.add(size);
            s.last_access_time = now;
            GetOutcome::Miss
        }
    }

    /// Undo the optimistic `used_size` increment of a recorded miss after
    /// the backend failed to supply the block. Returns whether the free
    /// list is empty, so the caller can restore the bitmask hint.
    fn rollback(&self, size: usize) -> bool {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.used_size >= size, "rollback without a recorded miss");
        s.used_size -= size;
        stats::CACHE_USED_BYTES.sub(size);
        s.head.is_null()
    }

    /// Evict entries older than the adaptive threshold; optionally decay the
    /// threshold first (global over-caching backpressure).
    fn cleanup(&self, now: u64, decay: bool) -> BinCleanup {
        let mut s = self.state.lock().unwrap();

        if decay && s.age_threshold != 0 {
            // Halve toward the recent hit interval so the whole cache
            // shrinks faster while over-caching persists.
            s.age_threshold = (s.age_threshold + s.last_hit_interval) / 2;
        }

        let mut evicted = EvictedList::new();
        // Threshold zero means the class was never calibrated by a miss;
        // such bins are left alone.
        if s.age_threshold != 0
            && !s.tail.is_null()
            && now.saturating_sub(s.oldest_age) > s.age_threshold
        {
            while let Some(tail) = NonNull::new(s.tail) {
                // Safety: tail is linked; surgery under the bin lock.
                let age = unsafe { tail.as_ref().age };
                if now.saturating_sub(age) <= s.age_threshold {
                    break;
                }
                // Safety: unlink the oldest entry.
                unsafe {
                    let prev = tail.as_ref().prev;
                    s.tail = prev;
                    if let Some(prev) = prev.as_mut() {
                        prev.next = std::ptr::null_mut();
                    } else {
                        s.head = std::ptr::null_mut();
                    }
                    let size = tail.as_ref().unaligned_size;
                    s.cached_size -= size;
                    stats::CACHE_CACHED_BYTES.sub(size);
                    s.last_cleaned_age = age;
                    evicted.push(tail);
                }
            }
            // Safety: tail (if any) is a linked block.
            s.oldest_age = match NonNull::new(s.tail) {
                Some(tail) => unsafe { tail.as_ref().age },
                None => 0,
            };
        }

        BinCleanup {
            used: s.used_size,
            cached: s.cached_size,
            now_empty: s.head.is_null(),
            evicted,
        }
    }

    /// Evict every cached entry regardless of age (trim/teardown path).
    fn clean_all(&self) -> EvictedList {
        let mut s = self.state.lock().unwrap();
        let mut evicted = EvictedList::new();
        while let Some(tail) = NonNull::new(s.tail) {
            // Safety: unlink the oldest entry under the bin lock.
            unsafe {
                let prev = tail.as_ref().prev;
                s.tail = prev;
                if let Some(prev) = prev.as_mut() {
                    prev.next = std::ptr::null_mut();
                } else {
                    s.head = std::ptr::null_mut();
                }
                let size = tail.as_ref().unaligned_size;
                s.cached_size -= size;
                stats::CACHE_CACHED_BYTES.sub(size);
                s.last_cleaned_age = tail.as_ref().age;
                evicted.push(tail);
            }
        }
        s.oldest_age = 0;
        evicted
    }

    /// (used_size, cached_size) under the bin lock.
    pub fn snapshot(&self) -> (usize, usize) {
        let s = self.state.lock().unwrap();
        (s.used_size, s.cached_size)
    }

    #[cfg(test)]
    fn age_threshold(&self) -> u64 {
        self.state.lock().unwrap().age_threshold
    }

    #[cfg(test)]
    fn cached_blocks(&self) -> Vec<NonNull<LargeBlockHeader>> {
        let s = self.state.lock().unwrap();
        let mut out = Vec::new();
        let mut cur = s.head;
        while let Some(b) = NonNull::new(cur) {
            out.push(b);
            // Safety: list links are valid under the lock.
            cur = unsafe { b.as_ref().next };
        }
        out
    }
}

pub(crate) enum CacheGet {
    Hit(NonNull<LargeBlockHeader>),
    /// Recorded miss: the bin's `used_size` was optimistically incremented.
    Miss,
    /// Size outside the cached range; goes straight to the backend.
    Bypass,
}

/// Cache for large allocations: an array of [`CacheBin`]s indexed by size
/// class, a non-empty bitmask hint for O(1) cleanup scans, and the logical
/// aging clock driving the periodic cleanup.
///
/// The clock is a plain atomic increment per operation — no wall-clock
/// reads. It is owned here (one per pool), never process-global.
pub(crate) struct LargeObjectCache {
    bins: Box<[CacheBin]>,
    mask: BinBitMask<16>,
    clock: AtomicU64,
    step: usize,
    min_size: usize,
    max_size: usize,
    cleanup_period: u64,
    overcache_tolerance: u32,
    /// Consecutive cleanup cycles that saw cached bytes above twice used
    /// bytes. At `overcache_tolerance` the thresholds start decaying.
    overcache_streak: AtomicU32,
}

impl LargeObjectCache {
    pub fn new(
        step: usize,
        min_size: usize,
        max_size: usize,
        cleanup_period: u64,
        overcache_tolerance: u32,
    ) -> Result<Self, MemError> {
        if step == 0 || min_size % step != 0 || max_size % step != 0 || min_size > max_size {
            return Err(MemError::InitializationFailed(format!(
                "invalid cache geometry: step {step}, range {min_size}..={max_size}"
            )));
        }
        if !cleanup_period.is_power_of_two() {
            return Err(MemError::InitializationFailed(format!(
                "cleanup period {cleanup_period} is not a power of two"
            )));
        }
        let num_bins = (max_size - min_size) / step + 1;
        if num_bins > MAX_CACHE_BINS {
            return Err(MemError::InitializationFailed(format!(
                "{num_bins} size classes exceed the supported maximum {MAX_CACHE_BINS}"
            )));
        }

        Ok(Self {
            bins: (0..num_bins).map(|_| CacheBin::new()).collect(),
            mask: BinBitMask::new(),
            clock: AtomicU64::new(0),
            step,
            min_size,
            max_size,
            cleanup_period,
            overcache_tolerance,
            overcache_streak: AtomicU32::new(0),
        })
    }

    /// Round a byte count up to its size class.
    #[inline]
    pub fn aligned_size(&self, size: usize) -> usize {
        size.next_multiple_of(self.step)
    }

    #[inline]
    fn bin_index(&self, aligned: usize) -> Option<usize> {
        if aligned < self.min_size || aligned > self.max_size {
            return None;
        }
        Some((aligned - self.min_size) / self.step)
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Try to satisfy a request for `aligned` bytes (already size-class
    /// rounded). Any evicted blocks from the piggybacked cleanup are
    /// returned for the caller to hand to the backend.
    pub fn get(&self, aligned: usize) -> (CacheGet, EvictedList) {
        let Some(idx) = self.bin_index(aligned) else {
            return (CacheGet::Bypass, EvictedList::new());
        };
        let now = self.tick();
        let out = match self.bins[idx].get(aligned, now) {
            GetOutcome::Hit { block, now_empty } => {
                if now_empty {
                    self.mask.clear(idx);
                }
                CacheGet::Hit(block)
            }
            GetOutcome::Miss => CacheGet::Miss,
        };
        (out, self.cleanup_if_needed(now))
    }

    /// Offer a freed block to the cache. Returns the block back when the
    /// cache declines it (out of range, or the class's first free), in
    /// which case the caller must return it to the backend.
    pub fn put(
        &self,
        block: NonNull<LargeBlockHeader>,
    ) -> (Option<NonNull<LargeBlockHeader>>, EvictedList) {
        // Safety: the caller owns the block.
        let size = unsafe { block.as_ref().unaligned_size };
        let Some(idx) = self.bin_index(size) else {
            return (Some(block), EvictedList::new());
        };
        let now = self.tick();
        let declined = match self.bins[idx].put(block, now) {
            PutOutcome::Cached { was_empty } => {
                if was_empty {
                    // Hint update deliberately outside the bin lock.
                    self.mask.set(idx);
                }
                None
            }
            PutOutcome::Declined => Some(block),
        };
        (declined, self.cleanup_if_needed(now))
    }

    /// Undo the bookkeeping of a recorded miss whose backend allocation
    /// failed, so the used/cached invariants hold for later operations.
    pub fn rollback(&self, aligned: usize) {
        let Some(idx) = self.bin_index(aligned) else {
            return;
        };
        if self.bins[idx].rollback(aligned) {
            self.mask.clear(idx);
        }
    }

    fn cleanup_if_needed(&self, now: u64) -> EvictedList {
        if now & (self.cleanup_period - 1) == 0 {
            self.regular_cleanup(now)
        } else {
            EvictedList::new()
        }
    }

    /// Scan non-empty bins from the largest size class downward, evicting
    /// entries past their bins' thresholds and measuring the global
    /// used/cached ratio that drives threshold decay.
    pub fn regular_cleanup(&self, now: u64) -> EvictedList {
        let decay = self.overcache_streak.load(Ordering::Relaxed) >= self.overcache_tolerance;
        let mut evicted = EvictedList::new();
        let mut total_used = 0usize;
        let mut total_cached = 0usize;

        let mut scan = self.bins.len() - 1;
        while let Some(idx) = self.mask.max_true_le(scan) {
            let result = self.bins[idx].cleanup(now, decay);
            total_used += result.used;
            total_cached += result.cached;
            if result.now_empty {
                self.mask.clear(idx);
            }
            evicted.append(result.evicted);
            if idx == 0 {
                break;
            }
            scan = idx - 1;
        }

        if total_cached > 2 * total_used {
            self.overcache_streak.fetch_add(1, Ordering::Relaxed);
        } else {
            self.overcache_streak.store(0, Ordering::Relaxed);
        }
        evicted
    }

    /// Evict everything (trim/teardown).
    pub fn clean_all(&self) -> EvictedList {
        let mut evicted = EvictedList::new();
        for (idx, bin) in self.bins.iter().enumerate() {
            let chain = bin.clean_all();
            if !chain.is_empty() {
                evicted.append(chain);
            }
            self.mask.clear(idx);
        }
        evicted
    }

    /// Total bytes sitting in free lists, summed bin by bin (best-effort
    /// snapshot, not atomic across bins).
    pub fn cached_bytes(&self) -> usize {
        self.bins.iter().map(|b| b.snapshot().1).sum()
    }

    /// Total bytes handed out to callers, summed bin by bin.
    pub fn used_bytes(&self) -> usize {
        self.bins.iter().map(|b| b.snapshot().0).sum()
    }

    /// (used, cached) for the class serving `aligned` bytes.
    pub fn class_snapshot(&self, aligned: usize) -> (usize, usize) {
        match self.bin_index(aligned) {
            Some(idx) => self.bins[idx].snapshot(),
            None => (0, 0),
        }
    }

    #[cfg(test)]
    fn advance_clock(&self, ticks: u64) {
        self.clock.fetch_add(ticks, Ordering::Relaxed);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const STEP: usize = 8 * 1024;
    const MIN: usize = 8 * 1024;
    const MAX: usize = 8 * 1024 * 1024;

    fn cache() -> LargeObjectCache {
        LargeObjectCache::new(STEP, MIN, MAX, 1024, 4).unwrap()
    }

    /// Cache logic only touches header fields, so a bare header stands in
    /// for a full backend block.
    fn fake_block(unaligned_size: usize) -> NonNull<LargeBlockHeader> {
        let layout = Layout::new::<LargeBlockHeader>();
        // Safety: Test code.
        let ptr = unsafe { alloc_zeroed(layout) }.cast::<LargeBlockHeader>();
        let mut nn = NonNull::new(ptr).unwrap();
        // Safety: Test code.
        unsafe {
            nn.as_mut().unaligned_size = unaligned_size;
        }
        nn
    }

    fn drop_block(b: NonNull<LargeBlockHeader>) {
        // Safety: Test code.
        unsafe { dealloc(b.as_ptr().cast(), Layout::new::<LargeBlockHeader>()) };
    }

    /// Prime a size class so its low-water mark is recorded and subsequent
    /// puts are cached: miss once, then decline the first put.
    fn prime_class(c: &LargeObjectCache, size: usize) {
        assert!(matches!(c.get(size).0, CacheGet::Miss));
        let b = fake_block(size);
        let (declined, _) = c.put(b);
        let declined = declined.expect("first put of a class must be declined");
        drop_block(declined);
    }

    #[test]
    fn test_cache_geometry_validation() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        assert!(LargeObjectCache::new(0, MIN, MAX, 1024, 4).is_err());
        assert!(LargeObjectCache::new(STEP, MIN, MAX, 1000, 4).is_err());
        assert!(LargeObjectCache::new(STEP, MIN, MIN - STEP, 1024, 4).is_err());
        // More classes than the bitmask can describe
        assert!(LargeObjectCache::new(STEP, MIN, STEP * 3000, 1024, 4).is_err());
        assert!(LargeObjectCache::new(STEP, MIN, MAX, 1024, 4).is_ok());
    }

    #[test]
    fn test_cache_bypass_out_of_range() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = cache();
        assert!(matches!(c.get(4096).0, CacheGet::Bypass));
        assert!(matches!(c.get(MAX + STEP).0, CacheGet::Bypass));
        assert!(matches!(c.get(MIN).0, CacheGet::Miss));
    }

    #[test]
    fn test_cache_first_free_not_cached() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = cache();
        let size = 64 * 1024;

        assert!(matches!(c.get(size).0, CacheGet::Miss));
        let b = fake_block(size);
        let (declined, _) = c.put(b);
        assert_eq!(declined, Some(b), "first free of a class must not cache");
        assert_eq!(c.class_snapshot(size), (0, 0));
        drop_block(b);
    }

    #[test]
    fn test_cache_accounting_invariant() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = cache();
        let size = 64 * 1024;
        prime_class(&c, size);

        // Three misses, three puts; every put after the first is cached.
        let blocks: Vec<_> = (0..3)
            .map(|_| {
                assert!(matches!(c.get(size).0, CacheGet::Miss));
                fake_block(size)
            })
            .collect();
        assert_eq!(c.class_snapshot(size), (3 * size, 0));

        for &b in &blocks {
            let (declined, _) = c.put(b);
            assert!(declined.is_none());
        }
        assert_eq!(c.class_snapshot(size), (0, 3 * size));

        // Hits move bytes back from cached to used.
        let (out, _) = c.get(size);
        assert!(matches!(out, CacheGet::Hit(_)));
        assert_eq!(c.class_snapshot(size), (size, 2 * size));

        // Tidy up: retrieve the rest so the fake blocks can be freed.
        for _ in 0..2 {
            assert!(matches!(c.get(size).0, CacheGet::Hit(_)));
        }
        for b in blocks {
            drop_block(b);
        }
    }

    #[test]
    fn test_cache_most_recently_freed_first() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = cache();
        let size = 32 * 1024;
        prime_class(&c, size);

        assert!(matches!(c.get(size).0, CacheGet::Miss));
        assert!(matches!(c.get(size).0, CacheGet::Miss));
        let a = fake_block(size);
        let b = fake_block(size);
        assert!(c.put(a).0.is_none());
        assert!(c.put(b).0.is_none());

        // b was freed last, so it must come back first.
        let CacheGet::Hit(first) = c.get(size).0 else {
            panic!("expected hit")
        };
        assert_eq!(first, b);
        let CacheGet::Hit(second) = c.get(size).0 else {
            panic!("expected hit")
        };
        assert_eq!(second, a);

        drop_block(a);
        drop_block(b);
    }

    #[test]
    fn test_cache_put_get_round_trip() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = cache();
        let size = 16 * 1024;
        prime_class(&c, size);

        assert!(matches!(c.get(size).0, CacheGet::Miss));
        assert!(matches!(c.get(size).0, CacheGet::Miss));
        let a = fake_block(size);
        let b = fake_block(size);
        assert!(c.put(a).0.is_none());
        assert!(c.put(b).0.is_none());

        let before_snapshot = c.class_snapshot(size);
        let before_list = c.bins[c.bin_index(size).unwrap()].cached_blocks();

        // get followed by put of the same block restores accounting and
        // list contents exactly.
        let CacheGet::Hit(got) = c.get(size).0 else {
            panic!("expected hit")
        };
        assert!(c.put(got).0.is_none());

        assert_eq!(c.class_snapshot(size), before_snapshot);
        assert_eq!(
            c.bins[c.bin_index(size).unwrap()].cached_blocks(),
            before_list
        );

        for _ in 0..2 {
            assert!(matches!(c.get(size).0, CacheGet::Hit(_)));
        }
        drop_block(a);
        drop_block(b);
    }

    #[test]
    fn test_cache_miss_calibrates_threshold() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = cache();
        let size = 24 * 1024;
        let idx = c.bin_index(size).unwrap();
        prime_class(&c, size);

        assert_eq!(c.bins[idx].age_threshold(), 0);
        c.advance_clock(100);
        // A miss on a class with a recorded low-water mark doubles the gap
        // since that cleanup time.
        assert!(matches!(c.get(size).0, CacheGet::Miss));
        assert!(c.bins[idx].age_threshold() > 0);
        c.rollback(size);
        assert_eq!(c.class_snapshot(size), (0, 0));
    }

    #[test]
    fn test_cache_rollback_restores_accounting() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = cache();
        let size = 40 * 1024;

        assert!(matches!(c.get(size).0, CacheGet::Miss));
        assert_eq!(c.class_snapshot(size), (size, 0));
        c.rollback(size);
        assert_eq!(c.class_snapshot(size), (0, 0));
    }

    #[test]
    fn test_cache_regular_cleanup_evicts_aged_entries() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = cache();
        let size = 48 * 1024;
        prime_class(&c, size);

        c.advance_clock(16);
        // Calibrate the threshold with a miss, then cache two blocks.
        assert!(matches!(c.get(size).0, CacheGet::Miss));
        assert!(matches!(c.get(size).0, CacheGet::Miss));
        let a = fake_block(size);
        let b = fake_block(size);
        assert!(c.put(a).0.is_none());
        assert!(c.put(b).0.is_none());
        let threshold = c.bins[c.bin_index(size).unwrap()].age_threshold();
        assert!(threshold > 0);

        // Age the entries past the threshold and run a cleanup directly.
        c.advance_clock(threshold + 100);
        let now = c.clock.load(Ordering::Relaxed);
        let mut evicted = c.regular_cleanup(now);

        let mut count = 0;
        while let Some(block) = evicted.pop() {
            // Safety: Test code.
            let age = unsafe { block.as_ref().age };
            assert!(now - age > threshold);
            count += 1;
        }
        assert_eq!(count, 2, "both aged entries must be evicted");
        assert_eq!(c.class_snapshot(size), (0, 0));

        drop_block(a);
        drop_block(b);
    }

    #[test]
    fn test_cache_clean_all_empties_every_bin() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let c = cache();
        for &size in &[16 * 1024, 64 * 1024, 256 * 1024] {
            prime_class(&c, size);
            assert!(matches!(c.get(size).0, CacheGet::Miss));
            let b = fake_block(size);
            assert!(c.put(b).0.is_none());
        }
        assert!(c.cached_bytes() > 0);

        let mut evicted = c.clean_all();
        assert_eq!(c.cached_bytes(), 0);
        while let Some(b) = evicted.pop() {
            drop_block(b);
        }
    }
}
