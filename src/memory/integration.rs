#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::pool::{LargePool, PoolConfig};
    use crate::memory::raw::{MemError, PlatformRaw, RawMemory};
    use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use crate::sync::{Arc, thread};
    use rand::Rng;
    use std::ptr::NonNull;

    /// Raw callback wrapper that counts calls and bytes, with a switchable
    /// failure mode for exercising the rollback paths.
    struct CountingRaw {
        inner: PlatformRaw,
        allocs: AtomicUsize,
        frees: AtomicUsize,
        alloc_bytes: AtomicUsize,
        free_bytes: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingRaw {
        fn new() -> Self {
            Self {
                inner: PlatformRaw,
                allocs: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
                alloc_bytes: AtomicUsize::new(0),
                free_bytes: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }

        fn allocs(&self) -> usize {
            self.allocs.load(Ordering::Relaxed)
        }
    }

    impl RawMemory for CountingRaw {
        unsafe fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(MemError::OsAllocFailed(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    "injected failure",
                )));
            }
            self.allocs.fetch_add(1, Ordering::Relaxed);
            self.alloc_bytes.fetch_add(size, Ordering::Relaxed);
            // Safety: forwarded contract.
            unsafe { self.inner.allocate(size) }
        }

        unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MemError> {
            self.frees.fetch_add(1, Ordering::Relaxed);
            self.free_bytes.fetch_add(size, Ordering::Relaxed);
            // Safety: forwarded contract.
            unsafe { self.inner.free(ptr, size) }
        }
    }

    #[test]
    fn test_second_batch_is_all_cache_hits() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let raw = Arc::new(CountingRaw::new());
        let pool = LargePool::with_raw(PoolConfig::default(), raw.clone()).unwrap();
        const SIZE: usize = 64 * 1024;
        const COUNT: usize = 1000;

        let mut ptrs = Vec::with_capacity(COUNT);
        for i in 0..COUNT {
            let p = pool.alloc(SIZE).unwrap();
            // Safety: Test code.
            unsafe { p.as_ptr().write(i as u8) };
            ptrs.push(p);
        }
        for p in ptrs.drain(..) {
            // Safety: Test code.
            unsafe { pool.free(p) };
        }

        let after_first_batch = raw.allocs();
        for _ in 0..COUNT {
            let p = pool.alloc(SIZE).unwrap();
            // Safety: Test code.
            unsafe { p.as_ptr().write(0xEE) };
            ptrs.push(p);
        }
        assert_eq!(
            raw.allocs(),
            after_first_batch,
            "the second batch must not trigger any raw-allocate call"
        );

        for p in ptrs {
            // Safety: Test code.
            unsafe { pool.free(p) };
        }
        drop(pool);
        assert_eq!(
            raw.allocs.load(Ordering::Relaxed),
            raw.frees.load(Ordering::Relaxed),
            "teardown must return every raw allocation"
        );
        assert_eq!(
            raw.alloc_bytes.load(Ordering::Relaxed),
            raw.free_bytes.load(Ordering::Relaxed),
        );
    }

    #[test]
    fn test_single_use_size_is_not_cached() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = LargePool::new().unwrap();
        const SIZE: usize = 100 * 1024;

        let p = pool.alloc(SIZE).unwrap();
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0x42, SIZE);
            pool.free(p);
        }

        assert_eq!(
            pool.class_accounting(SIZE),
            (0, 0),
            "a never-seen size must not be cached on its first free"
        );

        // The allocation path itself keeps working for that size.
        let p2 = pool.alloc(SIZE).unwrap();
        // Safety: Test code.
        unsafe { pool.free(p2) };
    }

    #[test]
    fn test_sustained_overcache_shrinks_below_twice_used() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = LargePool::with_config(PoolConfig {
            cleanup_period: 64,
            overcache_tolerance: 2,
            ..PoolConfig::default()
        })
        .unwrap();

        // Hold ~10 KB in use for the whole scenario.
        let held = pool.alloc(10 * 1024).unwrap();

        // Build up 30+ KB of cached blocks in another class.
        const BIG: usize = 20 * 1024;
        let warm = pool.alloc(BIG).unwrap();
        // Safety: Test code.
        unsafe { pool.free(warm) }; // low-water decline
        let batch: Vec<_> = (0..4).map(|_| pool.alloc(BIG).unwrap()).collect();
        for p in batch {
            // Safety: Test code.
            unsafe { pool.free(p) };
        }

        let stats = pool.stats();
        assert!(
            stats.cache_cached_bytes > 2 * stats.cache_used_bytes,
            "scenario precondition: cached {} must exceed twice used {}",
            stats.cache_cached_bytes,
            stats.cache_used_bytes,
        );

        // Drive cleanup cycles with light traffic on a third class until the
        // backpressure brings the ratio back down.
        let mut shrunk = false;
        for _ in 0..5000 {
            let p = pool.alloc(12 * 1024).unwrap();
            // Safety: Test code.
            unsafe { pool.free(p) };
            let stats = pool.stats();
            if stats.cache_cached_bytes <= 2 * stats.cache_used_bytes {
                shrunk = true;
                break;
            }
        }
        assert!(
            shrunk,
            "regular cleanup must shrink cached bytes below twice used bytes \
             within a bounded number of cycles"
        );

        // Safety: Test code.
        unsafe { pool.free(held) };
    }

    #[test]
    fn test_allocation_failure_rolls_back_accounting() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let raw = Arc::new(CountingRaw::new());
        // Tiny regions: every block gets its own region, so an empty bin
        // really does force the backend to call the raw allocator.
        let pool = LargePool::with_raw(
            PoolConfig {
                min_region_size: 4096,
                ..PoolConfig::default()
            },
            raw.clone(),
        )
        .unwrap();
        const SIZE: usize = 64 * 1024;

        raw.fail.store(true, Ordering::Relaxed);
        assert!(pool.alloc(SIZE).is_err());
        assert_eq!(
            pool.class_accounting(SIZE),
            (0, 0),
            "failed allocation must leave the class accounting untouched"
        );

        // And again with warm state: one cached block, then exhaust it.
        raw.fail.store(false, Ordering::Relaxed);
        let warm = pool.alloc(SIZE).unwrap();
        // Safety: Test code.
        unsafe { pool.free(warm) };
        let p1 = pool.alloc(SIZE).unwrap();
        // Safety: Test code.
        unsafe { pool.free(p1) };
        let cached_one = pool.class_accounting(SIZE);

        raw.fail.store(true, Ordering::Relaxed);
        let hit = pool.alloc(SIZE).unwrap(); // served from cache, no raw call
        let miss = pool.alloc(SIZE); // empty bin, backend fails
        assert!(miss.is_err());
        // Safety: Test code.
        unsafe { pool.free(hit) };
        assert_eq!(
            pool.class_accounting(SIZE),
            cached_one,
            "rollback must restore the exact pre-failure accounting"
        );
    }

    #[test]
    fn test_used_plus_cached_never_exceeds_os_bytes() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let pool = LargePool::new().unwrap();

        let mut live = Vec::new();
        for round in 0..6usize {
            for i in 1..=8usize {
                let size = 8 * 1024 * i + round * 1024;
                live.push(pool.alloc(size).unwrap());
            }
            // Free half each round so the cache fills up.
            for p in live.split_off(live.len() / 2) {
                // Safety: Test code.
                unsafe { pool.free(p) };
            }
            let stats = pool.stats();
            assert!(
                stats.cache_used_bytes + stats.cache_cached_bytes <= stats.total_from_os,
                "accounted bytes {} + {} must not exceed bytes from the OS {}",
                stats.cache_used_bytes,
                stats.cache_cached_bytes,
                stats.total_from_os,
            );
        }
        for p in live {
            // Safety: Test code.
            unsafe { pool.free(p) };
        }
    }

    #[test]
    fn test_mixed_slab_and_large_teardown_balance() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let raw = Arc::new(CountingRaw::new());
        {
            let pool = LargePool::with_raw(PoolConfig::default(), raw.clone()).unwrap();

            let mut large = Vec::new();
            let mut slabs = Vec::new();
            for i in 1..=24usize {
                large.push((pool.alloc(i * 7000).unwrap(), i * 7000));
                if i % 4 == 0 {
                    slabs.push((pool.alloc_slab(i / 4).unwrap(), i / 4));
                }
            }
            for (p, size) in &large {
                // Safety: Test code.
                unsafe { p.as_ptr().write_bytes(0x3C, *size) };
            }
            // Free only some; Drop must clean up the rest.
            for (p, _) in large.drain(..12) {
                // Safety: Test code.
                unsafe { pool.free(p) };
            }
            for (p, count) in slabs {
                // Safety: Test code.
                unsafe { pool.free_slab(p, count) };
            }
        }
        assert_eq!(
            raw.allocs.load(Ordering::Relaxed),
            raw.frees.load(Ordering::Relaxed),
            "pool teardown leaked raw allocations"
        );
        assert_eq!(
            raw.alloc_bytes.load(Ordering::Relaxed),
            raw.free_bytes.load(Ordering::Relaxed),
        );
    }

    #[test]
    fn test_threaded_alloc_free_integrity() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let raw = Arc::new(CountingRaw::new());
        let pool = Arc::new(LargePool::with_raw(PoolConfig::default(), raw.clone()).unwrap());
        let num_threads = 8u8;
        let iters = 120u32;
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads as usize));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut rng = rand::rng();
                    let mut live: Vec<(NonNull<u8>, u8)> = Vec::new();

                    barrier.wait();
                    for i in 0..iters {
                        let size = rng.random_range(8 * 1024..256 * 1024);
                        let ptr = pool.alloc(size).unwrap();
                        let fill = t.wrapping_mul(31).wrapping_add(i as u8);
                        // Safety: Test code.
                        unsafe {
                            ptr.as_ptr().write(fill);
                            ptr.as_ptr().add(size - 1).write(fill);
                        }
                        live.push((ptr, fill));

                        if live.len() > 8 {
                            let idx = rng.random_range(0..live.len());
                            let (p, expect) = live.swap_remove(idx);
                            // Safety: Test code.
                            unsafe {
                                assert_eq!(
                                    p.as_ptr().read(),
                                    expect,
                                    "contention corrupted thread {t}'s block"
                                );
                                pool.free(p);
                            }
                        }
                    }
                    for (p, expect) in live {
                        // Safety: Test code.
                        unsafe {
                            assert_eq!(p.as_ptr().read(), expect);
                            pool.free(p);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        drop(Arc::try_unwrap(pool).unwrap_or_else(|_| panic!("pool still shared after join")));
        assert_eq!(
            raw.allocs.load(Ordering::Relaxed),
            raw.frees.load(Ordering::Relaxed),
            "threaded churn leaked raw allocations"
        );
    }
}
