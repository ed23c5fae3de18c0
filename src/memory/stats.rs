//! Diagnostic gauges. All counters use `Relaxed` ordering, so individual
//! values are eventually consistent and cross-counter snapshots may be
//! transiently out of step with each other. Readers clamp negative
//! transients to zero. Do NOT base allocation decisions on these values.

use crate::sync::atomic::{AtomicU64, Ordering};

/// Diagnostic-only gauge.
///
/// Subtract-before-add interleavings under contention can make the raw
/// signed value dip below zero; `get()` clamps.
pub struct Counter(AtomicU64);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(val as u64, Ordering::Relaxed);
    }

    /// Best-effort subtract. Saturates at zero on underflow instead of
    /// wrapping, since racing updates can momentarily over-subtract.
    #[inline]
    pub fn sub(&self, val: usize) {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_sub(val as u64);
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed) as usize
    }
}

// Bytes currently obtained from the raw allocate callback (regions plus
// backref slot blocks).
crate::sync::static_atomic! {
    pub static TOTAL_FROM_OS: Counter = Counter::new();
}

// Live region count across all pools.
crate::sync::static_atomic! {
    pub static REGION_COUNT: Counter = Counter::new();
}

// Bytes sitting in large-object cache free lists.
crate::sync::static_atomic! {
    pub static CACHE_CACHED_BYTES: Counter = Counter::new();
}

// Bytes handed out of the large-object cache to callers.
crate::sync::static_atomic! {
    pub static CACHE_USED_BYTES: Counter = Counter::new();
}

// Blocks parked on backend pending-coalescing queues.
crate::sync::static_atomic! {
    pub static PENDING_COALESCE: Counter = Counter::new();
}
