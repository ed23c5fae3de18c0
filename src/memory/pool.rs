use super::backend::Backend;
use super::backref::BackRefTable;
use super::block::{AllBlocksList, EvictedList, LargeBlockHeader, LargeObjectHandle, payload_for};
use super::cache::{CacheGet, LargeObjectCache};
use super::raw::{MemError, PlatformRaw, RawMemory};
use super::stats;
use crate::sync::{Arc, Mutex};
use std::ptr::NonNull;

/// Configuration for [`LargePool`]. All fields have sensible defaults; the
/// size-class spacing and cached-size bounds are tuning parameters for the
/// target workload rather than fixed law.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Size-class spacing of the large object cache. Default: 8 KB.
    pub cache_step: usize,

    /// Smallest allocation the cache serves; below this, requests go
    /// straight to the backend. Default: 8 KB.
    pub min_cached_size: usize,

    /// Largest allocation the cache serves. Default: 8 MB.
    pub max_cached_size: usize,

    /// Cache operations between periodic cleanups. Must be a power of two.
    /// Default: 1024.
    pub cleanup_period: u64,

    /// Consecutive over-caching cleanup cycles (cached > 2x used) before
    /// eviction thresholds start decaying. Default: 4.
    pub overcache_tolerance: u32,

    /// Fixed slab block size served to an external small-object front end.
    /// Must be a power of two. Default: 16 KB.
    pub slab_block_size: usize,

    /// Minimum bytes requested from the raw callback per region. Default:
    /// 1 MB.
    pub min_region_size: usize,

    /// Threads allowed to extend memory from the OS simultaneously.
    /// Default: 2.
    pub max_os_extensions: usize,

    /// Never return fully-free regions to the OS before teardown.
    /// Default: false.
    pub keep_all_memory: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cache_step: 8 * 1024,
            min_cached_size: 8 * 1024,
            max_cached_size: 8 * 1024 * 1024,
            cleanup_period: 1024,
            overcache_tolerance: 4,
            slab_block_size: 16 * 1024,
            min_region_size: 1024 * 1024,
            max_os_extensions: 2,
            keep_all_memory: false,
        }
    }
}

/// Snapshot of a pool's memory accounting. Per-bin numbers are summed
/// without a global lock, so the totals are best-effort.
#[derive(Clone, Debug)]
pub struct PoolStats {
    /// Bytes currently obtained from the raw callback (all pools).
    pub total_from_os: usize,
    /// Live regions owned by this pool's backend.
    pub region_count: usize,
    /// Bytes sitting in this pool's cache free lists.
    pub cache_cached_bytes: usize,
    /// Bytes this pool's cache has handed out to callers.
    pub cache_used_bytes: usize,
    /// Blocks parked on pending-coalescing queues (all pools).
    pub pending_coalesce: usize,
}

/// Owner of the large-allocation subsystem: the cache, the region backend,
/// the pointer-validity table and the list of live blocks. All shared state
/// is owned here and handed into operations — nothing is process-global.
///
/// Allocation first tries the cache; a miss falls through to the backend,
/// which may extend memory from the raw callback. A free is offered to the
/// cache; if the cache declines, the block coalesces back into its region.
pub struct LargePool {
    backend: Backend,
    cache: LargeObjectCache,
    backrefs: BackRefTable,
    all_blocks: Mutex<AllBlocksList>,
    config: PoolConfig,
}

impl LargePool {
    /// Create a pool with default configuration on the platform VM API.
    ///
    /// # Errors
    ///
    /// Returns `MemError` if the configuration is invalid.
    pub fn new() -> Result<Self, MemError> {
        Self::with_raw(PoolConfig::default(), Arc::new(PlatformRaw))
    }

    /// Create a pool with custom configuration on the platform VM API.
    ///
    /// # Errors
    ///
    /// Returns `MemError` if the configuration is invalid.
    pub fn with_config(config: PoolConfig) -> Result<Self, MemError> {
        Self::with_raw(config, Arc::new(PlatformRaw))
    }

    /// Create a pool on a caller-supplied raw allocate/free callback pair.
    ///
    /// # Errors
    ///
    /// Returns `MemError` if the configuration is invalid.
    pub fn with_raw(config: PoolConfig, raw: Arc<dyn RawMemory>) -> Result<Self, MemError> {
        let cache = LargeObjectCache::new(
            config.cache_step,
            config.min_cached_size,
            config.max_cached_size,
            config.cleanup_period,
            config.overcache_tolerance,
        )?;
        let backend = Backend::new(
            raw.clone(),
            config.min_region_size,
            config.slab_block_size,
            config.max_os_extensions,
            config.keep_all_memory,
        )?;
        Ok(Self {
            backend,
            cache,
            backrefs: BackRefTable::new(raw),
            all_blocks: Mutex::new(AllBlocksList::new()),
            config,
        })
    }

    /// Allocate `size` bytes. The returned pointer is 64-byte aligned.
    ///
    /// # Errors
    ///
    /// Fails only when the raw allocate callback cannot supply memory; all
    /// optimistic bookkeeping is rolled back in that case.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, MemError> {
        let need = payload_for(size);
        let aligned = self.cache.aligned_size(need);

        let (outcome, evicted) = self.cache.get(aligned);
        self.destroy_chain(evicted);

        match outcome {
            CacheGet::Hit(block) => Ok(self.publish(block, size)),
            CacheGet::Miss => match self.create_block(aligned) {
                Ok(block) => Ok(self.publish(block, size)),
                Err(e) => {
                    // The recorded miss bumped the bin's used bytes; undo it
                    // so the accounting invariants survive the failure.
                    self.cache.rollback(aligned);
                    Err(e)
                }
            },
            CacheGet::Bypass => {
                let block = self.create_block(need)?;
                Ok(self.publish(block, size))
            }
        }
    }

    /// Free a pointer previously returned by [`alloc`](Self::alloc).
    ///
    /// The pointer is validated through the backref table before anything
    /// is trusted; pointers the pool never handed out are rejected (with a
    /// panic in debug builds).
    ///
    /// # Safety
    /// - `ptr` must have been returned by `alloc` on this pool.
    /// - `ptr` must not have been freed already.
    /// - The memory must not be accessed after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let handle_ptr =
            (ptr.as_ptr() as usize - size_of::<LargeObjectHandle>()) as *const LargeObjectHandle;
        // Safety: alloc placed a handle directly below the user pointer.
        let handle = unsafe { std::ptr::read(handle_ptr) };

        let block = NonNull::new(handle.block);
        let valid = match block {
            Some(b) => self.backrefs.resolve(handle.backref) == Some(b.cast()),
            None => false,
        };
        if !valid {
            debug_assert!(false, "pointer {ptr:p} was not allocated by this pool");
            return;
        }
        let block = block.expect("validated above");

        let (declined, evicted) = self.cache.put(block);
        if let Some(block) = declined {
            self.destroy_block(block);
        }
        self.destroy_chain(evicted);
    }

    /// Obtain `count` contiguous fixed-size slab blocks for an external
    /// small-object front end. The pointer is aligned to the configured
    /// slab block size.
    ///
    /// # Errors
    ///
    /// Fails only when the raw allocate callback cannot supply memory.
    pub fn alloc_slab(&self, count: usize) -> Result<NonNull<u8>, MemError> {
        self.backend.get_slab_block(count)
    }

    /// Return slab blocks obtained from [`alloc_slab`](Self::alloc_slab).
    ///
    /// # Safety
    /// - `ptr`/`count` must match a prior `alloc_slab` call on this pool.
    /// - The blocks must not be accessed after this call.
    pub unsafe fn free_slab(&self, ptr: NonNull<u8>, count: usize) {
        // Safety: forwarded contract.
        unsafe { self.backend.put_slab_block(ptr, count) };
    }

    /// Drop every cached block and retry parked coalescing, returning as
    /// much memory as possible to the OS (unless the pool retains memory).
    pub fn trim(&self) {
        let evicted = self.cache.clean_all();
        self.destroy_chain(evicted);
        self.backend.drain_pending();
    }

    /// Tear down every allocation at once, cached or live, returning all
    /// regions to the OS regardless of the retention setting.
    ///
    /// # Safety
    /// Every pointer previously returned by this pool becomes invalid.
    pub unsafe fn reset(&mut self) {
        let evicted = self.cache.clean_all();
        self.destroy_chain(evicted);
        self.release_live_blocks();

        // Accounting for the destroyed live blocks never went through the
        // cache; rebuild it fresh (geometry was validated at construction).
        stats::CACHE_USED_BYTES.sub(self.cache.used_bytes());
        self.cache = LargeObjectCache::new(
            self.config.cache_step,
            self.config.min_cached_size,
            self.config.max_cached_size,
            self.config.cleanup_period,
            self.config.overcache_tolerance,
        )
        .expect("geometry already validated");
        self.backend.drain_pending();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_from_os: stats::TOTAL_FROM_OS.get(),
            region_count: self.backend.region_count(),
            cache_cached_bytes: self.cache.cached_bytes(),
            cache_used_bytes: self.cache.used_bytes(),
            pending_coalesce: stats::PENDING_COALESCE.get(),
        }
    }

    /// (used, cached) bytes of the size class that serves `size`-byte
    /// allocations. Best-effort snapshot for diagnostics and tests.
    pub fn class_accounting(&self, size: usize) -> (usize, usize) {
        let aligned = self.cache.aligned_size(payload_for(size));
        self.cache.class_snapshot(aligned)
    }

    /// Create a fresh block from the backend: memory, backref tag, global
    /// list membership. `account_size` is the size-class-rounded span the
    /// cache accounts this block under.
    fn create_block(&self, account_size: usize) -> Result<NonNull<LargeBlockHeader>, MemError> {
        let (payload, _granted) = self.backend.get_large_block(account_size)?;
        let header = payload.cast::<LargeBlockHeader>();

        let tag = match self.backrefs.new_tag(true) {
            Ok(tag) => tag,
            Err(e) => {
                // No tag, no block: hand the memory straight back.
                // Safety: the block was just granted and is untouched.
                unsafe { self.backend.put_large_block(header) };
                return Err(e);
            }
        };

        // Safety: the payload spans at least `account_size` bytes, which
        // covers the header.
        unsafe {
            std::ptr::write(
                header.as_ptr(),
                LargeBlockHeader {
                    next: std::ptr::null_mut(),
                    prev: std::ptr::null_mut(),
                    global_next: std::ptr::null_mut(),
                    global_prev: std::ptr::null_mut(),
                    unaligned_size: account_size,
                    object_size: 0,
                    age: 0,
                    backref: tag,
                },
            );
            self.backrefs.set(tag, header.cast());
            self.all_blocks.lock().unwrap().push(header);
        }
        Ok(header)
    }

    /// Stamp a block with its new object size and handle, returning the
    /// user pointer.
    fn publish(&self, block: NonNull<LargeBlockHeader>, object_size: usize) -> NonNull<u8> {
        // Safety: the block is exclusively ours between cache/backend and
        // the caller; its span covers header, handle and object.
        unsafe {
            (*block.as_ptr()).object_size = object_size;
            let object = LargeBlockHeader::object_ptr(block);
            let handle = (object.as_ptr() as usize - size_of::<LargeObjectHandle>())
                as *mut LargeObjectHandle;
            std::ptr::write(
                handle,
                LargeObjectHandle {
                    block: block.as_ptr(),
                    backref: block.as_ref().backref,
                },
            );
            object
        }
    }

    /// Destroy a block the cache declined or evicted: unlink it from the
    /// live list, drop its backref tag, and let the backend coalesce it.
    fn destroy_block(&self, block: NonNull<LargeBlockHeader>) {
        // Safety: the block was created by `create_block` and is unlinked
        // from any cache bin.
        unsafe {
            self.all_blocks.lock().unwrap().remove(block);
            self.backrefs.remove(block.as_ref().backref);
            self.backend.put_large_block(block);
        }
    }

    fn destroy_chain(&self, mut evicted: EvictedList) {
        while let Some(block) = evicted.pop() {
            self.destroy_block(block);
        }
    }

    /// Return every block still on the live list to the backend (teardown
    /// and reset paths; outstanding pointers become invalid).
    fn release_live_blocks(&self) {
        loop {
            let block = self.all_blocks.lock().unwrap().pop();
            let Some(block) = block else { break };
            // Safety: blocks on the live list are valid headers.
            unsafe {
                self.backrefs.remove(block.as_ref().backref);
                self.backend.put_large_block(block);
            }
        }
    }
}

impl Drop for LargePool {
    fn drop(&mut self) {
        let evicted = self.cache.clean_all();
        self.destroy_chain(evicted);
        self.release_live_blocks();
        stats::CACHE_USED_BYTES.sub(self.cache.used_bytes());
        // Backend and backref table drops release the remaining regions and
        // slot blocks through the raw callback.
    }
}
