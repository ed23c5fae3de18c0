use super::bitmask::BinBitMask;
use super::block::LargeBlockHeader;
use super::raw::{MemError, RawMemory};
use super::stats;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex, hint, thread};
use std::ptr::NonNull;

// Block states live inside backend-owned memory, overlaid onto raw-callback
// spans. loom's atomic types carry model-checker state and cannot be placed
// in foreign memory, so these are std atomics; the backend's cross-thread
// claiming protocol is exercised by threaded tests rather than loom models.
use std::sync::atomic::AtomicUsize as StateCell;

/// Smallest carvable block. Must hold a `FreeBlock` when free.
const MIN_BLOCK_SIZE: usize = 64;
/// Power-of-two-stepped free-block bins: coarser granularity than the cache.
const NUM_BACKEND_BINS: usize = 32;

/// In a bin's free list, up for grabs.
const STATE_FREE: usize = 0;
/// Handed out to the cache or a caller.
const STATE_USED: usize = 1;
/// Mid-transition: being carved by an allocation or absorbed by a merge.
const STATE_CLAIMED: usize = 2;
/// Parked on the pending-coalescing queue.
const STATE_PENDING: usize = 3;

/// Boundary bookkeeping at the start of every block, free or used.
///
/// `size` and `left_size` are only mutated under the backend's structure
/// lock, which serializes all split/merge surgery; `state` is the only field
/// touched concurrently (claim CAS from the bin scan path).
#[repr(C)]
struct BlockTag {
    /// Whole block size, tag included.
    size: usize,
    /// Size of the left physical neighbor; zero for a region's first block.
    left_size: usize,
    state: StateCell,
    region: *mut Region,
}

const BLOCK_TAG_SIZE: usize = size_of::<BlockTag>();

/// A free block: the tag plus intrusive links for its size bin.
#[repr(C)]
struct FreeBlock {
    tag: BlockTag,
    next: *mut FreeBlock,
    prev: *mut FreeBlock,
}

/// A contiguous span obtained in one raw-allocate call, subdivided into
/// blocks. Released as a whole once its payload has coalesced back into a
/// single free span (or kept until teardown when the pool retains memory).
#[repr(C)]
struct Region {
    next: *mut Region,
    prev: *mut Region,
    /// Bytes obtained from the raw callback, this header included.
    total_size: usize,
    /// Carvable bytes following the header.
    payload_size: usize,
}

/// Header slot at the front of each region; padded so the payload starts
/// 64-byte aligned.
const REGION_HEADER_SIZE: usize = 64;

const _: () = assert!(size_of::<Region>() <= REGION_HEADER_SIZE);
const _: () = assert!(size_of::<FreeBlock>() <= MIN_BLOCK_SIZE);

#[inline]
fn round8(v: usize) -> usize {
    v.next_multiple_of(8)
}

/// Bin index for a block size: one bin per power of two from 64 bytes up.
#[inline]
fn bin_of(size: usize) -> usize {
    debug_assert!(size >= MIN_BLOCK_SIZE);
    let log2 = usize::BITS as usize - 1 - size.leading_zeros() as usize;
    (log2 - 6).min(NUM_BACKEND_BINS - 1)
}

struct FreeList {
    head: *mut FreeBlock,
}

// Safety: the list only holds pointers into backend-owned regions and is
// always accessed under its bin lock.
unsafe impl Send for FreeList {}

struct RegionList {
    head: *mut Region,
}

// Safety: same ownership argument as FreeList, under the region-list lock.
unsafe impl Send for RegionList {}

impl RegionList {
    /// # Safety
    /// `region` must be a valid, unlinked region header.
    unsafe fn push(&mut self, region: NonNull<Region>) {
        let r = region.as_ptr();
        // Safety: caller guarantees validity; head is valid or null.
        unsafe {
            (*r).prev = std::ptr::null_mut();
            (*r).next = self.head;
            if let Some(head) = self.head.as_mut() {
                head.prev = r;
            }
        }
        self.head = r;
    }

    /// # Safety
    /// `region` must currently be linked into this list.
    unsafe fn remove(&mut self, region: NonNull<Region>) {
        let r = region.as_ptr();
        // Safety: caller guarantees membership.
        unsafe {
            let prev = (*r).prev;
            let next = (*r).next;
            if let Some(prev) = prev.as_mut() {
                prev.next = next;
            } else {
                self.head = next;
            }
            if let Some(next) = next.as_mut() {
                next.prev = prev;
            }
        }
    }

    fn pop(&mut self) -> Option<NonNull<Region>> {
        let head = NonNull::new(self.head)?;
        // Safety: head is linked by construction.
        unsafe { self.remove(head) };
        Some(head)
    }

    fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(r) = NonNull::new(cur) {
            n += 1;
            // Safety: links valid under the region-list lock.
            cur = unsafe { r.as_ref().next };
        }
        n
    }
}

/// Blocks whose coalescing lost a race against a mid-transition neighbor,
/// parked for an opportunistic retry. A plain intrusive work queue (linked
/// through `FreeBlock::next`) rather than recursion, so worst-case stack
/// depth stays bounded.
struct PendingQueue {
    head: Mutex<FreeList>,
}

impl PendingQueue {
    fn new() -> Self {
        Self {
            head: Mutex::new(FreeList {
                head: std::ptr::null_mut(),
            }),
        }
    }

    /// # Safety
    /// `block` must be owned by the caller and in `STATE_PENDING`.
    unsafe fn push(&self, block: NonNull<FreeBlock>) {
        let mut q = self.head.lock().unwrap();
        // Safety: block is exclusively ours until drained.
        unsafe {
            (*block.as_ptr()).next = q.head;
        }
        q.head = block.as_ptr();
        stats::PENDING_COALESCE.add(1);
    }

    /// Detach the whole chain for processing.
    fn take_all(&self) -> *mut FreeBlock {
        let mut q = self.head.lock().unwrap();
        std::mem::replace(&mut q.head, std::ptr::null_mut())
    }
}

/// Outcome of trying to claim a physical neighbor during coalescing.
enum NeighborClaim {
    /// Claimed and unlinked; absorb it.
    Merged,
    /// In use or parked; leave it alone.
    Skip,
    /// Mid-transition on another thread; the whole put defers.
    Defer,
}

/// Owns memory regions obtained from the raw callback, carves them into
/// blocks, coalesces adjacent free blocks, and serves both fixed-size slab
/// blocks and variable-size large blocks.
pub(crate) struct Backend {
    raw: Arc<dyn RawMemory>,
    bins: [Mutex<FreeList>; NUM_BACKEND_BINS],
    mask: BinBitMask<1>,
    /// Serializes all split/merge boundary surgery. Ordering: structure
    /// lock before bin locks, never the reverse.
    structure: Mutex<()>,
    regions: Mutex<RegionList>,
    pending: PendingQueue,
    /// Bounded concurrency for raw-allocate calls: at most this many
    /// threads extend memory from the OS simultaneously.
    extend_permits: AtomicUsize,
    /// Bumped whenever a bin gains a block; extension waiters watch this
    /// and re-scan instead of mapping more memory.
    bin_mods: AtomicUsize,
    min_region_size: usize,
    slab_block_size: usize,
    keep_all_memory: bool,
}

// Safety: all interior raw pointers reference backend-owned region memory;
// the lock and claim protocol above governs every access.
unsafe impl Send for Backend {}
unsafe impl Sync for Backend {}

impl Backend {
    pub fn new(
        raw: Arc<dyn RawMemory>,
        min_region_size: usize,
        slab_block_size: usize,
        max_os_extensions: usize,
        keep_all_memory: bool,
    ) -> Result<Self, MemError> {
        if !slab_block_size.is_power_of_two() || slab_block_size < MIN_BLOCK_SIZE {
            return Err(MemError::InitializationFailed(format!(
                "slab block size {slab_block_size} must be a power of two >= {MIN_BLOCK_SIZE}"
            )));
        }
        if max_os_extensions == 0 {
            return Err(MemError::InitializationFailed(
                "at least one concurrent OS extension slot is required".to_string(),
            ));
        }
        Ok(Self {
            raw,
            bins: std::array::from_fn(|_| {
                Mutex::new(FreeList {
                    head: std::ptr::null_mut(),
                })
            }),
            mask: BinBitMask::new(),
            structure: Mutex::new(()),
            regions: Mutex::new(RegionList {
                head: std::ptr::null_mut(),
            }),
            pending: PendingQueue::new(),
            extend_permits: AtomicUsize::new(max_os_extensions),
            bin_mods: AtomicUsize::new(0),
            min_region_size,
            slab_block_size,
            keep_all_memory,
        })
    }

    // ------------------------------------------------------------------
    // get
    // ------------------------------------------------------------------

    /// Obtain a variable-size block with at least `payload` usable bytes.
    /// Returns the payload pointer and the granted payload size.
    pub fn get_large_block(&self, payload: usize) -> Result<(NonNull<u8>, usize), MemError> {
        self.get_block(payload, 8)
    }

    /// Obtain `count` contiguous slab blocks, aligned to the slab block
    /// size so a fixed-size front end can mask pointers down to block
    /// boundaries.
    pub fn get_slab_block(&self, count: usize) -> Result<NonNull<u8>, MemError> {
        debug_assert!(count > 0);
        let payload = count * self.slab_block_size;
        let (ptr, _granted) = self.get_block(payload, self.slab_block_size)?;
        debug_assert_eq!(ptr.as_ptr() as usize % self.slab_block_size, 0);
        Ok(ptr)
    }

    fn get_block(
        &self,
        payload: usize,
        payload_align: usize,
    ) -> Result<(NonNull<u8>, usize), MemError> {
        // Worst-case block size that guarantees an aligned carve succeeds.
        let exact = round8(BLOCK_TAG_SIZE + payload).max(MIN_BLOCK_SIZE);
        let needed = if payload_align > 8 {
            exact + payload_align + MIN_BLOCK_SIZE
        } else {
            exact
        };

        loop {
            // Retry parked coalescing first; it may return usable blocks.
            self.drain_pending();

            if let Some(block) = self.take_fit(needed) {
                return Ok(self.carve(block, payload, payload_align));
            }

            self.extend_for(needed)?;
            // Re-scan: the new span (or one freed by another thread) is in
            // the bins now, though another thread may steal it first.
        }
    }

    /// Scan the free-block bins for a block of at least `needed` bytes,
    /// claiming it out of its list. Uses the bitmask as a scan hint; the
    /// lists are authoritative.
    fn take_fit(&self, needed: usize) -> Option<NonNull<FreeBlock>> {
        let home = bin_of(needed);
        if let Some(block) = self.scan_bin(home, needed) {
            return Some(block);
        }
        // Blocks in any higher bin are at least one power of two bigger
        // than the home bin's floor, so the first claimable one fits.
        let mut from = home + 1;
        while let Some(idx) = self.mask.min_true_ge(from) {
            if let Some(block) = self.scan_bin(idx, needed) {
                return Some(block);
            }
            from = idx + 1;
        }
        None
    }

    fn scan_bin(&self, bin: usize, needed: usize) -> Option<NonNull<FreeBlock>> {
        let mut found = None;
        let mut now_empty = false;
        {
            let mut list = self.bins[bin].lock().unwrap();
            let mut cur = list.head;
            while let Some(block) = NonNull::new(cur) {
                // Safety: blocks stay linked while in the bin; we hold the
                // bin lock, so links are stable.
                let b = unsafe { block.as_ref() };
                if b.tag.size >= needed
                    && b.tag
                        .state
                        .compare_exchange(
                            STATE_FREE,
                            STATE_CLAIMED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    // Safety: claimed; unlink under the bin lock.
                    unsafe { Self::unlink_locked(&mut list, block) };
                    now_empty = list.head.is_null();
                    found = Some(block);
                    break;
                }
                cur = b.next;
            }
        }
        if now_empty {
            // Hint update outside the lock.
            self.mask.clear(bin);
        }
        found
    }

    /// # Safety
    /// `block` must be linked into `list`, whose lock is held.
    unsafe fn unlink_locked(list: &mut FreeList, block: NonNull<FreeBlock>) {
        // Safety: membership guaranteed by caller.
        unsafe {
            let b = block.as_ptr();
            let prev = (*b).prev;
            let next = (*b).next;
            if let Some(prev) = prev.as_mut() {
                prev.next = next;
            } else {
                list.head = next;
            }
            if let Some(next) = next.as_mut() {
                next.prev = prev;
            }
        }
    }

    /// Insert a block (already tagged, in `STATE_CLAIMED`) into its bin and
    /// publish it as free.
    fn insert_free(&self, block: NonNull<FreeBlock>) {
        // Safety: the block is exclusively ours until the state flips.
        let size = unsafe { block.as_ref().tag.size };
        let bin = bin_of(size);
        {
            let mut list = self.bins[bin].lock().unwrap();
            // Safety: link surgery under the bin lock.
            unsafe {
                let b = block.as_ptr();
                (*b).prev = std::ptr::null_mut();
                (*b).next = list.head;
                if let Some(head) = list.head.as_mut() {
                    head.prev = b;
                }
                list.head = b;
                (*b).tag.state.store(STATE_FREE, Ordering::Release);
            }
        }
        self.mask.set(bin);
        self.bin_mods.fetch_add(1, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // OS extension
    // ------------------------------------------------------------------

    fn try_acquire_permit(&self) -> bool {
        let mut cur = self.extend_permits.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.extend_permits.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Extend memory from the OS, throttled by the bounded permit count.
    /// A thread that cannot get a permit waits until either a slot frees or
    /// the bin-modification counter advances (memory appeared through
    /// another path), then returns so the caller re-scans before mapping.
    fn extend_for(&self, needed: usize) -> Result<(), MemError> {
        if !self.try_acquire_permit() {
            let seen = self.bin_mods.load(Ordering::Acquire);
            let mut spins = 0u32;
            loop {
                if self.bin_mods.load(Ordering::Acquire) != seen {
                    return Ok(());
                }
                if self.try_acquire_permit() {
                    break;
                }
                spins += 1;
                if spins < 64 {
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
        }
        let result = self.extend(needed);
        self.extend_permits.fetch_add(1, Ordering::Release);
        result
    }

    fn extend(&self, needed: usize) -> Result<(), MemError> {
        let payload = needed.max(self.min_region_size.saturating_sub(REGION_HEADER_SIZE));
        let total = (REGION_HEADER_SIZE + payload).next_multiple_of(4096);
        let payload = total - REGION_HEADER_SIZE;

        // Safety: total is non-zero.
        let mem = unsafe { self.raw.allocate(total)? };
        stats::TOTAL_FROM_OS.add(total);
        stats::REGION_COUNT.add(1);

        let region = mem.as_ptr().cast::<Region>();
        // Safety: the span is fresh, writable, and large enough.
        unsafe {
            std::ptr::write(
                region,
                Region {
                    next: std::ptr::null_mut(),
                    prev: std::ptr::null_mut(),
                    total_size: total,
                    payload_size: payload,
                },
            );
            self.regions
                .lock()
                .unwrap()
                .push(NonNull::new_unchecked(region));

            // Carve the whole payload into one free block.
            let start = mem.as_ptr() as usize + REGION_HEADER_SIZE;
            Self::write_tag(start, payload, 0, region, STATE_CLAIMED);
            self.insert_free(NonNull::new_unchecked(start as *mut FreeBlock));
        }
        Ok(())
    }

    /// # Safety
    /// `start` must be writable backend memory; the caller must hold the
    /// structure lock, or the block must not yet be discoverable.
    unsafe fn write_tag(start: usize, size: usize, left_size: usize, region: *mut Region, state: usize) {
        // Safety: upheld by caller.
        unsafe {
            std::ptr::write(
                start as *mut BlockTag,
                BlockTag {
                    size,
                    left_size,
                    state: StateCell::new(state),
                    region,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // carve (split)
    // ------------------------------------------------------------------

    /// Split a claimed block so that its payload starts `payload_align`ed,
    /// returning remainders to the bins. Trailing slack too small to stand
    /// alone is absorbed into the granted block.
    fn carve(
        &self,
        block: NonNull<FreeBlock>,
        payload: usize,
        payload_align: usize,
    ) -> (NonNull<u8>, usize) {
        let _guard = self.structure.lock().unwrap();

        // Safety: the block is claimed; size/left_size are stable under the
        // structure lock.
        let (total, left_orig, region) = unsafe {
            let b = block.as_ref();
            (b.tag.size, b.tag.left_size, b.tag.region)
        };
        let start = block.as_ptr() as usize;
        let end = start + total;

        // Position the payload: its block starts BLOCK_TAG_SIZE below the
        // aligned address, and any leading gap must be a standalone block.
        let mut payload_addr = (start + BLOCK_TAG_SIZE).next_multiple_of(payload_align);
        while payload_addr - BLOCK_TAG_SIZE != start
            && payload_addr - BLOCK_TAG_SIZE - start < MIN_BLOCK_SIZE
        {
            payload_addr += payload_align;
        }
        let new_start = payload_addr - BLOCK_TAG_SIZE;
        let needed = round8(BLOCK_TAG_SIZE + payload).max(MIN_BLOCK_SIZE);
        debug_assert!(new_start + needed <= end, "carve over-ran its block");

        let pre = new_start - start;
        let post = end - (new_start + needed);

        let left_for_used = if pre > 0 { pre } else { left_orig };
        let used_size = if post >= MIN_BLOCK_SIZE {
            needed
        } else {
            end - new_start
        };

        // Safety: all surgery below stays inside the claimed block, under
        // the structure lock.
        unsafe {
            if pre > 0 {
                Self::write_tag(start, pre, left_orig, region, STATE_CLAIMED);
            }
            if post >= MIN_BLOCK_SIZE {
                Self::write_tag(new_start + needed, post, used_size, region, STATE_CLAIMED);
            }
            Self::write_tag(new_start, used_size, left_for_used, region, STATE_USED);

            // The piece ending at `end` changed size; tell the block after.
            let last_piece = if post >= MIN_BLOCK_SIZE { post } else { used_size };
            self.set_left_size_after(region, end, last_piece);

            if pre > 0 {
                self.insert_free(NonNull::new_unchecked(start as *mut FreeBlock));
            }
            if post >= MIN_BLOCK_SIZE {
                self.insert_free(NonNull::new_unchecked((new_start + needed) as *mut FreeBlock));
            }

            (
                NonNull::new_unchecked(payload_addr as *mut u8),
                used_size - BLOCK_TAG_SIZE,
            )
        }
    }

    /// Update the left-neighbor size recorded by the block starting at
    /// `boundary`, if one exists in this region.
    ///
    /// # Safety
    /// Caller must hold the structure lock; `boundary` must be a block
    /// boundary of `region`.
    unsafe fn set_left_size_after(&self, region: *mut Region, boundary: usize, left_size: usize) {
        // Safety: region header is live while any of its blocks are.
        let payload_end = unsafe {
            region as usize + REGION_HEADER_SIZE + (*region).payload_size
        };
        debug_assert!(boundary <= payload_end);
        if boundary < payload_end {
            // Safety: a valid block tag starts at every interior boundary.
            unsafe {
                (*(boundary as *mut BlockTag)).left_size = left_size;
            }
        }
    }

    // ------------------------------------------------------------------
    // put (coalesce)
    // ------------------------------------------------------------------

    /// Return a large block to the backend. The header pointer is the
    /// payload start handed out by [`get_large_block`](Self::get_large_block).
    ///
    /// # Safety
    /// - `header` must be the exact payload pointer of a live large block.
    /// - The block must not be accessed after this call.
    pub unsafe fn put_large_block(&self, header: NonNull<LargeBlockHeader>) {
        self.drain_pending();
        let block = (header.as_ptr() as usize - BLOCK_TAG_SIZE) as *mut FreeBlock;
        // Safety: the payload pointer came from get_block, so the tag sits
        // directly below it.
        unsafe { self.coalesce_and_free(NonNull::new_unchecked(block)) };
    }

    /// Return slab blocks obtained from [`get_slab_block`](Self::get_slab_block).
    ///
    /// # Safety
    /// `ptr` must be the exact pointer returned by `get_slab_block`, not
    /// yet returned.
    pub unsafe fn put_slab_block(&self, ptr: NonNull<u8>, _count: usize) {
        self.drain_pending();
        let block = (ptr.as_ptr() as usize - BLOCK_TAG_SIZE) as *mut FreeBlock;
        // Safety: same layout argument as put_large_block.
        unsafe { self.coalesce_and_free(NonNull::new_unchecked(block)) };
    }

    /// Retry every parked block once.
    pub fn drain_pending(&self) {
        let mut cur = self.pending.take_all();
        while let Some(block) = NonNull::new(cur) {
            // Safety: the chain was detached whole; next is ours to read.
            cur = unsafe { block.as_ref().next };
            stats::PENDING_COALESCE.sub(1);
            // Safety: parked blocks are owned by the queue.
            unsafe { self.coalesce_and_free(block) };
        }
    }

    /// Try to claim and unlink the free block starting at `addr`.
    ///
    /// # Safety
    /// Caller must hold the structure lock; `addr` must be a block boundary.
    unsafe fn claim_neighbor(&self, addr: usize) -> NeighborClaim {
        let neighbor = addr as *mut FreeBlock;
        // Safety: a valid tag lives at every block boundary.
        let state = unsafe {
            (*neighbor).tag.state.compare_exchange(
                STATE_FREE,
                STATE_CLAIMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
        };
        match state {
            Ok(_) => {
                // Safety: claimed; stable size; unlink under its bin lock.
                unsafe {
                    let size = (*neighbor).tag.size;
                    let bin = bin_of(size);
                    let mut list = self.bins[bin].lock().unwrap();
                    Self::unlink_locked(&mut list, NonNull::new_unchecked(neighbor));
                }
                NeighborClaim::Merged
            }
            Err(STATE_USED) | Err(STATE_PENDING) => NeighborClaim::Skip,
            // STATE_CLAIMED: a concurrent carve or merge owns it right now.
            Err(_) => NeighborClaim::Defer,
        }
    }

    /// Merge `block` with free physical neighbors and either release the
    /// region (fully free) or bin the result. Defers onto the pending queue
    /// when a neighbor is mid-transition.
    ///
    /// # Safety
    /// `block` must be exclusively owned by the caller (freed by its user
    /// or popped off the pending queue) and carry a current tag.
    unsafe fn coalesce_and_free(&self, block: NonNull<FreeBlock>) {
        let guard = self.structure.lock().unwrap();

        // Safety: we own the block; fields are stable under the lock.
        let (mut size, mut left_size, region) = unsafe {
            let b = block.as_ref();
            #[cfg(debug_assertions)]
            {
                let state = b.tag.state.load(Ordering::Acquire);
                assert!(
                    state == STATE_USED || state == STATE_PENDING,
                    "block {block:p} returned twice or never handed out (state {state})",
                );
            }
            b.tag.state.store(STATE_CLAIMED, Ordering::Release);
            (b.tag.size, b.tag.left_size, b.tag.region)
        };
        let mut start = block.as_ptr() as usize;

        // Safety: region header outlives its blocks.
        let (payload_start, payload_size) = unsafe {
            (
                region as usize + REGION_HEADER_SIZE,
                (*region).payload_size,
            )
        };
        let payload_end = payload_start + payload_size;

        let mut deferred = false;

        if start > payload_start {
            debug_assert!(left_size > 0);
            let left = start - left_size;
            // Safety: structure lock held; `left` is a block boundary.
            match unsafe { self.claim_neighbor(left) } {
                NeighborClaim::Merged => {
                    // Safety: the left block is claimed and being absorbed.
                    let left_left = unsafe {
                        debug_assert_eq!((*(left as *mut BlockTag)).size, left_size);
                        (*(left as *mut BlockTag)).left_size
                    };
                    start = left;
                    size += left_size;
                    left_size = left_left;
                }
                NeighborClaim::Skip => {}
                NeighborClaim::Defer => deferred = true,
            }
        }

        if !deferred {
            let end = start + size;
            if end < payload_end {
                // Safety: structure lock held; `end` is a block boundary.
                match unsafe { self.claim_neighbor(end) } {
                    NeighborClaim::Merged => {
                        // Safety: right block claimed; its size is stable.
                        size += unsafe { (*(end as *mut BlockTag)).size };
                    }
                    NeighborClaim::Skip => {}
                    NeighborClaim::Defer => deferred = true,
                }
            }
        }

        if size == payload_size && !self.keep_all_memory {
            // Every block of the region coalesced back into one span.
            debug_assert!(!deferred);
            // Safety: region is linked until this removal.
            unsafe {
                self.regions
                    .lock()
                    .unwrap()
                    .remove(NonNull::new_unchecked(region));
            }
            // Safety: total_size matches the original raw allocation.
            let total = unsafe { (*region).total_size };
            drop(guard);
            // Safety: no live block references the region anymore.
            unsafe {
                drop(self.raw.free(NonNull::new_unchecked(region.cast()), total));
            }
            stats::TOTAL_FROM_OS.sub(total);
            stats::REGION_COUNT.sub(1);
            return;
        }

        // Safety: everything below mutates only the merged extent and its
        // right neighbor's boundary record, under the structure lock.
        unsafe {
            let state = if deferred { STATE_PENDING } else { STATE_CLAIMED };
            Self::write_tag(start, size, left_size, region, state);
            self.set_left_size_after(region, start + size, size);

            let merged = NonNull::new_unchecked(start as *mut FreeBlock);
            if deferred {
                drop(guard);
                self.pending.push(merged);
            } else {
                self.insert_free(merged);
            }
        }
    }

    // ------------------------------------------------------------------
    // introspection / teardown
    // ------------------------------------------------------------------

    pub fn region_count(&self) -> usize {
        self.regions.lock().unwrap().len()
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        let q = self.pending.head.lock().unwrap();
        let mut n = 0;
        let mut cur = q.head;
        while let Some(b) = NonNull::new(cur) {
            n += 1;
            // Safety: chain links are stable under the queue lock.
            cur = unsafe { b.as_ref().next };
        }
        n
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        // Teardown releases every region, retained or not. Callers must
        // have returned all live blocks first (the pool guarantees this).
        let mut regions = self.regions.lock().unwrap();
        while let Some(region) = regions.pop() {
            // Safety: region headers are valid until freed here.
            let total = unsafe { region.as_ref().total_size };
            // Safety: the region came from `raw` with this exact size.
            unsafe {
                drop(self.raw.free(region.cast(), total));
            }
            stats::TOTAL_FROM_OS.sub(total);
            stats::REGION_COUNT.sub(1);
        }
    }
}
