use super::raw::{MemError, RawMemory};
use super::stats;
use crate::sync::{Arc, Mutex};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

// Slots are overlaid onto raw-callback memory, so they must be plain-layout
// atomics. loom's atomic types carry model-checker state and cannot live in
// foreign memory; the table is therefore not modeled under loom (none of the
// loom tests exercise it) and uses std atomics directly.
use std::sync::atomic::{AtomicUsize, Ordering};

/// Entries per slot block. One slot block is one raw allocation.
const SLOTS_PER_BLOCK: usize = 1024;
const SLOT_BLOCK_BYTES: usize = SLOTS_PER_BLOCK * size_of::<usize>();
/// First-level capacity: up to 256 slot blocks, 262,144 live tags.
const MAX_SLOT_BLOCKS: usize = 256;

/// Opaque pointer-validity tag: a compact index into the two-level table.
///
/// Bit 30 records whether the tag belongs to a large block; the low bits are
/// the global slot index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct BackRefTag(u32);

const LARGE_BIT: u32 = 1 << 30;
const INDEX_MASK: u32 = (1 << 24) - 1;

impl BackRefTag {
    pub const INVALID: BackRefTag = BackRefTag(u32::MAX);

    fn new(index: u32, is_large: bool) -> Self {
        debug_assert!(index <= INDEX_MASK);
        Self(index | if is_large { LARGE_BIT } else { 0 })
    }

    #[inline]
    fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    #[inline]
    pub fn is_large(self) -> bool {
        self.0 != u32::MAX && self.0 & LARGE_BIT != 0
    }
}

struct TableGrowth {
    /// Slot blocks installed so far. Only grows.
    block_count: usize,
    /// Free slot indices, popped on `new_tag`, pushed back on `remove`.
    free: Vec<u32>,
    /// Live-slot tracking for double-remove detection.
    #[cfg(debug_assertions)]
    live: FixedBitSet,
}

/// Two-level arena mapping compact tags to header pointers.
///
/// Lookups are O(1) and never dereference untrusted memory: a tag is bounds-
/// checked against the installed blocks before the slot is read, so any raw
/// pointer can be validated as "ours" by comparing `resolve(tag)` with the
/// header address it claims to have.
///
/// Tag allocation takes the growth lock; `resolve` is lock-free.
pub(crate) struct BackRefTable {
    raw: Arc<dyn RawMemory>,
    /// First level: pointers to slot blocks, installed once, never moved.
    blocks: [std::sync::atomic::AtomicPtr<u8>; MAX_SLOT_BLOCKS],
    growth: Mutex<TableGrowth>,
}

// Safety: slot blocks are owned by the table; concurrent access goes through
// atomics and the growth lock.
unsafe impl Send for BackRefTable {}
unsafe impl Sync for BackRefTable {}

impl BackRefTable {
    pub fn new(raw: Arc<dyn RawMemory>) -> Self {
        Self {
            raw,
            blocks: std::array::from_fn(|_| {
                std::sync::atomic::AtomicPtr::new(std::ptr::null_mut())
            }),
            growth: Mutex::new(TableGrowth {
                block_count: 0,
                free: Vec::new(),
                #[cfg(debug_assertions)]
                live: FixedBitSet::new(),
            }),
        }
    }

    /// Allocate a slot. The slot resolves to null until [`set`](Self::set).
    ///
    /// # Errors
    ///
    /// Fails when a new slot block cannot be obtained from the raw callback,
    /// or when the first level is full.
    pub fn new_tag(&self, is_large: bool) -> Result<BackRefTag, MemError> {
        let mut g = self.growth.lock().unwrap();
        if g.free.is_empty() {
            if g.block_count == MAX_SLOT_BLOCKS {
                return Err(MemError::CapacityExhausted("backref table"));
            }
            // Safety: SLOT_BLOCK_BYTES is non-zero.
            let mem = unsafe { self.raw.allocate(SLOT_BLOCK_BYTES)? };
            stats::TOTAL_FROM_OS.add(SLOT_BLOCK_BYTES);

            let block = g.block_count;
            // Raw memory is zero-filled, which is exactly the all-null slot
            // state, so the block is publishable as-is.
            self.blocks[block].store(mem.as_ptr(), Ordering::Release);
            g.block_count += 1;

            let base = (block * SLOTS_PER_BLOCK) as u32;
            for i in (0..SLOTS_PER_BLOCK as u32).rev() {
                g.free.push(base + i);
            }
            #[cfg(debug_assertions)]
            {
                let live_len = g.block_count * SLOTS_PER_BLOCK;
                g.live.grow(live_len);
            }
        }

        let index = g.free.pop().expect("free list refilled above");
        #[cfg(debug_assertions)]
        {
            assert!(
                !g.live.contains(index as usize),
                "backref slot {index} handed out twice"
            );
            g.live.insert(index as usize);
        }
        Ok(BackRefTag::new(index, is_large))
    }

    fn slot(&self, tag: BackRefTag) -> Option<&AtomicUsize> {
        if tag == BackRefTag::INVALID {
            return None;
        }
        let index = tag.index();
        let block = index / SLOTS_PER_BLOCK;
        if block >= MAX_SLOT_BLOCKS {
            return None;
        }
        let base = self.blocks[block].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // Safety: base points to SLOT_BLOCK_BYTES of live, zero-initialized
        // table memory; the offset is within the block.
        Some(unsafe { &*base.cast::<AtomicUsize>().add(index % SLOTS_PER_BLOCK) })
    }

    /// Point `tag` at a block header.
    pub fn set(&self, tag: BackRefTag, header: NonNull<()>) {
        let Some(slot) = self.slot(tag) else {
            debug_assert!(false, "set on unallocated tag {tag:?}");
            return;
        };
        slot.store(header.as_ptr() as usize, Ordering::Release);
    }

    /// Recover the header pointer a tag refers to. Returns `None` for tags
    /// that were never allocated here, are out of bounds, or were removed —
    /// which is what makes arbitrary-pointer validation safe.
    pub fn resolve(&self, tag: BackRefTag) -> Option<NonNull<()>> {
        let slot = self.slot(tag)?;
        NonNull::new(slot.load(Ordering::Acquire) as *mut ())
    }

    /// Free a slot for reuse.
    pub fn remove(&self, tag: BackRefTag) {
        let Some(slot) = self.slot(tag) else {
            debug_assert!(false, "remove on unallocated tag {tag:?}");
            return;
        };
        slot.store(0, Ordering::Release);

        let mut g = self.growth.lock().unwrap();
        #[cfg(debug_assertions)]
        {
            assert!(
                g.live.contains(tag.index()),
                "double remove of backref tag {tag:?}"
            );
            g.live.set(tag.index(), false);
        }
        g.free.push(tag.index() as u32);
    }
}

impl Drop for BackRefTable {
    fn drop(&mut self) {
        let g = self.growth.lock().unwrap();
        for block in 0..g.block_count {
            let base = self.blocks[block].load(Ordering::Acquire);
            if let Some(ptr) = NonNull::new(base) {
                // Safety: the block was obtained from `raw` with this size.
                unsafe {
                    drop(self.raw.free(ptr, SLOT_BLOCK_BYTES));
                }
                stats::TOTAL_FROM_OS.sub(SLOT_BLOCK_BYTES);
            }
        }
    }
}
