use super::backref::BackRefTag;
use std::ptr::NonNull;

/// Alignment of the pointer handed back to callers.
pub(crate) const LARGE_OBJECT_ALIGN: usize = 64;

/// Per-allocation metadata prepended to every large allocation. Lives at the
/// start of the span carved out by the backend; valid from creation until the
/// block is returned to the backend (after which the memory is reused for
/// free-block bookkeeping).
#[repr(C)]
pub(crate) struct LargeBlockHeader {
    /// Cache free-list links. While cached the block sits in exactly one
    /// cache bin's list (most-recently-freed at the head).
    pub next: *mut LargeBlockHeader,
    pub prev: *mut LargeBlockHeader,
    /// Links in the pool-wide list of all live large blocks, used for bulk
    /// teardown. Linked at creation, unlinked only at destruction.
    pub global_next: *mut LargeBlockHeader,
    pub global_prev: *mut LargeBlockHeader,
    /// Bytes this block accounts for, header and alignment padding included.
    pub unaligned_size: usize,
    /// Bytes the caller asked for.
    pub object_size: usize,
    /// Logical timestamp at the moment the block was cached.
    pub age: u64,
    /// Pointer-validity tag for this block.
    pub backref: BackRefTag,
}

/// Written immediately before the user pointer so that a bare pointer can be
/// routed back to its header. `backref` lets the pool verify the pointer is
/// one of ours before trusting `block`.
#[repr(C)]
pub(crate) struct LargeObjectHandle {
    pub block: *mut LargeBlockHeader,
    pub backref: BackRefTag,
}

/// Payload bytes a block must span to serve `object_size` user bytes: header,
/// handle, and worst-case padding to reach a 64-byte-aligned user pointer.
pub(crate) const fn payload_for(object_size: usize) -> usize {
    object_size + size_of::<LargeBlockHeader>() + size_of::<LargeObjectHandle>() + LARGE_OBJECT_ALIGN
}

impl LargeBlockHeader {
    /// User pointer for this block: 64-byte aligned, past header and handle.
    /// The handle sits in the padding gap directly below the user pointer.
    pub fn object_ptr(header: NonNull<LargeBlockHeader>) -> NonNull<u8> {
        let past_meta = header.as_ptr() as usize
            + size_of::<LargeBlockHeader>()
            + size_of::<LargeObjectHandle>();
        let aligned = past_meta.next_multiple_of(LARGE_OBJECT_ALIGN);
        // Safety: derived from a non-null header by adding a positive offset.
        unsafe { NonNull::new_unchecked(aligned as *mut u8) }
    }
}

/// Intrusive doubly-linked list of every live large block in a pool, linked
/// through `global_next`/`global_prev`. Callers guard it with the pool's own
/// lock; the list itself is plain pointer surgery.
pub(crate) struct AllBlocksList {
    head: *mut LargeBlockHeader,
}

// Safety: AllBlocksList only stores pointers into memory its pool owns; all
// access is serialized by the pool's lock.
unsafe impl Send for AllBlocksList {}

impl AllBlocksList {
    pub fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
        }
    }

    /// # Safety
    /// `block` must be a valid header not currently linked into any list.
    pub unsafe fn push(&mut self, block: NonNull<LargeBlockHeader>) {
        let b = block.as_ptr();
        // Safety: caller guarantees block validity; head is valid or null.
        unsafe {
            (*b).global_prev = std::ptr::null_mut();
            (*b).global_next = self.head;
            if let Some(head) = self.head.as_mut() {
                head.global_prev = b;
            }
        }
        self.head = b;
    }

    /// # Safety
    /// `block` must currently be linked into this list.
    pub unsafe fn remove(&mut self, block: NonNull<LargeBlockHeader>) {
        let b = block.as_ptr();
        // Safety: caller guarantees membership, so the links are valid.
        unsafe {
            let prev = (*b).global_prev;
            let next = (*b).global_next;
            if let Some(prev) = prev.as_mut() {
                prev.global_next = next;
            } else {
                debug_assert_eq!(self.head, b, "block not linked into this list");
                self.head = next;
            }
            if let Some(next) = next.as_mut() {
                next.global_prev = prev;
            }
            (*b).global_next = std::ptr::null_mut();
            (*b).global_prev = std::ptr::null_mut();
        }
    }

    /// Unlink and return the current head, for teardown loops.
    pub fn pop(&mut self) -> Option<NonNull<LargeBlockHeader>> {
        let head = NonNull::new(self.head)?;
        // Safety: head is linked by construction.
        unsafe { self.remove(head) };
        Some(head)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(b) = std::ptr::NonNull::new(cur) {
            n += 1;
            // Safety: list links are valid between push/remove calls.
            cur = unsafe { b.as_ref().global_next };
        }
        n
    }
}

/// Singly-linked chain of blocks evicted from the cache, linked through
/// `next`. Produced under a bin lock, consumed (handed to the backend)
/// after the lock is released.
pub(crate) struct EvictedList {
    head: *mut LargeBlockHeader,
}

// Safety: owns the evicted blocks until drained.
unsafe impl Send for EvictedList {}

impl EvictedList {
    pub fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// # Safety
    /// `block` must be unlinked from every other list.
    pub unsafe fn push(&mut self, block: NonNull<LargeBlockHeader>) {
        // Safety: caller guarantees exclusive ownership of the block.
        unsafe {
            (*block.as_ptr()).next = self.head;
            (*block.as_ptr()).prev = std::ptr::null_mut();
        }
        self.head = block.as_ptr();
    }

    pub fn pop(&mut self) -> Option<NonNull<LargeBlockHeader>> {
        let head = NonNull::new(self.head)?;
        // Safety: head was pushed by us and is valid.
        self.head = unsafe { head.as_ref().next };
        Some(head)
    }

    /// Append every block of `other` onto this chain.
    pub fn append(&mut self, mut other: EvictedList) {
        while let Some(b) = other.pop() {
            // Safety: popped blocks are exclusively ours.
            unsafe { self.push(b) };
        }
    }
}
