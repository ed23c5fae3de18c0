use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum MemError {
    /// The raw allocate callback could not obtain memory from the OS.
    OsAllocFailed(std::io::Error),
    /// The raw free callback could not return memory to the OS.
    OsFreeFailed(std::io::Error),
    /// A fixed-size internal table ran out of slots.
    CapacityExhausted(&'static str),
    InitializationFailed(String),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OsAllocFailed(e) => write!(f, "raw allocation failed: {e}"),
            MemError::OsFreeFailed(e) => write!(f, "raw free failed: {e}"),
            MemError::CapacityExhausted(what) => write!(f, "{what} exhausted"),
            MemError::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for MemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemError::OsAllocFailed(e) | MemError::OsFreeFailed(e) => Some(e),
            MemError::CapacityExhausted(_) | MemError::InitializationFailed(_) => None,
        }
    }
}

/// The raw allocate/free callback pair through which the subsystem touches
/// the operating system. Supplied by the pool owner; everything else is
/// internal bookkeeping.
///
/// Returned memory must be page-aligned and zero-filled (anonymous mappings
/// give both for free).
pub trait RawMemory: Send + Sync {
    /// Obtain `size` bytes of readable/writable memory.
    ///
    /// # Safety
    /// `size` must be non-zero.
    unsafe fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemError>;

    /// Return a span previously obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// - `ptr`/`size` must exactly match a prior `allocate` call.
    /// - The span must not be accessed after this call.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MemError>;
}

/// Default [`RawMemory`] implementation backed by the platform VM API.
pub struct PlatformRaw;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{MemError, NonNull, PlatformRaw, RawMemory};
    use std::io;

    impl RawMemory for PlatformRaw {
        unsafe fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(MemError::OsAllocFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(MemError::OsAllocFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MemError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(MemError::OsFreeFailed(io::Error::last_os_error()));
            }
            Ok(())
        }
    }
}

#[cfg(all(windows, not(any(loom, miri))))]
mod windows {
    use super::{MemError, NonNull, PlatformRaw, RawMemory};
    use std::io;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc, VirtualFree,
    };

    impl RawMemory for PlatformRaw {
        unsafe fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(MemError::OsAllocFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn free(&self, ptr: NonNull<u8>, _size: usize) -> Result<(), MemError> {
            // MEM_RELEASE requires size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
                return Err(MemError::OsFreeFailed(io::Error::last_os_error()));
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed RawMemory (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler.  Instead every allocation is a
// plain zeroed heap block, which is sufficient for exercising the
// synchronization logic (loom) and the unsafe pointer code (Miri).
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl RawMemory for PlatformRaw {
    unsafe fn allocate(&self, size: usize) -> Result<NonNull<u8>, MemError> {
        if size == 0 {
            return Err(MemError::OsAllocFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size allocation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| MemError::OsAllocFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            MemError::OsAllocFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MemError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| MemError::OsFreeFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `allocate`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_free() {
        let raw = PlatformRaw;
        // Safety: Test code.
        unsafe {
            let ptr = raw.allocate(4096).expect("allocate failed");
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), 4096);
            slice[0] = 42;
            slice[4095] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[4095], 24);
            raw.free(ptr, 4096).expect("free failed");
        }
    }

    #[test]
    fn test_allocate_is_zeroed() {
        let raw = PlatformRaw;
        // Safety: Test code.
        unsafe {
            let ptr = raw.allocate(8192).expect("allocate failed");
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), 8192);
            assert!(slice.iter().all(|&b| b == 0), "fresh mapping not zeroed");
            raw.free(ptr, 8192).expect("free failed");
        }
    }

    #[test]
    fn test_allocate_page_aligned() {
        let raw = PlatformRaw;
        // Safety: Test code.
        unsafe {
            let ptr = raw.allocate(1024 * 1024).expect("allocate failed");
            assert_eq!(ptr.as_ptr() as usize % 4096, 0);
            raw.free(ptr, 1024 * 1024).expect("free failed");
        }
    }

    #[test]
    fn test_multiple_allocations_independent() {
        let raw = PlatformRaw;
        // Safety: Test code.
        unsafe {
            let p1 = raw.allocate(4096).unwrap();
            let p2 = raw.allocate(4096).unwrap();
            assert_ne!(p1, p2);

            *p1.as_ptr() = 1;
            *p2.as_ptr() = 2;
            assert_eq!(*p1.as_ptr(), 1);
            assert_eq!(*p2.as_ptr(), 2);

            raw.free(p1, 4096).unwrap();
            // p2 still valid after p1 is gone
            assert_eq!(*p2.as_ptr(), 2);
            raw.free(p2, 4096).unwrap();
        }
    }
}
