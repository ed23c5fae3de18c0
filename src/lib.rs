#[cfg(not(target_pointer_width = "64"))]
compile_error!("talus supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// pool surface
pub use memory::pool::{LargePool, PoolConfig, PoolStats};

// raw OS callback contract
pub use memory::raw::{MemError, PlatformRaw, RawMemory};
