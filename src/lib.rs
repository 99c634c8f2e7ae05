#[cfg(not(target_pointer_width = "64"))]
compile_error!("tagheap supports only 64-bit targets.");

// public module: contains implementation details (hidden via pub(crate))
pub mod heap;

// allocator + configuration
pub use heap::allocator::{Heap, HeapConfig, HeapError, Tunable};
pub use heap::allocator::{
    DEFAULT_MAX_FAST, DEFAULT_MMAP_MAX, DEFAULT_MMAP_THRESHOLD, DEFAULT_TOP_PAD,
    DEFAULT_TRIM_THRESHOLD,
};
#[cfg(unix)]
pub use heap::allocator::GlobalHeap;

// system memory interface
pub use heap::system::{ArenaMemory, CoreMemory, SysError};
#[cfg(unix)]
pub use heap::system::PlatformMemory;

// statistics
pub use heap::stats::HeapStats;
