//! System memory interface.
//!
//! The allocator acquires memory two ways: by moving a contiguous break
//! forward (and occasionally backward, to give pages back), and by mapping
//! independent anonymous regions for requests past the mapping threshold.
//! Both are abstracted behind [`CoreMemory`] so a fresh allocator can be
//! instantiated over any primitive: the real process break on unix
//! ([`PlatformMemory`]), or a deterministic in-process arena
//! ([`ArenaMemory`]) for tests and fixed-buffer embedding.

use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum SysError {
    /// The break could not be moved by the requested amount.
    BreakFailed(io::Error),
    /// An anonymous mapping could not be created.
    MapFailed(io::Error),
    /// A mapping could not be returned.
    UnmapFailed(io::Error),
    /// A fixed arena ran out of room for the break.
    ArenaExhausted { requested: usize, available: usize },
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SysError::BreakFailed(e) => write!(f, "break adjustment failed: {e}"),
            SysError::MapFailed(e) => write!(f, "anonymous mapping failed: {e}"),
            SysError::UnmapFailed(e) => write!(f, "unmapping failed: {e}"),
            SysError::ArenaExhausted {
                requested,
                available,
            } => write!(
                f,
                "arena exhausted: requested {requested} bytes, {available} available"
            ),
        }
    }
}

impl std::error::Error for SysError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SysError::BreakFailed(e) | SysError::MapFailed(e) | SysError::UnmapFailed(e) => {
                Some(e)
            }
            SysError::ArenaExhausted { .. } => None,
        }
    }
}

/// Source of raw memory for an allocator instance.
///
/// `extend` follows break semantics: it moves the frontier by `delta` bytes
/// and returns the frontier's *previous* position, so `extend(0)` is a
/// pure query. Implementations may return more usable space than asked for
/// but never less on success.
pub trait CoreMemory {
    /// Move the contiguous frontier by `delta` bytes; returns the previous
    /// frontier address.
    fn extend(&mut self, delta: isize) -> Result<NonNull<u8>, SysError>;

    /// Create an anonymous zero-filled mapping of `len` bytes, aligned to
    /// the page size.
    fn map(&mut self, len: usize) -> Result<NonNull<u8>, SysError>;

    /// Return a mapping previously produced by [`map`](Self::map).
    ///
    /// # Safety
    /// `ptr`/`len` must describe exactly one live mapping from `map` and
    /// nothing may touch the region afterwards.
    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), SysError>;

    /// Granularity of the primitives above. Always a power of two.
    fn page_size(&self) -> usize;
}

/// The real process break and anonymous mappings.
///
/// Foreign break movement (the platform allocator, other libraries) is
/// tolerated by the caller's non-contiguity detection; this type makes no
/// attempt to hide it.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PlatformMemory;

#[cfg(unix)]
impl CoreMemory for PlatformMemory {
    fn extend(&mut self, delta: isize) -> Result<NonNull<u8>, SysError> {
        // Safety: FFI call to sbrk.
        let prev = unsafe { libc::sbrk(delta as libc::intptr_t) };
        if prev == usize::MAX as *mut libc::c_void {
            return Err(SysError::BreakFailed(io::Error::last_os_error()));
        }
        NonNull::new(prev.cast::<u8>())
            .ok_or_else(|| SysError::BreakFailed(io::Error::other("sbrk returned null")))
    }

    fn map(&mut self, len: usize) -> Result<NonNull<u8>, SysError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(SysError::MapFailed(io::Error::last_os_error()));
        }
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| SysError::MapFailed(io::Error::other("mmap returned null")))
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), SysError> {
        // Safety: FFI call to munmap; region validity is the caller's contract.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) } != 0 {
            return Err(SysError::UnmapFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        use std::sync::OnceLock;
        static CACHED: OnceLock<usize> = OnceLock::new();
        *CACHED.get_or_init(|| {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            assert!(
                raw > 0,
                "sysconf(_SC_PAGESIZE) failed: {}",
                io::Error::last_os_error()
            );
            raw as usize
        })
    }
}

/// Page granularity presented by [`ArenaMemory`].
const ARENA_PAGE: usize = 4096;

/// Deterministic [`CoreMemory`] over one fixed heap-backed region.
///
/// The break lives inside a single pre-allocated buffer; mappings are plain
/// heap allocations tracked so they can be reclaimed on drop. An optional
/// break limit below the capacity forces extension failures on demand,
/// which is how tests drive the allocator's mapping fallback and fencepost
/// paths.
pub struct ArenaMemory {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
    break_limit: usize,
    maps: Vec<(NonNull<u8>, usize)>,
    mapped_total: usize,
    map_limit: usize,
}

impl ArenaMemory {
    /// Arena with `capacity` bytes of break space (rounded up to the page
    /// granularity).
    ///
    /// # Panics
    /// Panics if the backing buffer cannot be allocated.
    pub fn new(capacity: usize) -> Self {
        let capacity = (capacity.max(1) + ARENA_PAGE - 1) & !(ARENA_PAGE - 1);
        let layout = std::alloc::Layout::from_size_align(capacity, ARENA_PAGE)
            .expect("arena capacity overflows a layout");
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).expect("arena backing allocation failed");
        Self {
            base,
            capacity,
            brk: 0,
            break_limit: capacity,
            maps: Vec::new(),
            mapped_total: 0,
            map_limit: usize::MAX,
        }
    }

    /// Arena whose break refuses to grow past `limit` bytes even though
    /// `capacity` bytes are reserved.
    pub fn with_break_limit(capacity: usize, limit: usize) -> Self {
        let mut arena = Self::new(capacity);
        arena.break_limit = limit.min(arena.capacity);
        arena
    }

    /// Cap the total bytes `map` may hand out. Zero refuses every mapping,
    /// which is how exhaustion of both acquisition paths is simulated.
    pub fn limit_mappings(mut self, total_bytes: usize) -> Self {
        self.map_limit = total_bytes;
        self
    }

    /// Start of the break region, for inspection.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Bytes of break space currently in use.
    pub fn break_used(&self) -> usize {
        self.brk
    }

    /// Live mappings handed out and not yet returned.
    pub fn live_mappings(&self) -> usize {
        self.maps.len()
    }
}

impl CoreMemory for ArenaMemory {
    fn extend(&mut self, delta: isize) -> Result<NonNull<u8>, SysError> {
        // Safety: brk never exceeds capacity.
        let prev = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) };
        if delta >= 0 {
            let delta = delta as usize;
            if self.brk + delta > self.break_limit {
                return Err(SysError::ArenaExhausted {
                    requested: delta,
                    available: self.break_limit - self.brk,
                });
            }
            self.brk += delta;
        } else {
            let back = delta.unsigned_abs();
            if back > self.brk {
                return Err(SysError::BreakFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "break shrink below arena base",
                )));
            }
            self.brk -= back;
        }
        Ok(prev)
    }

    fn map(&mut self, len: usize) -> Result<NonNull<u8>, SysError> {
        if self.mapped_total.saturating_add(len) > self.map_limit {
            return Err(SysError::MapFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "arena mapping budget exhausted",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(len, ARENA_PAGE)
            .map_err(|e| SysError::MapFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size (len comes page-rounded and > 0).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            SysError::MapFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "backing allocation failed",
            ))
        })?;
        self.maps.push((ptr, len));
        self.mapped_total += len;
        Ok(ptr)
    }

    unsafe fn unmap(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), SysError> {
        let pos = self
            .maps
            .iter()
            .position(|&(p, l)| p == ptr && l == len)
            .ok_or_else(|| {
                SysError::UnmapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unknown mapping",
                ))
            })?;
        self.maps.swap_remove(pos);
        let layout = std::alloc::Layout::from_size_align(len, ARENA_PAGE)
            .map_err(|e| SysError::UnmapFailed(io::Error::other(e)))?;
        // Safety: ptr was produced by map() with this exact layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size(&self) -> usize {
        ARENA_PAGE
    }
}

impl Drop for ArenaMemory {
    fn drop(&mut self) {
        // Safety: base was produced by alloc_zeroed with this layout; any
        // mappings left in the list are live and owned by the arena.
        unsafe {
            for (ptr, len) in self.maps.drain(..) {
                let layout = std::alloc::Layout::from_size_align_unchecked(len, ARENA_PAGE);
                std::alloc::dealloc(ptr.as_ptr(), layout);
            }
            let layout = std::alloc::Layout::from_size_align_unchecked(self.capacity, ARENA_PAGE);
            std::alloc::dealloc(self.base.as_ptr(), layout);
        }
    }
}

// Safety: the arena exclusively owns its buffer and mapping list.
unsafe impl Send for ArenaMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_break_semantics() {
        let mut arena = ArenaMemory::new(64 * 1024);
        let start = arena.extend(0).unwrap();

        // Positive delta returns the previous frontier.
        let prev = arena.extend(4096).unwrap();
        assert_eq!(prev, start);
        assert_eq!(arena.break_used(), 4096);
        // Safety: the 4096 bytes just extended are owned by us.
        unsafe {
            start.as_ptr().write(0xAB);
            assert_eq!(start.as_ptr().read(), 0xAB);
        }

        // Query does not move the frontier.
        let cur = arena.extend(0).unwrap();
        assert_eq!(cur.as_ptr() as usize, start.as_ptr() as usize + 4096);

        // Negative delta gives bytes back.
        arena.extend(-4096).unwrap();
        assert_eq!(arena.break_used(), 0);

        // Shrinking below the base is refused.
        assert!(arena.extend(-1).is_err());
    }

    #[test]
    fn arena_capacity_is_enforced() {
        let mut arena = ArenaMemory::new(8 * 1024);
        assert!(arena.extend(8 * 1024).is_ok());
        let err = arena.extend(1).unwrap_err();
        assert!(matches!(err, SysError::ArenaExhausted { .. }));
    }

    #[test]
    fn arena_break_limit_fails_early() {
        let mut arena = ArenaMemory::with_break_limit(64 * 1024, 4096);
        assert!(arena.extend(4096).is_ok());
        assert!(arena.extend(4096).is_err());
    }

    #[test]
    fn arena_mappings_round_trip() {
        let mut arena = ArenaMemory::new(4096);
        let m = arena.map(8192).unwrap();
        assert_eq!(m.as_ptr() as usize % ARENA_PAGE, 0);
        assert_eq!(arena.live_mappings(), 1);
        // Mapped memory is zero-filled.
        // Safety: the mapping is 8192 bytes.
        unsafe {
            assert_eq!(m.as_ptr().read(), 0);
            assert_eq!(m.as_ptr().add(8191).read(), 0);
        }
        // Safety: exactly the mapping returned above.
        unsafe { arena.unmap(m, 8192).unwrap() };
        assert_eq!(arena.live_mappings(), 0);
    }

    #[test]
    fn arena_unmap_rejects_unknown_region() {
        let mut arena = ArenaMemory::new(4096);
        let bogus = NonNull::new(ARENA_PAGE as *mut u8).unwrap();
        // Safety: the call must fail before touching the pointer.
        let err = unsafe { arena.unmap(bogus, 4096) }.unwrap_err();
        assert!(matches!(err, SysError::UnmapFailed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn platform_page_size_is_power_of_two() {
        let mem = PlatformMemory;
        let page = mem.page_size();
        assert!(page.is_power_of_two());
    }

    #[cfg(unix)]
    #[test]
    fn platform_map_round_trip() {
        let mut mem = PlatformMemory;
        let page = mem.page_size();
        let ptr = mem.map(page * 2).unwrap();
        // Safety: the mapping is page * 2 bytes and writable.
        unsafe {
            ptr.as_ptr().write(7);
            assert_eq!(ptr.as_ptr().read(), 7);
            mem.unmap(ptr, page * 2).unwrap();
        }
    }

    #[cfg(unix)]
    #[test]
    fn platform_break_query() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let mut mem = PlatformMemory;
        let a = mem.extend(0).unwrap();
        let b = mem.extend(0).unwrap();
        assert_eq!(a, b);
    }
}
