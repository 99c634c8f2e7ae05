//! The allocator proper.
//!
//! A [`Heap`] owns one boxed state record and a [`CoreMemory`] source. The
//! state carries the segregated free structure: eleven fast bins (LIFO
//! caches for recently freed small chunks), 96 normal bins behind the
//! occupancy binmap, the unsorted staging queue, and the top chunk at the
//! heap frontier. Allocation walks those tiers from cheapest to most
//! expensive; release either parks chunks in a fast bin or coalesces them
//! with physical neighbors before staging them in the unsorted queue.
//!
//! The state is single-threaded-cooperative: every entry point takes
//! `&mut self` and completes without suspension points. [`GlobalHeap`]
//! wraps one process-wide instance in a mutex, which is the intended
//! concurrency model; finer-grained locking is unsound because coalescing
//! crosses bins.

use std::fmt;
use std::ptr::NonNull;

use super::chunk::{
    unlink, ChunkRef, RawChunk, ALIGNMENT, ALIGN_MASK, MIN_CHUNK, MMAPPED, PREV_IN_USE, WORD,
};
use super::index::{
    fastbin_index, in_smallbin_range, largebin_index, request2size, smallbin_index, Binmap,
    BINMAP_SHIFT, BINMAP_WORDS, MAX_FAST_REQUEST, NBINS, NFASTBINS, SMALLBIN_WIDTH,
};
use super::stats::{HeapStats, HighWater};
use super::system::CoreMemory;
#[cfg(unix)]
use super::system::PlatformMemory;

pub const DEFAULT_MAX_FAST: usize = 64;
pub const DEFAULT_TRIM_THRESHOLD: usize = 256 * 1024;
pub const DEFAULT_TOP_PAD: usize = 0;
pub const DEFAULT_MMAP_THRESHOLD: usize = 256 * 1024;
pub const DEFAULT_MMAP_MAX: usize = 65536;

/// Merged-chunk size in `free` that triggers a fast-bin drain. Half the
/// default trim threshold: consolidation is only worth forcing when it is
/// likely to uncover trimmable space, but it also caps fragmentation around
/// large chunks, so it stays fixed rather than tracking the tunable.
const CONSOLIDATION_THRESHOLD: usize = DEFAULT_TRIM_THRESHOLD >> 1;

/// Minimum unit when an anonymous mapping stands in for a failed break
/// extension.
const MAP_AS_EXTENSION_UNIT: usize = 1024 * 1024;

// The two low bits of max_fast never matter for size comparisons (chunk
// sizes are 16-grained), so they double as state flags.
const ANYCHUNKS_BIT: usize = 1;
const FASTCHUNKS_BIT: usize = 2;
const FLAG_MASK: usize = ANYCHUNKS_BIT | FASTCHUNKS_BIT;

/// Why an allocation request could not be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// The padded request would wrap the integer range.
    RequestOverflow { requested: usize },
    /// The system refused both contiguous extension and anonymous mapping.
    Exhausted,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::RequestOverflow { requested } => {
                write!(f, "request of {requested} bytes overflows the size range")
            }
            HeapError::Exhausted => write!(f, "system memory exhausted"),
        }
    }
}

impl std::error::Error for HeapError {}

/// Runtime-adjustable parameters, applied through [`Heap::tune`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tunable {
    /// Upper bound (as a request size) for fast-bin eligibility. Bounded
    /// by a compile-time ceiling of 80 bytes; 0 disables fast bins.
    MaxFast,
    /// Top size beyond which `free` attempts to return pages.
    TrimThreshold,
    /// Extra bytes requested with every contiguous extension.
    TopPad,
    /// Request size at or above which allocations get their own mapping.
    MmapThreshold,
    /// Maximum number of simultaneous direct mappings.
    MmapMax,
}

/// Initial tunable values for a new heap. All fields default to the
/// classic values; see [`Heap::tune`] for runtime adjustment.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// Fast-bin eligibility bound as a request size. Clamped to the
    /// compile-time ceiling of 80.
    pub max_fast: usize,
    pub trim_threshold: usize,
    pub top_pad: usize,
    pub mmap_threshold: usize,
    pub mmap_max: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            max_fast: DEFAULT_MAX_FAST,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            top_pad: DEFAULT_TOP_PAD,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            mmap_max: DEFAULT_MMAP_MAX,
        }
    }
}

/// The allocator state record. Boxed by [`Heap`] so the bin sentinels have
/// stable addresses; every normal bin is a real chunk-shaped sentinel node
/// rather than an aliased slice of a pointer array.
struct State {
    /// Fast-bin eligibility bound (chunk size), low bits repurposed as the
    /// ANYCHUNKS/FASTCHUNKS flags.
    max_fast: usize,
    /// Singly-linked LIFO stacks of recently freed small chunks.
    fastbins: [*mut RawChunk; NFASTBINS],
    /// The wilderness chunk bordering the frontier. Points at the unsorted
    /// sentinel until the first extension, which makes it a legal
    /// zero-sized top.
    top: ChunkRef,
    /// Remainder of the most recent small-request split, kept for locality.
    last_remainder: *mut RawChunk,
    /// Sentinel nodes for the normal bins. Index 0 is unused, 1 is the
    /// unsorted queue, 2..=31 small, 32..=95 large.
    bins: [RawChunk; NBINS],
    binmap: Binmap,

    trim_threshold: usize,
    top_pad: usize,
    mmap_threshold: usize,

    n_mmaps: usize,
    n_mmaps_max: usize,

    pagesize: usize,
    /// Whether successive break extensions are expected to be adjacent.
    /// Learned pessimistically: cleared for good on the first surprise.
    contiguous: bool,

    mmapped_mem: usize,
    sbrked_mem: usize,
    max_sbrked_mem: HighWater,
    max_mmapped_mem: HighWater,
    max_total_mem: HighWater,
}

impl State {
    #[inline]
    fn max_fast(&self) -> usize {
        self.max_fast & !FLAG_MASK
    }

    #[inline]
    fn have_anychunks(&self) -> bool {
        self.max_fast & ANYCHUNKS_BIT != 0
    }

    #[inline]
    fn set_anychunks(&mut self) {
        self.max_fast |= ANYCHUNKS_BIT;
    }

    #[inline]
    fn have_fastchunks(&self) -> bool {
        self.max_fast & FASTCHUNKS_BIT != 0
    }

    #[inline]
    fn set_fastchunks(&mut self) {
        self.max_fast |= FASTCHUNKS_BIT | ANYCHUNKS_BIT;
    }

    #[inline]
    fn clear_fastchunks(&mut self) {
        self.max_fast &= !FASTCHUNKS_BIT;
    }

    fn set_max_fast(&mut self, request: usize) {
        let bound = if request == 0 {
            // Below the minimum chunk, so nothing ever qualifies.
            SMALLBIN_WIDTH
        } else {
            ((request + WORD + ALIGN_MASK) & !ALIGN_MASK).max(MIN_CHUNK)
        };
        self.max_fast = bound | (self.max_fast & FLAG_MASK);
    }
}

/// Sentinel node of normal bin `i`, viewed as a chunk.
///
/// # Safety
/// `st` must point at a live `State`; `1 <= i < NBINS`.
#[inline]
unsafe fn bin_at(st: *mut State, i: usize) -> ChunkRef {
    debug_assert!((1..NBINS).contains(&i));
    // Safety: in-bounds element of the bins array, which is chunk-shaped.
    unsafe { ChunkRef::from_base(std::ptr::addr_of_mut!((*st).bins[i]).cast()) }
}

/// A boundary-tagged heap over a caller-supplied memory source.
///
/// One instance services variable-sized requests from a contiguous region
/// extended on demand, direct-mapping requests past the mapping threshold.
/// All methods take `&mut self`; wrap the heap in a lock to share it (see
/// [`GlobalHeap`]).
pub struct Heap<M: CoreMemory> {
    st: NonNull<State>,
    mem: M,
}

// Safety: the heap exclusively owns its state record and all chunk memory
// reachable from it; the raw pointers never alias another heap.
unsafe impl<M: CoreMemory + Send> Send for Heap<M> {}

impl<M: CoreMemory> Drop for Heap<M> {
    fn drop(&mut self) {
        // Safety: st came from Box::into_raw in with_config.
        unsafe { drop(Box::from_raw(self.st.as_ptr())) };
    }
}

impl<M: CoreMemory> Heap<M> {
    pub fn new(mem: M) -> Self {
        Self::with_config(mem, HeapConfig::default())
    }

    pub fn with_config(mem: M, config: HeapConfig) -> Self {
        let pagesize = mem.page_size();
        let mut state = Box::new(State {
            max_fast: 0,
            fastbins: [std::ptr::null_mut(); NFASTBINS],
            top: ChunkRef::dangling(),
            last_remainder: std::ptr::null_mut(),
            bins: [RawChunk::EMPTY; NBINS],
            binmap: Binmap::new(),
            trim_threshold: config.trim_threshold,
            top_pad: config.top_pad,
            mmap_threshold: config.mmap_threshold,
            n_mmaps: 0,
            n_mmaps_max: config.mmap_max,
            pagesize,
            contiguous: true,
            mmapped_mem: 0,
            sbrked_mem: 0,
            max_sbrked_mem: HighWater::default(),
            max_mmapped_mem: HighWater::default(),
            max_total_mem: HighWater::default(),
        });
        state.set_max_fast(config.max_fast.min(MAX_FAST_REQUEST));

        let st = NonNull::from(Box::leak(state));
        // Safety: st is live; establishing the circular sentinel links is
        // the last step of initialization.
        unsafe {
            for i in 1..NBINS {
                let bin = bin_at(st.as_ptr(), i);
                bin.set_fd(bin);
                bin.set_bk(bin);
            }
            // The unsorted sentinel doubles as a zero-sized legal top until
            // the first extension replaces it.
            (*st.as_ptr()).top = bin_at(st.as_ptr(), 1);
        }
        Heap { st, mem }
    }

    /// The memory source backing this heap.
    pub fn memory(&self) -> &M {
        &self.mem
    }

    // ---- allocation ------------------------------------------------------

    /// Allocate `bytes` of payload.
    ///
    /// A zero-byte request returns a valid pointer to a minimum-sized
    /// chunk; callers that treat "no space" and "zero bytes" differently
    /// must check the request, not the result.
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        let nb = request2size(bytes).ok_or(HeapError::RequestOverflow { requested: bytes })?;
        // Safety: nb is a normalized chunk size.
        unsafe { self.alloc_chunk(nb) }.ok_or(HeapError::Exhausted)
    }

    /// The allocation ladder for a normalized chunk size: fast bins, exact
    /// small bin, unsorted drain, large-bin scan, binmap scan, top, system.
    ///
    /// # Safety
    /// `nb` must come from `request2size`.
    unsafe fn alloc_chunk(&mut self, nb: usize) -> Option<NonNull<u8>> {
        let st = self.st.as_ptr();

        // Nothing has been freed yet, so no bin can hold anything.
        if unsafe { !(*st).have_anychunks() } {
            return unsafe { self.alloc_from_top(nb) };
        }

        // Safety: all chunk handles below reference memory owned by this
        // heap; list surgery follows the circular-sentinel discipline.
        unsafe {
            if nb <= (*st).max_fast() {
                let idx = fastbin_index(nb);
                if let Some(victim) = ChunkRef::from_raw((*st).fastbins[idx]) {
                    (*st).fastbins[idx] = victim.fd_raw();
                    return Some(victim.mem_nonnull());
                }
            }

            let idx;
            if in_smallbin_range(nb) {
                // Small bins hold one size each, so a hit is an exact fit.
                idx = smallbin_index(nb);
                let bin = bin_at(st, idx);
                let victim = bin.bk();
                if victim != bin {
                    let bck = victim.bk();
                    victim.set_inuse_bit_at(nb);
                    bin.set_bk(bck);
                    bck.set_fd(bin);
                    return Some(victim.mem_nonnull());
                }
            } else {
                idx = largebin_index(nb);
                // Drain fast bins before a large search so their chunks
                // cannot hide coalesceable space.
                if (*st).have_fastchunks() {
                    self.consolidate();
                }
            }

            // Drain the unsorted queue from the tail. Each chunk gets one
            // chance to be taken as an exact fit (or as the locality
            // remainder for a small request); everything else is routed to
            // its definitive bin. This is the only place normal bins gain
            // members, which defers bin-index computation until a chunk is
            // known not to be reused immediately.
            loop {
                let unsorted = bin_at(st, 1);
                let victim = unsorted.bk();
                if victim == unsorted {
                    break;
                }
                let bck = victim.bk();
                let size = victim.size();

                // A lone unsorted chunk that was the most recent split
                // remainder serves runs of small requests from one place.
                if in_smallbin_range(nb)
                    && bck == unsorted
                    && victim.as_raw() == (*st).last_remainder
                    && size > nb + MIN_CHUNK
                {
                    let remainder_size = size - nb;
                    let remainder = victim.at_offset(nb);
                    unsorted.set_bk(remainder);
                    unsorted.set_fd(remainder);
                    remainder.set_bk(unsorted);
                    remainder.set_fd(unsorted);
                    (*st).last_remainder = remainder.as_raw();

                    victim.set_head(nb | PREV_IN_USE);
                    remainder.set_head(remainder_size | PREV_IN_USE);
                    remainder.set_foot(remainder_size);
                    return Some(victim.mem_nonnull());
                }

                unsorted.set_bk(bck);
                bck.set_fd(unsorted);

                if size == nb {
                    victim.set_inuse_bit_at(size);
                    return Some(victim.mem_nonnull());
                }

                let victim_index;
                let mut fwd;
                let mut bck;
                if in_smallbin_range(size) {
                    victim_index = smallbin_index(size);
                    bck = bin_at(st, victim_index);
                    fwd = bck.fd();
                } else {
                    victim_index = largebin_index(size);
                    bck = bin_at(st, victim_index);
                    fwd = bck.fd();
                    if fwd != bck {
                        if size < bck.bk().size() {
                            // Smaller than the current smallest: straight
                            // to the tail.
                            fwd = bck;
                            bck = bck.bk();
                        } else {
                            // Keep descending order; stop before the first
                            // chunk no larger than the new one, so equal
                            // sizes pop least-recently-freed first.
                            while size < fwd.size() {
                                fwd = fwd.fd();
                            }
                            bck = fwd.bk();
                        }
                    }
                }

                (*st).binmap.mark(victim_index);
                victim.set_bk(bck);
                victim.set_fd(fwd);
                fwd.set_bk(victim);
                bck.set_fd(victim);
            }

            // Targeted search: the large bin for nb, tail (smallest) first,
            // so the first fit is the best fit.
            if !in_smallbin_range(nb) {
                let bin = bin_at(st, idx);
                let mut victim = bin.bk();
                while victim != bin {
                    let size = victim.size();
                    if size >= nb {
                        let remainder_size = size - nb;
                        unlink(victim);
                        if remainder_size < MIN_CHUNK {
                            victim.set_inuse_bit_at(size);
                        } else {
                            let remainder = victim.at_offset(nb);
                            // The queue was fully drained above, so this
                            // insert rebuilds it from empty.
                            let unsorted = bin_at(st, 1);
                            unsorted.set_bk(remainder);
                            unsorted.set_fd(remainder);
                            remainder.set_bk(unsorted);
                            remainder.set_fd(unsorted);
                            victim.set_head(nb | PREV_IN_USE);
                            remainder.set_head(remainder_size | PREV_IN_USE);
                            remainder.set_foot(remainder_size);
                        }
                        return Some(victim.mem_nonnull());
                    }
                    victim = victim.bk();
                }
            }

            // Best-fit fallback over the remaining bins, skipping empty map
            // words wholesale. A set bit is only a hint; stale bits are
            // cleared here and nowhere else.
            let mut idx = idx + 1;
            let mut block = idx >> BINMAP_SHIFT;
            let mut map = (*st).binmap.word(block);
            let mut bit = Binmap::bit(idx);

            loop {
                if bit > map || bit == 0 {
                    loop {
                        block += 1;
                        if block >= BINMAP_WORDS {
                            return self.alloc_from_top(nb);
                        }
                        map = (*st).binmap.word(block);
                        if map != 0 {
                            break;
                        }
                    }
                    idx = block << BINMAP_SHIFT;
                    bit = 1;
                }

                while bit & map == 0 {
                    idx += 1;
                    bit <<= 1;
                    debug_assert!(bit != 0);
                }

                let bin = bin_at(st, idx);
                let victim = bin.bk();
                if victim == bin {
                    // The hint lied; make it authoritative and move on.
                    (*st).binmap.clear(idx);
                    map &= !bit;
                    idx += 1;
                    bit <<= 1;
                    continue;
                }

                let size = victim.size();
                debug_assert!(size >= nb);
                let remainder_size = size - nb;

                let bck = victim.bk();
                bin.set_bk(bck);
                bck.set_fd(bin);

                if remainder_size < MIN_CHUNK {
                    victim.set_inuse_bit_at(size);
                } else {
                    let remainder = victim.at_offset(nb);
                    let unsorted = bin_at(st, 1);
                    unsorted.set_bk(remainder);
                    unsorted.set_fd(remainder);
                    remainder.set_bk(unsorted);
                    remainder.set_fd(unsorted);
                    if in_smallbin_range(nb) {
                        (*st).last_remainder = remainder.as_raw();
                    }
                    victim.set_head(nb | PREV_IN_USE);
                    remainder.set_head(remainder_size | PREV_IN_USE);
                    remainder.set_foot(remainder_size);
                }
                return Some(victim.mem_nonnull());
            }
        }
    }

    /// Split `nb` off the top chunk, or go to the system when top is too
    /// small. Top always keeps at least a minimum chunk in reserve so the
    /// fencepost protocol has room to work with.
    ///
    /// # Safety
    /// `nb` must be a normalized chunk size.
    unsafe fn alloc_from_top(&mut self, nb: usize) -> Option<NonNull<u8>> {
        let st = self.st.as_ptr();
        // Safety: top is always a legal chunk (possibly the zero-sized
        // initial sentinel, whose size fails the check below).
        unsafe {
            let victim = (*st).top;
            let size = victim.size();
            if size >= nb + MIN_CHUNK {
                let remainder_size = size - nb;
                let remainder = victim.at_offset(nb);
                (*st).top = remainder;
                victim.set_head(nb | PREV_IN_USE);
                remainder.set_head(remainder_size | PREV_IN_USE);
                return Some(victim.mem_nonnull());
            }
            self.sysmalloc(nb)
        }
    }

    // ---- system acquisition ----------------------------------------------

    /// Acquire memory from the system: direct-map big requests, extend the
    /// contiguous region otherwise, falling back to an anonymous mapping
    /// (and permanent non-contiguous mode) when extension fails.
    ///
    /// # Safety
    /// `nb` must be a normalized chunk size and top must be too small for it.
    unsafe fn sysmalloc(&mut self, nb: usize) -> Option<NonNull<u8>> {
        let st = self.st.as_ptr();
        // Safety: state and all chunk memory are owned by this heap.
        unsafe {
            let pagemask = (*st).pagesize - 1;

            // Fast-bin space may already cover the request. Only small
            // requests can get here with fast chunks pending (large ones
            // consolidated on entry), so drain and retry the whole ladder
            // with the same normalized size before touching the system.
            if (*st).have_fastchunks() {
                debug_assert!(in_smallbin_range(nb));
                self.consolidate();
                return self.alloc_chunk(nb);
            }

            // Direct mapping. The overhead is one word more than a heap
            // chunk because no successor donates a prev_size slot.
            if nb >= (*st).mmap_threshold && (*st).n_mmaps < (*st).n_mmaps_max {
                let size = (nb + WORD + ALIGN_MASK + pagemask) & !pagemask;
                if size > nb {
                    if let Ok(mm) = self.mem.map(size) {
                        // Record any leading pad in prev_size so release
                        // can recover the mapping base.
                        let front_misalign = (mm.as_ptr() as usize + ALIGNMENT) & ALIGN_MASK;
                        let p = if front_misalign > 0 {
                            let correction = ALIGNMENT - front_misalign;
                            let p = ChunkRef::from_base(mm.as_ptr().add(correction));
                            p.set_prev_size(correction);
                            p.set_head((size - correction) | MMAPPED);
                            p
                        } else {
                            let p = ChunkRef::from_base(mm.as_ptr());
                            p.set_prev_size(0);
                            p.set_head(size | MMAPPED);
                            p
                        };

                        (*st).n_mmaps += 1;
                        (*st).mmapped_mem += size;
                        (*st).max_mmapped_mem.observe((*st).mmapped_mem);
                        (*st)
                            .max_total_mem
                            .observe((*st).mmapped_mem + (*st).sbrked_mem);
                        return Some(p.mem_nonnull());
                    }
                }
            }

            let old_top = (*st).top;
            let old_size = old_top.size();
            let old_end = old_top.addr() + old_size;

            debug_assert!(
                (old_top == bin_at(st, 1) && old_size == 0)
                    || (old_size >= MIN_CHUNK && old_top.prev_in_use())
            );
            debug_assert!(old_size < nb + MIN_CHUNK);
            debug_assert!(!(*st).have_fastchunks());

            let mut size = nb + (*st).top_pad + MIN_CHUNK;
            // When contiguous, the new space will merge with the old top,
            // so that much can be deducted up front.
            if (*st).contiguous {
                size -= old_size;
            }
            size = (size + pagemask) & !pagemask;

            let mut brk: Option<NonNull<u8>> = None;
            let mut snd_brk: Option<NonNull<u8>> = None;

            if size > 0 && size <= isize::MAX as usize {
                brk = self.mem.extend(size as isize).ok();
            }

            if brk.is_none() {
                // Extension refused: fall back to an anonymous mapping in
                // larger units. The old top cannot be merged with it, so
                // its size goes back into the request.
                if (*st).contiguous {
                    size = (size + old_size + pagemask) & !pagemask;
                }
                if size < MAP_AS_EXTENSION_UNIT {
                    size = MAP_AS_EXTENSION_UNIT;
                }
                if size > nb {
                    if let Ok(mm) = self.mem.map(size) {
                        brk = Some(mm);
                        snd_brk = Some(NonNull::new_unchecked(mm.as_ptr().add(size)));
                        // One hole is enough; never assume adjacency again,
                        // or a later extension could bridge regions.
                        (*st).contiguous = false;
                        #[cfg(debug_assertions)]
                        eprintln!(
                            "[tagheap] break extension failed; \
                             switching to mapped regions permanently"
                        );
                    }
                }
            }

            let brk = brk?;
            let brk_addr = brk.as_ptr() as usize;
            (*st).sbrked_mem += size;

            if brk_addr == old_end && snd_brk.is_none() {
                // The extension resumed exactly at the frontier: top just
                // grows.
                old_top.set_head((size + old_size) | PREV_IN_USE);
            } else {
                // A break that moved backwards means someone else shrank
                // the region; stop trusting adjacency.
                if (*st).contiguous && old_size != 0 && brk_addr < old_end {
                    (*st).contiguous = false;
                }

                let mut aligned_brk = brk.as_ptr();
                let mut correction: usize;

                if (*st).contiguous {
                    // Foreign extensions may have pushed the break forward
                    // since our last call; their bytes sit between old_end
                    // and brk and are counted as ours for accounting.
                    if old_size != 0 {
                        (*st).sbrked_mem += brk_addr - old_end;
                    }

                    // First chunk in the new space must align its payload.
                    let front_misalign = (brk_addr + ALIGNMENT) & ALIGN_MASK;
                    correction = 0;
                    if front_misalign > 0 {
                        correction = ALIGNMENT - front_misalign;
                        aligned_brk = aligned_brk.add(correction);
                    }
                    // Merge distance back to the old top, then pad the far
                    // end out to a page boundary so future extensions stay
                    // page-aligned.
                    correction += old_size;
                    let end_misalign = brk_addr + size + correction;
                    correction += ((end_misalign + pagemask) & !pagemask) - end_misalign;

                    debug_assert!(correction <= isize::MAX as usize);
                    match self.mem.extend(correction as isize) {
                        Ok(prev) => {
                            if (prev.as_ptr() as usize) < brk_addr {
                                // The second extension landed below the
                                // first: ignore it, estimate conservatively
                                // from the first call, and give up on
                                // adjacency.
                                snd_brk = Some(NonNull::new_unchecked(brk.as_ptr().add(size)));
                                correction = 0;
                                (*st).contiguous = false;
                            } else {
                                snd_brk = Some(prev);
                            }
                        }
                        Err(_) => {
                            // Could not get the correction; learn where the
                            // frontier is and proceed without it.
                            correction = 0;
                            snd_brk = self.mem.extend(0).ok();
                        }
                    }
                } else {
                    // Non-contiguous sources must hand out aligned blocks.
                    debug_assert!((brk_addr + ALIGNMENT) & ALIGN_MASK == 0);
                    correction = 0;
                    if snd_brk.is_none() {
                        if let Ok(cur) = self.mem.extend(0) {
                            let cur_addr = cur.as_ptr() as usize;
                            (*st).sbrked_mem +=
                                cur_addr.saturating_sub(brk_addr + size);
                            snd_brk = Some(cur);
                        }
                    }
                }

                if let Some(snd) = snd_brk {
                    (*st).top = ChunkRef::from_base(aligned_brk);
                    let top_size = (snd.as_ptr() as usize - aligned_brk as usize) + correction;
                    (*st).top.set_head(top_size | PREV_IN_USE);
                    (*st).sbrked_mem += correction;

                    // The old top is now orphaned behind a gap. Wall it off
                    // with two minimum-width in-use fenceposts so coalescing
                    // can never walk across memory the heap does not own,
                    // then release whatever body remains.
                    if old_size != 0 {
                        let fenced_size = (old_size - 3 * WORD) & !ALIGN_MASK;
                        old_top.set_head(fenced_size | PREV_IN_USE);
                        old_top
                            .at_offset(fenced_size)
                            .set_head(WORD | PREV_IN_USE);
                        old_top
                            .at_offset(fenced_size + WORD)
                            .set_head(WORD | PREV_IN_USE);
                        if fenced_size >= MIN_CHUNK {
                            let saved = (*st).trim_threshold;
                            (*st).trim_threshold = usize::MAX;
                            self.free(old_top.mem());
                            (*st).trim_threshold = saved;
                        }
                    }
                }
            }

            (*st).max_sbrked_mem.observe((*st).sbrked_mem);
            (*st)
                .max_total_mem
                .observe((*st).sbrked_mem + (*st).mmapped_mem);

            let top = (*st).top;
            let top_size = top.size();
            if top_size >= nb + MIN_CHUNK {
                let remainder_size = top_size - nb;
                let remainder = top.at_offset(nb);
                (*st).top = remainder;
                top.set_head(nb | PREV_IN_USE);
                remainder.set_head(remainder_size | PREV_IN_USE);
                return Some(top.mem_nonnull());
            }

            None
        }
    }

    /// Release pages at the frontier when top is large enough. Returns true
    /// iff memory actually went back to the system.
    ///
    /// # Safety
    /// State must be consistent (no half-finished surgery).
    unsafe fn systrim(&mut self, pad: usize) -> bool {
        let st = self.st.as_ptr();
        // Safety: only reads top and adjusts its head after a verified
        // release.
        unsafe {
            let pagesize = (*st).pagesize as isize;
            let top_size = (*st).top.size();

            // Whole pages past the pad, always keeping one page in top.
            let extra = ((top_size as isize - pad as isize - MIN_CHUNK as isize
                + (pagesize - 1))
                / pagesize
                - 1)
                * pagesize;
            if extra <= 0 {
                return false;
            }
            let extra = extra as usize;

            // Only shrink when the frontier is exactly where this heap left
            // it; a foreign extension in between makes the release unsafe.
            let Ok(current_brk) = self.mem.extend(0) else {
                return false;
            };
            if current_brk.as_ptr() as usize != (*st).top.addr() + top_size {
                return false;
            }

            // The shrink result is ignored; what counts is where the
            // frontier ends up, so query again and trust only that.
            let _ = self.mem.extend(-(extra as isize));
            let Ok(new_brk) = self.mem.extend(0) else {
                return false;
            };
            let released =
                (current_brk.as_ptr() as usize).saturating_sub(new_brk.as_ptr() as usize);
            if released == 0 {
                return false;
            }

            (*st).sbrked_mem -= released;
            (*st).top.set_head((top_size - released) | PREV_IN_USE);
            true
        }
    }

    // ---- release ---------------------------------------------------------

    /// Release a payload previously returned by this heap.
    ///
    /// A null `mem` is a no-op. Anything else not obtained from this heap
    /// is undefined behavior.
    ///
    /// # Safety
    /// `mem` must be null or a live payload pointer from this heap, and
    /// must not be used after the call.
    pub unsafe fn free(&mut self, mem: *mut u8) {
        if mem.is_null() {
            return;
        }
        let st = self.st.as_ptr();
        // Safety: mem is a live payload per the caller's contract.
        unsafe {
            let mut p = ChunkRef::from_mem(mem);
            let mut size = p.size();

            // Eligible chunks go straight onto a fast bin, untouched: the
            // successor's prev-in-use stays set, so neighbors cannot
            // coalesce with it until a consolidation pass.
            if size <= (*st).max_fast() {
                (*st).set_fastchunks();
                let idx = fastbin_index(size);
                p.set_fd_raw((*st).fastbins[idx]);
                (*st).fastbins[idx] = p.as_raw();
                return;
            }

            if !p.is_mmapped() {
                (*st).set_anychunks();

                let nextchunk = p.at_offset(size);
                let nextsize = nextchunk.size();

                // Coalesce backward.
                if !p.prev_in_use() {
                    size += p.prev_size();
                    p = p.prev_chunk();
                    unlink(p);
                }

                if nextchunk != (*st).top {
                    // Record the successor's in-use state, then clear its
                    // prev-in-use to reflect that p is now free.
                    let nextinuse = nextchunk.inuse_bit_at(nextsize);
                    nextchunk.set_head(nextsize);

                    // Coalesce forward.
                    if !nextinuse {
                        unlink(nextchunk);
                        size += nextsize;
                    }

                    // Stage in the unsorted queue; binning is deferred
                    // until an allocation gives the chunk one chance to be
                    // reused as-is.
                    let bck = bin_at(st, 1);
                    let fwd = bck.fd();
                    p.set_bk(bck);
                    p.set_fd(fwd);
                    bck.set_fd(p);
                    fwd.set_bk(p);

                    p.set_head(size | PREV_IN_USE);
                    p.set_foot(size);
                } else {
                    // Borders the frontier: fold into top, no bin at all.
                    size += nextsize;
                    p.set_head(size | PREV_IN_USE);
                    (*st).top = p;
                }

                // A large merged block hints that surrounding fast chunks
                // are worth consolidating, and afterwards top may have
                // grown past the trim threshold.
                if size >= CONSOLIDATION_THRESHOLD {
                    if (*st).have_fastchunks() {
                        self.consolidate();
                    }
                    if (*st).top.size() >= (*st).trim_threshold {
                        let pad = (*st).top_pad;
                        self.systrim(pad);
                    }
                }
            } else {
                // Direct mapping: recover the base from the recorded
                // leading pad and hand the whole region back.
                let offset = p.prev_size();
                (*st).n_mmaps -= 1;
                (*st).mmapped_mem -= size + offset;
                let base = NonNull::new_unchecked(p.as_raw().cast::<u8>().sub(offset));
                let _ = self.mem.unmap(base, size + offset);
            }
        }
    }

    /// Drain every fast bin: merge each chunk with its free physical
    /// neighbors and stage the result in the unsorted queue (or fold it
    /// into top). Clears the FASTCHUNKS flag.
    unsafe fn consolidate(&mut self) {
        let st = self.st.as_ptr();
        // Safety: same ownership argument as free; this is the streamlined
        // variant of its coalescing path, which must not itself push to
        // fast bins.
        unsafe {
            (*st).clear_fastchunks();
            let unsorted = bin_at(st, 1);

            for i in 0..NFASTBINS {
                let mut next = std::mem::replace(&mut (*st).fastbins[i], std::ptr::null_mut());
                while let Some(chunk) = ChunkRef::from_raw(next) {
                    next = chunk.fd_raw();

                    let mut p = chunk;
                    let mut size = p.head() & !PREV_IN_USE;
                    let nextchunk = p.at_offset(size);
                    let nextsize = nextchunk.size();

                    if !p.prev_in_use() {
                        size += p.prev_size();
                        p = p.prev_chunk();
                        unlink(p);
                    }

                    if nextchunk != (*st).top {
                        let nextinuse = nextchunk.inuse_bit_at(nextsize);
                        nextchunk.set_head(nextsize);
                        if !nextinuse {
                            size += nextsize;
                            unlink(nextchunk);
                        }

                        let first = unsorted.fd();
                        unsorted.set_fd(p);
                        first.set_bk(p);
                        p.set_head(size | PREV_IN_USE);
                        p.set_bk(unsorted);
                        p.set_fd(first);
                        p.set_foot(size);
                    } else {
                        size += nextsize;
                        p.set_head(size | PREV_IN_USE);
                        (*st).top = p;
                    }
                }
            }
        }
    }

    /// Consolidate, then release frontier pages past `pad` if top has
    /// grown beyond a page. Returns true iff memory was released.
    pub fn trim(&mut self, pad: usize) -> bool {
        // Safety: entry-point sequencing, state is consistent.
        unsafe {
            self.consolidate();
            self.systrim(pad)
        }
    }

    // ---- reallocate ------------------------------------------------------

    /// Resize the allocation at `oldmem` to `bytes`, preserving contents up
    /// to the smaller of the two sizes.
    ///
    /// Null `oldmem` allocates. On failure the old allocation is untouched
    /// and stays valid. A zero `bytes` with non-null `oldmem` shrinks to a
    /// minimum-sized chunk.
    ///
    /// # Safety
    /// `oldmem` must be null or a live payload pointer from this heap; on
    /// success it must no longer be used (unless returned unchanged).
    pub unsafe fn reallocate(
        &mut self,
        oldmem: *mut u8,
        bytes: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if oldmem.is_null() {
            return self.allocate(bytes);
        }
        let nb = request2size(bytes).ok_or(HeapError::RequestOverflow { requested: bytes })?;
        let st = self.st.as_ptr();

        // Safety: oldmem is a live payload per the caller's contract.
        unsafe {
            let oldp = ChunkRef::from_mem(oldmem);
            let oldsize = oldp.size();

            if oldp.is_mmapped() {
                // A mapping can absorb growth up to its page-rounded size;
                // note the extra word of overhead mappings carry.
                if oldsize >= nb + WORD {
                    return Ok(NonNull::new_unchecked(oldmem));
                }
                let newmem = self.alloc_chunk(nb).ok_or(HeapError::Exhausted)?;
                std::ptr::copy_nonoverlapping(oldmem, newmem.as_ptr(), oldsize - ALIGNMENT);
                self.free(oldmem);
                return Ok(newmem);
            }

            let newp;
            let newsize;
            if oldsize >= nb {
                // Already big enough; only the tail split below remains.
                newp = oldp;
                newsize = oldsize;
            } else {
                let next = oldp.at_offset(oldsize);

                if next == (*st).top && oldsize + next.size() >= nb + MIN_CHUNK {
                    // Expand forward into top.
                    let total = oldsize + next.size();
                    oldp.set_head_size(nb);
                    (*st).top = oldp.at_offset(nb);
                    (*st).top.set_head((total - nb) | PREV_IN_USE);
                    return Ok(oldp.mem_nonnull());
                } else if next != (*st).top && !next.inuse() && oldsize + next.size() >= nb {
                    // Absorb the free successor.
                    newp = oldp;
                    newsize = oldsize + next.size();
                    unlink(next);
                } else {
                    let newmem = self.alloc_chunk(nb).ok_or(HeapError::Exhausted)?;
                    let fresh = ChunkRef::from_mem(newmem.as_ptr());

                    if fresh == next {
                        // The new chunk landed directly after the old one:
                        // splice them and skip the copy.
                        newsize = fresh.size() + oldsize;
                        newp = oldp;
                    } else {
                        // The payload holds an odd number of words, at
                        // least three; short copies are done by word.
                        let copysize = oldsize - WORD;
                        let ncopies = copysize / WORD;
                        debug_assert!(ncopies >= 3);
                        if ncopies > 9 {
                            std::ptr::copy_nonoverlapping(oldmem, newmem.as_ptr(), copysize);
                        } else {
                            let s = oldmem.cast::<usize>();
                            let d = newmem.as_ptr().cast::<usize>();
                            for i in 0..ncopies {
                                *d.add(i) = *s.add(i);
                            }
                        }
                        self.free(oldmem);
                        return Ok(newmem);
                    }
                }
            }

            debug_assert!(newsize >= nb);
            let remainder_size = newsize - nb;
            if remainder_size < MIN_CHUNK {
                newp.set_head_size(newsize);
                newp.set_inuse_bit_at(newsize);
            } else {
                // Mark the tail in use before routing it through free, so
                // release sees a well-formed chunk.
                let remainder = newp.at_offset(nb);
                newp.set_head_size(nb);
                remainder.set_head(remainder_size | PREV_IN_USE);
                remainder.set_inuse_bit_at(remainder_size);
                self.free(remainder.mem());
            }
            Ok(newp.mem_nonnull())
        }
    }

    // ---- aligned and zeroed ----------------------------------------------

    /// Allocate `bytes` with a payload aligned to `alignment`.
    ///
    /// Alignments at or below the natural 16 fall through to `allocate`;
    /// others are rounded up to a power of two.
    pub fn allocate_aligned(
        &mut self,
        alignment: usize,
        bytes: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if alignment <= ALIGNMENT {
            return self.allocate(bytes);
        }
        let mut alignment = alignment.max(MIN_CHUNK);
        if !alignment.is_power_of_two() {
            alignment = alignment
                .checked_next_power_of_two()
                .ok_or(HeapError::RequestOverflow { requested: bytes })?;
        }

        let nb = request2size(bytes).ok_or(HeapError::RequestOverflow { requested: bytes })?;
        // Worst-case padding so an aligned spot with a binnable leader is
        // always inside.
        let outer = nb
            .checked_add(alignment)
            .and_then(|v| v.checked_add(MIN_CHUNK))
            .and_then(request2size)
            .ok_or(HeapError::RequestOverflow { requested: bytes })?;

        // Safety: chunk surgery below stays inside the outer allocation.
        unsafe {
            let m = self.alloc_chunk(outer).ok_or(HeapError::Exhausted)?;
            let mut p = ChunkRef::from_mem(m.as_ptr());

            if (m.as_ptr() as usize) % alignment != 0 {
                // Lowest aligned payload inside; if the leader would be too
                // small to free, the next aligned spot is guaranteed to fit.
                let aligned_mem =
                    (m.as_ptr() as usize + alignment - 1) & !(alignment - 1);
                let mut newp_addr = aligned_mem - ALIGNMENT;
                if newp_addr - p.addr() < MIN_CHUNK {
                    newp_addr += alignment;
                }
                let newp = ChunkRef::from_base(newp_addr as *mut u8);
                let leadsize = newp.addr() - p.addr();
                let newsize = p.size() - leadsize;

                if p.is_mmapped() {
                    // For a mapping, the leader just grows the recorded pad.
                    newp.set_prev_size(p.prev_size() + leadsize);
                    newp.set_head(newsize | MMAPPED);
                    return Ok(newp.mem_nonnull());
                }

                newp.set_head(newsize | PREV_IN_USE);
                newp.set_inuse_bit_at(newsize);
                p.set_head_size(leadsize);
                self.free(p.mem());
                p = newp;
            }

            // Give back spare room at the end as well.
            if !p.is_mmapped() {
                let size = p.size();
                if size > nb + MIN_CHUNK {
                    let remainder_size = size - nb;
                    let remainder = p.at_offset(nb);
                    remainder.set_head(remainder_size | PREV_IN_USE);
                    p.set_head_size(nb);
                    self.free(remainder.mem());
                }
            }

            debug_assert!(p.mem() as usize % alignment == 0);
            Ok(p.mem_nonnull())
        }
    }

    /// Allocate a payload aligned to the page size.
    pub fn allocate_page_aligned(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        // Safety: pagesize was cached at construction.
        let page = unsafe { (*self.st.as_ptr()).pagesize };
        self.allocate_aligned(page, bytes)
    }

    /// Allocate `count * elem_size` zeroed bytes. Overflow in the product
    /// is an error, not a wrap.
    pub fn allocate_zeroed(
        &mut self,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let total = count
            .checked_mul(elem_size)
            .ok_or(HeapError::RequestOverflow {
                requested: usize::MAX,
            })?;
        let mem = self.allocate(total)?;
        // Safety: mem is a fresh payload of at least `total` bytes.
        unsafe {
            let p = ChunkRef::from_mem(mem.as_ptr());
            // Direct mappings come zero-filled from the system.
            if !p.is_mmapped() {
                let clearsize = p.size() - WORD;
                let nclears = clearsize / WORD;
                debug_assert!(nclears >= 3);
                if nclears > 9 {
                    std::ptr::write_bytes(mem.as_ptr(), 0, clearsize);
                } else {
                    let d = mem.as_ptr().cast::<usize>();
                    for i in 0..nclears {
                        *d.add(i) = 0;
                    }
                }
            }
        }
        Ok(mem)
    }

    // ---- bulk allocation -------------------------------------------------

    /// Allocate `n` independently freeable zeroed payloads of `elem_size`
    /// bytes each, all carved from one host chunk.
    ///
    /// Chunks this close together maximize locality for element-per-node
    /// structures. Each element may be freed (or reallocated) on its own;
    /// the host region stays with the heap until all of them are.
    pub fn independent_calloc(
        &mut self,
        n: usize,
        elem_size: usize,
    ) -> Result<Vec<NonNull<u8>>, HeapError> {
        self.ialloc(n, ElemSizes::Uniform(elem_size), true)
    }

    /// Allocate one independently freeable payload per entry of `sizes`,
    /// all carved from one host chunk. Contents are not cleared.
    pub fn independent_comalloc(
        &mut self,
        sizes: &[usize],
    ) -> Result<Vec<NonNull<u8>>, HeapError> {
        self.ialloc(sizes.len(), ElemSizes::PerElement(sizes), false)
    }

    fn ialloc(
        &mut self,
        n: usize,
        sizes: ElemSizes<'_>,
        zero: bool,
    ) -> Result<Vec<NonNull<u8>>, HeapError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let st = self.st.as_ptr();

        // Total of the normalized element sizes; the aggregate chunk is
        // exactly their sum, so the last element absorbs any slack the
        // allocation rounds in.
        let mut contents = 0usize;
        for i in 0..n {
            let sz = request2size(sizes.get(i)).ok_or(HeapError::RequestOverflow {
                requested: sizes.get(i),
            })?;
            contents = contents
                .checked_add(sz)
                .ok_or(HeapError::RequestOverflow { requested: contents })?;
        }

        // Safety: the carve below only touches the aggregate chunk.
        unsafe {
            // The host must live on the contiguous heap: elements inside a
            // segregated mapping could never be freed one by one. Disable
            // direct mapping for the one allocation.
            let saved = (*st).n_mmaps_max;
            (*st).n_mmaps_max = 0;
            let mem = self.alloc_chunk(contents);
            (*st).n_mmaps_max = saved;
            let mem = mem.ok_or(HeapError::Exhausted)?;

            let mut p = ChunkRef::from_mem(mem.as_ptr());
            debug_assert!(!p.is_mmapped());
            let mut remainder_size = p.size();

            if zero {
                std::ptr::write_bytes(mem.as_ptr(), 0, remainder_size - WORD);
            }

            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                out.push(p.mem_nonnull());
                if i != n - 1 {
                    // request2size cannot fail here: it succeeded above.
                    let size = request2size(sizes.get(i)).unwrap_or(MIN_CHUNK);
                    remainder_size -= size;
                    p.set_head(size | PREV_IN_USE);
                    p = p.at_offset(size);
                } else {
                    p.set_head(remainder_size | PREV_IN_USE);
                }
            }
            Ok(out)
        }
    }

    // ---- introspection ---------------------------------------------------

    /// Usable payload bytes behind `mem`: at least what was requested,
    /// often a little more. Zero for null or freed chunks.
    ///
    /// # Safety
    /// `mem` must be null or a payload pointer from this heap.
    pub unsafe fn usable_size(&self, mem: *const u8) -> usize {
        if mem.is_null() {
            return 0;
        }
        // Safety: mem is a payload from this heap per contract.
        unsafe {
            let p = ChunkRef::from_mem(mem.cast_mut());
            if p.is_mmapped() {
                p.size() - ALIGNMENT
            } else if p.inuse() {
                p.size() - WORD
            } else {
                0
            }
        }
    }

    /// Traversal-based statistics snapshot.
    pub fn stats(&mut self) -> HeapStats {
        let st = self.st.as_ptr();
        // Safety: read-only walk of bins and fast bins.
        unsafe {
            let mut fast_blocks = 0;
            let mut fast_bytes = 0;
            for i in 0..NFASTBINS {
                let mut cur = (*st).fastbins[i];
                while let Some(p) = ChunkRef::from_raw(cur) {
                    fast_blocks += 1;
                    fast_bytes += p.size();
                    cur = p.fd_raw();
                }
            }

            // Top always counts as one free block, even at size zero.
            let mut free_blocks = 1;
            let mut free_bytes = (*st).top.size() + fast_bytes;
            for i in 1..NBINS {
                let bin = bin_at(st, i);
                let mut p = bin.bk();
                while p != bin {
                    free_blocks += 1;
                    free_bytes += p.size();
                    p = p.bk();
                }
            }

            HeapStats {
                fast_blocks,
                fast_bytes,
                free_blocks,
                free_bytes,
                in_use_bytes: (*st).sbrked_mem - free_bytes,
                core_bytes: (*st).sbrked_mem,
                mapped_count: (*st).n_mmaps,
                mapped_bytes: (*st).mmapped_mem,
                releasable_bytes: (*st).top.size(),
                max_total_bytes: (*st).max_total_mem.get(),
            }
        }
    }

    /// Adjust a tunable. Returns true iff the value was accepted.
    pub fn tune(&mut self, param: Tunable, value: usize) -> bool {
        // Consolidate first so no fast chunk is stranded above a lowered
        // eligibility bound.
        // Safety: entry-point sequencing, state is consistent.
        unsafe { self.consolidate() };
        let st = self.st.as_ptr();
        // Safety: plain field stores.
        unsafe {
            match param {
                Tunable::MaxFast => {
                    if value <= MAX_FAST_REQUEST {
                        (*st).set_max_fast(value);
                        true
                    } else {
                        false
                    }
                }
                Tunable::TrimThreshold => {
                    (*st).trim_threshold = value;
                    true
                }
                Tunable::TopPad => {
                    (*st).top_pad = value;
                    true
                }
                Tunable::MmapThreshold => {
                    (*st).mmap_threshold = value;
                    true
                }
                Tunable::MmapMax => {
                    (*st).n_mmaps_max = value;
                    true
                }
            }
        }
    }

    /// Exhaustive structural audit, debug builds only. Panics on the first
    /// violated invariant.
    #[cfg(any(debug_assertions, test))]
    pub(crate) fn check_state(&mut self) {
        use super::index::bin_index;
        use fixedbitset::FixedBitSet;

        let st = self.st.as_ptr();
        // Safety: read-only walk; the state is between operations.
        unsafe {
            let top = (*st).top;
            let initial = bin_at(st, 1) == top && top.size() == 0;
            if !initial {
                assert!(top.prev_in_use(), "top lost its prev-in-use flag");
                assert!(top.size() >= MIN_CHUNK, "top shrank below a legal chunk");
            }

            // Fast bins: members keep their in-use appearance and match
            // their slot's size class.
            let max_fast = (*st).max_fast();
            for (i, head) in (*st).fastbins.iter().enumerate() {
                let mut cur = *head;
                while let Some(p) = ChunkRef::from_raw(cur) {
                    let size = p.size();
                    assert_eq!(fastbin_index(size), i, "fast chunk in wrong slot");
                    assert!(size <= max_fast, "oversized chunk parked in a fast bin");
                    assert!(p.inuse(), "fast chunk lost its outward in-use state");
                    cur = p.fd_raw();
                }
                if ChunkRef::from_raw(*head).is_some() {
                    assert!(
                        (*st).have_fastchunks(),
                        "fast bins populated with FASTCHUNKS clear"
                    );
                }
            }

            // Normal bins: circular links intact, boundary tags coherent,
            // no free physical neighbors, sizes binned correctly, large
            // bins sorted descending from the head.
            let mut occupied = FixedBitSet::with_capacity(NBINS);
            for i in 1..NBINS {
                let bin = bin_at(st, i);
                let mut p = bin.bk();
                let mut prev_walk = bin;
                while p != bin {
                    occupied.insert(i);
                    assert_eq!(p.fd(), prev_walk, "broken circular link in bin {i}");
                    assert!(p != top, "top chunk linked into bin {i}");

                    let size = p.size();
                    assert!(size >= MIN_CHUNK, "undersized chunk in bin {i}");
                    assert_eq!(size & ALIGN_MASK, 0, "misaligned size in bin {i}");
                    assert_eq!(
                        p.at_offset(size).prev_size(),
                        size,
                        "foot disagrees with head in bin {i}"
                    );
                    assert!(
                        !p.at_offset(size).prev_in_use(),
                        "successor still sees binned chunk as in use"
                    );
                    assert!(
                        p.prev_in_use(),
                        "two adjacent free chunks escaped coalescing"
                    );
                    if i >= 2 {
                        assert_eq!(bin_index(size), i, "chunk binned by the wrong size");
                    }
                    prev_walk = p;
                    p = p.bk();
                }

                if i >= NBINS - 64 && occupied.contains(i) {
                    // Large bins keep descending order from the head.
                    let mut q = bin.fd();
                    while q.fd() != bin {
                        assert!(
                            q.size() >= q.fd().size(),
                            "large bin {i} out of order"
                        );
                        q = q.fd();
                    }
                }
            }

            // A clear binmap bit is authoritative; a set bit is only a hint
            // and may be stale.
            for i in 2..NBINS {
                if !(*st).binmap.is_marked(i) {
                    assert!(!occupied.contains(i), "binmap missed occupied bin {i}");
                }
            }
        }
    }
}

enum ElemSizes<'a> {
    Uniform(usize),
    PerElement(&'a [usize]),
}

impl ElemSizes<'_> {
    fn get(&self, i: usize) -> usize {
        match self {
            ElemSizes::Uniform(s) => *s,
            ElemSizes::PerElement(sizes) => sizes[i],
        }
    }
}

// ---- process-wide instance ----------------------------------------------

#[cfg(unix)]
static GLOBAL_HEAP: std::sync::OnceLock<std::sync::Mutex<Heap<PlatformMemory>>> =
    std::sync::OnceLock::new();

/// Facade over one process-wide [`Heap`] behind a mutex.
///
/// Every entry point locks for its full duration, which is exactly the
/// single-global-lock model the state is designed for. The type also
/// implements [`GlobalAlloc`](std::alloc::GlobalAlloc), so it can serve as
/// the Rust global allocator.
#[cfg(unix)]
pub struct GlobalHeap;

#[cfg(unix)]
impl GlobalHeap {
    fn instance() -> &'static std::sync::Mutex<Heap<PlatformMemory>> {
        GLOBAL_HEAP.get_or_init(|| std::sync::Mutex::new(Heap::new(PlatformMemory)))
    }

    /// See [`Heap::allocate`].
    pub fn allocate(bytes: usize) -> Result<NonNull<u8>, HeapError> {
        Self::instance().lock().unwrap().allocate(bytes)
    }

    /// See [`Heap::free`].
    ///
    /// # Safety
    /// Same contract as [`Heap::free`], against the global instance.
    pub unsafe fn free(mem: *mut u8) {
        // Safety: forwarded contract.
        unsafe { Self::instance().lock().unwrap().free(mem) }
    }

    /// See [`Heap::reallocate`].
    ///
    /// # Safety
    /// Same contract as [`Heap::reallocate`], against the global instance.
    pub unsafe fn reallocate(mem: *mut u8, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        // Safety: forwarded contract.
        unsafe { Self::instance().lock().unwrap().reallocate(mem, bytes) }
    }

    /// See [`Heap::allocate_aligned`].
    pub fn allocate_aligned(alignment: usize, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        Self::instance().lock().unwrap().allocate_aligned(alignment, bytes)
    }

    /// See [`Heap::allocate_zeroed`].
    pub fn allocate_zeroed(count: usize, elem_size: usize) -> Result<NonNull<u8>, HeapError> {
        Self::instance().lock().unwrap().allocate_zeroed(count, elem_size)
    }

    /// See [`Heap::usable_size`].
    ///
    /// # Safety
    /// Same contract as [`Heap::usable_size`], against the global instance.
    pub unsafe fn usable_size(mem: *const u8) -> usize {
        // Safety: forwarded contract.
        unsafe { Self::instance().lock().unwrap().usable_size(mem) }
    }

    /// See [`Heap::trim`].
    pub fn trim(pad: usize) -> bool {
        Self::instance().lock().unwrap().trim(pad)
    }

    /// See [`Heap::tune`].
    pub fn tune(param: Tunable, value: usize) -> bool {
        Self::instance().lock().unwrap().tune(param, value)
    }

    /// See [`Heap::stats`].
    pub fn stats() -> HeapStats {
        Self::instance().lock().unwrap().stats()
    }
}

// Safety: all methods funnel through the instance mutex; pointers carry
// their own in-band size, so dealloc can ignore the layout.
#[cfg(unix)]
unsafe impl std::alloc::GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        let result = if layout.align() <= ALIGNMENT {
            Self::allocate(layout.size())
        } else {
            Self::allocate_aligned(layout.align(), layout.size())
        };
        match result {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: std::alloc::Layout) {
        // Safety: ptr came from alloc on this allocator.
        unsafe { Self::free(ptr) }
    }

    unsafe fn alloc_zeroed(&self, layout: std::alloc::Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            match Self::allocate_zeroed(layout.size(), 1) {
                Ok(ptr) => ptr.as_ptr(),
                Err(_) => std::ptr::null_mut(),
            }
        } else {
            // Safety: same contract as alloc.
            let ptr = unsafe { self.alloc(layout) };
            if !ptr.is_null() {
                // Safety: the allocation is at least layout.size() bytes.
                unsafe { std::ptr::write_bytes(ptr, 0, layout.size()) };
            }
            ptr
        }
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        layout: std::alloc::Layout,
        new_size: usize,
    ) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            // Safety: ptr came from alloc on this allocator.
            match unsafe { Self::reallocate(ptr, new_size) } {
                Ok(p) => p.as_ptr(),
                Err(_) => std::ptr::null_mut(),
            }
        } else {
            // Over-aligned blocks go through allocate-copy-free to keep
            // the alignment guarantee.
            let new_layout =
                match std::alloc::Layout::from_size_align(new_size, layout.align()) {
                    Ok(l) => l,
                    Err(_) => return std::ptr::null_mut(),
                };
            // Safety: same contract as alloc; copy is bounded by both
            // allocation sizes.
            unsafe {
                let fresh = self.alloc(new_layout);
                if !fresh.is_null() {
                    std::ptr::copy_nonoverlapping(
                        ptr,
                        fresh,
                        layout.size().min(new_size),
                    );
                    Self::free(ptr);
                }
                fresh
            }
        }
    }
}
