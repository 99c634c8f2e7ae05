#[cfg(test)]
mod tests {
    use crate::heap::allocator::{Heap, HeapConfig, Tunable};
    use crate::heap::chunk::{ChunkRef, ALIGNMENT, MIN_CHUNK};
    use crate::heap::system::ArenaMemory;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn heap() -> Heap<ArenaMemory> {
        Heap::new(ArenaMemory::new(16 * 1024 * 1024))
    }

    #[test]
    fn zero_allocation_round_trip() {
        // X1: Empty state, allocate(0), free; byte accounting returns to
        // the empty figures.
        let mut h = heap();
        assert_eq!(h.stats().core_bytes, 0);

        let p = h.allocate(0).unwrap();
        // Safety: p is backed by a minimum-sized chunk.
        unsafe {
            assert!(h.usable_size(p.as_ptr()) >= MIN_CHUNK - ALIGNMENT);
            h.free(p.as_ptr());
        }

        let s = h.stats();
        assert_eq!(s.in_use_bytes, 0);
        assert_eq!(s.free_bytes, s.core_bytes);
        h.check_state();
    }

    #[test]
    fn heap_allocation_trim_returns_pages() {
        // X2: A six-figure request stays on the contiguous heap, folds back
        // into top on free, and trim hands whole pages to the system.
        let mut h = heap();
        let a = h.allocate(100_000).unwrap();
        assert_eq!(h.stats().mapped_count, 0, "below the mapping threshold");
        let grown = h.stats().core_bytes;
        assert!(grown >= 100_000);
        assert_eq!(grown % 4096, 0);

        // Safety: a is live and unused afterwards.
        unsafe { h.free(a.as_ptr()) };
        assert_eq!(h.stats().releasable_bytes, grown, "free folds into top");

        assert!(h.trim(0), "top far exceeds one page");
        let after = h.stats().core_bytes;
        assert!(after < grown);
        assert_eq!((grown - after) % 4096, 0, "release is page-granular");
        assert_eq!(after, h.memory().break_used());

        // Nothing left to give back: trim is idempotent.
        assert!(!h.trim(0));
        h.check_state();
    }

    #[test]
    fn physical_walk_reaches_top_once() {
        // X3: After consolidation the chunk chain from the heap base is
        // seamless: boundary tags agree, no two free chunks touch, the
        // sizes sum to the break usage, and the walk ends exactly at top.
        let mut h = heap();
        let mut live = Vec::new();
        for i in 0..40usize {
            live.push(h.allocate(24 + (i % 7) * 48).unwrap());
        }
        // Free every other allocation, then consolidate via trim.
        // Safety: each pointer is freed at most once.
        unsafe {
            for p in live.iter().step_by(2) {
                h.free(p.as_ptr());
            }
        }
        h.trim(0);

        let base = h.memory().base();
        let break_used = h.memory().break_used();
        let stats = h.stats();
        assert_eq!(stats.core_bytes, break_used);

        // Safety: the walk stays inside the arena's break region.
        unsafe {
            let end = base.as_ptr() as usize + break_used;
            let mut p = ChunkRef::from_base(base.as_ptr());
            let mut total = 0;
            let mut prev_free = false;
            loop {
                let size = p.size();
                assert!(size >= MIN_CHUNK);
                total += size;
                if p.addr() + size == end {
                    // The wilderness chunk: never binned, prev-in-use set,
                    // tail touching the frontier.
                    assert_eq!(size, stats.releasable_bytes);
                    assert!(p.prev_in_use() == !prev_free);
                    break;
                }
                assert!(p.addr() + size < end, "walk overran the frontier");
                let free = !p.at_offset(size).prev_in_use();
                if free {
                    assert_eq!(p.at_offset(size).prev_size(), size, "foot mismatch");
                    assert!(!prev_free, "adjacent free chunks after consolidation");
                }
                assert!(p.prev_in_use() == !prev_free, "stale prev-in-use bit");
                prev_free = free;
                p = p.at_offset(size);
            }
            assert_eq!(total, break_used, "chunk sizes must tile the region");
        }
        h.check_state();
    }

    #[test]
    fn fallback_mapping_fences_off_old_region() {
        // X4: When the break refuses to grow, the heap continues in a
        // mapped region; the orphaned old top is fenced, freed, and stays
        // allocatable without ever coalescing across the gap.
        let mut h = Heap::new(ArenaMemory::with_break_limit(64 * 1024, 4096));
        let a = h.allocate(1000).unwrap();

        // Forces the fallback: 5008 bytes cannot fit the remaining page.
        let c = h.allocate(5000).unwrap();
        let region1 = h.memory().base().as_ptr() as usize;
        let c_addr = c.as_ptr() as usize;
        assert!(
            c_addr < region1 || c_addr >= region1 + 4096,
            "large request must live in the fallback region"
        );

        // The old top's body is reusable despite the hole.
        let d = h.allocate(2000).unwrap();
        let d_addr = d.as_ptr() as usize;
        assert!(
            (region1..region1 + 4096).contains(&d_addr),
            "orphaned region should serve further requests"
        );

        // Both regions stay intact under writes.
        // Safety: all payloads are live with the written sizes.
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0x11, 1000);
            std::ptr::write_bytes(c.as_ptr(), 0x22, 5000);
            std::ptr::write_bytes(d.as_ptr(), 0x33, 2000);
            assert_eq!(a.as_ptr().add(999).read(), 0x11);
            assert_eq!(c.as_ptr().add(4999).read(), 0x22);
            assert_eq!(d.as_ptr().add(1999).read(), 0x33);

            h.free(d.as_ptr());
            h.free(a.as_ptr());
            h.free(c.as_ptr());
        }
        h.check_state();

        // The heap keeps working in non-contiguous mode.
        let e = h.allocate(3000).unwrap();
        // Safety: e is live and unused afterwards.
        unsafe { h.free(e.as_ptr()) };
        h.check_state();
    }

    #[test]
    fn realloc_chain_preserves_prefix() {
        // X5: Repeated growth through every reallocation strategy keeps the
        // original bytes intact.
        let mut h = heap();
        let mut p = h.allocate(64).unwrap();
        // Safety: p is a fresh 64-byte payload.
        unsafe {
            for i in 0..64u8 {
                p.as_ptr().add(i as usize).write(i);
            }
        }
        let mut wall = Vec::new();
        for step in 1..8usize {
            // A wall after the block forces some moves and allows some
            // in-place growth, covering both paths.
            if step % 2 == 0 {
                wall.push(h.allocate(48).unwrap());
            }
            // Safety: p is live; the new pointer supersedes it.
            p = unsafe { h.reallocate(p.as_ptr(), 64 << step).unwrap() };
            // Safety: the first 64 bytes survived the resize.
            unsafe {
                for i in 0..64u8 {
                    assert_eq!(p.as_ptr().add(i as usize).read(), i, "step {step}");
                }
            }
        }
        h.check_state();
    }

    #[test]
    fn mapping_threshold_crossover() {
        // X6: The same request size switches acquisition paths when the
        // threshold tunable moves.
        let mut h = heap();
        let p = h.allocate(50_000).unwrap();
        assert_eq!(h.stats().mapped_count, 0);
        // Safety: p is live and unused afterwards.
        unsafe { h.free(p.as_ptr()) };

        assert!(h.tune(Tunable::MmapThreshold, 32 * 1024));
        let q = h.allocate(50_000).unwrap();
        assert_eq!(h.stats().mapped_count, 1);
        // Safety: q is live and unused afterwards.
        unsafe { h.free(q.as_ptr()) };
        assert_eq!(h.stats().mapped_count, 0);
        h.check_state();
    }

    #[test]
    fn stress_mixed_operations() {
        // X7: Seeded slot-array stress over every public operation, with a
        // full structural audit at regular intervals.
        let mut h = Heap::with_config(
            ArenaMemory::new(32 * 1024 * 1024),
            HeapConfig {
                // Low enough that the stress regularly crosses the mapping
                // path as well.
                mmap_threshold: 64 * 1024,
                ..HeapConfig::default()
            },
        );
        let mut rng = StdRng::seed_from_u64(0x7461_6768_6561_7021);
        let mut slots: Vec<Option<(std::ptr::NonNull<u8>, usize, u8)>> = vec![None; 48];

        for iter in 0..3000usize {
            let i = rng.gen_range(0..slots.len());
            match slots[i].take() {
                None => {
                    let size = if rng.gen_ratio(1, 40) {
                        rng.gen_range(64 * 1024..128 * 1024)
                    } else {
                        rng.gen_range(1..4000)
                    };
                    let fill = rng.gen::<u8>();
                    let p = match rng.gen_range(0..4) {
                        0 => h.allocate_zeroed(size, 1).unwrap(),
                        1 => h.allocate_aligned(1 << rng.gen_range(5..10), size).unwrap(),
                        _ => h.allocate(size).unwrap(),
                    };
                    assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
                    // Safety: fresh payload of at least `size` bytes.
                    unsafe {
                        assert!(h.usable_size(p.as_ptr()) >= size);
                        std::ptr::write_bytes(p.as_ptr(), fill, size);
                    }
                    slots[i] = Some((p, size, fill));
                }
                Some((p, size, fill)) => {
                    // Verify the pattern before the chunk changes hands.
                    // Safety: p is live with `size` patterned bytes.
                    unsafe {
                        let spot = rng.gen_range(0..size);
                        assert_eq!(p.as_ptr().add(spot).read(), fill, "corrupted slot {i}");
                        assert_eq!(p.as_ptr().read(), fill);
                        assert_eq!(p.as_ptr().add(size - 1).read(), fill);
                    }
                    if rng.gen_ratio(1, 4) {
                        let new_size = rng.gen_range(1..6000);
                        // Safety: p is live; q supersedes it.
                        let q = unsafe { h.reallocate(p.as_ptr(), new_size).unwrap() };
                        // Safety: the common prefix survives the resize.
                        unsafe {
                            for off in [0, size.min(new_size) - 1] {
                                assert_eq!(q.as_ptr().add(off).read(), fill);
                            }
                            std::ptr::write_bytes(q.as_ptr(), fill, new_size);
                        }
                        slots[i] = Some((q, new_size, fill));
                    } else {
                        // Safety: p is live and unused afterwards.
                        unsafe { h.free(p.as_ptr()) };
                    }
                }
            }

            if iter % 64 == 63 {
                h.check_state();
            }
            if iter % 512 == 511 {
                h.trim(0);
            }
        }

        // Drain every slot and confirm the heap returns to rest.
        // Safety: each live payload is freed exactly once.
        unsafe {
            for slot in slots.iter_mut() {
                if let Some((p, size, fill)) = slot.take() {
                    assert_eq!(p.as_ptr().read(), fill);
                    assert_eq!(p.as_ptr().add(size - 1).read(), fill);
                    h.free(p.as_ptr());
                }
            }
        }
        h.trim(0);
        let s = h.stats();
        assert_eq!(s.in_use_bytes, 0);
        assert_eq!(s.mapped_count, 0);
        assert_eq!(s.free_bytes, s.core_bytes);
        h.check_state();
    }

    #[test]
    fn bulk_and_scalar_allocations_interleave() {
        // X8: Bulk carves and scalar traffic share the heap without
        // stepping on each other.
        let mut h = heap();
        let scalars: Vec<_> = (0..8usize).map(|i| h.allocate(100 + i * 8).unwrap()).collect();
        let bulk = h.independent_calloc(16, 48).unwrap();
        let sizes = [24usize, 400, 64, 1000];
        let co = h.independent_comalloc(&sizes).unwrap();

        // Safety: every payload below is live with the stated size.
        unsafe {
            for (i, p) in bulk.iter().enumerate() {
                std::ptr::write_bytes(p.as_ptr(), i as u8 + 1, 48);
            }
            for (p, &sz) in co.iter().zip(&sizes) {
                std::ptr::write_bytes(p.as_ptr(), 0xC0, sz);
            }
            // Free bulk elements out of order, interleaved with scalars.
            for p in bulk.iter().step_by(2) {
                h.free(p.as_ptr());
            }
            for p in &scalars {
                h.free(p.as_ptr());
            }
            for p in bulk.iter().skip(1).step_by(2) {
                h.free(p.as_ptr());
            }
            for (p, &sz) in co.iter().zip(&sizes) {
                assert_eq!(p.as_ptr().add(sz - 1).read(), 0xC0);
                h.free(p.as_ptr());
            }
        }
        h.trim(0);
        assert_eq!(h.stats().in_use_bytes, 0);
        h.check_state();
    }
}
