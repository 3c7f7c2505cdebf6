//! First-fit heap over a single fixed arena.
//!
//! ```text
//!   offset 0                                              end   N
//!   ┌──────────┬──────────────┬──────────┬────────────────┬─────┬──┐
//!   │ hdr│data │ hdr│  free   │ hdr│data │ hdr│   free    │ END │  │
//!   └──────────┴──────────────┴──────────┴────────────────┴─────┴──┘
//!                 ▲                           ▲
//!   start ────────┘ ────── next ──────────────┘ ── next ──▶ END
//! ```
//!
//! Free blocks are chained in address order. Allocation walks the chain and
//! takes the first block that fits, splitting off the tail when the surplus
//! is larger than [`MIN_BLOCK_SIZE`]. Freeing links the block back in and
//! merges it with whichever neighbours are free, so two free blocks are
//! never adjacent.

use core::ptr::NonNull;

use crate::{
    arena::Arena,
    block::{BlockLink, BlockRef, BlockState, HEADER_SIZE, MIN_BLOCK_SIZE, NONE, align_up},
    config::{ALIGNMENT, FreeCheck, HeapConfig},
    error::{AllocError, Violation},
    free_list::{FreeBlocks, FreeList},
};

const SIZE_LIMIT: usize = 1 << (usize::BITS - 1);

/// Snapshot of the heap, in the shape of FreeRTOS `HeapStats_t`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub available_bytes: usize,
    pub largest_free_block: usize,
    /// 0 when there are no free blocks.
    pub smallest_free_block: usize,
    pub free_blocks: usize,
    pub minimum_ever_free_bytes: usize,
    pub successful_allocations: usize,
    pub successful_frees: usize,
}

/// A heap owning an `N` byte arena.
///
/// The arena layout is built by the first [`Heap::allocate`] call with a
/// valid size. Payload pointers point into the heap itself, so the
/// heap must not move while allocations are outstanding; keep it in a
/// `static` (see [`GuardedHeap`](crate::GuardedHeap)) or pin it in place.
pub struct Heap<const N: usize> {
    arena: Arena<N>,
    free_list: FreeList,
    free_bytes: usize,
    minimum_ever_free_bytes: usize,
    successful_allocations: usize,
    successful_frees: usize,
    config: HeapConfig,
}

impl<const N: usize> Heap<N> {
    pub const fn new() -> Self {
        Self::with_config(HeapConfig::new())
    }

    pub const fn with_config(config: HeapConfig) -> Self {
        const {
            assert!(N >= 2 * MIN_BLOCK_SIZE, "arena too small for a heap");
        }

        Heap {
            arena: Arena::new(),
            free_list: FreeList::new(),
            free_bytes: 0,
            minimum_ever_free_bytes: 0,
            successful_allocations: 0,
            successful_frees: 0,
            config,
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    fn init(&mut self) {
        let size = self.free_list.init(&self.arena);
        self.free_bytes = size;
        self.minimum_ever_free_bytes = size;

        log::debug!("heap initialized: {size} of {N} bytes usable");
    }

    /// Allocates `size` zeroed bytes, 8-byte aligned. The block taken is
    /// `size` rounded up to [`ALIGNMENT`] plus the header, so small requests
    /// cost a full [`MIN_BLOCK_SIZE`].
    ///
    /// On [`AllocError::OutOfMemory`] the configured out-of-memory hook runs
    /// before this returns.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let result = self.try_allocate(size);
        if let Err(AllocError::OutOfMemory { requested, .. }) = result {
            self.out_of_memory(requested);
        }
        result
    }

    pub(crate) fn out_of_memory(&self, requested: usize) {
        if let Some(hook) = self.config.oom_hook {
            hook(requested);
        }
    }

    pub(crate) fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 || size & SIZE_LIMIT != 0 {
            return Err(AllocError::InvalidSize { requested: size });
        }

        if !self.free_list.is_initialized() {
            self.init();
        }

        // size is below SIZE_LIMIT, this cannot overflow
        let wanted = (align_up(size) + HEADER_SIZE).max(MIN_BLOCK_SIZE);
        let out_of_memory = AllocError::OutOfMemory {
            requested: size,
            free: self.free_bytes,
        };

        let found = if wanted <= self.free_bytes {
            self.free_list.take_first_fit(&self.arena, wanted)
        } else {
            None
        };
        let Some(offset) = found else {
            log::warn!("malloc failed: {size} bytes, {} free", self.free_bytes);
            return Err(out_of_memory);
        };

        let block = BlockRef::new(&self.arena, offset);
        if block.size() - wanted > MIN_BLOCK_SIZE {
            let rest = offset + wanted;
            BlockRef::new(&self.arena, rest).write(BlockLink::free(block.size() - wanted, NONE));
            block.set_size(wanted);
            self.free_list.insert(&self.arena, rest);
        }

        self.free_bytes -= block.size();
        self.minimum_ever_free_bytes = self.minimum_ever_free_bytes.min(self.free_bytes);

        block.set_state(BlockState::Allocated);
        block.set_next(NONE);
        self.successful_allocations += 1;

        self.arena.zero(block.payload(), block.size() - HEADER_SIZE);
        log::trace!("malloc {size} -> block {offset} ({} bytes)", block.size());

        Ok(self.arena.ptr_at(block.payload()))
    }

    /// Returns a block to the heap. Null is ignored.
    ///
    /// A pointer that is not a live allocation of this heap is handled by the
    /// configured [`FreeCheck`]: a panic, or an error log and no change.
    ///
    /// # Safety
    /// `ptr` must not be used after this call. Passing a pointer into the
    /// middle of a live allocation can corrupt the heap if the bytes before
    /// it happen to look like a header.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if let Err(violation) = unsafe { self.try_free(ptr) } {
            reject_free(self.config.free_check, violation);
        }
    }

    /// Like [`Heap::free`], but reports violations instead of applying the
    /// [`FreeCheck`] policy. The heap is unchanged on error.
    ///
    /// # Safety
    /// Same as [`Heap::free`].
    pub unsafe fn try_free(&mut self, ptr: *mut u8) -> Result<(), Violation> {
        if ptr.is_null() {
            return Ok(());
        }

        let offset = self.block_of(ptr)?;
        let block = BlockRef::new(&self.arena, offset);
        let link = block.read().ok_or(Violation::Corrupt { offset })?;
        if link.state == BlockState::Free {
            return Err(Violation::NotAllocated { offset });
        }
        if link.next != NONE {
            return Err(Violation::StillLinked { offset });
        }

        let size = link.size;
        let fits = offset
            .checked_add(size)
            .is_some_and(|end| end <= self.free_list.end());
        if size < MIN_BLOCK_SIZE || size % ALIGNMENT != 0 || !fits {
            return Err(Violation::Corrupt { offset });
        }

        block.set_state(BlockState::Free);
        self.free_bytes += size;
        self.successful_frees += 1;
        self.free_list.insert(&self.arena, offset);

        log::trace!("free block {offset} ({size} bytes)");
        Ok(())
    }

    /// Header offset for a payload pointer.
    fn block_of(&self, ptr: *mut u8) -> Result<usize, Violation> {
        let addr = ptr.addr();
        let payload = self
            .arena
            .offset_of(ptr)
            .filter(|payload| self.free_list.is_initialized() && *payload < self.free_list.end())
            .filter(|payload| *payload >= HEADER_SIZE)
            .ok_or(Violation::ForeignPointer { addr })?;

        if payload % ALIGNMENT != 0 {
            return Err(Violation::Misaligned { addr });
        }
        Ok(payload - HEADER_SIZE)
    }

    /// Bytes not currently allocated, headers of free blocks included.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Lowest value [`Heap::free_bytes`] has had since initialization.
    pub fn minimum_ever_free_bytes(&self) -> usize {
        self.minimum_ever_free_bytes
    }

    /// Bytes blocks can occupy; 0 until the first allocation.
    pub fn capacity(&self) -> usize {
        if self.free_list.is_initialized() {
            self.free_list.end()
        } else {
            0
        }
    }

    pub fn free_blocks(&self) -> FreeBlocks<'_, N> {
        self.free_list.iter(&self.arena)
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            available_bytes: self.free_bytes,
            minimum_ever_free_bytes: self.minimum_ever_free_bytes,
            successful_allocations: self.successful_allocations,
            successful_frees: self.successful_frees,
            ..HeapStats::default()
        };

        for block in self.free_blocks() {
            stats.free_blocks += 1;
            stats.largest_free_block = stats.largest_free_block.max(block.size);
            stats.smallest_free_block = match stats.smallest_free_block {
                0 => block.size,
                smallest => smallest.min(block.size),
            };
        }

        stats
    }
}

pub(crate) fn reject_free(check: FreeCheck, violation: Violation) {
    match check {
        FreeCheck::Panic => panic!("{violation}"),
        FreeCheck::Log => log::error!("ignored bad free: {violation}"),
    }
}

impl<const N: usize> Default for Heap<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;
    use crate::free_list::FreeBlock;

    const N: usize = 1024;
    const USABLE: usize = N - HEADER_SIZE;

    fn block_size<const M: usize>(heap: &Heap<M>, ptr: NonNull<u8>) -> usize {
        let offset = heap.arena.offset_of(ptr.as_ptr()).unwrap() - HEADER_SIZE;
        BlockRef::new(&heap.arena, offset).size()
    }

    /// Free blocks ascend, never touch each other and are correctly sized.
    fn assert_well_formed<const M: usize>(heap: &Heap<M>) {
        let blocks: Vec<FreeBlock> = heap.free_blocks().collect();
        for pair in blocks.windows(2) {
            assert!(pair[0].offset + pair[0].size < pair[1].offset);
        }
        for block in &blocks {
            assert_eq!(block.size % ALIGNMENT, 0);
            assert!(block.size >= MIN_BLOCK_SIZE);
        }
        let free: usize = blocks.iter().map(|b| b.size).sum();
        assert_eq!(free, heap.free_bytes());
    }

    #[test]
    fn lazy_init() {
        let mut heap = Heap::<N>::new();
        assert_eq!(heap.free_bytes(), 0);
        assert_eq!(heap.capacity(), 0);
        assert_eq!(heap.free_blocks().count(), 0);

        let ptr = heap.allocate(8).unwrap();
        assert_eq!(heap.capacity(), USABLE);
        unsafe { heap.free(ptr.as_ptr()) };
        assert_eq!(heap.free_bytes(), USABLE);
    }

    #[test]
    fn alloc_and_oom() {
        let mut heap = Heap::<N>::new();

        let one = heap.allocate(100).unwrap();
        assert_eq!(one.as_ptr().addr() % ALIGNMENT, 0);
        assert_eq!(heap.free_bytes(), USABLE - (104 + HEADER_SIZE));

        let after_one = heap.free_bytes();
        let blocks: Vec<FreeBlock> = heap.free_blocks().collect();
        assert_eq!(
            heap.allocate(2000),
            Err(AllocError::OutOfMemory {
                requested: 2000,
                free: after_one
            })
        );
        assert_eq!(heap.free_bytes(), after_one);
        assert_eq!(heap.free_blocks().collect::<Vec<_>>(), blocks);
        assert_eq!(heap.stats().successful_allocations, 1);

        unsafe { heap.free(one.as_ptr()) };
        assert_eq!(heap.free_bytes(), USABLE);
        assert_eq!(
            heap.free_blocks().collect::<Vec<_>>(),
            [FreeBlock {
                offset: 0,
                size: USABLE
            }]
        );
    }

    #[test]
    fn invalid_sizes() {
        let mut heap = Heap::<N>::new();
        assert_eq!(heap.allocate(0), Err(AllocError::InvalidSize { requested: 0 }));
        assert_eq!(
            heap.allocate(SIZE_LIMIT | 16),
            Err(AllocError::InvalidSize {
                requested: SIZE_LIMIT | 16
            })
        );
        assert_eq!(
            heap.allocate(usize::MAX),
            Err(AllocError::InvalidSize { requested: usize::MAX })
        );
        // Rejected before the arena is laid out.
        assert_eq!(heap.capacity(), 0);
    }

    #[test]
    fn free_in_any_order() {
        let orders = [[1, 0, 2], [0, 1, 2], [2, 1, 0], [0, 2, 1], [2, 0, 1], [1, 2, 0]];
        for order in orders {
            let mut heap = Heap::<N>::new();
            let ptrs = [
                heap.allocate(64).unwrap(),
                heap.allocate(64).unwrap(),
                heap.allocate(64).unwrap(),
            ];
            for i in order {
                unsafe { heap.free(ptrs[i].as_ptr()) };
                assert_well_formed(&heap);
            }
            assert_eq!(
                heap.free_blocks().collect::<Vec<_>>(),
                [FreeBlock {
                    offset: 0,
                    size: USABLE
                }]
            );
        }
    }

    #[test]
    fn exact_fit_does_not_split() {
        let mut heap = Heap::<N>::new();
        let ptr = heap.allocate(USABLE - HEADER_SIZE).unwrap();
        assert_eq!(heap.free_bytes(), 0);
        assert_eq!(heap.free_blocks().count(), 0);
        assert_eq!(block_size(&heap, ptr), USABLE);

        assert!(matches!(heap.allocate(1), Err(AllocError::OutOfMemory { .. })));
        unsafe { heap.free(ptr.as_ptr()) };
        assert_eq!(heap.free_bytes(), USABLE);
    }

    #[test]
    fn small_surplus_is_handed_out() {
        let mut heap = Heap::<N>::new();
        // Leaves exactly MIN_BLOCK_SIZE behind, which is not worth a block.
        let size = USABLE - MIN_BLOCK_SIZE - HEADER_SIZE;
        let ptr = heap.allocate(size).unwrap();
        assert_eq!(block_size(&heap, ptr), USABLE);
        assert_eq!(heap.free_bytes(), 0);

        unsafe { heap.free(ptr.as_ptr()) };
        // One more alignment unit of surplus does split.
        let ptr = heap.allocate(size - ALIGNMENT).unwrap();
        assert_eq!(block_size(&heap, ptr), USABLE - MIN_BLOCK_SIZE - ALIGNMENT);
        assert_eq!(heap.free_bytes(), MIN_BLOCK_SIZE + ALIGNMENT);
    }

    #[test]
    fn tiny_requests_take_min_block() {
        let mut heap = Heap::<N>::new();
        let ptr = heap.allocate(1).unwrap();
        assert_eq!(block_size(&heap, ptr), MIN_BLOCK_SIZE);
        assert_eq!(heap.free_bytes(), USABLE - MIN_BLOCK_SIZE);
    }

    #[test]
    fn zeroed() {
        let mut heap = Heap::<N>::new();
        let one = heap.allocate(64).unwrap();
        unsafe {
            one.as_ptr().write_bytes(0xFF, 64);
            heap.free(one.as_ptr());
        }

        let two = heap.allocate(60).unwrap();
        assert_eq!(one, two);
        let sum: u32 = (0..64).map(|i| unsafe { *two.as_ptr().add(i) } as u32).sum();
        assert_eq!(sum, 0);
    }

    #[test]
    fn round_trip_restores_shape() {
        let mut heap = Heap::<N>::new();
        let keep = heap.allocate(40).unwrap();
        let hole = heap.allocate(200).unwrap();
        let _tail = heap.allocate(24).unwrap();
        unsafe { heap.free(hole.as_ptr()) };

        let free = heap.free_bytes();
        let blocks: Vec<FreeBlock> = heap.free_blocks().collect();
        let ptr = heap.allocate(16).unwrap();
        unsafe { heap.free(ptr.as_ptr()) };

        assert_eq!(heap.free_bytes(), free);
        assert_eq!(heap.free_blocks().collect::<Vec<_>>(), blocks);
        unsafe { heap.free(keep.as_ptr()) };
        assert_well_formed(&heap);
    }

    #[test]
    fn first_fit_reuses_lowest_hole() {
        let mut heap = Heap::<N>::new();
        let a = heap.allocate(128).unwrap();
        let _b = heap.allocate(16).unwrap();
        let c = heap.allocate(128).unwrap();
        let _d = heap.allocate(16).unwrap();
        unsafe {
            heap.free(c.as_ptr());
            heap.free(a.as_ptr());
        }

        assert_eq!(heap.allocate(128).unwrap(), a);
        assert_eq!(heap.allocate(128).unwrap(), c);
    }

    #[test]
    fn free_null() {
        let mut heap = Heap::<N>::new();
        unsafe { heap.free(core::ptr::null_mut()) };
        assert_eq!(unsafe { heap.try_free(core::ptr::null_mut()) }, Ok(()));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut heap = Heap::<N>::with_config(HeapConfig::new().free_check(FreeCheck::Panic));
        let ptr = heap.allocate(32).unwrap();
        unsafe {
            heap.free(ptr.as_ptr());
            heap.free(ptr.as_ptr());
        }
    }

    #[test]
    fn double_free_logged() {
        let mut heap = Heap::<N>::with_config(HeapConfig::new().free_check(FreeCheck::Log));
        let ptr = heap.allocate(32).unwrap();
        unsafe {
            heap.free(ptr.as_ptr());
            heap.free(ptr.as_ptr());
        }
        assert_eq!(heap.free_bytes(), USABLE);
        assert_eq!(heap.stats().successful_frees, 1);
        assert_well_formed(&heap);
    }

    #[test]
    fn violations() {
        let mut heap = Heap::<N>::new();
        let ptr = heap.allocate(64).unwrap();
        let before = heap.stats();

        let mut outside = 0u8;
        let outside = &mut outside as *mut u8;
        assert_eq!(
            unsafe { heap.try_free(outside) },
            Err(Violation::ForeignPointer { addr: outside.addr() })
        );

        let misaligned = unsafe { ptr.as_ptr().add(3) };
        assert_eq!(
            unsafe { heap.try_free(misaligned) },
            Err(Violation::Misaligned { addr: misaligned.addr() })
        );

        // Zeroed payload bytes never decode as a header.
        let inner = unsafe { ptr.as_ptr().add(HEADER_SIZE + 8) };
        assert_eq!(
            unsafe { heap.try_free(inner) },
            Err(Violation::Corrupt { offset: HEADER_SIZE + 8 })
        );

        let header = heap.arena.offset_of(ptr.as_ptr()).unwrap() - HEADER_SIZE;
        BlockRef::new(&heap.arena, header).set_next(0);
        assert_eq!(
            unsafe { heap.try_free(ptr.as_ptr()) },
            Err(Violation::StillLinked { offset: header })
        );
        BlockRef::new(&heap.arena, header).set_next(NONE);

        assert_eq!(heap.stats(), before);
        assert_eq!(unsafe { heap.try_free(ptr.as_ptr()) }, Ok(()));
        assert_eq!(
            unsafe { heap.try_free(ptr.as_ptr()) },
            Err(Violation::NotAllocated { offset: header })
        );
    }

    #[test]
    fn free_before_init() {
        let mut heap = Heap::<N>::new();
        let ptr = heap.arena.ptr_at(HEADER_SIZE).as_ptr();
        assert_eq!(
            unsafe { heap.try_free(ptr) },
            Err(Violation::ForeignPointer { addr: ptr.addr() })
        );
    }

    static OOM_REQUESTS: AtomicUsize = AtomicUsize::new(0);

    fn count_oom(requested: usize) {
        OOM_REQUESTS.fetch_add(requested, Ordering::Relaxed);
    }

    #[test]
    fn oom_hook() {
        let mut heap = Heap::<N>::with_config(HeapConfig::new().oom_hook(count_oom));
        assert!(heap.allocate(0).is_err());
        assert_eq!(OOM_REQUESTS.load(Ordering::Relaxed), 0);

        assert!(heap.allocate(4096).is_err());
        assert_eq!(OOM_REQUESTS.load(Ordering::Relaxed), 4096);
        assert!(heap.allocate(64).is_ok());
        assert_eq!(OOM_REQUESTS.load(Ordering::Relaxed), 4096);
    }

    #[test]
    fn stats() {
        let mut heap = Heap::<N>::new();
        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();
        unsafe { heap.free(a.as_ptr()) };

        let block = 64 + HEADER_SIZE;
        assert_eq!(
            heap.stats(),
            HeapStats {
                available_bytes: USABLE - block,
                largest_free_block: USABLE - 2 * block,
                smallest_free_block: block,
                free_blocks: 2,
                minimum_ever_free_bytes: USABLE - 2 * block,
                successful_allocations: 2,
                successful_frees: 1,
            }
        );
    }

    #[test]
    fn random_workload() {
        const SIZE: usize = 8192;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut heap = Heap::<SIZE>::new();
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
        let mut lowest = usize::MAX;

        for _ in 0..4000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..=512);
                let free = heap.free_bytes();
                let blocks = heap.free_blocks().count();
                match heap.allocate(size) {
                    Ok(ptr) => {
                        unsafe { ptr.as_ptr().write_bytes(0x3C, size) };
                        live.push((ptr, block_size(&heap, ptr)));
                    }
                    Err(AllocError::OutOfMemory { .. }) => {
                        assert_eq!(heap.free_bytes(), free);
                        assert_eq!(heap.free_blocks().count(), blocks);
                    }
                    Err(err) => panic!("{err}"),
                }
            } else {
                let (ptr, _) = live.swap_remove(rng.gen_range(0..live.len()));
                unsafe { heap.free(ptr.as_ptr()) };
            }

            let held: usize = live.iter().map(|(_, size)| size).sum();
            assert_eq!(heap.free_bytes() + held, heap.capacity());

            lowest = lowest.min(heap.free_bytes());
            assert_eq!(heap.minimum_ever_free_bytes(), lowest);
            assert_well_formed(&heap);
        }

        for (ptr, _) in live.drain(..) {
            unsafe { heap.free(ptr.as_ptr()) };
        }
        assert_eq!(
            heap.free_blocks().collect::<Vec<_>>(),
            [FreeBlock {
                offset: 0,
                size: SIZE - HEADER_SIZE
            }]
        );
    }
}
