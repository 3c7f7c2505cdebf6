use crate::{
    arena::Arena,
    block::{BlockLink, BlockRef, HEADER_SIZE, NONE},
    config::ALIGNMENT,
};

/// A free block as seen from outside the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: usize,
    // header included
    pub size: usize,
}

/// Singly linked list of free blocks in ascending offset order.
///
/// The start sentinel is `head`; it has no bytes in the arena. The end
/// sentinel is a header-only block at the top of the arena with size 0
/// and no successor, so every walk stops there.
pub struct FreeList {
    head: usize,
    end: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList {
            head: NONE,
            end: NONE,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.end != NONE
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Lays out a single free block spanning the arena below the end
    /// sentinel and returns its size.
    pub fn init<const N: usize>(&mut self, arena: &Arena<N>) -> usize {
        let end = (arena.usable_len() - HEADER_SIZE) & !(ALIGNMENT - 1);
        BlockRef::new(arena, end).write(BlockLink::end_sentinel());
        BlockRef::new(arena, 0).write(BlockLink::free(end, end));

        self.head = 0;
        self.end = end;
        end
    }

    // `None` stands for the start sentinel.
    fn next_of<const N: usize>(&self, arena: &Arena<N>, node: Option<usize>) -> usize {
        match node {
            None => self.head,
            Some(offset) => BlockRef::new(arena, offset).next(),
        }
    }

    fn link<const N: usize>(&mut self, arena: &Arena<N>, node: Option<usize>, next: usize) {
        match node {
            None => self.head = next,
            Some(offset) => BlockRef::new(arena, offset).set_next(next),
        }
    }

    /// Unlinks and returns the lowest-addressed block of at least `wanted`
    /// bytes, or `None` if the walk reaches the end sentinel.
    pub fn take_first_fit<const N: usize>(&mut self, arena: &Arena<N>, wanted: usize) -> Option<usize> {
        let mut prev = None;
        let mut block = BlockRef::new(arena, self.head);
        while block.size() < wanted && block.next() != NONE {
            prev = Some(block.offset());
            block = BlockRef::new(arena, block.next());
        }

        if block.offset() == self.end {
            return None;
        }

        self.link(arena, prev, block.next());
        Some(block.offset())
    }

    /// Links the free block at `offset` back into the list, merging it with
    /// the free blocks directly before and after it.
    pub fn insert<const N: usize>(&mut self, arena: &Arena<N>, offset: usize) {
        debug_assert!(offset < self.end);

        let mut prev = None;
        loop {
            let next = self.next_of(arena, prev);
            if next >= offset {
                break;
            }
            prev = Some(next);
        }

        let mut block = BlockRef::new(arena, offset);
        if let Some(prev) = prev.map(|p| BlockRef::new(arena, p)) {
            if prev.end() == offset {
                prev.add_size(block.size());
                block = prev;
            }
        }

        let succ = self.next_of(arena, prev);
        if block.end() == succ && succ != self.end {
            let succ = BlockRef::new(arena, succ);
            block.add_size(succ.size());
            block.set_next(succ.next());
        } else {
            block.set_next(succ);
        }

        // After a backward merge the predecessor already is the block.
        if prev != Some(block.offset()) {
            self.link(arena, prev, block.offset());
        }
    }

    pub fn iter<'a, const N: usize>(&self, arena: &'a Arena<N>) -> FreeBlocks<'a, N> {
        FreeBlocks {
            arena,
            next: self.head,
            end: self.end,
        }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// Free blocks in address order, sentinels excluded.
pub struct FreeBlocks<'a, const N: usize> {
    arena: &'a Arena<N>,
    next: usize,
    end: usize,
}

impl<const N: usize> Iterator for FreeBlocks<'_, N> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        if self.next == self.end || self.next == NONE {
            return None;
        }
        let block = BlockRef::new(self.arena, self.next);
        self.next = block.next();

        Some(FreeBlock {
            offset: block.offset(),
            size: block.size(),
        })
    }
}
