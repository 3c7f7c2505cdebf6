use crate::{
    arena::{Arena, WORD},
    config::ALIGNMENT,
};

/// Marks a `next` field that points nowhere: the end sentinel and every
/// allocated block carry it.
pub const NONE: usize = usize::MAX;

// Field offsets inside a header.
const NEXT: usize = 0;
const SIZE: usize = WORD;
const STATE: usize = 2 * WORD;

/// Bytes taken by the header at the start of every block.
pub const HEADER_SIZE: usize = align_up(STATE + 1);

/// A split never leaves a free remainder this small or smaller.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE << 1;

/// Rounds `n` up to the alignment unit. Callers guarantee no overflow.
pub const fn align_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Who owns a block. Stored as a tag byte; any other byte value in that
/// position means the header was overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Free = 0x5A,
    Allocated = 0xA5,
}

impl BlockState {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            t if t == BlockState::Free as u8 => Some(BlockState::Free),
            t if t == BlockState::Allocated as u8 => Some(BlockState::Allocated),
            _ => None,
        }
    }
}

/// Decoded block header.
///
/// `size` counts the whole block, header included. `next` is the offset of
/// the following free block and is only meaningful while the block is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLink {
    pub next: usize,
    pub size: usize,
    pub state: BlockState,
}

impl BlockLink {
    pub const fn free(size: usize, next: usize) -> Self {
        BlockLink {
            next,
            size,
            state: BlockState::Free,
        }
    }

    pub const fn end_sentinel() -> Self {
        Self::free(0, NONE)
    }
}

/// A header inside an arena, addressed by offset.
///
/// Never access the header bytes directly; go through this API so the
/// field layout stays in one place.
#[derive(Clone, Copy)]
pub struct BlockRef<'a, const N: usize> {
    arena: &'a Arena<N>,
    offset: usize,
}

impl<'a, const N: usize> BlockRef<'a, N> {
    pub fn new(arena: &'a Arena<N>, offset: usize) -> Self {
        debug_assert_eq!(offset % ALIGNMENT, 0);
        BlockRef { arena, offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn end(&self) -> usize {
        self.offset + self.size()
    }

    pub fn next(&self) -> usize {
        self.arena.read_word(self.offset + NEXT)
    }

    pub fn set_next(&self, next: usize) {
        self.arena.write_word(self.offset + NEXT, next)
    }

    pub fn size(&self) -> usize {
        self.arena.read_word(self.offset + SIZE)
    }

    pub fn set_size(&self, size: usize) {
        self.arena.write_word(self.offset + SIZE, size)
    }

    pub fn add_size(&self, size: usize) {
        self.set_size(self.size() + size)
    }

    pub fn state(&self) -> Option<BlockState> {
        BlockState::from_tag(self.arena.read_byte(self.offset + STATE))
    }

    pub fn set_state(&self, state: BlockState) {
        self.arena.write_byte(self.offset + STATE, state as u8)
    }

    pub fn read(&self) -> Option<BlockLink> {
        Some(BlockLink {
            next: self.next(),
            size: self.size(),
            state: self.state()?,
        })
    }

    pub fn write(&self, link: BlockLink) {
        self.set_next(link.next);
        self.set_size(link.size);
        self.set_state(link.state);
    }

    pub fn payload(&self) -> usize {
        self.offset + HEADER_SIZE
    }
}
