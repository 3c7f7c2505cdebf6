use core::fmt;

/// Why an allocation request failed. No heap state changes on either path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Zero bytes, or a size with the top bit set.
    InvalidSize { requested: usize },
    /// No free block is large enough.
    OutOfMemory { requested: usize, free: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidSize { requested } => {
                write!(f, "invalid allocation size {requested}")
            }
            AllocError::OutOfMemory { requested, free } => write!(
                f,
                "out of memory: requested {requested} bytes, {free} bytes free"
            ),
        }
    }
}

/// A `free` that breaks the allocate/free contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// The pointer does not point into the payload area of the arena.
    ForeignPointer { addr: usize },
    /// The pointer is inside the arena but not on a block boundary.
    Misaligned { addr: usize },
    /// The block is already free (double free).
    NotAllocated { offset: usize },
    /// The block is tagged allocated but still carries a free-list link.
    StillLinked { offset: usize },
    /// The header does not decode to a valid block.
    Corrupt { offset: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::ForeignPointer { addr } => {
                write!(f, "free of pointer 0x{addr:x} outside the heap")
            }
            Violation::Misaligned { addr } => {
                write!(f, "free of pointer 0x{addr:x} not returned by allocate")
            }
            Violation::NotAllocated { offset } => {
                write!(f, "double free of block at offset {offset}")
            }
            Violation::StillLinked { offset } => {
                write!(f, "allocated block at offset {offset} is still linked")
            }
            Violation::Corrupt { offset } => {
                write!(f, "corrupt block header at offset {offset}")
            }
        }
    }
}
