//! A first-fit heap for small embedded targets.
//!
//! All memory comes from one fixed arena. Free blocks are kept in a list
//! sorted by address; allocation takes the first block that is large
//! enough and splits off what is left, freeing merges the block with its
//! free neighbours. Every block starts with a small header holding its
//! size, its state and, while free, the offset of the next free block.
//!
//! - [`Heap`] owns an arena and does the bookkeeping.
//! - [`GuardedHeap`] puts a heap behind a [`CriticalSection`] and
//!   implements [`GlobalAlloc`](core::alloc::GlobalAlloc).
//! - [`system`] holds the process-wide heap and [`SystemHeap`].
//!
//! Returned memory is always zeroed and aligned to [`ALIGNMENT`]. Freeing
//! something that is not a live allocation panics unless the heap is
//! configured with [`FreeCheck::Log`] (or built with the `unchecked-free`
//! feature), in which case the free is logged and ignored.
#![cfg_attr(not(test), no_std)]

mod arena;
mod block;
pub mod config;
pub mod error;
mod free_list;
mod guarded;
mod heap;
pub mod section;
pub mod system;

pub use block::{HEADER_SIZE, MIN_BLOCK_SIZE};
pub use config::{ALIGNMENT, DEFAULT_HEAP_SIZE, FreeCheck, HeapConfig, OomHook};
pub use error::{AllocError, Violation};
pub use free_list::{FreeBlock, FreeBlocks};
pub use guarded::GuardedHeap;
pub use heap::{Heap, HeapStats};
#[cfg(unix)]
pub use section::SignalGuard;
pub use section::{CriticalSection, Interrupts, SingleCore, SpinLock};
pub use system::SystemHeap;
