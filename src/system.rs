//! The process-wide heap.
//!
//! One [`DEFAULT_HEAP_SIZE`] arena behind a [`SpinLock`], built at compile
//! time so it lands in zero-initialized memory. Firmware either calls the
//! functions here directly or registers [`SystemHeap`] as the global
//! allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOCATOR: mcu_heap::SystemHeap = mcu_heap::SystemHeap;
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{
    config::{DEFAULT_HEAP_SIZE, HeapConfig, OomHook},
    guarded::GuardedHeap,
    heap::HeapStats,
    section::SpinLock,
};

static SYSTEM: GuardedHeap<DEFAULT_HEAP_SIZE, SpinLock> =
    GuardedHeap::with_config(SpinLock::new(), HeapConfig::new().oom_hook(malloc_failed));

static MALLOC_FAILED_HOOK: spin::Once<OomHook> = spin::Once::new();

fn malloc_failed(requested: usize) {
    if let Some(hook) = MALLOC_FAILED_HOOK.get() {
        hook(requested);
    }
}

/// Registers the hook called when a system heap allocation runs out of
/// memory. Only the first registration takes effect; returns whether this
/// one did.
pub fn set_malloc_failed_hook(hook: OomHook) -> bool {
    let mut installed = false;
    MALLOC_FAILED_HOOK.call_once(|| {
        installed = true;
        hook
    });
    installed
}

/// Allocates `size` zeroed bytes, or returns null.
pub fn port_malloc(size: usize) -> *mut u8 {
    SYSTEM
        .allocate(size)
        .map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// # Safety
/// `ptr` must be null or come from [`port_malloc`], and must not be used
/// afterwards.
pub unsafe fn port_free(ptr: *mut u8) {
    unsafe { SYSTEM.free(ptr) }
}

pub fn free_heap_size() -> usize {
    SYSTEM.free_bytes()
}

pub fn minimum_ever_free_heap_size() -> usize {
    SYSTEM.minimum_ever_free_bytes()
}

pub fn heap_stats() -> HeapStats {
    SYSTEM.stats()
}

/// Global allocator backed by the system heap.
pub struct SystemHeap;

unsafe impl GlobalAlloc for SystemHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { SYSTEM.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { SYSTEM.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { SYSTEM.dealloc(ptr, layout) }
    }
}
