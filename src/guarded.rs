use core::{
    alloc::{GlobalAlloc, Layout},
    cell::UnsafeCell,
    ptr::{self, NonNull},
};

use crate::{
    config::{ALIGNMENT, FreeCheck, HeapConfig},
    error::{AllocError, Violation},
    heap::{Heap, HeapStats, reject_free},
    section::CriticalSection,
};

/// A [`Heap`] that can be shared: every access runs inside the critical
/// section `C`.
///
/// The out-of-memory hook and the bad-free policy run after the section has
/// been left, so a hook may call back into the heap. A bad free reaching
/// [`GlobalAlloc::dealloc`] under [`FreeCheck::Panic`] aborts instead of
/// panicking.
///
/// ```rust,ignore
/// use mcu_heap::{GuardedHeap, SpinLock};
///
/// #[global_allocator]
/// static HEAP: GuardedHeap<4096, SpinLock> = GuardedHeap::new(SpinLock::new());
/// ```
pub struct GuardedHeap<const N: usize, C> {
    heap: UnsafeCell<Heap<N>>,
    section: C,
}

unsafe impl<const N: usize, C: CriticalSection + Sync> Sync for GuardedHeap<N, C> {}

impl<const N: usize, C: CriticalSection> GuardedHeap<N, C> {
    pub const fn new(section: C) -> Self {
        Self::with_config(section, HeapConfig::new())
    }

    pub const fn with_config(section: C, config: HeapConfig) -> Self {
        GuardedHeap {
            heap: UnsafeCell::new(Heap::with_config(config)),
            section,
        }
    }

    fn locked<R>(&self, f: impl FnOnce(&mut Heap<N>) -> R) -> R {
        // The section makes this the only live reference to the heap.
        self.section.with(|| f(unsafe { &mut *self.heap.get() }))
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let (result, hook) = self.locked(|heap| (heap.try_allocate(size), heap.config().oom_hook));

        if let (Err(AllocError::OutOfMemory { requested, .. }), Some(hook)) = (result, hook) {
            hook(requested);
        }
        result
    }

    /// # Safety
    /// See [`Heap::free`].
    pub unsafe fn free(&self, ptr: *mut u8) {
        if let Err((check, violation)) = unsafe { self.release(ptr) } {
            reject_free(check, violation);
        }
    }

    unsafe fn release(&self, ptr: *mut u8) -> Result<(), (FreeCheck, Violation)> {
        let (result, check) =
            self.locked(|heap| (unsafe { heap.try_free(ptr) }, heap.config().free_check));
        result.map_err(|violation| (check, violation))
    }

    pub fn free_bytes(&self) -> usize {
        self.locked(|heap| heap.free_bytes())
    }

    pub fn minimum_ever_free_bytes(&self) -> usize {
        self.locked(|heap| heap.minimum_ever_free_bytes())
    }

    pub fn capacity(&self) -> usize {
        self.locked(|heap| heap.capacity())
    }

    pub fn stats(&self) -> HeapStats {
        self.locked(|heap| heap.stats())
    }
}

unsafe impl<const N: usize, C: CriticalSection> GlobalAlloc for GuardedHeap<N, C> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    // Blocks are always handed out zeroed.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { self.alloc(layout) }
    }

    // Must not unwind: a bad free under `FreeCheck::Panic` aborts.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        match unsafe { self.release(ptr) } {
            Ok(()) => {}
            Err((FreeCheck::Log, violation)) => reject_free(FreeCheck::Log, violation),
            Err((FreeCheck::Panic, violation)) => {
                log::error!("bad free in global allocator: {violation}");
                halt()
            }
        }
    }
}

// A panic cannot leave an `extern "C"` function, so this aborts.
#[cold]
extern "C" fn halt() -> ! {
    panic!("heap corrupted by a bad free")
}
