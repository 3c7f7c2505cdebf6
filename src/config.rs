//! Compile-time constants and the per-heap runtime configuration.

/// Every block size and every payload address is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Size of the arena behind the process-wide [`SystemHeap`](crate::SystemHeap).
#[cfg(not(feature = "large-arena"))]
pub const DEFAULT_HEAP_SIZE: usize = 70 * 1024;
#[cfg(feature = "large-arena")]
pub const DEFAULT_HEAP_SIZE: usize = 80 * 1024;

/// Called with the requested size whenever an allocation runs out of memory.
pub type OomHook = fn(requested: usize);

/// What `free` does when handed a pointer that is not a live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeCheck {
    /// Halt with a panic. This is the default in every build profile.
    Panic,
    /// Log the violation at error level and leave the heap untouched.
    Log,
}

impl FreeCheck {
    pub const fn from_features() -> Self {
        if cfg!(feature = "unchecked-free") {
            FreeCheck::Log
        } else {
            FreeCheck::Panic
        }
    }
}

impl Default for FreeCheck {
    fn default() -> Self {
        Self::from_features()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    pub free_check: FreeCheck,
    pub oom_hook: Option<OomHook>,
}

impl HeapConfig {
    pub const fn new() -> Self {
        HeapConfig {
            free_check: FreeCheck::from_features(),
            oom_hook: None,
        }
    }

    pub const fn free_check(mut self, free_check: FreeCheck) -> Self {
        self.free_check = free_check;
        self
    }

    pub const fn oom_hook(mut self, hook: OomHook) -> Self {
        self.oom_hook = Some(hook);
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
