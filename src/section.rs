//! Exclusion primitives a [`GuardedHeap`](crate::GuardedHeap) runs its
//! mutations under.
//!
//! The heap never blocks inside a section and never yields, so any of these
//! may be used from interrupt or signal context as long as the section type
//! matches the deployment: [`Interrupts`] on a bare-metal target,
//! [`SpinLock`] or [`SignalGuard`] on a hosted one, [`SingleCore`] where
//! nothing can preempt the allocator at all.

/// Scoped exclusion around heap mutations.
///
/// # Safety
/// While `f` runs, no other context may be running a closure passed to
/// `with` on the same value, and the exclusion must be released on every
/// way out of `with`, unwinding included.
pub unsafe trait CriticalSection {
    fn with<R>(&self, f: impl FnOnce() -> R) -> R;
}

/// No exclusion at all.
pub struct SingleCore(());

impl SingleCore {
    /// # Safety
    /// The heap must only ever be reached from one context, with no
    /// interrupt or signal handler allocating.
    pub const unsafe fn new() -> Self {
        SingleCore(())
    }
}

unsafe impl CriticalSection for SingleCore {
    fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }
}

/// Busy-waiting lock, for hosts with threads but no allocating handlers.
pub struct SpinLock {
    lock: spin::Mutex<()>,
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            lock: spin::Mutex::new(()),
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl CriticalSection for SpinLock {
    fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }
}

/// Interrupts masked through the `critical-section` crate. The target (or a
/// test harness) has to provide the implementation.
pub struct Interrupts;

unsafe impl CriticalSection for Interrupts {
    fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        critical_section::with(|_| f())
    }
}

#[cfg(unix)]
pub use self::signal::SignalGuard;

#[cfg(unix)]
mod signal {
    use core::{mem, ptr};

    use super::CriticalSection;

    /// All signals blocked on the calling thread, then a spin lock.
    ///
    /// The hosted counterpart of disabling interrupts: a signal handler that
    /// allocates can never interrupt a thread holding the lock.
    pub struct SignalGuard {
        lock: spin::Mutex<()>,
    }

    impl SignalGuard {
        pub const fn new() -> Self {
            SignalGuard {
                lock: spin::Mutex::new(()),
            }
        }
    }

    impl Default for SignalGuard {
        fn default() -> Self {
            Self::new()
        }
    }

    struct BlockedSignals {
        previous: libc::sigset_t,
    }

    impl BlockedSignals {
        fn block_all() -> Self {
            unsafe {
                let mut all: libc::sigset_t = mem::zeroed();
                let mut previous: libc::sigset_t = mem::zeroed();
                libc::sigfillset(&mut all);
                let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut previous);
                debug_assert_eq!(rc, 0);

                BlockedSignals { previous }
            }
        }
    }

    impl Drop for BlockedSignals {
        fn drop(&mut self) {
            unsafe {
                libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut());
            }
        }
    }

    unsafe impl CriticalSection for SignalGuard {
        fn with<R>(&self, f: impl FnOnce() -> R) -> R {
            let _blocked = BlockedSignals::block_all();
            let _guard = self.lock.lock();
            f()
        }
    }
}
