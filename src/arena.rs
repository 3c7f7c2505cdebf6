use core::{cell::UnsafeCell, ptr::NonNull};

use crate::config::ALIGNMENT;

pub(crate) const WORD: usize = size_of::<usize>();

/// The byte buffer every block of a heap is carved from.
///
/// Headers live inside the buffer, next to the payloads handed out to
/// callers, so all access goes through raw pointers derived from
/// [`Arena::base`] rather than through references to the whole array.
/// Every accessor is bounds checked; an offset outside the arena means the
/// heap is corrupt and panics.
#[repr(C, align(8))]
pub struct Arena<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
}

const _: () = assert!(align_of::<Arena<1>>() == ALIGNMENT);

impl<const N: usize> Arena<N> {
    pub const fn new() -> Self {
        Arena {
            bytes: UnsafeCell::new([0; N]),
        }
    }

    // rounded down to the alignment unit
    pub const fn usable_len(&self) -> usize {
        N & !(ALIGNMENT - 1)
    }

    pub fn base(&self) -> *mut u8 {
        self.bytes.get().cast()
    }

    fn check(&self, at: usize, len: usize) {
        assert!(
            at.checked_add(len).is_some_and(|end| end <= N),
            "arena access out of bounds: {at} + {len} > {N}"
        );
    }

    pub fn read_word(&self, at: usize) -> usize {
        self.check(at, WORD);
        unsafe { self.base().add(at).cast::<usize>().read_unaligned() }
    }

    pub fn write_word(&self, at: usize, value: usize) {
        self.check(at, WORD);
        unsafe { self.base().add(at).cast::<usize>().write_unaligned(value) }
    }

    pub fn read_byte(&self, at: usize) -> u8 {
        self.check(at, 1);
        unsafe { self.base().add(at).read() }
    }

    pub fn write_byte(&self, at: usize, value: u8) {
        self.check(at, 1);
        unsafe { self.base().add(at).write(value) }
    }

    pub fn zero(&self, at: usize, len: usize) {
        self.check(at, len);
        unsafe { self.base().add(at).write_bytes(0, len) }
    }

    pub fn ptr_at(&self, at: usize) -> NonNull<u8> {
        self.check(at, 0);
        // base is derived from a reference, so it is never null
        unsafe { NonNull::new_unchecked(self.base().add(at)) }
    }

    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        ptr.addr()
            .checked_sub(self.base().addr())
            .filter(|offset| *offset < N)
    }
}

impl<const N: usize> Default for Arena<N> {
    fn default() -> Self {
        Self::new()
    }
}
