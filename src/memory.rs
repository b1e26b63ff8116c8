//! The crash-safety guard in front of every raw load.
//!
//! Any address derived from crash-time data (a frame pointer, an encoded
//! pointer, a CFA) may be garbage, so nothing dereferences an address without
//! going through [`check`] first.

use crate::error::{Error, Result};

pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// The first page is never mapped.
pub const POINTER_MIN: usize = 0x1000;
/// The upper half of the address space belongs to the kernel.
pub const POINTER_MAX: usize = usize::MAX / 2;

pub fn is_invalid(address: usize) -> bool {
    !(POINTER_MIN..=POINTER_MAX).contains(&address)
}

pub fn check(address: usize) -> Result<usize> {
    if is_invalid(address) {
        return Err(Error::PointerInvalid(address));
    }
    Ok(address)
}

/// Checks both ends of `[address, address + length)`.
pub fn check_span(address: usize, length: usize) -> Result<()> {
    check(address)?;
    if length > 0 {
        let last = address
            .checked_add(length - 1)
            .ok_or(Error::PointerInvalid(address))?;
        check(last)?;
    }
    Ok(())
}

/// Word-sized reads from the stack of the thread being unwound.
pub trait Memory {
    /// Loads a word from an address that already passed the guard.
    fn load_word(&self, address: usize) -> Option<usize>;

    fn read_word(&self, address: usize) -> Result<usize> {
        check_span(address, WORD_SIZE)?;
        self.load_word(address)
            .ok_or(Error::MemoryReadFailed(address))
    }
}

impl<M: Memory + ?Sized> Memory for &M {
    fn load_word(&self, address: usize) -> Option<usize> {
        (**self).load_word(address)
    }
}

/// Reads the address space of the current process directly.
#[derive(Debug)]
pub struct ProcessMemory {
    _private: (),
}

impl ProcessMemory {
    /// # Safety
    /// Every address that passes the guard and reaches this reader must be
    /// mapped and readable for the duration of the walk. This holds for the
    /// stacks of the faulting thread and of suspended threads, which is the
    /// only place the unwinder reads from.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Memory for ProcessMemory {
    fn load_word(&self, address: usize) -> Option<usize> {
        // SAFETY: the guard already ran, and `new` covers mapping.
        let value = unsafe {
            core::ptr::with_exposed_provenance::<usize>(address).read_unaligned()
        };
        Some(value)
    }
}
