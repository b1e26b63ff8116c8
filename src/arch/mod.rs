//! Per-architecture register files and compact unwind steppers.
//!
//! Both register files are plain data and build on every host, so either
//! stepper can be exercised anywhere. Only context capture is tied to the
//! architecture the crate is compiled for.

use core::fmt;

use crate::error::Result;
use crate::memory::Memory;

pub mod aarch64;
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::{capture_context, Aarch64Registers as NativeRegisters};
#[cfg(target_arch = "x86_64")]
pub use x86_64::{capture_context, X86_64Registers as NativeRegisters};

/// The outcome of stepping one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<R> {
    /// The register set of the caller.
    Caller(R),
    /// The frame has no caller. This is how a walk succeeds.
    EndOfStack,
}

/// The outcome of applying a compact unwind encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactStep<R> {
    Step(Step<R>),
    /// The function is described by the FDE at this offset into `__eh_frame`.
    Dwarf(u32),
}

/// A machine register file.
///
/// Registers are addressed by their DWARF numbers. Values that came out of
/// memory go through [`Registers::strip_pointer`] before they are used as
/// addresses, and through [`Registers::sign_pointer`] before they are written
/// into a register the hardware would authenticate.
pub trait Registers: Clone + fmt::Debug {
    /// The DWARF columns this register file holds are `0..DWARF_REGISTER_COUNT`.
    const DWARF_REGISTER_COUNT: u16;

    fn ip(&self) -> usize;
    fn set_ip(&mut self, value: usize);
    fn sp(&self) -> usize;
    fn set_sp(&mut self, value: usize);
    fn fp(&self) -> usize;
    fn set_fp(&mut self, value: usize);

    fn dwarf_register(&self, register: u16) -> Result<usize>;
    fn set_dwarf_register(&mut self, register: u16, value: usize) -> Result<()>;

    fn has_dwarf_register(register: u16) -> bool {
        register < Self::DWARF_REGISTER_COUNT
    }

    /// Removes any authentication bits from a pointer.
    fn strip_pointer(value: usize) -> usize {
        value
    }

    /// Turns a raw pointer back into the form the register would hold.
    fn sign_pointer(value: usize) -> usize {
        value
    }

    /// Visits every register in logging order.
    fn for_each_register(&self, f: &mut dyn FnMut(&'static str, usize));

    /// Applies a compact unwind encoding to this frame.
    fn step_compact<M: Memory>(&self, encoding: u32, memory: &M) -> Result<CompactStep<Self>>;
}

/// Formats a register file through its register names.
///
/// `Debug` is a map, `Display` is the `name: 0x.., ..` form of the crash log.
pub struct RegisterList<'a, R>(pub &'a R);

impl<R: Registers> fmt::Debug for RegisterList<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.0.for_each_register(&mut |name, value| {
            map.entry(&format_args!("{name}"), &format_args!("{value:#x}"));
        });
        map.finish()
    }
}

impl<R: Registers> fmt::Display for RegisterList<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut result = Ok(());
        let mut first = true;
        self.0.for_each_register(&mut |name, value| {
            if result.is_err() {
                return;
            }
            let separator = if first { "" } else { ", " };
            first = false;
            result = write!(f, "{separator}{name}: {value:#x}");
        });
        result
    }
}
