//! aarch64: register file, compact unwind stepper, pointer authentication and
//! context capture.

use core::fmt;

use super::{CompactStep, RegisterList, Registers, Step};
use crate::error::{Error, Result};
use crate::memory::{Memory, WORD_SIZE};
use crate::walk::fp;

pub const X19: u16 = 19;
pub const FP: u16 = 29;
/// The return address column.
pub const LR: u16 = 30;
pub const SP: u16 = 31;
/// Not a DWARF column, kept right after `sp` so the file stays flat.
pub const PC: u16 = 32;

const NAMES: [&str; 33] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "fp", "lr", "sp", "pc",
];

// <mach-o/compact_unwind_encoding.h>
const UNWIND_ARM64_MODE_MASK: u32 = 0x0F00_0000;
const UNWIND_ARM64_MODE_FRAMELESS: u32 = 0x0200_0000;
const UNWIND_ARM64_MODE_DWARF: u32 = 0x0300_0000;
const UNWIND_ARM64_MODE_FRAME: u32 = 0x0400_0000;

const UNWIND_ARM64_FRAME_X19_X20_PAIR: u32 = 0x0000_0001;
const UNWIND_ARM64_FRAME_X21_X22_PAIR: u32 = 0x0000_0002;
const UNWIND_ARM64_FRAME_X23_X24_PAIR: u32 = 0x0000_0004;
const UNWIND_ARM64_FRAME_X25_X26_PAIR: u32 = 0x0000_0008;
const UNWIND_ARM64_FRAME_X27_X28_PAIR: u32 = 0x0000_0010;
const UNWIND_ARM64_FRAME_D8_D9_PAIR: u32 = 0x0000_0100;
const UNWIND_ARM64_FRAME_D10_D11_PAIR: u32 = 0x0000_0200;
const UNWIND_ARM64_FRAME_D12_D13_PAIR: u32 = 0x0000_0400;
const UNWIND_ARM64_FRAME_D14_D15_PAIR: u32 = 0x0000_0800;

const UNWIND_ARM64_FRAMELESS_STACK_SIZE_MASK: u32 = 0x00FF_F000;
const UNWIND_ARM64_DWARF_SECTION_OFFSET: u32 = 0x00FF_FFFF;

/// Saved pairs in the order they are laid out, walking down from the top of
/// the save area. Floating point pairs have no slot in this register file but
/// still occupy stack space.
const SAVED_PAIRS: [(u32, Option<(u16, u16)>); 9] = [
    (UNWIND_ARM64_FRAME_X19_X20_PAIR, Some((19, 20))),
    (UNWIND_ARM64_FRAME_X21_X22_PAIR, Some((21, 22))),
    (UNWIND_ARM64_FRAME_X23_X24_PAIR, Some((23, 24))),
    (UNWIND_ARM64_FRAME_X25_X26_PAIR, Some((25, 26))),
    (UNWIND_ARM64_FRAME_X27_X28_PAIR, Some((27, 28))),
    (UNWIND_ARM64_FRAME_D8_D9_PAIR, None),
    (UNWIND_ARM64_FRAME_D10_D11_PAIR, None),
    (UNWIND_ARM64_FRAME_D12_D13_PAIR, None),
    (UNWIND_ARM64_FRAME_D14_D15_PAIR, None),
];

/// Bits of a code or data pointer that hold the address. Everything above is
/// a pointer authentication code or a tag.
#[cfg(target_vendor = "apple")]
pub const POINTER_MASK: usize = 0x0000_000f_ffff_ffff;
#[cfg(not(target_vendor = "apple"))]
pub const POINTER_MASK: usize = 0x0000_ffff_ffff_ffff;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Aarch64Registers {
    registers: [usize; 33],
}

impl Default for Aarch64Registers {
    fn default() -> Self {
        Self {
            registers: [0; 33],
        }
    }
}

impl fmt::Debug for Aarch64Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        RegisterList(self).fmt(f)
    }
}

impl Aarch64Registers {
    pub const fn new(registers: [usize; 33]) -> Self {
        Self { registers }
    }

    pub fn lr(&self) -> usize {
        self.registers[usize::from(LR)]
    }

    pub fn set_lr(&mut self, value: usize) {
        self.registers[usize::from(LR)] = value;
    }

    /// Restores the pairs selected by `encoding`, reading downwards from
    /// `top`.
    fn restore_pairs<M: Memory>(&mut self, encoding: u32, top: usize, memory: &M) -> Result<()> {
        let mut location = top;
        for (bit, pair) in SAVED_PAIRS {
            if encoding & bit == 0 {
                continue;
            }
            let second = location
                .checked_sub(WORD_SIZE)
                .ok_or(Error::PointerInvalid(location))?;
            if let Some((a, b)) = pair {
                self.set_dwarf_register(a, memory.read_word(location)?)?;
                self.set_dwarf_register(b, memory.read_word(second)?)?;
                trace!("restored x{a}/x{b} from {location:#x}");
            }
            location = second
                .checked_sub(WORD_SIZE)
                .ok_or(Error::PointerInvalid(second))?;
        }
        Ok(())
    }

    fn frame<M: Memory>(&self, encoding: u32, memory: &M) -> Result<Step<Self>> {
        let fp = Self::strip_pointer(self.fp());
        let top = fp.checked_sub(WORD_SIZE).ok_or(Error::PointerInvalid(fp))?;

        let mut caller = *self;
        caller.restore_pairs(encoding, top, memory)?;
        fp::step(&caller, memory)
    }

    fn frameless<M: Memory>(&self, encoding: u32, memory: &M) -> Result<Step<Self>> {
        let stack_size =
            ((encoding & UNWIND_ARM64_FRAMELESS_STACK_SIZE_MASK) >> 12) as usize * 16;
        let sp = Self::strip_pointer(self.sp());
        // The stack size covers the saved pairs, which sit at its top.
        let caller_sp = sp
            .checked_add(stack_size)
            .ok_or(Error::PointerInvalid(sp))?;

        let mut caller = *self;
        if encoding & !(UNWIND_ARM64_MODE_MASK | UNWIND_ARM64_FRAMELESS_STACK_SIZE_MASK) != 0 {
            let top = caller_sp
                .checked_sub(WORD_SIZE)
                .ok_or(Error::PointerInvalid(caller_sp))?;
            caller.restore_pairs(encoding, top, memory)?;
        }

        // A frameless function never spilled lr, so it still holds the
        // return address.
        let return_address = Self::strip_pointer(self.lr());
        if return_address == 0 {
            return Ok(Step::EndOfStack);
        }
        caller.set_sp(Self::sign_pointer(caller_sp));
        caller.set_ip(return_address);
        Ok(Step::Caller(caller))
    }
}

impl Registers for Aarch64Registers {
    const DWARF_REGISTER_COUNT: u16 = 33;

    fn ip(&self) -> usize {
        self.registers[usize::from(PC)]
    }

    fn set_ip(&mut self, value: usize) {
        self.registers[usize::from(PC)] = value;
    }

    fn sp(&self) -> usize {
        self.registers[usize::from(SP)]
    }

    fn set_sp(&mut self, value: usize) {
        self.registers[usize::from(SP)] = value;
    }

    fn fp(&self) -> usize {
        self.registers[usize::from(FP)]
    }

    fn set_fp(&mut self, value: usize) {
        self.registers[usize::from(FP)] = value;
    }

    fn dwarf_register(&self, register: u16) -> Result<usize> {
        self.registers
            .get(usize::from(register))
            .copied()
            .ok_or(Error::ArgumentInvalid("no such aarch64 register"))
    }

    fn set_dwarf_register(&mut self, register: u16, value: usize) -> Result<()> {
        let slot = self
            .registers
            .get_mut(usize::from(register))
            .ok_or(Error::ArgumentInvalid("no such aarch64 register"))?;
        *slot = value;
        Ok(())
    }

    fn strip_pointer(value: usize) -> usize {
        value & POINTER_MASK
    }

    /// Pointers are handed back unsigned. The unwinder never returns into the
    /// frames it walks, so nothing authenticates them.
    fn sign_pointer(value: usize) -> usize {
        value
    }

    fn for_each_register(&self, f: &mut dyn FnMut(&'static str, usize)) {
        for (name, value) in NAMES.iter().zip(self.registers) {
            f(name, value);
        }
    }

    fn step_compact<M: Memory>(&self, encoding: u32, memory: &M) -> Result<CompactStep<Self>> {
        match encoding & UNWIND_ARM64_MODE_MASK {
            UNWIND_ARM64_MODE_FRAME => self.frame(encoding, memory).map(CompactStep::Step),
            UNWIND_ARM64_MODE_FRAMELESS => self.frameless(encoding, memory).map(CompactStep::Step),
            UNWIND_ARM64_MODE_DWARF => Ok(CompactStep::Dwarf(
                encoding & UNWIND_ARM64_DWARF_SECTION_OFFSET,
            )),
            _ => Err(Error::ArgumentInvalid("unknown aarch64 compact unwind mode")),
        }
    }
}

/// Snapshots the registers at the call site.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn capture_context() -> Aarch64Registers {
    use core::arch::asm;

    let mut context = Aarch64Registers::default();

    unsafe {
        asm!(
            "stp x0, x1, [{regs}, #0]",
            "stp x2, x3, [{regs}, #16]",
            "stp x4, x5, [{regs}, #32]",
            "stp x6, x7, [{regs}, #48]",
            "stp x8, x9, [{regs}, #64]",
            "stp x10, x11, [{regs}, #80]",
            "stp x12, x13, [{regs}, #96]",
            "stp x14, x15, [{regs}, #112]",
            "stp x16, x17, [{regs}, #128]",
            "stp x18, x19, [{regs}, #144]",
            "stp x20, x21, [{regs}, #160]",
            "stp x22, x23, [{regs}, #176]",
            "stp x24, x25, [{regs}, #192]",
            "stp x26, x27, [{regs}, #208]",
            "stp x28, x29, [{regs}, #224]", // x29 is fp
            "str x30, [{regs}, #240]",      // lr
            "mov {tmp}, sp",
            "str {tmp}, [{regs}, #248]",
            "adr {tmp}, .",
            "str {tmp}, [{regs}, #256]",
            regs = in(reg) context.registers.as_mut_ptr(),
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
    }

    context
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
impl Aarch64Registers {
    /// # Safety
    /// `context` must be the context handed to a `SA_SIGINFO` handler.
    pub unsafe fn from_ucontext(context: &libc::ucontext_t) -> Self {
        let mcontext = &context.uc_mcontext;
        let mut registers = Self::default();
        for (slot, value) in registers.registers.iter_mut().zip(mcontext.regs) {
            *slot = value as usize;
        }
        registers.set_sp(mcontext.sp as usize);
        registers.set_ip(mcontext.pc as usize);
        registers
    }
}

#[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
impl Aarch64Registers {
    /// # Safety
    /// `context` must be the context handed to a `SA_SIGINFO` handler.
    pub unsafe fn from_ucontext(context: &libc::ucontext_t) -> Self {
        let ss = (*context.uc_mcontext).__ss;
        let mut registers = Self::default();
        for (slot, value) in registers.registers.iter_mut().zip(ss.__x) {
            *slot = value as usize;
        }
        registers.set_fp(ss.__fp as usize);
        registers.set_lr(ss.__lr as usize);
        registers.set_sp(ss.__sp as usize);
        registers.set_ip(ss.__pc as usize);
        registers
    }
}
