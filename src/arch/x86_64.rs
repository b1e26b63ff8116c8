//! x86_64: DWARF-numbered register file, compact unwind stepper and context
//! capture.

use core::fmt;

use super::{CompactStep, RegisterList, Registers, Step};
use crate::error::{Error, Result};
use crate::memory::{Memory, WORD_SIZE};
use crate::walk::fp;

pub const RAX: u16 = 0;
pub const RDX: u16 = 1;
pub const RCX: u16 = 2;
pub const RBX: u16 = 3;
pub const RSI: u16 = 4;
pub const RDI: u16 = 5;
pub const RBP: u16 = 6;
pub const RSP: u16 = 7;
pub const R8: u16 = 8;
pub const R12: u16 = 12;
pub const R13: u16 = 13;
pub const R14: u16 = 14;
pub const R15: u16 = 15;
/// The return address column.
pub const RIP: u16 = 16;

const NAMES: [&str; 17] = [
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

// <mach-o/compact_unwind_encoding.h>
const UNWIND_X86_64_MODE_MASK: u32 = 0x0F00_0000;
const UNWIND_X86_64_MODE_RBP_FRAME: u32 = 0x0100_0000;
const UNWIND_X86_64_MODE_STACK_IMMD: u32 = 0x0200_0000;
const UNWIND_X86_64_MODE_STACK_IND: u32 = 0x0300_0000;
const UNWIND_X86_64_MODE_DWARF: u32 = 0x0400_0000;

const UNWIND_X86_64_RBP_FRAME_REGISTERS: u32 = 0x0000_7FFF;
const UNWIND_X86_64_RBP_FRAME_OFFSET: u32 = 0x00FF_0000;
const UNWIND_X86_64_DWARF_SECTION_OFFSET: u32 = 0x00FF_FFFF;

const UNWIND_X86_64_REG_NONE: u32 = 0;
const UNWIND_X86_64_REG_RBX: u32 = 1;
const UNWIND_X86_64_REG_R12: u32 = 2;
const UNWIND_X86_64_REG_R13: u32 = 3;
const UNWIND_X86_64_REG_R14: u32 = 4;
const UNWIND_X86_64_REG_R15: u32 = 5;
const UNWIND_X86_64_REG_RBP: u32 = 6;

const RBP_FRAME_REGISTER_SLOTS: u32 = 5;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct X86_64Registers {
    registers: [usize; 17],
}

impl fmt::Debug for X86_64Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        RegisterList(self).fmt(f)
    }
}

impl X86_64Registers {
    pub const fn new(registers: [usize; 17]) -> Self {
        Self { registers }
    }

    fn rbp_frame<M: Memory>(&self, encoding: u32, memory: &M) -> Result<Step<Self>> {
        let offset = ((encoding & UNWIND_X86_64_RBP_FRAME_OFFSET) >> 16) as usize;
        let mut saved = encoding & UNWIND_X86_64_RBP_FRAME_REGISTERS;

        let rbp = self.fp();
        let mut location = rbp
            .checked_sub(offset * WORD_SIZE)
            .ok_or(Error::PointerInvalid(rbp))?;

        let mut caller = *self;
        for _ in 0..RBP_FRAME_REGISTER_SLOTS {
            let register = match saved & 0x7 {
                UNWIND_X86_64_REG_NONE => None,
                UNWIND_X86_64_REG_RBX => Some(RBX),
                UNWIND_X86_64_REG_R12 => Some(R12),
                UNWIND_X86_64_REG_R13 => Some(R13),
                UNWIND_X86_64_REG_R14 => Some(R14),
                UNWIND_X86_64_REG_R15 => Some(R15),
                UNWIND_X86_64_REG_RBP => Some(RBP),
                _ => return Err(Error::ArgumentInvalid("unknown RBP frame register")),
            };
            if let Some(register) = register {
                let value = memory.read_word(location)?;
                trace!("restored {} from {location:#x}", NAMES[usize::from(register)]);
                caller.set_dwarf_register(register, value)?;
            }
            saved >>= 3;
            location += WORD_SIZE;
        }

        // The chain step reads through the frame's own rbp.
        caller.set_fp(rbp);
        fp::step(&caller, memory)
    }
}

impl Registers for X86_64Registers {
    const DWARF_REGISTER_COUNT: u16 = 17;

    fn ip(&self) -> usize {
        self.registers[usize::from(RIP)]
    }

    fn set_ip(&mut self, value: usize) {
        self.registers[usize::from(RIP)] = value;
    }

    fn sp(&self) -> usize {
        self.registers[usize::from(RSP)]
    }

    fn set_sp(&mut self, value: usize) {
        self.registers[usize::from(RSP)] = value;
    }

    fn fp(&self) -> usize {
        self.registers[usize::from(RBP)]
    }

    fn set_fp(&mut self, value: usize) {
        self.registers[usize::from(RBP)] = value;
    }

    fn dwarf_register(&self, register: u16) -> Result<usize> {
        self.registers
            .get(usize::from(register))
            .copied()
            .ok_or(Error::ArgumentInvalid("no such x86_64 register"))
    }

    fn set_dwarf_register(&mut self, register: u16, value: usize) -> Result<()> {
        let slot = self
            .registers
            .get_mut(usize::from(register))
            .ok_or(Error::ArgumentInvalid("no such x86_64 register"))?;
        *slot = value;
        Ok(())
    }

    fn for_each_register(&self, f: &mut dyn FnMut(&'static str, usize)) {
        for (name, value) in NAMES.iter().zip(self.registers) {
            f(name, value);
        }
    }

    fn step_compact<M: Memory>(&self, encoding: u32, memory: &M) -> Result<CompactStep<Self>> {
        match encoding & UNWIND_X86_64_MODE_MASK {
            UNWIND_X86_64_MODE_RBP_FRAME => self.rbp_frame(encoding, memory).map(CompactStep::Step),
            UNWIND_X86_64_MODE_STACK_IMMD => Err(Error::Unimplemented("stack immediate frames")),
            UNWIND_X86_64_MODE_STACK_IND => Err(Error::Unimplemented("stack indirect frames")),
            UNWIND_X86_64_MODE_DWARF => Ok(CompactStep::Dwarf(
                encoding & UNWIND_X86_64_DWARF_SECTION_OFFSET,
            )),
            _ => Err(Error::ArgumentInvalid("unknown x86_64 compact unwind mode")),
        }
    }
}

/// Snapshots the registers at the call site.
///
/// `rip` is the address right after the capture and `rsp`/`rbp` belong to
/// the function this is inlined into.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn capture_context() -> X86_64Registers {
    use core::arch::asm;

    let mut context = X86_64Registers::default();

    unsafe {
        asm!(
            "mov [{regs}+0*8], rax",
            "mov [{regs}+1*8], rdx",
            "mov [{regs}+2*8], rcx",
            "mov [{regs}+3*8], rbx", // callee-saved
            "mov [{regs}+4*8], rsi",
            "mov [{regs}+5*8], rdi",
            "mov [{regs}+6*8], rbp", // callee-saved
            "mov [{regs}+7*8], rsp", // callee-saved
            "mov [{regs}+8*8], r8",
            "mov [{regs}+9*8], r9",
            "mov [{regs}+10*8], r10",
            "mov [{regs}+11*8], r11",
            "mov [{regs}+12*8], r12", // callee-saved
            "mov [{regs}+13*8], r13", // callee-saved
            "mov [{regs}+14*8], r14", // callee-saved
            "mov [{regs}+15*8], r15", // callee-saved

            "lea rax, [rip + 0]", // must use rip as a base register
            "mov [{regs}+16*8], rax",

            out("rax") _,
            regs = in(reg) context.registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    context
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
impl X86_64Registers {
    /// # Safety
    /// `context` must be the context handed to a `SA_SIGINFO` handler.
    pub unsafe fn from_ucontext(context: &libc::ucontext_t) -> Self {
        use libc::*;

        let gregs = &context.uc_mcontext.gregs;
        let reg = |index: c_int| gregs[index as usize] as usize;
        Self::new([
            reg(REG_RAX),
            reg(REG_RDX),
            reg(REG_RCX),
            reg(REG_RBX),
            reg(REG_RSI),
            reg(REG_RDI),
            reg(REG_RBP),
            reg(REG_RSP),
            reg(REG_R8),
            reg(REG_R9),
            reg(REG_R10),
            reg(REG_R11),
            reg(REG_R12),
            reg(REG_R13),
            reg(REG_R14),
            reg(REG_R15),
            reg(REG_RIP),
        ])
    }
}

#[cfg(all(target_arch = "x86_64", target_vendor = "apple"))]
impl X86_64Registers {
    /// # Safety
    /// `context` must be the context handed to a `SA_SIGINFO` handler.
    pub unsafe fn from_ucontext(context: &libc::ucontext_t) -> Self {
        let ss = (*context.uc_mcontext).__ss;
        Self::new([
            ss.__rax as usize,
            ss.__rdx as usize,
            ss.__rcx as usize,
            ss.__rbx as usize,
            ss.__rsi as usize,
            ss.__rdi as usize,
            ss.__rbp as usize,
            ss.__rsp as usize,
            ss.__r8 as usize,
            ss.__r9 as usize,
            ss.__r10 as usize,
            ss.__r11 as usize,
            ss.__r12 as usize,
            ss.__r13 as usize,
            ss.__r14 as usize,
            ss.__r15 as usize,
            ss.__rip as usize,
        ])
    }
}
