//! this implements the stuff necessary to get from a FDE to the caller's registers
//!
//! # how it works
//! somebody hands us the offset of a FDE inside an image's `.eh_frame`: the
//! compact unwind table delegating to DWARF, or the binary search table of
//! `.eh_frame_hdr` (see [`divination`]). we parse that FDE and its CIE as
//! beautiful DWARF call frame information, as god (or rather, the x86-64 psABI)
//! intended, run the call frame instructions up to the pc we care about and
//! apply the resulting row to the registers.
//!
//! for this we need a DWARF parser and a DWARF call frame information interpreter (yes, that shit is basically a programming
//! language). See https://dwarfstd.org/doc/DWARF5.pdf for more information if more information is desired.

pub mod cfi;
pub mod divination;
pub mod parse;


use crate::arch::{Registers, Step};
use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use crate::memory::{self, Memory};

use self::cfi::{CfaRule, CfiState};
use self::parse::{Cie, EntryHeader};

/// Steps `registers` through the FDE at `fde_offset` in `eh_frame`.
///
/// `pc` is the address to compute the rules for, which is already adjusted
/// for return addresses by the caller.
#[instrument(level = "trace", skip(eh_frame, registers, memory), fields(pc = format_args!("{pc:#x}")))]
pub fn step_registers<R: Registers, M: Memory>(
    eh_frame: &[u8],
    fde_offset: usize,
    pc: usize,
    registers: &R,
    memory: &M,
) -> Result<Step<R>> {
    let mut cursor = ByteCursor::new(eh_frame, fde_offset)?;
    let (cie, fde) = parse::read_cfi(&mut cursor)?;
    let pc_offset = fde.pc_offset(pc).ok_or_else(|| {
        trace!(
            "FDE at {fde_offset:#x} covers {:#x}..{:#x}, not {pc:#x}",
            fde.pc_begin,
            fde.pc_begin.wrapping_add(fde.pc_range)
        );
        Error::MissingUnwindInfo
    })?;

    let state = cfi::run(&cie, &fde, pc_offset)?;
    apply(&cie, &state, registers, memory)
}

/// Builds the caller's registers from a row of the rule table.
pub fn apply<R: Registers, M: Memory>(
    cie: &Cie<'_>,
    state: &CfiState,
    registers: &R,
    memory: &M,
) -> Result<Step<R>> {
    let (register, offset) = match state.cfa {
        CfaRule::RegisterOffset { register, offset } => (register, offset),
        CfaRule::Undefined => return Err(Error::InconsistentData("no CFA rule")),
        CfaRule::Expression => return Err(Error::Unimplemented("CFA expressions")),
    };
    let base = R::strip_pointer(registers.dwarf_register(register)?);
    let cfa = add_offset(base, offset)?;
    let cfa = memory::check(cfa)?;
    trace!("CFA = r{register}({base:#x}){offset:+} = {cfa:#x}");

    let return_column = u16::try_from(cie.return_address_register)
        .ok()
        .filter(|&column| R::has_dwarf_register(column))
        .ok_or(Error::ArgumentInvalid("return address register out of range"))?;
    // Without a rule the return address is still in its register, as in a leaf.
    let mut return_address = registers.dwarf_register(return_column)?;

    let mut caller = registers.clone();
    for (column, offset) in state.saved() {
        let address = add_offset(cfa, offset)?;
        let value = memory.read_word(address)?;
        trace!("r{column} = [{address:#x}] = {value:#x}");
        if column == return_column {
            return_address = value;
        }
        if R::has_dwarf_register(column) {
            caller.set_dwarf_register(column, value)?;
        }
    }

    let return_address = R::strip_pointer(return_address);
    if return_address == 0 {
        return Ok(Step::EndOfStack);
    }
    caller.set_ip(return_address);
    caller.set_sp(R::sign_pointer(cfa));
    Ok(Step::Caller(caller))
}

fn add_offset(base: usize, offset: i64) -> Result<usize> {
    isize::try_from(offset)
        .ok()
        .and_then(|offset| base.checked_add_signed(offset))
        .ok_or(Error::PointerInvalid(base))
}

/// Finds the FDE covering `pc` by walking the whole section.
///
/// Only for sections without a search table; `.eh_frame_hdr` is the fast path.
pub fn find_fde(eh_frame: &[u8], pc: usize) -> Result<usize> {
    let mut cursor = ByteCursor::new(eh_frame, 0)?;
    while !cursor.at_end() {
        let offset = cursor.offset();
        // A zero length terminates the section.
        if cursor.clone().read_u32()? == 0 {
            break;
        }
        let header = EntryHeader::read(&mut cursor)?;

        if !header.is_cie() {
            let (_, fde) = parse::read_cfi(&mut cursor.at(offset)?)?;
            if fde.contains(pc) {
                trace!("FDE at {offset:#x} covers {pc:#x}");
                return Ok(offset);
            }
        }
        cursor = cursor.at(header.end)?;
    }
    Err(Error::MissingUnwindInfo)
}
