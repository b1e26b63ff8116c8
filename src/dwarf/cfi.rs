//! The call frame instruction interpreter.
//!
//! Only the handful of opcodes compilers actually emit for ordinary frames is
//! understood. Anything else stops the interpretation instead of guessing.
#![allow(non_upper_case_globals)]

#[cfg(test)]
mod tests;

use crate::cursor::ByteCursor;
use crate::dwarf::parse::{Cie, Fde};
use crate::error::{Error, Result};

/// Size of the rule table, indexed by DWARF register number. Covers the
/// general purpose, vector and floating point columns of both supported
/// architectures.
pub const MAX_REGISTERS: usize = 96;

// High two bits.
const DW_CFA_advance_loc_hi: u8 = 0x01;
const DW_CFA_offset_hi: u8 = 0x02;

const DW_CFA_nop: u8 = 0x00;
const DW_CFA_def_cfa: u8 = 0x0c;
const DW_CFA_def_cfa_offset: u8 = 0x0e;

/// How to compute the Canonical Frame Address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CfaRule {
    #[default]
    Undefined,
    RegisterOffset {
        register: u16,
        offset: i64,
    },
    /// Computed by a DWARF expression. Recognized so it can be reported, never
    /// evaluated.
    Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterRule {
    #[default]
    Unused,
    /// The caller's value is saved at `CFA + offset`.
    OffsetFromCfa(i64),
}

/// The row of the rule table for one program counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfiState {
    pub cfa: CfaRule,
    pub registers: [RegisterRule; MAX_REGISTERS],
    /// Code offset the rules currently apply from.
    pub location: u64,
}

impl Default for CfiState {
    fn default() -> Self {
        Self::new()
    }
}

impl CfiState {
    pub const fn new() -> Self {
        Self {
            cfa: CfaRule::Undefined,
            registers: [RegisterRule::Unused; MAX_REGISTERS],
            location: 0,
        }
    }

    pub fn rule(&self, register: u16) -> RegisterRule {
        self.registers
            .get(usize::from(register))
            .copied()
            .unwrap_or_default()
    }

    /// Every register with a rule, in register order.
    pub fn saved(&self) -> impl Iterator<Item = (u16, i64)> + '_ {
        self.registers
            .iter()
            .enumerate()
            .filter_map(|(register, rule)| match *rule {
                RegisterRule::Unused => None,
                RegisterRule::OffsetFromCfa(offset) => Some((register as u16, offset)),
            })
    }

    fn set_rule(&mut self, register: u64, rule: RegisterRule) -> Result<()> {
        let slot = usize::try_from(register)
            .ok()
            .and_then(|register| self.registers.get_mut(register))
            .ok_or(Error::ArgumentInvalid("register number out of range"))?;
        *slot = rule;
        Ok(())
    }
}

/// Computes the rules in effect at `pc_offset` bytes into the function.
///
/// The CIE's initial instructions always run to completion. The FDE's
/// instructions run until the location moves past `pc_offset`.
#[instrument(level = "trace", skip(cie, fde), fields(fde = fde.offset))]
pub fn run(cie: &Cie<'_>, fde: &Fde<'_>, pc_offset: usize) -> Result<CfiState> {
    let mut state = CfiState::new();
    execute(cie.initial_instructions, cie, None, &mut state)?;
    state.location = 0;
    execute(fde.instructions, cie, Some(pc_offset as u64), &mut state)?;
    trace!("CFA {:?} at location {:#x}", state.cfa, state.location);
    Ok(state)
}

pub fn execute(
    instructions: &[u8],
    cie: &Cie<'_>,
    pc_offset: Option<u64>,
    state: &mut CfiState,
) -> Result<()> {
    if instructions.is_empty() {
        return Ok(());
    }
    let mut cursor = ByteCursor::new(instructions, 0)?;

    while !cursor.at_end() {
        if pc_offset.is_some_and(|target| state.location > target) {
            break;
        }

        let opcode = cursor.read_u8()?;
        let low = opcode & 0x3f;
        match opcode >> 6 {
            DW_CFA_advance_loc_hi => {
                let delta = u64::from(low)
                    .checked_mul(cie.code_alignment_factor)
                    .and_then(|delta| state.location.checked_add(delta))
                    .ok_or(Error::InconsistentData("location overflow"))?;
                trace!("DW_CFA_advance_loc {low} -> {delta:#x}");
                state.location = delta;
            }
            DW_CFA_offset_hi => {
                let factored = cursor.read_uleb128()?;
                let offset = i64::try_from(factored)
                    .ok()
                    .and_then(|factored| factored.checked_mul(cie.data_alignment_factor))
                    .ok_or(Error::InconsistentData("register offset overflow"))?;
                trace!("DW_CFA_offset r{low} at CFA{offset:+}");
                state.set_rule(u64::from(low), RegisterRule::OffsetFromCfa(offset))?;
            }
            0 => match opcode {
                DW_CFA_nop => {}
                DW_CFA_def_cfa => {
                    let register = cursor.read_uleb128()?;
                    let offset = cursor.read_uleb128()?;
                    let register = u16::try_from(register)
                        .ok()
                        .filter(|&register| usize::from(register) < MAX_REGISTERS)
                        .ok_or(Error::ArgumentInvalid("CFA register out of range"))?;
                    let offset = i64::try_from(offset)
                        .map_err(|_| Error::InconsistentData("CFA offset overflow"))?;
                    trace!("DW_CFA_def_cfa r{register}{offset:+}");
                    state.cfa = CfaRule::RegisterOffset { register, offset };
                }
                DW_CFA_def_cfa_offset => {
                    let new_offset = cursor.read_uleb128()?;
                    let CfaRule::RegisterOffset { offset, .. } = &mut state.cfa else {
                        return Err(Error::InconsistentData(
                            "DW_CFA_def_cfa_offset without a register-based CFA",
                        ));
                    };
                    *offset = i64::try_from(new_offset)
                        .map_err(|_| Error::InconsistentData("CFA offset overflow"))?;
                    trace!("DW_CFA_def_cfa_offset {offset}");
                }
                _ => return Err(Error::UnsupportedOpcode(opcode)),
            },
            _ => return Err(Error::UnsupportedOpcode(opcode)),
        }
    }

    Ok(())
}
