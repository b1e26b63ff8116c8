//! Decoding of `.eh_frame` call frame information records.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information,
//! and the LSB `.eh_frame` extensions to it.
//!
//! The section is a sequence of entries, each starting with a length:
//! ```text
//! length      u32, or 0xffffffff followed by a u64 length
//! id          u32 or u64: zero for a CIE, the back-reference to its CIE for a FDE
//! body...
//! ```
//!
//! A FDE's back-reference counts from the id field itself, not from the start
//! of the section as `.debug_frame` does. Every record here borrows its
//! instruction bytes from the section; nothing is copied.
#![allow(non_upper_case_globals)]


use core::fmt;

use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use crate::memory::Memory;

const LONG_LENGTH_MARKER: u32 = 0xffff_ffff;

/// The length and id that start every CIE and FDE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Offset of the length field.
    pub offset: usize,
    /// Bytes following the length field.
    pub length: u64,
    pub is_64: bool,
    /// Zero for a CIE, otherwise the FDE's back-reference delta.
    pub id: u64,
    /// Offset just past the id field.
    pub id_end: usize,
    /// Offset of the next entry.
    pub end: usize,
}

impl EntryHeader {
    pub fn read(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let offset = cursor.offset();
        let short = cursor.read_u32()?;
        let (length, is_64) = if short == LONG_LENGTH_MARKER {
            (cursor.read_u64()?, true)
        } else {
            (u64::from(short), false)
        };
        if length == 0 {
            return Err(Error::InconsistentData("zero-length entry"));
        }

        let end = usize::try_from(length)
            .ok()
            .and_then(|length| cursor.offset().checked_add(length))
            .filter(|&end| end <= cursor.limit())
            .ok_or(Error::EndOfData)?;

        let id = if is_64 {
            cursor.read_u64()?
        } else {
            u64::from(cursor.read_u32()?)
        };
        let id_end = cursor.offset();
        if id_end > end {
            return Err(Error::InconsistentData("entry too short for its id"));
        }

        Ok(Self {
            offset,
            length,
            is_64,
            id,
            id_end,
            end,
        })
    }

    pub fn is_cie(&self) -> bool {
        self.id == 0
    }

    fn id_size(&self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    /// Where the CIE of this FDE starts.
    pub fn cie_offset(&self) -> Result<usize> {
        usize::try_from(self.id)
            .ok()
            .and_then(|id| id.checked_add(self.id_size()))
            .and_then(|delta| self.id_end.checked_sub(delta))
            .ok_or(Error::InconsistentData("CIE pointer points before the section"))
    }

    /// Bytes from the cursor position to the end of the entry.
    fn remaining(&self, cursor: &ByteCursor<'_>) -> Result<usize> {
        self.end
            .checked_sub(cursor.offset())
            .ok_or(Error::InconsistentData("entry fields overrun its length"))
    }
}

/// Common Information Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie<'a> {
    pub offset: usize,
    pub version: u8,
    /// Describes which optional fields the CIE and its FDEs carry. Empty when
    /// there is no augmentation.
    pub augmentation_string: &'a str,
    /// Only present when the augmentation string starts with `z`.
    pub augmentation: Option<AugmentationData>,
    /// Factored out of every advance location instruction.
    pub code_alignment_factor: u64,
    /// Factored out of offset instructions.
    pub data_alignment_factor: i64,
    /// The rule table column that holds the return address.
    pub return_address_register: u64,
    /// Instructions that set up the initial rules for every FDE using this CIE.
    pub initial_instructions: &'a [u8],
}

/// Frame Description Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde<'a> {
    pub offset: usize,
    pub length: u64,
    pub cie_offset: usize,
    /// Address of the first instruction covered.
    pub pc_begin: usize,
    /// Number of bytes of instructions covered.
    pub pc_range: usize,
    /// The language-specific data area, when the CIE declares one.
    pub lsda: Option<EncodedPointer>,
    pub instructions: &'a [u8],
}

impl Fde<'_> {
    pub fn contains(&self, pc: usize) -> bool {
        pc.checked_sub(self.pc_begin)
            .is_some_and(|offset| offset < self.pc_range)
    }

    /// Offset of `pc` from the start of the function.
    pub fn pc_offset(&self, pc: usize) -> Option<usize> {
        self.contains(pc).then(|| pc - self.pc_begin)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AugmentationData {
    pub personality: Option<EncodedPointer>,
    pub lsda_pointer_encoding: Option<Encoding>,
    pub pointer_encoding: Option<Encoding>,
    /// `S`: the frame belongs to a signal trampoline.
    pub signal_frame: bool,
}

/// A decoded pointer that may still need one more load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedPointer {
    pub value: usize,
    /// `DW_EH_PE_indirect`: `value` is the address of the real pointer.
    pub indirect: bool,
}

impl EncodedPointer {
    pub fn resolve(self, memory: &impl Memory) -> Result<usize> {
        if self.indirect {
            memory.read_word(self.value)
        } else {
            Ok(self.value)
        }
    }
}

/// Reads the FDE at the cursor and the CIE it refers to.
#[instrument(level = "trace", skip(cursor), fields(offset = cursor.offset()))]
pub fn read_cfi<'a>(cursor: &mut ByteCursor<'a>) -> Result<(Cie<'a>, Fde<'a>)> {
    let header = EntryHeader::read(cursor)?;
    if header.is_cie() {
        return Err(Error::InconsistentData("expected a FDE, found a CIE"));
    }

    let cie_offset = header.cie_offset()?;
    trace!("FDE at {:#x} uses CIE at {cie_offset:#x}", header.offset);

    let mut cie_cursor = cursor.at(cie_offset)?;
    let cie = read_cie(&mut cie_cursor)?;
    let fde = read_fde_body(cursor, &header, cie_offset, &cie)?;

    Ok((cie, fde))
}

pub fn read_cie<'a>(cursor: &mut ByteCursor<'a>) -> Result<Cie<'a>> {
    let header = EntryHeader::read(cursor)?;
    if !header.is_cie() {
        return Err(Error::InconsistentData("CIE id is not zero"));
    }

    let version = cursor.read_u8()?;
    if version != 1 && version != 3 {
        return Err(Error::UnexpectedData(version));
    }

    let augmentation_string = core::str::from_utf8(cursor.read_cstr()?)
        .map_err(|_| Error::InconsistentData("augmentation string is not UTF-8"))?;
    let code_alignment_factor = cursor.read_uleb128()?;
    let data_alignment_factor = cursor.read_sleb128()?;
    let return_address_register = if version == 1 {
        u64::from(cursor.read_u8()?)
    } else {
        cursor.read_uleb128()?
    };

    let augmentation = if augmentation_string.starts_with('z') {
        let len = read_length(cursor)?;
        let bytes = cursor.read_bytes(len)?;
        Some(parse_augmentation_data(augmentation_string, bytes)?)
    } else {
        None
    };

    let initial_instructions = cursor.read_bytes(header.remaining(cursor)?)?;

    let cie = Cie {
        offset: header.offset,
        version,
        augmentation_string,
        augmentation,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        initial_instructions,
    };
    trace!("{cie:?}");
    Ok(cie)
}

fn read_fde_body<'a>(
    cursor: &mut ByteCursor<'a>,
    header: &EntryHeader,
    cie_offset: usize,
    cie: &Cie<'_>,
) -> Result<Fde<'a>> {
    let augmentation = cie.augmentation.unwrap_or_default();
    let encoding = augmentation.pointer_encoding.unwrap_or(Encoding::ABSPTR);

    let begin = read_encoded(cursor, encoding, None)?
        .ok_or(Error::InconsistentData("FDE pc_begin is omitted"))?;
    if begin.indirect {
        return Err(Error::Unimplemented("indirect FDE pc_begin"));
    }
    // The range is a length, so only the value format applies.
    let range = read_encoded(cursor, encoding.format_only(), None)?
        .ok_or(Error::InconsistentData("FDE pc_range is omitted"))?;

    let mut lsda = None;
    if cie.augmentation.is_some() {
        let len = read_length(cursor)?;
        let bytes = cursor.read_bytes(len)?;
        if let Some(lsda_encoding) = augmentation.lsda_pointer_encoding {
            let mut data = ByteCursor::new(bytes, 0)?;
            lsda = read_encoded(&mut data, lsda_encoding, None)?;
        }
    }

    let instructions = cursor.read_bytes(header.remaining(cursor)?)?;

    Ok(Fde {
        offset: header.offset,
        length: header.length,
        cie_offset,
        pc_begin: begin.value,
        pc_range: range.value,
        lsda,
        instructions,
    })
}

fn read_length(cursor: &mut ByteCursor<'_>) -> Result<usize> {
    usize::try_from(cursor.read_uleb128()?).map_err(|_| Error::EndOfData)
}

fn parse_augmentation_data(string: &str, data: &[u8]) -> Result<AugmentationData> {
    let mut data = ByteCursor::new(data, 0)?;
    trace!("augmentation {string:?} | {:x?}", data.data());

    let mut aug_data = AugmentationData::default();

    // The leading `z` only says that augmentation data exists at all.
    for code in string.bytes().skip(1) {
        match code {
            // Personality routine: an encoding byte and a pointer in that encoding.
            b'P' => {
                let encoding = Encoding(data.read_u8()?);
                aug_data.personality = read_encoded(&mut data, encoding, None)?;
            }
            // The encoding of the LSDA pointer in each FDE's augmentation data.
            b'L' => {
                let encoding = Encoding(data.read_u8()?);
                aug_data.lsda_pointer_encoding = (!encoding.is_omit()).then_some(encoding);
            }
            // The encoding of the FDE's address fields.
            b'R' => {
                aug_data.pointer_encoding = Some(Encoding(data.read_u8()?));
            }
            b'S' => aug_data.signal_frame = true,
            _ => return Err(Error::UnexpectedData(code)),
        }
    }

    Ok(aug_data)
}

/// Reads a pointer in the given encoding. Returns `None` for `DW_EH_PE_omit`.
///
/// `pcrel` is relative to the address of the field being read.
pub fn read_encoded(
    cursor: &mut ByteCursor<'_>,
    encoding: Encoding,
    datarel_base: Option<usize>,
) -> Result<Option<EncodedPointer>> {
    if encoding.is_omit() {
        return Ok(None);
    }

    let format = encoding.format()?;
    let application = encoding.application()?;
    let field_address = cursor.current_address();

    let value = match format {
        ValueFormat::DW_EH_PE_absptr => cursor.read_word()?,
        ValueFormat::DW_EH_PE_uleb128 => cursor.read_uleb128()? as usize,
        ValueFormat::DW_EH_PE_udata2 => cursor.read_u16()? as usize,
        ValueFormat::DW_EH_PE_udata4 => cursor.read_u32()? as usize,
        ValueFormat::DW_EH_PE_udata8 => cursor.read_u64()? as usize,
        ValueFormat::DW_EH_PE_sleb128 => cursor.read_sleb128()? as isize as usize,
        ValueFormat::DW_EH_PE_sdata2 => cursor.read_i16()? as isize as usize,
        ValueFormat::DW_EH_PE_sdata4 => cursor.read_i32()? as isize as usize,
        ValueFormat::DW_EH_PE_sdata8 => cursor.read_i64()? as isize as usize,
    };

    let value = match application {
        ValueApplication::DW_EH_PE_absptr => value,
        ValueApplication::DW_EH_PE_pcrel => value.wrapping_add(field_address),
        ValueApplication::DW_EH_PE_datarel => {
            let base = datarel_base
                .ok_or(Error::InconsistentData("datarel pointer without a data base"))?;
            value.wrapping_add(base)
        }
        ValueApplication::DW_EH_PE_textrel => {
            return Err(Error::Unimplemented("textrel pointer encoding"))
        }
        ValueApplication::DW_EH_PE_funcrel => {
            return Err(Error::Unimplemented("funcrel pointer encoding"))
        }
        ValueApplication::DW_EH_PE_aligned => {
            return Err(Error::Unimplemented("aligned pointer encoding"))
        }
    };

    Ok(Some(EncodedPointer {
        value,
        indirect: encoding.is_indirect(),
    }))
}

/// A `DW_EH_PE_*` pointer encoding byte.
#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub struct Encoding(pub u8);

impl Encoding {
    pub const ABSPTR: Self = Self(0x00);
    pub const OMIT: Self = Self(0xff);
    const INDIRECT: u8 = 0x80;

    pub fn is_omit(self) -> bool {
        self == Self::OMIT
    }

    pub fn is_indirect(self) -> bool {
        self.0 & Self::INDIRECT != 0
    }

    /// The same value format applied absolutely.
    pub fn format_only(self) -> Self {
        Self(self.0 & 0x0f)
    }

    fn format(self) -> Result<ValueFormat> {
        Ok(match self.0 & 0x0f {
            0x00 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            _ => return Err(Error::UnexpectedData(self.0)),
        })
    }

    fn application(self) -> Result<ValueApplication> {
        Ok(match (self.0 & !Self::INDIRECT) >> 4 {
            0x0 => ValueApplication::DW_EH_PE_absptr,
            0x1 => ValueApplication::DW_EH_PE_pcrel,
            0x2 => ValueApplication::DW_EH_PE_textrel,
            0x3 => ValueApplication::DW_EH_PE_datarel,
            0x4 => ValueApplication::DW_EH_PE_funcrel,
            0x5 => ValueApplication::DW_EH_PE_aligned,
            _ => return Err(Error::UnexpectedData(self.0)),
        })
    }

    /// Size of a fixed-width value, `None` for LEB128.
    pub fn size(self) -> Result<Option<usize>> {
        Ok(match self.format()? {
            ValueFormat::DW_EH_PE_absptr => Some(core::mem::size_of::<usize>()),
            ValueFormat::DW_EH_PE_uleb128 | ValueFormat::DW_EH_PE_sleb128 => None,
            ValueFormat::DW_EH_PE_udata2 | ValueFormat::DW_EH_PE_sdata2 => Some(2),
            ValueFormat::DW_EH_PE_udata4 | ValueFormat::DW_EH_PE_sdata4 => Some(4),
            ValueFormat::DW_EH_PE_udata8 | ValueFormat::DW_EH_PE_sdata8 => Some(8),
        })
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return f.write_str("DW_EH_PE_omit");
        }
        match (self.application(), self.format()) {
            (Ok(application), Ok(format)) => {
                if self.is_indirect() {
                    f.write_str("DW_EH_PE_indirect | ")?;
                }
                write!(f, "{application:?} | {format:?}")
            }
            _ => write!(f, "Encoding({:#04x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueFormat {
    /// A native pointer-sized value.
    DW_EH_PE_absptr,
    /// Unsigned LEB128.
    DW_EH_PE_uleb128,
    /// A 2 bytes unsigned value.
    DW_EH_PE_udata2,
    /// A 4 bytes unsigned value.
    DW_EH_PE_udata4,
    /// An 8 bytes unsigned value.
    DW_EH_PE_udata8,
    /// Signed LEB128.
    DW_EH_PE_sleb128,
    /// A 2 bytes signed value.
    DW_EH_PE_sdata2,
    /// A 4 bytes signed value.
    DW_EH_PE_sdata4,
    /// An 8 bytes signed value.
    DW_EH_PE_sdata8,
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueApplication {
    DW_EH_PE_absptr,
    /// Relative to the address of the encoded field itself.
    DW_EH_PE_pcrel,
    /// Relative to the beginning of the .text section.
    DW_EH_PE_textrel,
    /// Relative to the beginning of the .got or .eh_frame_hdr section.
    DW_EH_PE_datarel,
    /// Relative to the beginning of the function.
    DW_EH_PE_funcrel,
    /// Aligned to an address unit sized boundary.
    DW_EH_PE_aligned,
}
