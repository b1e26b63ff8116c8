//! Lookup in the two-level `__unwind_info` index.
//!
//! ```text
//! header         version, common encodings, personalities, first level index
//! first level    {function offset, second level page, LSDA index} sorted by
//!                function offset, closed by a sentinel entry
//! second level   a regular page of {function offset, encoding} pairs, or a
//!                compressed page of packed u32 entries
//! ```
//!
//! Layouts follow `<mach-o/compact_unwind_encoding.h>`. Every field is read
//! through a [`ByteCursor`]; nothing in the section is reinterpreted in place.

#[cfg(test)]
mod tests;

use crate::arch::{CompactStep, Registers};
use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use crate::memory::Memory;

pub const UNWIND_SECTION_VERSION: u32 = 1;
const UNWIND_SECOND_LEVEL_REGULAR: u32 = 2;
const UNWIND_SECOND_LEVEL_COMPRESSED: u32 = 3;

const INDEX_ENTRY_SIZE: usize = 12;
const ENCODING_SIZE: usize = 4;

fn compressed_entry_function_offset(entry: u32) -> u32 {
    entry & 0x00FF_FFFF
}

fn compressed_entry_encoding_index(entry: u32) -> u32 {
    entry >> 24
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindInfoHeader {
    pub version: u32,
    pub common_encodings_offset: u32,
    pub common_encodings_count: u32,
    pub personalities_offset: u32,
    pub personalities_count: u32,
    pub index_offset: u32,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub function_offset: u32,
    pub second_level_page_offset: u32,
    pub lsda_index_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedPageHeader {
    pub entry_page_offset: u16,
    pub entry_count: u16,
    pub encodings_page_offset: u16,
    pub encodings_count: u16,
}

/// A parsed `__unwind_info` section.
#[derive(Debug, Clone)]
pub struct UnwindInfo<'a> {
    data: &'a [u8],
    header: UnwindInfoHeader,
}

impl<'a> UnwindInfo<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(data, 0)?;
        let header = UnwindInfoHeader {
            version: cursor.read_u32()?,
            common_encodings_offset: cursor.read_u32()?,
            common_encodings_count: cursor.read_u32()?,
            personalities_offset: cursor.read_u32()?,
            personalities_count: cursor.read_u32()?,
            index_offset: cursor.read_u32()?,
            index_count: cursor.read_u32()?,
        };
        if header.version != UNWIND_SECTION_VERSION {
            trace!("compact unwind version invalid {}", header.version);
            return Err(Error::InconsistentData("unsupported unwind info version"));
        }
        Ok(Self { data, header })
    }

    pub fn header(&self) -> &UnwindInfoHeader {
        &self.header
    }

    fn cursor(&self, offset: usize) -> Result<ByteCursor<'a>> {
        ByteCursor::new(self.data, offset)
    }

    fn read_u32_at(&self, offset: usize) -> Result<u32> {
        self.cursor(offset)?.read_u32()
    }

    pub fn index_entry(&self, index: u32) -> Result<IndexEntry> {
        if index >= self.header.index_count {
            return Err(Error::ArgumentInvalid("index entry out of range"));
        }
        let offset = self.header.index_offset as usize + index as usize * INDEX_ENTRY_SIZE;
        let mut cursor = self.cursor(offset)?;
        Ok(IndexEntry {
            function_offset: cursor.read_u32()?,
            second_level_page_offset: cursor.read_u32()?,
            lsda_index_offset: cursor.read_u32()?,
        })
    }

    /// Finds the last first level entry whose function offset is not greater
    /// than `target`, an offset from the image's load address.
    pub fn lookup_first_level(&self, target: u32) -> Result<(u32, IndexEntry)> {
        let count = self.header.index_count;
        let idx = upper_bound(count, target, |i| {
            self.index_entry(i).map(|entry| entry.function_offset)
        })?;
        if idx == 0 {
            return Err(Error::InconsistentData("address precedes the first index entry"));
        }
        Ok((idx - 1, self.index_entry(idx - 1)?))
    }

    /// Finds the encoding of the function containing `target`.
    pub fn lookup_encoding(&self, target: u32) -> Result<u32> {
        let (index, entry) = self.lookup_first_level(target)?;
        if index + 1 >= self.header.index_count {
            // The last entry only marks where the covered range ends.
            return Err(Error::InconsistentData("address past the last index entry"));
        }

        let page = entry.second_level_page_offset as usize;
        let encoding = match self.read_u32_at(page)? {
            UNWIND_SECOND_LEVEL_REGULAR => {
                return Err(Error::Unimplemented("regular second level pages"))
            }
            UNWIND_SECOND_LEVEL_COMPRESSED => self.lookup_compressed(index, &entry, target)?,
            kind => {
                trace!("second level page kind invalid {kind}");
                return Err(Error::InconsistentData("unknown second level page kind"));
            }
        };

        trace!("compact unwind encoding {encoding:#010x} for {target:#x}");
        if encoding == 0 {
            return Err(Error::MissingUnwindInfo);
        }
        Ok(encoding)
    }

    pub fn compressed_page_header(&self, page: usize) -> Result<CompressedPageHeader> {
        let mut cursor = self.cursor(page)?;
        if cursor.read_u32()? != UNWIND_SECOND_LEVEL_COMPRESSED {
            return Err(Error::InconsistentData("not a compressed page"));
        }
        Ok(CompressedPageHeader {
            entry_page_offset: cursor.read_u16()?,
            entry_count: cursor.read_u16()?,
            encodings_page_offset: cursor.read_u16()?,
            encodings_count: cursor.read_u16()?,
        })
    }

    fn lookup_compressed(&self, index: u32, entry: &IndexEntry, target: u32) -> Result<u32> {
        let page = entry.second_level_page_offset as usize;
        let header = self.compressed_page_header(page)?;

        let function_offset = target
            .checked_sub(entry.function_offset)
            .ok_or(Error::InconsistentData("address precedes its page"))?;

        let entries = page + usize::from(header.entry_page_offset);
        let count = u32::from(header.entry_count);
        let read_entry = |i: u32| self.read_u32_at(entries + i as usize * ENCODING_SIZE);

        let idx = upper_bound(count, function_offset, |i| {
            read_entry(i).map(compressed_entry_function_offset)
        })?;
        if idx == count {
            // The last entry of a page runs until the next page starts.
            let next = self.index_entry(index + 1)?;
            if target >= next.function_offset {
                return Err(Error::InconsistentData("address past the end of its page"));
            }
        }
        if idx == 0 {
            return Err(Error::InconsistentData("address precedes the first page entry"));
        }

        let encoding_index = compressed_entry_encoding_index(read_entry(idx - 1)?);
        self.resolve_encoding(page, &header, encoding_index)
    }

    /// Low indices name the section wide common encodings, the rest name the
    /// page's own.
    fn resolve_encoding(
        &self,
        page: usize,
        header: &CompressedPageHeader,
        encoding_index: u32,
    ) -> Result<u32> {
        let common_count = self.header.common_encodings_count;
        if encoding_index < common_count {
            let offset = self.header.common_encodings_offset as usize
                + encoding_index as usize * ENCODING_SIZE;
            return self.read_u32_at(offset);
        }

        let local = encoding_index - common_count;
        if local >= u32::from(header.encodings_count) {
            return Err(Error::InconsistentData("encoding index out of range"));
        }
        let offset =
            page + usize::from(header.encodings_page_offset) + local as usize * ENCODING_SIZE;
        self.read_u32_at(offset)
    }
}

/// Index of the first element whose key is greater than `target`.
fn upper_bound(count: u32, target: u32, mut key: impl FnMut(u32) -> Result<u32>) -> Result<u32> {
    let (mut low, mut high) = (0, count);
    while low < high {
        let mid = low + (high - low) / 2;
        if target < key(mid)? {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    Ok(low)
}

/// Looks up `pc` in an image's `__unwind_info` and applies the encoding.
#[instrument(level = "trace", skip(unwind_info, registers, memory), fields(pc = format_args!("{pc:#x}")))]
pub fn step<R: Registers, M: Memory>(
    unwind_info: &[u8],
    load_address: usize,
    pc: usize,
    registers: &R,
    memory: &M,
) -> Result<CompactStep<R>> {
    let target = pc
        .checked_sub(load_address)
        .and_then(|offset| u32::try_from(offset).ok())
        .ok_or(Error::ArgumentInvalid("address outside the image"))?;

    let info = UnwindInfo::parse(unwind_info)?;
    let encoding = info.lookup_encoding(target)?;
    registers.step_compact(encoding, memory)
}
