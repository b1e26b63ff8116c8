//! # divination
//!
//! the practice of seeking knowledge of the future or the unknown by
//! supernatural means.
//!
//! we ask supernatural means (the linker's `.eh_frame_hdr`) for knowledge of
//! the future (where we will find the dwarves): a table of every FDE in the
//! image, sorted by the first address it covers, which we can binary search
//! instead of walking `.eh_frame` from the start.
//!
//! See <https://refspecs.linuxfoundation.org/LSB_1.3.0/gLSB/gLSB/ehframehdr.html>
//! and <https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>.
//!
//! ```text
//! version           u8, always 1
//! eh_frame_ptr_enc  u8
//! fde_count_enc     u8
//! table_enc         u8
//! eh_frame_ptr      encoded
//! fde_count         encoded
//! table             fde_count * (initial_location, fde_address), both table_enc
//! ```

use super::parse::{read_encoded, Encoding};
use crate::cursor::ByteCursor;
use crate::error::{Error, Result};

/// The `.eh_frame_hdr` section.
#[derive(Debug, Clone)]
pub struct EhFrameHeader<'a> {
    data: &'a [u8],
    /// Address of the `.eh_frame` section.
    pub eh_frame_ptr: usize,
    pub fde_count: usize,
    table_enc: Encoding,
    table_offset: usize,
    /// Size of one half of a table entry.
    field_size: usize,
}

impl<'a> EhFrameHeader<'a> {
    #[instrument(level = "trace", skip(data))]
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(data, 0)?;
        let base = cursor.base_address();

        let version = cursor.read_u8()?;
        if version != 1 {
            trace!("eh_frame_hdr version is not 1");
            return Err(Error::UnexpectedData(version));
        }
        let eh_frame_ptr_enc = Encoding(cursor.read_u8()?);
        let fde_count_enc = Encoding(cursor.read_u8()?);
        let table_enc = Encoding(cursor.read_u8()?);
        trace!(?eh_frame_ptr_enc, ?fde_count_enc, ?table_enc);

        let eh_frame_ptr = read_encoded(&mut cursor, eh_frame_ptr_enc, Some(base))?
            .ok_or(Error::InconsistentData("eh_frame_ptr is omitted"))?;
        if eh_frame_ptr.indirect {
            return Err(Error::Unimplemented("indirect eh_frame_ptr"));
        }

        let mut fde_count = read_encoded(&mut cursor, fde_count_enc, Some(base))?
            .map_or(0, |count| count.value);
        if table_enc.is_omit() {
            fde_count = 0;
        }

        let field_size = if fde_count == 0 {
            0
        } else {
            if table_enc.is_indirect() {
                return Err(Error::Unimplemented("indirect search table entries"));
            }
            table_enc
                .size()?
                .ok_or(Error::Unimplemented("variable width search table entries"))?
        };

        let table_offset = cursor.offset();
        let fits = fde_count
            .checked_mul(2 * field_size)
            .and_then(|len| len.checked_add(table_offset))
            .is_some_and(|end| end <= data.len());
        if !fits {
            return Err(Error::EndOfData);
        }

        trace!(
            "eh_frame: {:#x}, fde_count: {fde_count}",
            eh_frame_ptr.value
        );
        Ok(Self {
            data,
            eh_frame_ptr: eh_frame_ptr.value,
            fde_count,
            table_enc,
            table_offset,
            field_size,
        })
    }

    /// The `(initial_location, fde_address)` pair at `index`.
    pub fn entry(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.fde_count {
            return Err(Error::ArgumentInvalid("search table index out of range"));
        }
        let offset = self.table_offset + index * 2 * self.field_size;
        let mut cursor = ByteCursor::new(self.data, offset)?;
        let base = cursor.base_address();

        let mut field = || {
            read_encoded(&mut cursor, self.table_enc, Some(base))?
                .map(|pointer| pointer.value)
                .ok_or(Error::InconsistentData("search table entry is omitted"))
        };
        let initial_location = field()?;
        let fde_address = field()?;
        Ok((initial_location, fde_address))
    }

    /// Address of the FDE with the greatest initial location not above `pc`.
    ///
    /// That FDE may still end before `pc`; the caller checks its range.
    pub fn find_fde(&self, pc: usize) -> Result<usize> {
        let (mut low, mut high) = (0, self.fde_count);
        while low < high {
            let mid = low + (high - low) / 2;
            let (initial_location, _) = self.entry(mid)?;
            trace!(?low, ?high, ?mid, "binary searching for {pc:#x}: {initial_location:#x}");
            if pc < initial_location {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        if low == 0 {
            return Err(Error::MissingUnwindInfo);
        }

        let (_, fde_address) = self.entry(low - 1)?;
        trace!("found FDE at address {fde_address:#x} for {pc:#x}");
        Ok(fde_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(count: u32, table: &[(i32, i32)]) -> Vec<u8> {
        let mut data = vec![1, 0x1b, 0x03, 0x3b];
        data.extend_from_slice(&0x100i32.to_le_bytes());
        data.extend_from_slice(&count.to_le_bytes());
        for (initial_location, fde) in table {
            data.extend_from_slice(&initial_location.to_le_bytes());
            data.extend_from_slice(&fde.to_le_bytes());
        }
        data
    }

    #[test]
    fn parse_header() {
        let data = header(2, &[(0x100, 0x1000), (0x200, 0x2000)]);
        let base = data.as_ptr().addr();
        let header = EhFrameHeader::parse(&data).unwrap();

        // pcrel counts from the eh_frame_ptr field itself.
        assert_eq!(header.eh_frame_ptr, base + 4 + 0x100);
        assert_eq!(header.fde_count, 2);
        assert_eq!(header.entry(1), Ok((base + 0x200, base + 0x2000)));
        assert!(header.entry(2).is_err());
    }

    #[test]
    fn binary_search() {
        let data = header(3, &[(0x100, 0x1000), (0x200, 0x2000), (0x300, 0x3000)]);
        let base = data.as_ptr().addr();
        let header = EhFrameHeader::parse(&data).unwrap();

        assert_eq!(header.find_fde(base + 0x100), Ok(base + 0x1000));
        assert_eq!(header.find_fde(base + 0x250), Ok(base + 0x2000));
        assert_eq!(header.find_fde(base + 0x300), Ok(base + 0x3000));
        assert_eq!(header.find_fde(base + 0x9000), Ok(base + 0x3000));
        assert_eq!(header.find_fde(base + 0xff), Err(Error::MissingUnwindInfo));
    }

    #[test]
    fn empty_table() {
        let data = header(0, &[]);
        let header = EhFrameHeader::parse(&data).unwrap();
        assert_eq!(header.find_fde(0x40_0000), Err(Error::MissingUnwindInfo));
    }

    #[test]
    fn bad_headers() {
        let mut data = header(1, &[(0x100, 0x1000)]);
        data[0] = 2;
        assert_eq!(EhFrameHeader::parse(&data).unwrap_err(), Error::UnexpectedData(2));

        // The table claims more entries than the section holds.
        let data = header(4, &[(0x100, 0x1000)]);
        assert_eq!(EhFrameHeader::parse(&data).unwrap_err(), Error::EndOfData);

        let mut data = header(1, &[(0x100, 0x1000)]);
        data[3] = 0x31;
        assert!(matches!(
            EhFrameHeader::parse(&data),
            Err(Error::Unimplemented(_))
        ));
    }
}
