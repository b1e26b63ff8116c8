//! A bounds-checked reader over a borrowed byte span.

#[cfg(test)]
mod tests;

use crate::error::{Error, Result};
use crate::memory;

/// LEB128 values longer than this are treated as corrupt.
pub const MAX_LEB128_BYTES: usize = 10;
/// Longest NUL-terminated string we are willing to scan for, terminator included.
pub const MAX_STRING_LENGTH: usize = 4096;

/// Sequential little-endian reader.
///
/// `offset <= data.len()` always holds. A read either advances the offset by
/// exactly what it consumed or fails and leaves the cursor where it was.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8], offset: usize) -> Result<Self> {
        memory::check(data.as_ptr().addr())?;
        if offset > data.len() {
            return Err(Error::EndOfData);
        }
        Ok(Self { data, offset })
    }

    /// A fresh cursor over the same span.
    pub fn at(&self, offset: usize) -> Result<Self> {
        Self::new(self.data, offset)
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn limit(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn at_end(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub fn is_valid(&self) -> bool {
        !memory::is_invalid(self.base_address()) && !self.at_end()
    }

    pub fn base_address(&self) -> usize {
        self.data.as_ptr().addr()
    }

    /// The runtime address of the next byte to be read.
    pub fn current_address(&self) -> usize {
        self.base_address() + self.offset
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(Error::EndOfData)?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.read_array().map(i16::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    pub fn read_word(&mut self) -> Result<usize> {
        self.read_array().map(usize::from_le_bytes)
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        self.restoring(|this| {
            let mut result = 0_u64;
            let mut shift = 0;
            for _ in 0..MAX_LEB128_BYTES {
                let byte = this.read_u8()?;
                if shift < 64 {
                    result |= u64::from(byte & 0x7f) << shift;
                }
                shift += 7;
                if byte & 0x80 == 0 {
                    return Ok(result);
                }
            }
            Err(Error::InconsistentData("LEB128 value is too long"))
        })
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        self.restoring(|this| {
            let mut result = 0_i64;
            let mut shift = 0;
            for _ in 0..MAX_LEB128_BYTES {
                let byte = this.read_u8()?;
                if shift < 64 {
                    result |= i64::from(byte & 0x7f) << shift;
                }
                shift += 7;
                if byte & 0x80 == 0 {
                    if shift < 64 && byte & 0x40 != 0 {
                        result |= -1 << shift;
                    }
                    return Ok(result);
                }
            }
            Err(Error::InconsistentData("LEB128 value is too long"))
        })
    }

    /// Reads a NUL-terminated string, returning it without the terminator.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.offset..];
        let window = &rest[..rest.len().min(MAX_STRING_LENGTH)];
        let Some(len) = window.iter().position(|&b| b == 0) else {
            return Err(if rest.len() < MAX_STRING_LENGTH {
                Error::EndOfData
            } else {
                Error::InconsistentData("string is not terminated")
            });
        };
        self.offset += len + 1;
        Ok(&rest[..len])
    }

    fn restoring<T>(&mut self, read: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let start = self.offset;
        let result = read(self);
        if result.is_err() {
            self.offset = start;
        }
        result
    }
}
