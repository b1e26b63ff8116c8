//! Image capture from dyld's image list.
//!
//! Each Mach-O header is decoded field by field through a [`ByteCursor`]:
//! `LC_SEGMENT_64 __TEXT` gives the text size and the slide, its
//! `__unwind_info` and `__eh_frame` sections the unwind metadata, and
//! `LC_UUID` the UUID.

use core::ffi::CStr;

use super::{ImageDescriptor, ImageTable, Region};
use crate::cursor::ByteCursor;
use crate::error::{Error, Result};
use crate::memory;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MACH_HEADER_64_SIZE: usize = 32;
const SEGMENT_COMMAND_64_SIZE: usize = 72;
const SECTION_64_SIZE: usize = 80;

const LC_REQ_DYLD: u32 = 0x8000_0000;
const LC_SEGMENT_64: u32 = 0x19;
const LC_UUID: u32 = 0x1b;

pub fn capture(table: &mut ImageTable) {
    // SAFETY: dyld's image functions may be called at any time; the index is
    // below the count. A concurrently unloaded image yields a null header.
    unsafe {
        for index in 0..libc::_dyld_image_count() {
            let header = libc::_dyld_get_image_header(index);
            if header.is_null() {
                continue;
            }

            let mut image = match describe(header.addr()) {
                Ok(image) => image,
                Err(err) => {
                    debug!("skipping image {index}: {err}");
                    continue;
                }
            };
            let name = libc::_dyld_get_image_name(index);
            if !name.is_null() {
                image.path = Some(CStr::from_ptr(name));
            }

            if !table.push(image) {
                break;
            }
        }
    }
}

/// Decodes the mapped Mach-O header at `address`.
fn describe(address: usize) -> Result<ImageDescriptor> {
    // SAFETY: dyld only hands out headers of mapped images.
    let header = unsafe { mapped(address, MACH_HEADER_64_SIZE)? };
    let mut cursor = ByteCursor::new(header, 0)?;
    let magic = cursor.read_u32()?;
    if magic != MH_MAGIC_64 {
        return Err(Error::InconsistentData("not a 64-bit Mach-O header"));
    }
    cursor.skip(12)?;
    let command_count = cursor.read_u32()?;
    let commands_size = cursor.read_u32()? as usize;

    // SAFETY: The load commands follow the header in the same mapping.
    let commands = unsafe { mapped(address + MACH_HEADER_64_SIZE, commands_size)? };
    parse_load_commands(address, commands, command_count)
}

pub(crate) fn parse_load_commands(
    load_address: usize,
    commands: &[u8],
    command_count: u32,
) -> Result<ImageDescriptor> {
    let mut image = ImageDescriptor::new(load_address, 0);
    let mut cursor = ByteCursor::new(commands, 0)?;

    for _ in 0..command_count {
        let start = cursor.offset();
        let command = cursor.read_u32()? & !LC_REQ_DYLD;
        let size = cursor.read_u32()? as usize;
        if size < 8 {
            return Err(Error::InconsistentData("load command too small"));
        }

        match command {
            LC_UUID => {
                image.uuid.copy_from_slice(cursor.read_bytes(16)?);
            }
            LC_SEGMENT_64 => {
                let segment = cursor.at(start)?;
                read_segment(&mut image, segment, size)?;
            }
            _ => {}
        }
        cursor = cursor.at(start + size)?;
    }

    Ok(image)
}

fn read_segment(image: &mut ImageDescriptor, mut cursor: ByteCursor<'_>, size: usize) -> Result<()> {
    if size < SEGMENT_COMMAND_64_SIZE {
        return Err(Error::InconsistentData("segment command too small"));
    }
    cursor.skip(8)?;
    if name(cursor.read_bytes(16)?) != b"__TEXT" {
        return Ok(());
    }
    let vmaddr = cursor.read_u64()? as usize;
    let vmsize = cursor.read_u64()? as usize;
    cursor.skip(8 + 8 + 4 + 4)?;
    let section_count = cursor.read_u32()?;
    cursor.skip(4)?;

    image.slide = image.load_address.wrapping_sub(vmaddr);
    image.text_size = vmsize;

    for _ in 0..section_count {
        let start = cursor.offset();
        let section = name(cursor.read_bytes(16)?);
        cursor.skip(16)?;
        let address = (cursor.read_u64()? as usize).wrapping_add(image.slide);
        let size = cursor.read_u64()? as usize;
        match section {
            b"__unwind_info" => image.unwind_info = Region::new(address, size),
            b"__eh_frame" => image.eh_frame = Region::new(address, size),
            _ => {}
        }
        cursor = cursor.at(start + SECTION_64_SIZE)?;
    }
    Ok(())
}

/// A fixed-size name field up to its first NUL.
fn name(field: &[u8]) -> &[u8] {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..len]
}

/// # Safety
///
/// `[address, address + len)` must be mapped.
unsafe fn mapped<'a>(address: usize, len: usize) -> Result<&'a [u8]> {
    memory::check_span(address, len)?;
    // SAFETY: The caller promises the range is mapped.
    Ok(unsafe { core::slice::from_raw_parts(core::ptr::with_exposed_provenance(address), len) })
}
