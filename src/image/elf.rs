//! Image capture on ELF hosts through `dl_iterate_phdr`.
//!
//! The executable `PT_LOAD` segment is the image's text, `PT_GNU_EH_FRAME`
//! is `.eh_frame_hdr`, and the GNU build id note stands in for a UUID.
//! `.eh_frame` itself has no program header; its start comes from the
//! `.eh_frame_hdr` and it is bounded by the `PT_LOAD` holding it.

use core::ffi::{c_int, c_void, CStr};

use libc::{dl_phdr_info, size_t, Elf64_Phdr, PF_X, PT_GNU_EH_FRAME, PT_LOAD, PT_NOTE};

use super::{ImageDescriptor, ImageTable, Region};
use crate::cursor::ByteCursor;
use crate::dwarf::divination::EhFrameHeader;
use crate::error::Result;

const NT_GNU_BUILD_ID: u32 = 3;

pub fn capture(table: &mut ImageTable) {
    // SAFETY: The callback only runs during this call, while `table` is borrowed.
    unsafe {
        libc::dl_iterate_phdr(Some(add_image), (table as *mut ImageTable).cast());
    }
}

unsafe extern "C" fn add_image(info: *mut dl_phdr_info, _size: size_t, data: *mut c_void) -> c_int {
    // SAFETY: `data` is the table handed to `dl_iterate_phdr` by `capture`.
    let table = unsafe { &mut *data.cast::<ImageTable>() };
    // SAFETY: The loader passes a valid entry for the duration of the callback.
    let info = unsafe { &*info };

    // SAFETY: The program headers of a loaded object are mapped.
    let headers = unsafe { core::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) };
    let path = if info.dlpi_name.is_null() {
        None
    } else {
        // SAFETY: The name is a NUL-terminated string owned by the loader.
        Some(unsafe { CStr::from_ptr(info.dlpi_name) }).filter(|name| !name.is_empty())
    };

    match describe(info.dlpi_addr as usize, headers) {
        Some(mut image) => {
            image.path = path;
            if !table.push(image) {
                // Stop iterating, the table is full.
                return 1;
            }
        }
        None => trace!("skipping {path:?}, it has no executable segment"),
    }
    0
}

fn describe(base: usize, headers: &[Elf64_Phdr]) -> Option<ImageDescriptor> {
    let text = headers
        .iter()
        .find(|header| header.p_type == PT_LOAD && header.p_flags & PF_X != 0)?;

    let mut image = ImageDescriptor::new(
        base.wrapping_add(text.p_vaddr as usize),
        text.p_memsz as usize,
    );
    image.slide = base;

    for header in headers {
        let region = Region::new(base.wrapping_add(header.p_vaddr as usize), header.p_memsz as usize);
        match header.p_type {
            PT_GNU_EH_FRAME => image.eh_frame_hdr = region,
            PT_NOTE => {
                // SAFETY: Note segments of a loaded object are mapped.
                if let Ok(Some(id)) = unsafe { region.as_bytes() }.and_then(build_id) {
                    image.uuid = id;
                }
            }
            _ => {}
        }
    }

    if !image.eh_frame_hdr.is_empty() {
        image.eh_frame = eh_frame_region(base, headers, image.eh_frame_hdr).unwrap_or_default();
    }
    Some(image)
}

fn eh_frame_region(base: usize, headers: &[Elf64_Phdr], hdr: Region) -> Result<Region> {
    // SAFETY: PT_GNU_EH_FRAME of a loaded object is mapped.
    let header = EhFrameHeader::parse(unsafe { hdr.as_bytes()? })?;
    let start = header.eh_frame_ptr;

    let segment = headers
        .iter()
        .filter(|header| header.p_type == PT_LOAD)
        .map(|header| Region::new(base.wrapping_add(header.p_vaddr as usize), header.p_memsz as usize))
        .find(|segment| segment.contains(start));

    Ok(segment
        .map(|segment| Region::new(start, segment.address + segment.size - start))
        .unwrap_or_default())
}

/// The first 16 bytes of the `NT_GNU_BUILD_ID` note, zero padded.
fn build_id(notes: &[u8]) -> Result<Option<[u8; 16]>> {
    let mut cursor = ByteCursor::new(notes, 0)?;
    while cursor.remaining() >= 12 {
        let name_size = cursor.read_u32()? as usize;
        let desc_size = cursor.read_u32()? as usize;
        let kind = cursor.read_u32()?;
        let name = cursor.read_bytes(name_size)?;
        cursor.skip(padding(name_size))?;
        let desc = cursor.read_bytes(desc_size)?;
        cursor.skip(padding(desc_size).min(cursor.remaining()))?;

        if kind == NT_GNU_BUILD_ID && name == b"GNU\0" {
            let mut id = [0; 16];
            let len = desc.len().min(id.len());
            id[..len].copy_from_slice(&desc[..len]);
            return Ok(Some(id));
        }
    }
    Ok(None)
}

fn padding(size: usize) -> usize {
    (4 - size % 4) % 4
}
