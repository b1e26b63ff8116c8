use super::*;
use crate::arch::x86_64::X86_64Registers;
use crate::arch::Step;
use crate::error::Error;
use crate::memory::testing::FakeStack;

const RBP_FRAME: u32 = 0x0100_0000;
const DWARF_AT_0X123: u32 = 0x0400_0123;

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn compressed_entry(function_offset: u32, encoding_index: u32) -> u32 {
    function_offset | (encoding_index << 24)
}

// header         0..28
// common         28..36   [RBP_FRAME, 0]
// index          36..72   0x1000 -> page 72, 0x2000 -> page 100, sentinel 0x3000
// compressed     72..100  entries at +12, encodings at +24
// regular        100..104
fn section() -> Vec<u8> {
    let mut data = vec![0; 104];
    for (i, value) in [1, 28, 2, 36, 0, 36, 3].into_iter().enumerate() {
        put_u32(&mut data, i * 4, value);
    }
    put_u32(&mut data, 28, RBP_FRAME);
    put_u32(&mut data, 32, 0);

    for (i, (function, page)) in [(0x1000, 72), (0x2000, 100), (0x3000, 0)].into_iter().enumerate() {
        put_u32(&mut data, 36 + i * 12, function);
        put_u32(&mut data, 36 + i * 12 + 4, page);
    }

    put_u32(&mut data, 72, UNWIND_SECOND_LEVEL_COMPRESSED);
    put_u16(&mut data, 76, 12);
    put_u16(&mut data, 78, 3);
    put_u16(&mut data, 80, 24);
    put_u16(&mut data, 82, 1);
    put_u32(&mut data, 84, compressed_entry(0x000, 0));
    put_u32(&mut data, 88, compressed_entry(0x100, 2));
    put_u32(&mut data, 92, compressed_entry(0x200, 1));
    put_u32(&mut data, 96, DWARF_AT_0X123);

    put_u32(&mut data, 100, UNWIND_SECOND_LEVEL_REGULAR);
    data
}

#[test]
fn parses_the_header() {
    let data = section();
    let info = UnwindInfo::parse(&data).unwrap();
    assert_eq!(
        *info.header(),
        UnwindInfoHeader {
            version: 1,
            common_encodings_offset: 28,
            common_encodings_count: 2,
            personalities_offset: 36,
            personalities_count: 0,
            index_offset: 36,
            index_count: 3,
        }
    );
    assert_eq!(
        info.index_entry(1).unwrap(),
        IndexEntry {
            function_offset: 0x2000,
            second_level_page_offset: 100,
            lsda_index_offset: 0,
        }
    );
    assert!(info.index_entry(3).is_err());
}

#[test]
fn rejects_other_versions() {
    let mut data = section();
    put_u32(&mut data, 0, 2);
    assert!(matches!(
        UnwindInfo::parse(&data),
        Err(Error::InconsistentData(_))
    ));
    assert_eq!(UnwindInfo::parse(&data[..20]).unwrap_err(), Error::EndOfData);
}

#[test]
fn first_level_takes_the_last_entry_not_past_the_target() {
    let data = section();
    let info = UnwindInfo::parse(&data).unwrap();

    assert_eq!(info.lookup_first_level(0x1000).unwrap().0, 0);
    assert_eq!(info.lookup_first_level(0x1fff).unwrap().0, 0);
    assert_eq!(info.lookup_first_level(0x2000).unwrap().0, 1);
    // Exactly the last entry is still a hit.
    assert_eq!(info.lookup_first_level(0x3000).unwrap().0, 2);
    assert!(matches!(
        info.lookup_first_level(0xfff),
        Err(Error::InconsistentData(_))
    ));
}

#[test]
fn common_and_page_encodings() {
    let data = section();
    let info = UnwindInfo::parse(&data).unwrap();

    assert_eq!(info.lookup_encoding(0x1000), Ok(RBP_FRAME));
    assert_eq!(info.lookup_encoding(0x10ff), Ok(RBP_FRAME));
    assert_eq!(info.lookup_encoding(0x1100), Ok(DWARF_AT_0X123));
    assert_eq!(info.lookup_encoding(0x11ff), Ok(DWARF_AT_0X123));
}

#[test]
fn zero_encoding_is_missing_info() {
    let data = section();
    let info = UnwindInfo::parse(&data).unwrap();
    assert_eq!(info.lookup_encoding(0x1200), Err(Error::MissingUnwindInfo));
    // The last page entry reaches up to the next index entry.
    assert_eq!(info.lookup_encoding(0x1fff), Err(Error::MissingUnwindInfo));
}

#[test]
fn unsupported_pages() {
    let mut data = section();
    let info = UnwindInfo::parse(&data).unwrap();
    assert!(matches!(
        info.lookup_encoding(0x2000),
        Err(Error::Unimplemented(_))
    ));
    assert!(matches!(
        info.lookup_encoding(0x3000),
        Err(Error::InconsistentData(_))
    ));

    put_u32(&mut data, 72, 7);
    let info = UnwindInfo::parse(&data).unwrap();
    assert!(matches!(
        info.lookup_encoding(0x1000),
        Err(Error::InconsistentData(_))
    ));
}

#[test]
fn page_entries_must_cover_the_target() {
    let mut data = section();
    put_u32(&mut data, 84, compressed_entry(0x010, 0));
    let info = UnwindInfo::parse(&data).unwrap();
    assert!(matches!(
        info.lookup_encoding(0x1008),
        Err(Error::InconsistentData(_))
    ));
    assert_eq!(info.lookup_encoding(0x1010), Ok(RBP_FRAME));
}

#[test]
fn local_encoding_index_out_of_range() {
    let mut data = section();
    put_u32(&mut data, 88, compressed_entry(0x100, 3));
    let info = UnwindInfo::parse(&data).unwrap();
    assert!(matches!(
        info.lookup_encoding(0x1100),
        Err(Error::InconsistentData(_))
    ));
}

#[test]
fn step_dispatches_to_the_register_file() {
    let data = section();
    let load_address = 0x1_0000_0000;
    let stack = FakeStack::new(0x7ff0_0000, 8);
    let registers = X86_64Registers::default();

    assert_eq!(
        step(&data, load_address, load_address + 0x1100, &registers, &stack),
        Ok(CompactStep::Dwarf(0x123))
    );
    assert_eq!(
        step(&data, load_address, load_address + 0x1200, &registers, &stack),
        Err(Error::MissingUnwindInfo)
    );
    assert!(matches!(
        step(&data, load_address, load_address - 1, &registers, &stack),
        Err(Error::ArgumentInvalid(_))
    ));
}

#[test]
fn step_applies_frame_encodings() {
    let data = section();
    let load_address = 0x1_0000_0000;
    let mut stack = FakeStack::new(0x7ff0_0000, 8);
    stack.set(4, stack.addr(6));
    stack.set(5, 0x1_0000_2345);

    let mut registers = X86_64Registers::default();
    registers.set_fp(stack.addr(4));

    let Ok(CompactStep::Step(Step::Caller(caller))) =
        step(&data, load_address, load_address + 0x1000, &registers, &stack)
    else {
        panic!();
    };
    assert_eq!(caller.ip(), 0x1_0000_2345);
    assert_eq!(caller.fp(), stack.addr(6));
    assert_eq!(caller.sp(), stack.addr(6));
}
