use super::*;

fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

fn sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

#[test]
fn fails_exactly_at_the_limit() {
    let data = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    let mut cursor = ByteCursor::new(&data, 0).unwrap();

    assert_eq!(cursor.read_u32(), Ok(0x0403_0201));
    assert_eq!(cursor.read_u32(), Ok(0x0807_0605));
    assert_eq!(cursor.read_u32(), Err(Error::EndOfData));
    assert_eq!(cursor.offset(), 8);
    assert_eq!(cursor.read_u64(), Err(Error::EndOfData));
    assert_eq!(cursor.offset(), 8);
    assert_eq!(cursor.read_u16(), Ok(0x0a09));
    assert!(cursor.at_end());
    assert!(!cursor.is_valid());
    assert_eq!(cursor.read_u8(), Err(Error::EndOfData));
    assert_eq!(cursor.offset(), 10);
}

#[test]
fn start_offset_bounds() {
    let data = [0_u8; 4];
    assert!(ByteCursor::new(&data, 4).unwrap().at_end());
    assert_eq!(ByteCursor::new(&data, 5).map(|_| ()), Err(Error::EndOfData));

    let cursor = ByteCursor::new(&data, 1).unwrap();
    assert_eq!(cursor.at(3).unwrap().remaining(), 1);
    assert_eq!(cursor.current_address(), data.as_ptr().addr() + 1);
}

#[test]
fn rejects_invalid_base() {
    // Never dereferenced: an empty slice at a bogus address.
    let bogus: &[u8] = unsafe { core::slice::from_raw_parts(core::ptr::dangling::<u8>(), 0) };
    assert_eq!(
        ByteCursor::new(bogus, 0).map(|_| ()),
        Err(Error::PointerInvalid(1))
    );
}

#[test]
fn fixed_width_little_endian() {
    #[rustfmt::skip]
    let data = [
        0xef, 0xcd, 0xab, 0x89, 0x67, 0x45, 0x23, 0x01,
        0xfe, 0xff,
        0xf8, 0xff, 0xff, 0xff,
    ];
    let mut cursor = ByteCursor::new(&data, 0).unwrap();
    assert_eq!(cursor.read_u64(), Ok(0x0123_4567_89ab_cdef));
    assert_eq!(cursor.read_i16(), Ok(-2));
    assert_eq!(cursor.read_i32(), Ok(-8));
}

#[test]
fn uleb128_values() {
    for value in [
        0,
        1,
        127,
        128,
        624_485,
        u64::from(u32::MAX),
        1 << 62,
        (1 << 63) - 1,
    ] {
        let bytes = uleb(value);
        let mut cursor = ByteCursor::new(&bytes, 0).unwrap();
        assert_eq!(cursor.read_uleb128(), Ok(value), "{value:#x}");
        assert!(cursor.at_end());
    }
}

#[test]
fn sleb128_sign_extends() {
    for value in [0, 2, -2, 63, 64, -64, -65, -123_456, i64::MIN / 2, i64::MAX / 2] {
        let bytes = sleb(value);
        let mut cursor = ByteCursor::new(&bytes, 0).unwrap();
        assert_eq!(cursor.read_sleb128(), Ok(value), "{value}");
        assert!(cursor.at_end());
    }

    // DWARF's own examples.
    let mut cursor = ByteCursor::new(&[0x7f, 0x80, 0x7f], 0).unwrap();
    assert_eq!(cursor.read_sleb128(), Ok(-1));
    assert_eq!(cursor.read_sleb128(), Ok(-128));
}

#[test]
fn leb128_failures_leave_offset() {
    let long = [0x80_u8; 11];
    let mut cursor = ByteCursor::new(&long, 0).unwrap();
    assert!(matches!(cursor.read_uleb128(), Err(Error::InconsistentData(_))));
    assert_eq!(cursor.offset(), 0);
    assert!(matches!(cursor.read_sleb128(), Err(Error::InconsistentData(_))));
    assert_eq!(cursor.offset(), 0);

    let truncated = [0x01, 0x80, 0x80];
    let mut cursor = ByteCursor::new(&truncated, 0).unwrap();
    assert_eq!(cursor.read_uleb128(), Ok(1));
    assert_eq!(cursor.read_uleb128(), Err(Error::EndOfData));
    assert_eq!(cursor.offset(), 1);
}

#[test]
fn strings() {
    let data = b"zPLR\0\0x";
    let mut cursor = ByteCursor::new(data, 0).unwrap();
    assert_eq!(cursor.read_cstr(), Ok(&b"zPLR"[..]));
    assert_eq!(cursor.offset(), 5);
    assert_eq!(cursor.read_cstr(), Ok(&b""[..]));
    assert_eq!(cursor.read_cstr(), Err(Error::EndOfData));
    assert_eq!(cursor.offset(), 6);

    let unterminated = vec![b'a'; MAX_STRING_LENGTH + 10];
    let mut cursor = ByteCursor::new(&unterminated, 0).unwrap();
    assert!(matches!(cursor.read_cstr(), Err(Error::InconsistentData(_))));
    assert_eq!(cursor.offset(), 0);
}
