use super::*;

fn cie(code_alignment_factor: u64, initial_instructions: &[u8]) -> Cie<'_> {
    Cie {
        offset: 0,
        version: 1,
        augmentation_string: "zR",
        augmentation: None,
        code_alignment_factor,
        data_alignment_factor: -8,
        return_address_register: 16,
        initial_instructions,
    }
}

fn fde(instructions: &[u8]) -> Fde<'_> {
    Fde {
        offset: 0x18,
        length: 0x20,
        cie_offset: 0,
        pc_begin: 0x40_1000,
        pc_range: 0x100,
        lsda: None,
        instructions,
    }
}

#[test]
fn stops_at_the_target_pc() {
    let cie = cie(1, &[]);
    // def_cfa(r7, 8), advance_loc(4), offset(r6, 2)
    let instructions = [0x0c, 7, 8, 0x44, 0x86, 2];
    let fde = fde(&instructions);

    let state = run(&cie, &fde, 0).unwrap();
    assert_eq!(
        state.cfa,
        CfaRule::RegisterOffset {
            register: 7,
            offset: 8
        }
    );
    assert_eq!(state.saved().count(), 0);

    let state = run(&cie, &fde, 5).unwrap();
    assert_eq!(
        state.cfa,
        CfaRule::RegisterOffset {
            register: 7,
            offset: 8
        }
    );
    assert_eq!(state.rule(6), RegisterRule::OffsetFromCfa(-16));
    assert_eq!(state.saved().collect::<Vec<_>>(), [(6, -16)]);

    // The row created by advance_loc applies at its own location.
    let state = run(&cie, &fde, 4).unwrap();
    assert_eq!(state.rule(6), RegisterRule::OffsetFromCfa(-16));
    let state = run(&cie, &fde, 3).unwrap();
    assert_eq!(state.rule(6), RegisterRule::Unused);
}

#[test]
fn cie_instructions_ignore_location() {
    // def_cfa(rsp, 8), advance_loc(1), offset(rip, 1), nop
    let initial = [0x0c, 7, 8, 0x41, 0x90, 1, 0];
    let cie = cie(1, &initial);
    // advance_loc(1), def_cfa_offset(16), advance_loc(3), offset(rbp, 2)
    let instructions = [0x41, 0x0e, 16, 0x43, 0x86, 2];
    let fde = fde(&instructions);

    let state = run(&cie, &fde, 0).unwrap();
    assert_eq!(
        state.cfa,
        CfaRule::RegisterOffset {
            register: 7,
            offset: 8
        }
    );
    assert_eq!(state.rule(16), RegisterRule::OffsetFromCfa(-8));

    let state = run(&cie, &fde, 1).unwrap();
    assert_eq!(
        state.cfa,
        CfaRule::RegisterOffset {
            register: 7,
            offset: 16
        }
    );
    assert_eq!(state.rule(6), RegisterRule::Unused);

    let state = run(&cie, &fde, 0xff).unwrap();
    assert_eq!(state.saved().collect::<Vec<_>>(), [(6, -16), (16, -8)]);
    assert_eq!(state.location, 4);
}

#[test]
fn code_alignment_scales_advances() {
    let cie = cie(4, &[0x0c, 31, 0]);
    // advance_loc(1), def_cfa_offset(32), offset(x29, 4), offset(x30, 3)
    let instructions = [0x41, 0x0e, 32, 0x9d, 4, 0x9e, 3];
    let fde = fde(&instructions);

    let state = run(&cie, &fde, 3).unwrap();
    assert_eq!(
        state.cfa,
        CfaRule::RegisterOffset {
            register: 31,
            offset: 0
        }
    );

    let state = run(&cie, &fde, 4).unwrap();
    assert_eq!(
        state.cfa,
        CfaRule::RegisterOffset {
            register: 31,
            offset: 32
        }
    );
    assert_eq!(state.rule(29), RegisterRule::OffsetFromCfa(-32));
    assert_eq!(state.rule(30), RegisterRule::OffsetFromCfa(-24));
}

#[test]
fn def_cfa_offset_needs_a_register_rule() {
    let cie = cie(1, &[]);
    let instructions = [0x0e, 16];
    assert!(matches!(
        run(&cie, &fde(&instructions), 0),
        Err(Error::InconsistentData(_))
    ));
}

#[test]
fn unsupported_opcodes_fail() {
    let cie = cie(1, &[]);
    // def_cfa_register
    assert_eq!(
        run(&cie, &fde(&[0x0c, 7, 8, 0x0d, 6]), 0),
        Err(Error::UnsupportedOpcode(0x0d))
    );
    // restore(r6)
    assert_eq!(
        run(&cie, &fde(&[0xc6]), 0),
        Err(Error::UnsupportedOpcode(0xc6))
    );
    // remember_state in the CIE fails even though the FDE is fine
    let bad_cie = Cie {
        initial_instructions: &[0x0a],
        ..cie
    };
    assert_eq!(
        run(&bad_cie, &fde(&[]), 0),
        Err(Error::UnsupportedOpcode(0x0a))
    );
}

#[test]
fn bad_operands() {
    let cie = cie(1, &[]);
    // def_cfa(r200, 8)
    assert!(matches!(
        run(&cie, &fde(&[0x0c, 0xc8, 0x01, 8]), 0),
        Err(Error::ArgumentInvalid(_))
    ));
    // def_cfa with its offset cut off
    assert_eq!(run(&cie, &fde(&[0x0c, 7]), 0), Err(Error::EndOfData));
    assert_eq!(run(&cie, &fde(&[0x0c, 7, 0x80]), 0), Err(Error::EndOfData));
}
