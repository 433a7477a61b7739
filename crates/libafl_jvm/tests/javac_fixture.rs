//! Instruments a class compiled by javac (see `fixtures/Branches.java`).

mod common;

use common::{Machine, method_code};
use libafl_jvm::{
    CoverageState, EdgeCoverageInstrumentor,
    classfile::{ClassFile, frame::VerificationType},
};

static BRANCHES: &[u8] = include_bytes!("fixtures/Branches.class");

#[test]
fn test_javac_class_round_trips() {
    let class = ClassFile::parse(BRANCHES).unwrap();
    assert_eq!(class.name().unwrap(), "fixtures/Branches");
    assert_eq!(class.to_bytes().unwrap(), BRANCHES);
}

#[test]
fn test_javac_class_counts() {
    let state = CoverageState::with_capacity(16, 1024);
    let instrumentor = EdgeCoverageInstrumentor::builder().state(&state).build();
    let (_, report) = instrumentor.instrument_with_report(BRANCHES).unwrap();

    let counts: Vec<(&str, usize, usize)> = report
        .methods
        .iter()
        .map(|m| (m.name.as_str(), m.edge_probes, m.call_probes))
        .collect();
    assert_eq!(
        counts,
        [
            ("<init>", 1, 1),
            ("pick", 3, 0),
            ("parse", 2, 1),
            ("select", 4, 0),
            ("widen", 3, 0),
        ]
    );
    assert_eq!(report.total_probes(), 15);
    assert_eq!(state.edges_allocated(), 15);
}

#[test]
fn test_javac_frames_carry_the_map() {
    let state = CoverageState::with_capacity(16, 1024);
    let instrumentor = EdgeCoverageInstrumentor::builder().state(&state).build();
    let bytes = instrumentor.instrument_with_report(BRANCHES).unwrap().0;
    let before = ClassFile::parse(BRANCHES).unwrap();
    let after = ClassFile::parse(&bytes).unwrap();

    for (name, map_slot) in [("pick", 2), ("parse", 2), ("select", 1), ("widen", 6)] {
        let original = method_code(&before, name);
        let code = method_code(&after, name);
        assert_eq!(original.max_locals, map_slot, "{name}");
        assert_eq!(code.max_locals, map_slot + 1, "{name}");
        assert_eq!(code.max_stack, original.max_stack + 5, "{name}");
        assert!(!code.frames.is_empty(), "{name} lost its frames");

        for frame in &code.frames {
            assert_eq!(frame.local_slots(), u32::from(code.max_locals), "{name}");
            let Some(VerificationType::Object(index)) = frame.locals.last() else {
                panic!("{name}: frame at {:?} does not end with the map", frame.label);
            };
            assert_eq!(after.pool.class_name(*index).unwrap(), "java/nio/ByteBuffer");
        }
    }

    let parse = method_code(&after, "parse");
    assert_eq!(parse.handlers.len(), 1);
    let catch_type = parse.handlers[0].catch_type;
    assert_eq!(
        after.pool.class_name(catch_type).unwrap(),
        "java/lang/NumberFormatException"
    );
    let handler = parse
        .frames
        .iter()
        .find(|frame| frame.label == parse.handlers[0].handler)
        .unwrap();
    assert_eq!(handler.locals.len(), 3);
    assert_eq!(handler.locals[1], VerificationType::Top);
    assert_eq!(handler.stack.len(), 1);

    let widen = method_code(&after, "widen");
    for frame in &widen.frames {
        assert!(
            frame
                .locals
                .starts_with(&[VerificationType::Integer, VerificationType::Long]),
            "{:?}",
            frame.locals
        );
    }
}

#[test]
fn test_javac_methods_record_the_path_taken() {
    let state = CoverageState::with_capacity(16, 1024);
    let instrumentor = EdgeCoverageInstrumentor::builder().state(&state).build();
    let (bytes, report) = instrumentor.instrument_with_report(BRANCHES).unwrap();
    let class = ClassFile::parse(&bytes).unwrap();
    let ids = |name: &str| {
        report
            .methods
            .iter()
            .find(|m| m.name == name)
            .unwrap()
            .edge_ids
            .iter()
            .map(|&id| id as usize)
            .collect::<Vec<_>>()
    };
    let map = state.map();

    let pick = ids("pick");
    let mut machine = Machine::new(&class, map);
    assert_eq!(machine.call("pick", &[5]), Some(1));
    assert_eq!(map.get(pick[0]), Some(1));
    assert_eq!(map.get(pick[1]), Some(0));
    assert_eq!(map.get(pick[2]), Some(1));

    let select = ids("select");
    assert_eq!(machine.call("select", &[1]), Some(20));
    assert_eq!(machine.call("select", &[7]), Some(0));
    assert_eq!(machine.call("select", &[7]), Some(0));
    assert_eq!(map.get(select[0]), Some(0));
    assert_eq!(map.get(select[1]), Some(1));
    assert_eq!(map.get(select[2]), Some(0));
    assert_eq!(map.get(select[3]), Some(2));
    assert_eq!(machine.notifications, 0);
}
