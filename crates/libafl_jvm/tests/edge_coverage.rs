//! Instruments small classes and runs them to check which counters move.

mod common;

use std::sync::Arc;

use common::{
    Machine, add_calls, add_pick, add_sum, add_touch, add_twice, full_subject, method_code,
    subject,
};
use libafl_jvm::{
    CallSiteFilter, CoverageState, EdgeCoverageInstrumentor, Error, InstrumentationMode,
    Instrumentor, NoThrowTable, PackagePrefixes, classfile::ClassFile, classfile::insn::Insn,
    saturating_increment,
};
use serial_test::serial;

fn no_throw() -> Arc<NoThrowTable> {
    Arc::new(NoThrowTable::from_text("java/lang/Math#abs#(I)I\n").unwrap())
}

fn production_filter() -> CallSiteFilter {
    CallSiteFilter::new(
        no_throw(),
        PackagePrefixes::new(["libafl/jvm/"]),
        InstrumentationMode::Production,
    )
}

fn instrumentor(state: &CoverageState) -> EdgeCoverageInstrumentor<'_> {
    EdgeCoverageInstrumentor::builder()
        .state(state)
        .filter(production_filter())
        .build()
}

#[test]
fn test_if_else_records_taken_branch_only() {
    let state = CoverageState::with_capacity(16, 1024);
    let mut class = subject();
    add_pick(&mut class);
    let (bytes, report) = instrumentor(&state)
        .instrument_with_report(&class.to_bytes().unwrap())
        .unwrap();
    assert_eq!(report.methods[0].edge_probes, 3);
    assert_eq!(report.methods[0].call_probes, 0);
    assert_eq!(report.methods[0].edge_ids, vec![0, 1, 2]);

    let class = ClassFile::parse(&bytes).unwrap();
    let mut machine = Machine::new(&class, state.map());
    assert_eq!(machine.call("pick", &[1]), Some(1));
    assert_eq!(&state.map().snapshot()[..3], &[1, 0, 1]);
    assert_eq!(machine.call("pick", &[0]), Some(2));
    assert_eq!(&state.map().snapshot()[..3], &[1, 1, 2]);
}

#[test]
fn test_only_throwing_calls_get_a_probe() {
    let state = CoverageState::with_capacity(16, 1024);
    let mut class = subject();
    add_twice(&mut class);
    add_calls(&mut class);
    let (bytes, report) = instrumentor(&state)
        .instrument_with_report(&class.to_bytes().unwrap())
        .unwrap();
    let calls = &report.methods[1];
    assert_eq!(calls.name, "calls");
    assert_eq!(calls.call_probes, 1);
    assert_eq!(calls.edge_probes, 1);

    let class = ClassFile::parse(&bytes).unwrap();
    let code = method_code(&class, "calls");
    let invokes: Vec<_> = code
        .insns
        .iter()
        .enumerate()
        .filter(|(_, insn)| insn.invoked_method().is_some())
        .map(|(i, _)| i)
        .collect();
    // abs, the call probe's get and put, twice, the return probe's get and put
    assert_eq!(invokes.len(), 6);

    let mut machine = Machine::new(&class, state.map());
    assert_eq!(machine.call("calls", &[-3]), Some(6));
    let hit: Vec<_> = state.map().snapshot()[..state.edges_allocated()].to_vec();
    assert!(hit.iter().all(|c| *c == 1), "{hit:?}");
}

#[test]
fn test_reinstrumenting_is_deterministic() {
    let state = CoverageState::with_capacity(16, 1024);
    let input = full_subject();
    let first = instrumentor(&state).instrument(&input).unwrap();
    let allocated = state.edges_allocated();
    state.reset_edge_ids();
    let second = instrumentor(&state).instrument(&input).unwrap();
    assert_eq!(first, second);
    assert_eq!(state.edges_allocated(), allocated);
}

#[test]
#[serial]
fn test_global_state_is_default() {
    let global = CoverageState::global();
    global.reset_edge_ids();
    let instrumentor = EdgeCoverageInstrumentor::builder().build();
    let input = full_subject();
    let first = instrumentor.instrument(&input).unwrap();
    assert!(global.edges_allocated() > 0);
    global.reset_edge_ids();
    assert_eq!(instrumentor.instrument(&input).unwrap(), first);
    global.reset_edge_ids();
}

#[test]
fn test_ids_stay_dense_across_growth() {
    let state = CoverageState::with_capacity(1, 1 << 16);
    let input = full_subject();
    let mut ids = vec![];
    for _ in 0..5 {
        let (_, report) = instrumentor(&state).instrument_with_report(&input).unwrap();
        ids.extend(report.methods.iter().flat_map(|m| m.edge_ids.iter().copied()));
    }
    let expected: Vec<u32> = (0..ids.len() as u32).collect();
    assert_eq!(ids, expected);
    assert!(state.map().capacity() >= ids.len());
}

#[test]
fn test_counter_saturates_through_bytecode() {
    let state = CoverageState::with_capacity(4, 64);
    let mut class = subject();
    add_twice(&mut class);
    let bytes = instrumentor(&state)
        .instrument(&class.to_bytes().unwrap())
        .unwrap();
    let class = ClassFile::parse(&bytes).unwrap();
    let mut machine = Machine::new(&class, state.map());

    let mut expected = 0;
    for round in 0..600 {
        assert_eq!(machine.call("twice", &[round]), Some(round * 2));
        expected = saturating_increment(expected);
        assert_eq!(state.map().get(0), Some(expected));
        assert_ne!(expected, 0);
    }
}

#[test]
fn test_growth_keeps_recorded_hits() {
    let state = CoverageState::with_capacity(1, 1 << 16);
    let mut class = subject();
    add_sum(&mut class);
    let bytes = instrumentor(&state)
        .instrument(&class.to_bytes().unwrap())
        .unwrap();
    let class = ClassFile::parse(&bytes).unwrap();
    assert_eq!(Machine::new(&class, state.map()).call("sum", &[4]), Some(10));
    // fall-through into the loop head, the back edge, the return
    assert_eq!(state.map().snapshot()[..3], [1, 4, 1]);

    let before = state.map().capacity();
    for _ in 0..20 {
        instrumentor(&state).instrument(&full_subject()).unwrap();
    }
    assert!(state.map().capacity() > before);
    assert_eq!(state.map().snapshot()[..3], [1, 4, 1]);
}

#[test]
fn test_testing_mode_probes_runtime_calls_and_notifies() {
    let mut class = subject();
    add_touch(&mut class);
    let input = class.to_bytes().unwrap();

    let production = CoverageState::with_capacity(16, 1024);
    let (_, report) = instrumentor(&production)
        .instrument_with_report(&input)
        .unwrap();
    assert_eq!(report.methods[0].call_probes, 0);

    let testing = CoverageState::fixed(16);
    let (bytes, report) = EdgeCoverageInstrumentor::builder()
        .state(&testing)
        .filter(CallSiteFilter::new(
            no_throw(),
            PackagePrefixes::new(["libafl/jvm/"]),
            InstrumentationMode::Testing,
        ))
        .build()
        .instrument_with_report(&input)
        .unwrap();
    assert_eq!(report.methods[0].call_probes, 1);
    assert_eq!(report.methods[0].edge_probes, 1);

    let class = ClassFile::parse(&bytes).unwrap();
    let mut machine = Machine::new(&class, testing.map());
    assert_eq!(machine.call("touch", &[]), None);
    // two probes, each notifying, plus the original call
    assert_eq!(machine.notifications, 3);
}

#[test]
fn test_fixed_map_runs_out() {
    let state = CoverageState::fixed(2);
    let mut class = subject();
    add_pick(&mut class);
    let instrumentor = EdgeCoverageInstrumentor::builder()
        .state(&state)
        .filter(CallSiteFilter::new(
            no_throw(),
            PackagePrefixes::new(["libafl/jvm/"]),
            InstrumentationMode::Testing,
        ))
        .build();
    let result = instrumentor.instrument(&class.to_bytes().unwrap());
    assert!(matches!(result, Err(Error::MapGrowth(..))));
}

#[test]
fn test_large_ids_are_loaded_from_the_pool() {
    let state = CoverageState::with_capacity(1, 1 << 17);
    for _ in 0..40_000 {
        state.next_edge_id().unwrap();
    }
    let mut class = subject();
    add_twice(&mut class);
    let bytes = instrumentor(&state)
        .instrument(&class.to_bytes().unwrap())
        .unwrap();
    let class = ClassFile::parse(&bytes).unwrap();
    let code = method_code(&class, "twice");
    assert!(code.insns.iter().any(|insn| matches!(insn, Insn::Ldc(_))));

    let mut machine = Machine::new(&class, state.map());
    assert_eq!(machine.call("twice", &[21]), Some(42));
    assert_eq!(state.map().get(40_000), Some(1));
}

#[test]
fn test_malformed_input_is_structural() {
    let state = CoverageState::with_capacity(16, 1024);
    let input = full_subject();
    let mut broken = input.clone();
    broken[0] = 0;
    assert!(matches!(
        instrumentor(&state).instrument(&broken),
        Err(Error::Structural(..))
    ));
    assert!(matches!(
        instrumentor(&state).instrument(&input[..input.len() / 2]),
        Err(Error::Structural(..))
    ));
    assert_eq!(state.edges_allocated(), 0);
}
