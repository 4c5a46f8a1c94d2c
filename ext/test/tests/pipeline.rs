//! End-to-end pipeline tests: every packet over the canonical program's key
//! must leave the same state before and after an optimization step.

use p4t::{register_core_steps, CompileError, StepRegistry, StepRegistryBuilder};
use p4t_test::prelude::*;

fn registry() -> StepRegistry {
    register_core_steps(StepRegistryBuilder::new()).build()
}

fn args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

/// Run every packet through both graphs and compare the observable state.
fn assert_equivalent(t: &TestProgram, source: &ProgramGraph, compiled: &ProgramGraph) {
    for packet in t.all_packets() {
        let mut before = packet.clone();
        Simulator::new(source).run(&mut before).unwrap();

        let mut after = Packet::new();
        for (path, _) in packet.snapshot(&t.program, &["test"]) {
            let src = t.program.field_by_path(&path).unwrap();
            let dst = compiled.program.field_by_path(&path).unwrap();
            after = after.with(dst, packet.get(src));
        }
        let trace = Simulator::new(compiled).run(&mut after).unwrap();

        assert_eq!(
            (before.snapshot(&t.program, &["test"]), before.is_dropped()),
            (after.snapshot(&compiled.program, &["test"]), after.is_dropped()),
            "packet {:?} diverged, compiled trace {trace:?}",
            packet.snapshot(&t.program, &["test"]),
        );
    }
}

#[test]
fn rekey_identity_is_equivalent() {
    let t = TestProgram::new();
    let source = t.graph();
    let compiled = registry()
        .run("rekey", source.clone(), &args(&["test_table", "0-3"]))
        .unwrap();
    assert_equivalent(&t, &source, &compiled);
}

#[test]
fn rekey_permutation_is_equivalent() {
    let t = TestProgram::new();
    let source = t.graph();
    let compiled = registry()
        .run("rekey", source.clone(), &args(&["test_table", "2,0,3,1"]))
        .unwrap();
    assert_equivalent(&t, &source, &compiled);

    let table = compiled.program.table_by_name("p4t_test_table_r").unwrap();
    let vmr = compiled.vmr(table).unwrap();
    assert_eq!(vmr.len(), 7);
    assert_eq!(vmr.get(0).unwrap().pattern(), "*1**");
}

#[test]
fn rekey_routes_through_setup_table() {
    let t = TestProgram::new();
    let compiled = registry()
        .run("rekey", t.graph(), &args(&["test_table", "3,2,1,0"]))
        .unwrap();

    let mut packet = Packet::new().with(t.fields[0], 1).with(t.fields[1], 3);
    let trace = Simulator::new(&compiled).run(&mut packet).unwrap();
    assert_eq!(
        trace,
        ["p4t_compress_p4t_test_table_r", "p4t_test_table_r", "post"]
    );
    assert_eq!(packet.get(t.fields[2]), 2);
}

#[test]
fn lossless_partition_is_equivalent() {
    let t = TestProgram::new();
    let source = t.graph();
    // rows 0, 1 read only a; rows 2, 4 read only b; the rest read both
    let compiled = registry()
        .run(
            "partition",
            source.clone(),
            &args(&["test_table", "0,1:0,1", "2,4:2,3", "3,5,6:0-3"]),
        )
        .unwrap();
    assert_equivalent(&t, &source, &compiled);

    let dispatcher = compiled
        .program
        .table_by_name("p4t_test_table_dispatcher")
        .unwrap();
    assert_eq!(compiled.vmr(dispatcher).unwrap().len(), 7);
    // three members plus the dispatcher
    assert_eq!(compiled.vmrs.len(), 4);
}

#[test]
fn partition_then_rekey_member_is_equivalent() {
    let t = TestProgram::new();
    let source = t.graph();
    let registry = registry();
    let partitioned = registry
        .run(
            "partition",
            source.clone(),
            &args(&["test_table", "0,1:0,1", "2,3,4,5,6:0-3"]),
        )
        .unwrap();
    let compiled = registry
        .run("rekey", partitioned, &args(&["p4t_test_table_r_1", "3,2,1,0"]))
        .unwrap();
    assert_equivalent(&t, &source, &compiled);
}

#[test]
fn single_group_subset_only_drops_entries() {
    let t = TestProgram::new();
    let compiled = registry()
        .run("partition", t.graph(), &args(&["test_table", "6,0"]))
        .unwrap();

    let vmr = compiled.vmr(t.table).unwrap();
    let patterns: Vec<String> = vmr.iter().map(|e| e.pattern()).collect();
    assert_eq!(patterns, ["****", "1***"]);
    assert_eq!(vmr.default_action(), Some(&VmrAction::Unbound(t.drop)));
}

#[test]
fn failed_step_leaves_no_graph() {
    let t = TestProgram::new();
    let err = registry()
        .run("partition", t.graph(), &args(&["test_table", "0,1:0,1", "2,3"]))
        .unwrap_err();
    assert!(matches!(err, CompileError::InvalidArgument { .. }));
}

#[test]
fn compiled_graph_materializes_every_table() {
    let t = TestProgram::new();
    let compiled = registry()
        .run(
            "partition",
            t.graph(),
            &args(&["test_table", "0,1:0,1", "2,4:2,3", "3,5,6:0-3"]),
        )
        .unwrap();
    let commands = compiled.materialize().unwrap();
    let entries = commands
        .iter()
        .filter(|c| matches!(c, p4t::RuntimeCommand::AddEntry { .. }))
        .count();
    // seven member entries plus seven dispatcher entries
    assert_eq!(entries, 14);
}
