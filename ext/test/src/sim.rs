//! Pipeline simulator.
//!
//! Walks the control flow of a [`ProgramGraph`] from its ingress node, looks
//! each table's key up in its rule set and interprets the primitives the
//! compiler emits. Conditionals follow their true branch unless the packet
//! says otherwise.
//!
//! | Primitive | Effect |
//! |-----------|--------|
//! | `modify_field(dst, src)` | `dst = src`, truncated to `dst`'s width |
//! | `drop` | marks the packet dropped |
//! | `no_op` | nothing |
//! | `compress_k(dst, src, from, to, ...)` | concatenates bit ranges, MSB first |
//! | `set_max_field_k(dst, src...)` | `dst = max(src...)` |
//!
//! Field values are limited to 64 bits.

use std::collections::{BTreeMap, HashMap};

use bitvec::prelude::*;
use p4t::{
    bits_from_u64, Arg, CompileError, FieldId, NodeId, Program, ProgramGraph, Result, VmrAction,
};

/// Upper bound on visited nodes; a longer walk means a control-flow cycle.
const MAX_STEPS: usize = 1024;

/// Field values plus the drop flag. Unset fields read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    values: HashMap<FieldId, u64>,
    conditions: HashMap<String, bool>,
    dropped: bool,
}

impl Packet {
    /// An all-zero packet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field` (builder pattern).
    #[must_use]
    pub fn with(mut self, field: FieldId, value: u64) -> Self {
        self.values.insert(field, value);
        self
    }

    /// Choose the branch of conditional `name` (builder pattern).
    #[must_use]
    pub fn with_condition(mut self, name: impl Into<String>, value: bool) -> Self {
        self.conditions.insert(name.into(), value);
        self
    }

    /// Current value of `field`.
    #[must_use]
    pub fn get(&self, field: FieldId) -> u64 {
        self.values.get(&field).copied().unwrap_or(0)
    }

    /// `true` once a `drop` primitive ran.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// Values of every field of the named instances, by path.
    #[must_use]
    pub fn snapshot(&self, program: &Program, instances: &[&str]) -> BTreeMap<String, u64> {
        instances
            .iter()
            .filter_map(|name| program.instance_by_name(name).ok())
            .flat_map(|id| program.instance(id).fields().iter().copied())
            .filter(|&f| !program.field(f).is_padding())
            .map(|f| (program.field_path(f), self.get(f)))
            .collect()
    }
}

/// Executes packets through a compiled pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Simulator<'a> {
    graph: &'a ProgramGraph,
}

impl<'a> Simulator<'a> {
    /// Simulate `graph`.
    #[must_use]
    pub fn new(graph: &'a ProgramGraph) -> Self {
        Self { graph }
    }

    /// Run `packet` from the ingress node; returns the visited table names.
    ///
    /// # Errors
    ///
    /// [`CompileError::IllegalState`] for an unknown primitive, a missing
    /// runtime value or a control-flow cycle.
    pub fn run(&self, packet: &mut Packet) -> Result<Vec<String>> {
        let program = &self.graph.program;
        let mut trace = Vec::new();
        let mut node = program.ingress();
        while let Some(current) = node {
            if trace.len() >= MAX_STEPS {
                return Err(illegal(format!("no exit after {MAX_STEPS} nodes")));
            }
            trace.push(program.node_name(current).to_owned());
            node = match current {
                NodeId::Conditional(id) => {
                    let conditional = program.conditional(id);
                    let taken = packet
                        .conditions
                        .get(conditional.name())
                        .copied()
                        .unwrap_or(true);
                    if taken {
                        conditional.on_true()
                    } else {
                        conditional.on_false()
                    }
                }
                NodeId::Table(id) => {
                    let table = program.table(id);
                    let vmr = self.graph.vmr(id);
                    let mut key: BitVec = BitVec::new();
                    for field in program.table_key_fields(id) {
                        let width = program.field(field).width();
                        key.extend_from_bitslice(&bits_from_u64(packet.get(field), width));
                    }
                    match vmr.and_then(|v| v.lookup(&key)) {
                        Some(hit) => {
                            self.execute(&hit.action, packet)?;
                            table.next_of(hit.action.action())
                        }
                        None => {
                            let default = vmr
                                .and_then(|v| v.default_action().cloned())
                                .or_else(|| table.default_action().map(VmrAction::Unbound));
                            if let Some(action) = default {
                                self.execute(&action, packet)?;
                            }
                            table.default_next()
                        }
                    }
                }
            };
        }
        Ok(trace)
    }

    fn execute(&self, action: &VmrAction, packet: &mut Packet) -> Result<()> {
        let program = &self.graph.program;
        let data = action.data();
        let calls = if program.action(action.action()).is_primitive() {
            let arity = program.action(action.action()).arity();
            vec![p4t::Call {
                callee: action.action(),
                args: (0..arity).map(Arg::Param).collect(),
            }]
        } else {
            program.flat_calls(action.action())
        };

        for call in calls {
            let name = program.action(call.callee).name();
            let value = |arg: &Arg, packet: &Packet| -> Result<u64> {
                match *arg {
                    Arg::Field(f) => Ok(packet.get(f)),
                    Arg::Value(v) => Ok(v),
                    Arg::Param(i) => data
                        .get(i)
                        .copied()
                        .ok_or_else(|| illegal(format!("{name} reads missing runtime value {i}"))),
                }
            };
            let field = |arg: &Arg| match *arg {
                Arg::Field(f) => Ok(f),
                _ => Err(illegal(format!("{name} expects a field argument"))),
            };

            match name {
                "no_op" => {}
                "drop" => packet.dropped = true,
                "modify_field" => {
                    let dst = field(&call.args[0])?;
                    let v = value(&call.args[1], packet)?;
                    write(program, packet, dst, v);
                }
                _ if name.starts_with("set_max_field_") => {
                    let dst = field(&call.args[0])?;
                    let mut max = 0;
                    for arg in &call.args[1..] {
                        max = max.max(value(arg, packet)?);
                    }
                    write(program, packet, dst, max);
                }
                _ if name.starts_with("compress_") => {
                    let dst = field(&call.args[0])?;
                    let mut acc: u128 = 0;
                    for chunk in call.args[1..].chunks(3) {
                        let [src, from, to] = chunk else {
                            return Err(illegal(format!("{name} takes (src, from, to) triples")));
                        };
                        let src = field(src)?;
                        let width = program.field(src).width() as u64;
                        let (from, to) = (value(from, packet)?, value(to, packet)?);
                        let len = to - from;
                        let bits = (u128::from(packet.get(src)) >> (width - to)) & ((1u128 << len) - 1);
                        acc = (acc << len) | bits;
                    }
                    write(program, packet, dst, acc as u64);
                }
                other => return Err(illegal(format!("cannot simulate primitive {other}"))),
            }
        }
        Ok(())
    }
}

fn write(program: &Program, packet: &mut Packet, field: FieldId, value: u64) {
    let width = program.field(field).width();
    let masked = if width >= 64 { value } else { value & ((1u64 << width) - 1) };
    packet.values.insert(field, masked);
}

fn illegal(reason: String) -> CompileError {
    CompileError::IllegalState { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestProgram;

    #[test]
    fn source_pipeline_applies_highest_priority() {
        let t = TestProgram::new();
        let graph = t.graph();
        let sim = Simulator::new(&graph);
        let [a, b, c] = t.fields;

        // a=1 b=3 matches rows 1, 2, 4, 6; row 1 (priority 60) wins
        let mut packet = Packet::new().with(a, 1).with(b, 3);
        let trace = sim.run(&mut packet).unwrap();
        assert_eq!(trace, ["test_table", "post"]);
        assert_eq!(packet.get(c), 2);
        assert_eq!(packet.get(b), 3);
        assert!(!packet.is_dropped());
    }

    #[test]
    fn miss_runs_rule_set_default() {
        let t = TestProgram::new();
        let mut graph = t.graph();
        let mut vmr = graph.take_vmr(t.table).unwrap();
        vmr.remove(6).unwrap();
        graph.insert_vmr(vmr).unwrap();

        let mut packet = Packet::new().with(t.fields[0], 0).with(t.fields[1], 0);
        let mut sim_packet = packet.clone();
        Simulator::new(&graph).run(&mut sim_packet).unwrap();
        // row 5 (0* 0*) still matches
        assert_eq!(sim_packet.get(t.fields[2]), 6);

        packet = Packet::new().with(t.fields[0], 0).with(t.fields[1], 2);
        let mut vmr = graph.take_vmr(t.table).unwrap();
        vmr.remove(2).unwrap();
        graph.insert_vmr(vmr).unwrap();
        Simulator::new(&graph).run(&mut packet).unwrap();
        assert!(packet.is_dropped());
    }

    #[test]
    fn snapshot_lists_instance_fields() {
        let t = TestProgram::new();
        let packet = Packet::new().with(t.fields[2], 9);
        let snapshot = packet.snapshot(&t.program, &["test"]);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot["test.c"], 9);
    }
}
