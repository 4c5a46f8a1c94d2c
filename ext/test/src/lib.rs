//! p4t-test: shared test programs and a pipeline simulator
//!
//! Provides a small canonical program, rule-set builders from ternary strings,
//! and a [`Simulator`] that walks a compiled pipeline so tests can compare a
//! source table against what replaced it.
//!
//! # Example
//!
//! ```
//! use p4t_test::prelude::*;
//!
//! let t = TestProgram::new();
//! let vmr = t.sample_vmr();
//! assert_eq!(vmr.len(), 7);
//! assert_eq!(vmr.bit_width(), 4);
//! ```

use p4t::prelude::*;
use p4t::{ActionId, FieldId};

#[cfg(feature = "fixtures")]
pub mod fixture;
mod sim;

pub use sim::{Packet, Simulator};

/// The canonical test program.
///
/// ```text
/// header test_t { a: 2, b: 2, c: 8 }   instance test (metadata)
/// set_c(x: 8)  = modify_field(test.c, x)
/// set_b(x: 2)  = modify_field(test.b, x)
/// test_table   reads test.a ternary, test.b ternary
///              actions set_c, set_b, drop
/// ingress -> test_table -> post
/// ```
#[derive(Debug, Clone)]
pub struct TestProgram {
    /// The program.
    pub program: Program,
    /// `test_table`.
    pub table: TableId,
    /// `post`, the table after `test_table`.
    pub post: TableId,
    /// `test.a`, `test.b`, `test.c`.
    pub fields: [FieldId; 3],
    /// `set_c`.
    pub set_c: ActionId,
    /// `set_b`.
    pub set_b: ActionId,
    /// `drop`.
    pub drop: ActionId,
}

impl TestProgram {
    /// Build the canonical program.
    ///
    /// # Panics
    ///
    /// Never for the fixed program above.
    #[must_use]
    pub fn new() -> Self {
        Self::build().expect("canonical test program is valid")
    }

    fn build() -> p4t::Result<Self> {
        let mut program = Program::new();
        let header = program.add_header("test_t")?;
        for (name, width) in [("a", 2), ("b", 2), ("c", 8)] {
            program.add_header_field(header, name, width)?;
        }
        let test = program.add_instance(header, "test", true)?;
        let a = program.instance_field(test, "a")?;
        let b = program.instance_field(test, "b")?;
        let c = program.instance_field(test, "c")?;

        let modify = program.action_by_name("modify_field")?;
        let set_c = program.add_action("set_c", vec![p4t::Param::new("x", 8)])?;
        program.add_call(set_c, modify, vec![c.into(), "x".into()])?;
        let set_b = program.add_action("set_b", vec![p4t::Param::new("x", 2)])?;
        program.add_call(set_b, modify, vec![b.into(), "x".into()])?;
        let drop = program.action_by_name("drop")?;
        let no_op = program.action_by_name("no_op")?;

        let table = program.add_table(
            "test_table",
            vec![
                MatchField::new(a, MatchKind::Ternary),
                MatchField::new(b, MatchKind::Ternary),
            ],
            vec![set_c, set_b, drop],
            None,
        )?;
        let post = program.add_table("post", vec![], vec![no_op], None)?;
        p4t::rewrite::chain_tables(&mut program, &[table, post]);
        program.set_ingress(Some(NodeId::Table(table)));

        Ok(Self {
            program,
            table,
            post,
            fields: [a, b, c],
            set_c,
            set_b,
            drop,
        })
    }

    /// Entry on `test_table` from a 4-character ternary pattern.
    ///
    /// # Panics
    ///
    /// If `pattern` is not four characters of `0`, `1` or `*`.
    #[must_use]
    pub fn entry(&self, pattern: &str, action: VmrAction, priority: u64) -> VmrEntry {
        entry(pattern, action, priority)
    }

    /// Seven overlapping entries with distinct priorities, default `drop`.
    ///
    /// | # | a b | action | priority |
    /// |---|-----|--------|----------|
    /// | 0 | `1* **` | `set_c(1)` | 70 |
    /// | 1 | `01 **` | `set_c(2)` | 60 |
    /// | 2 | `** 1*` | `set_b(3)` | 50 |
    /// | 3 | `00 01` | `set_c(4)` | 40 |
    /// | 4 | `** *1` | `set_b(1)` | 30 |
    /// | 5 | `0* 0*` | `set_c(6)` | 20 |
    /// | 6 | `** **` | `set_c(7)` | 10 |
    #[must_use]
    pub fn sample_vmr(&self) -> Vmr {
        let rows: [(&str, ActionId, u64, u64); 7] = [
            ("1***", self.set_c, 1, 70),
            ("01**", self.set_c, 2, 60),
            ("**1*", self.set_b, 3, 50),
            ("0001", self.set_c, 4, 40),
            ("***1", self.set_b, 1, 30),
            ("0*0*", self.set_c, 6, 20),
            ("****", self.set_c, 7, 10),
        ];
        let mut vmr = Vmr::new(&self.program, self.table);
        for (pattern, action, data, priority) in rows {
            vmr.push(entry(pattern, VmrAction::bound(action, vec![data]), priority))
                .expect("sample entries fit test_table");
        }
        vmr.set_default_action(Some(VmrAction::Unbound(self.drop)));
        vmr
    }

    /// A [`ProgramGraph`] holding the program and [`sample_vmr`](Self::sample_vmr).
    #[must_use]
    pub fn graph(&self) -> ProgramGraph {
        let mut graph = ProgramGraph::new(self.program.clone(), CompilerConfig::default());
        graph
            .insert_vmr(self.sample_vmr())
            .expect("sample rule set fits test_table");
        graph
    }

    /// Every packet over `test.a` and `test.b`.
    #[must_use]
    pub fn all_packets(&self) -> Vec<Packet> {
        (0..4u64)
            .flat_map(|a| (0..4u64).map(move |b| (a, b)))
            .map(|(a, b)| Packet::new().with(self.fields[0], a).with(self.fields[1], b))
            .collect()
    }
}

impl Default for TestProgram {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry from a ternary pattern (`0`, `1`, `*`).
///
/// # Panics
///
/// If the pattern contains any other character.
#[must_use]
pub fn entry(pattern: &str, action: VmrAction, priority: u64) -> VmrEntry {
    VmrEntry::ternary(pattern, action, priority).expect("pattern of 0, 1 and *")
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{entry, Packet, Simulator, TestProgram};
    pub use p4t::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_program_is_valid() {
        let t = TestProgram::new();
        t.program.validate().unwrap();
        assert_eq!(t.program.table_key_width(t.table), 4);
        assert_eq!(t.program.table(t.table).default_next(), Some(NodeId::Table(t.post)));
    }

    #[test]
    fn sample_graph_validates() {
        let t = TestProgram::new();
        t.graph().validate().unwrap();
    }

    #[test]
    fn all_packets_cover_the_key() {
        assert_eq!(TestProgram::new().all_packets().len(), 16);
    }
}
