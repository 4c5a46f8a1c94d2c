//! Conformance fixture runner
//!
//! Loads YAML fixtures, compiles them with the core steps and checks the
//! result. A fixture passes when:
//!
//! - the steps fail with the expected error kind, or
//! - the listed rule sets have the expected `pattern@priority` entries, and
//!   every packet over the `equivalence` fields leaves the observed
//!   instances in the same state before and after compilation.

use std::collections::BTreeMap;

use p4t::{
    register_core_steps, CompilerConfig, EntriesConfig, ProgramConfig, ProgramGraph,
    StepRegistryBuilder,
};
use serde::Deserialize;

use crate::{Packet, Simulator};

/// A complete test fixture
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fixture {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: CompilerConfig,
    pub program: ProgramConfig,
    #[serde(default)]
    pub entries: EntriesConfig,
    #[serde(default)]
    pub steps: Vec<StepCase>,
    #[serde(default)]
    pub expect: Expect,
    #[serde(default)]
    pub equivalence: Option<Equivalence>,
}

/// One step invocation
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepCase {
    pub step: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Expected outcome
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expect {
    /// Error kind (`CompileError::kind`) raised by loading or a step.
    #[serde(default)]
    pub error: Option<String>,
    /// Table name to `pattern@priority` entries, in order.
    #[serde(default)]
    pub rule_sets: BTreeMap<String, Vec<String>>,
}

/// Exhaustive behavioural comparison
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Equivalence {
    /// Field paths enumerated over every value.
    pub fields: Vec<String>,
    /// Instances whose fields must end up equal.
    pub observe: Vec<String>,
}

/// Outcome of running one fixture
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(String),
}

/// Packets tried per equivalence check at most.
const MAX_PACKETS: u64 = 1 << 16;

impl Fixture {
    /// Parse a fixture from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Parse multiple fixtures from a YAML file with `---` separators
    pub fn from_yaml_multi(yaml: &str) -> Result<Vec<Self>, serde_yaml::Error> {
        let mut fixtures = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            fixtures.push(Self::deserialize(doc)?);
        }
        Ok(fixtures)
    }

    /// Compile and check.
    pub fn run(&self) -> Outcome {
        let compiled = ProgramGraph::from_config(&self.program, Some(&self.entries), self.config.clone())
            .and_then(|source| {
                let registry = register_core_steps(StepRegistryBuilder::new()).build();
                let mut graph = source.clone();
                for case in &self.steps {
                    graph = registry.run(&case.step, graph, &case.args)?;
                }
                Ok((source, graph))
            });

        let (source, graph) = match (compiled, &self.expect.error) {
            (Err(e), Some(kind)) if e.kind() == kind.as_str() => return Outcome::Passed,
            (Err(e), _) => return Outcome::Failed(format!("unexpected error: {e}")),
            (Ok(_), Some(kind)) => return Outcome::Failed(format!("expected a {kind} error")),
            (Ok(pair), None) => pair,
        };

        for (table, expected) in &self.expect.rule_sets {
            let actual: Vec<String> = match graph.program.table_by_name(table) {
                Ok(id) => graph
                    .vmr(id)
                    .map(|vmr| vmr.iter().map(|e| format!("{}@{}", e.pattern(), e.priority)).collect())
                    .unwrap_or_default(),
                Err(e) => return Outcome::Failed(e.to_string()),
            };
            if &actual != expected {
                return Outcome::Failed(format!(
                    "rule set {table}: expected {expected:?}, got {actual:?}"
                ));
            }
        }

        match &self.equivalence {
            Some(eq) => check_equivalence(&source, &graph, eq),
            None => Outcome::Passed,
        }
    }

    /// Run and panic on failure
    pub fn run_and_assert(&self) {
        if let Outcome::Failed(reason) = self.run() {
            panic!("Fixture '{}' failed: {reason}", self.name);
        }
    }
}

fn check_equivalence(source: &ProgramGraph, compiled: &ProgramGraph, eq: &Equivalence) -> Outcome {
    let mut fields = Vec::new();
    for path in &eq.fields {
        match (
            source.program.field_by_path(path),
            compiled.program.field_by_path(path),
        ) {
            (Ok(s), Ok(c)) => fields.push((s, c, source.program.field(s).width())),
            (Err(e), _) | (_, Err(e)) => return Outcome::Failed(e.to_string()),
        }
    }
    let total_bits: usize = fields.iter().map(|&(_, _, w)| w).sum();
    if total_bits >= 64 || 1u64 << total_bits > MAX_PACKETS {
        return Outcome::Failed(format!("{total_bits} bits are too many to enumerate"));
    }
    let observe: Vec<&str> = eq.observe.iter().map(String::as_str).collect();

    for n in 0..(1u64 << total_bits) {
        let mut shift = total_bits;
        let (mut before, mut after) = (Packet::new(), Packet::new());
        for &(s, c, width) in &fields {
            shift -= width;
            let value = (n >> shift) & ((1u64 << width) - 1);
            before = before.with(s, value);
            after = after.with(c, value);
        }
        let runs = Simulator::new(source)
            .run(&mut before)
            .and_then(|_| Simulator::new(compiled).run(&mut after));
        if let Err(e) = runs {
            return Outcome::Failed(format!("packet {n}: {e}"));
        }
        let expected = (before.snapshot(&source.program, &observe), before.is_dropped());
        let actual = (after.snapshot(&compiled.program, &observe), after.is_dropped());
        if expected != actual {
            return Outcome::Failed(format!(
                "packet {n}: expected {expected:?}, got {actual:?}"
            ));
        }
    }
    Outcome::Passed
}
