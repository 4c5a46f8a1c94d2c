//! Materialization: turn rule sets into runtime table commands.
//!
//! The external runtime (a physical switch or a software model) is reached
//! through the [`Materializer`] trait. Every non-default entry becomes one
//! [`RuntimeCommand::AddEntry`] carrying its priority explicitly; every rule
//! set with a default action adds one [`RuntimeCommand::SetDefault`].
//!
//! Values are hex strings of big-endian bytes, left-padded to whole bytes.

use std::collections::BTreeMap;

use bitvec::prelude::*;
use log::debug;
use serde::Serialize;

use crate::{
    bits_from_u64, is_prefix, CompileError, MatchKind, Program, Result, TableId, Vmr, VmrAction,
};

/// One key field of an entry, in runtime form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuntimeMatch {
    /// Exact key.
    Exact {
        /// Key bytes.
        key: String,
    },
    /// Key with a prefix length.
    Lpm {
        /// Key bytes.
        key: String,
        /// Number of leading bits compared.
        prefix_length: usize,
    },
    /// Key with a mask.
    Ternary {
        /// Key bytes.
        key: String,
        /// Mask bytes.
        mask: String,
    },
}

/// A call into the runtime table API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RuntimeCommand {
    /// Add one entry.
    AddEntry {
        /// Table name.
        table: String,
        /// One match per key field.
        match_key: Vec<RuntimeMatch>,
        /// Action name.
        action: String,
        /// Action data, one value per parameter.
        data: Vec<String>,
        /// Entry priority.
        priority: u64,
    },
    /// Set the table's default action.
    SetDefault {
        /// Table name.
        table: String,
        /// Action name.
        action: String,
        /// Action data.
        data: Vec<String>,
    },
}

/// Sink for runtime commands.
pub trait Materializer {
    /// Apply one command.
    ///
    /// # Errors
    ///
    /// Implementation-defined; materialization stops at the first error.
    fn apply(&mut self, command: RuntimeCommand) -> Result<()>;
}

/// A [`Materializer`] that keeps every command in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingMaterializer {
    commands: Vec<RuntimeCommand>,
}

impl RecordingMaterializer {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands recorded so far.
    #[must_use]
    pub fn commands(&self) -> &[RuntimeCommand] {
        &self.commands
    }

    /// Take the recorded commands.
    #[must_use]
    pub fn into_commands(self) -> Vec<RuntimeCommand> {
        self.commands
    }
}

impl Materializer for RecordingMaterializer {
    fn apply(&mut self, command: RuntimeCommand) -> Result<()> {
        self.commands.push(command);
        Ok(())
    }
}

/// Push every rule set in `vmrs` into `sink`, table by table.
///
/// Returns the number of commands applied.
///
/// # Errors
///
/// [`CompileError::InvalidMask`] if an entry does not fit its table's match
/// kinds; any error from the sink.
pub fn materialize(
    program: &Program,
    vmrs: &BTreeMap<TableId, Vmr>,
    sink: &mut dyn Materializer,
) -> Result<usize> {
    let mut applied = 0;
    for vmr in vmrs.values() {
        for command in vmr.materialize(program)? {
            sink.apply(command)?;
            applied += 1;
        }
    }
    debug!("materialized {applied} commands for {} tables", vmrs.len());
    Ok(applied)
}

impl Vmr {
    /// Runtime commands for this rule set: one `AddEntry` per entry, then
    /// `SetDefault` if a default action is set.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidMask`] if a sub-mask does not suit its field's
    /// match kind.
    pub fn materialize(&self, program: &Program) -> Result<Vec<RuntimeCommand>> {
        let table = program.table(self.table());
        let key: Vec<_> = table
            .match_fields()
            .iter()
            .filter(|mf| !program.field(mf.field).is_padding())
            .map(|mf| (mf.field, mf.kind, program.field(mf.field).width()))
            .collect();

        let mut commands = Vec::with_capacity(self.len() + 1);
        for entry in self {
            let mut match_key = Vec::with_capacity(key.len());
            let mut offset = 0;
            for &(field, kind, width) in &key {
                let value = &entry.value[offset..offset + width];
                let mask = &entry.mask[offset..offset + width];
                offset += width;
                let invalid = |reason: &str| CompileError::InvalidMask {
                    table: table.name().to_owned(),
                    field: program.field_path(field),
                    reason: reason.to_owned(),
                };
                match_key.push(match kind {
                    MatchKind::Exact if !mask.all() => {
                        return Err(invalid("exact match requires an all-ones mask"));
                    }
                    MatchKind::Lpm if !is_prefix(mask) => {
                        return Err(invalid(
                            "prefix match requires a contiguous mask from the most significant bit",
                        ));
                    }
                    MatchKind::Exact => RuntimeMatch::Exact { key: hex(value) },
                    MatchKind::Lpm => RuntimeMatch::Lpm {
                        key: hex(value),
                        prefix_length: mask.count_ones(),
                    },
                    MatchKind::Ternary => RuntimeMatch::Ternary {
                        key: hex(value),
                        mask: hex(mask),
                    },
                });
            }
            commands.push(RuntimeCommand::AddEntry {
                table: table.name().to_owned(),
                match_key,
                action: program.action(entry.action.action()).name().to_owned(),
                data: runtime_data(program, &entry.action),
                priority: entry.priority,
            });
        }

        if let Some(default) = self.default_action() {
            commands.push(RuntimeCommand::SetDefault {
                table: table.name().to_owned(),
                action: program.action(default.action()).name().to_owned(),
                data: runtime_data(program, default),
            });
        }
        Ok(commands)
    }
}

fn runtime_data(program: &Program, action: &VmrAction) -> Vec<String> {
    let widths = program.action(action.action()).param_widths();
    action
        .data()
        .iter()
        .zip(widths)
        .map(|(&value, width)| hex(&bits_from_u64(value, width)))
        .collect()
}

/// Lowercase hex of `bits`, left-padded with zero bits to whole bytes.
fn hex(bits: &BitSlice) -> String {
    let pad = (8 - bits.len() % 8) % 8;
    let mut padded: BitVec = BitVec::repeat(false, pad);
    padded.extend_from_bitslice(bits);
    padded
        .chunks(8)
        .map(|byte| {
            let value = byte.iter().by_vals().fold(0u8, |acc, b| (acc << 1) | u8::from(b));
            format!("{value:02x}")
        })
        .collect()
}
