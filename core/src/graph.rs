//! ProgramGraph: the unit optimization steps consume and produce.

use std::collections::BTreeMap;

use log::debug;

use crate::{
    materialize, CompileError, CompilerConfig, EntriesConfig, ProgramConfig, Program,
    RecordingMaterializer, Result, RuntimeCommand, TableId, Vmr,
};

/// A program, the rule sets bound to its tables, and the compiler settings.
///
/// Steps take the graph by value and return the rewritten graph. A step that
/// fails drops its input, so a half-rewritten program is never observed.
#[derive(Debug, Clone, Default)]
pub struct ProgramGraph {
    /// The program.
    pub program: Program,
    /// Rule sets by table.
    pub vmrs: BTreeMap<TableId, Vmr>,
    /// Settings for sessions opened on this graph.
    pub config: CompilerConfig,
}

impl ProgramGraph {
    /// Wrap a program with no rule sets.
    #[must_use]
    pub fn new(program: Program, config: CompilerConfig) -> Self {
        Self {
            program,
            vmrs: BTreeMap::new(),
            config,
        }
    }

    /// Build a program from config and load its entries.
    ///
    /// # Errors
    ///
    /// Any error from [`Program::from_config`], [`EntriesConfig::load`] or
    /// [`CompilerConfig::validate`].
    pub fn from_config(
        program: &ProgramConfig,
        entries: Option<&EntriesConfig>,
        config: CompilerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let program = Program::from_config(program)?;
        let vmrs = match entries {
            Some(entries) => entries.load(&program)?,
            None => BTreeMap::new(),
        };
        debug!(
            "loaded program with {} rule sets, {} entries",
            vmrs.len(),
            vmrs.values().map(Vmr::len).sum::<usize>()
        );
        Ok(Self {
            program,
            vmrs,
            config,
        })
    }

    /// Rule set of `table`, if one is attached.
    #[must_use]
    pub fn vmr(&self, table: TableId) -> Option<&Vmr> {
        self.vmrs.get(&table)
    }

    /// Attach `vmr` to its table, replacing any previous rule set.
    ///
    /// # Errors
    ///
    /// [`CompileError::BitWidthMismatch`] if the widths differ.
    pub fn insert_vmr(&mut self, vmr: Vmr) -> Result<Option<Vmr>> {
        vmr.check_compatible(&self.program, vmr.table())?;
        Ok(self.vmrs.insert(vmr.table(), vmr))
    }

    /// Detach and return the rule set of `table`.
    pub fn take_vmr(&mut self, table: TableId) -> Option<Vmr> {
        self.vmrs.remove(&table)
    }

    /// Check the program and that every rule set fits its table.
    ///
    /// # Errors
    ///
    /// [`CompileError::IllegalState`] from [`Program::validate`] or for a rule
    /// set stored under the wrong table; [`CompileError::BitWidthMismatch`];
    /// [`CompileError::InvalidArgument`] for an entry whose action is not
    /// permitted in its table or whose data does not match the signature.
    pub fn validate(&self) -> Result<()> {
        self.program.validate()?;
        for (&table, vmr) in &self.vmrs {
            if vmr.table() != table {
                return Err(CompileError::illegal_state(format!(
                    "rule set of table {} is stored under table {}",
                    self.program.table(vmr.table()).name(),
                    self.program.table(table).name()
                )));
            }
            vmr.check_compatible(&self.program, table)?;

            let t = self.program.table(table);
            for entry in vmr {
                if !t.has_action(entry.action.action()) {
                    return Err(CompileError::invalid_argument(format!(
                        "action {} is not permitted in table {}",
                        self.program.action(entry.action.action()).name(),
                        t.name()
                    )));
                }
                entry.action.check_signature(&self.program)?;
            }
            if let Some(default) = vmr.default_action() {
                let action = default.action();
                if !t.has_action(action) && t.default_action() != Some(action) {
                    return Err(CompileError::invalid_argument(format!(
                        "default action {} is not permitted in table {}",
                        self.program.action(action).name(),
                        t.name()
                    )));
                }
                default.check_signature(&self.program)?;
            }
        }
        Ok(())
    }

    /// Runtime commands for every attached rule set, in table order.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidMask`] if an entry does not suit its table.
    pub fn materialize(&self) -> Result<Vec<RuntimeCommand>> {
        let mut recorder = RecordingMaterializer::new();
        materialize(&self.program, &self.vmrs, &mut recorder)?;
        Ok(recorder.into_commands())
    }
}
