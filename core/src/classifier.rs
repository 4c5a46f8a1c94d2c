//! Classifier: a table, a compatible rule set and an optional setup action.

use std::collections::BTreeMap;

use bitvec::prelude::*;
use log::debug;

use crate::rewrite::adopt_actions;
use crate::{
    bits_to_subkeys, is_prefix, ActionId, CompileError, MatchField, MatchKind, NodeId, Program,
    Result, Session, TableId, Vmr, VmrAction, VmrEntry,
};

/// A rule set attached to a table.
///
/// The setup action, when present, must run before the table so that the
/// table's key is populated. Both [`subset`](Self::subset) and
/// [`reorder`](Self::reorder) leave `self` untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classifier {
    table: TableId,
    vmr: Vmr,
    setup_action: Option<ActionId>,
    bits: Option<Vec<usize>>,
}

impl Classifier {
    /// Attach `vmr` to `table`.
    ///
    /// # Errors
    ///
    /// [`CompileError::BitWidthMismatch`] if the rule set width differs from
    /// the table key width; [`CompileError::InvalidArgument`] if the rule set
    /// is bound to another table.
    pub fn new(
        program: &Program,
        table: TableId,
        vmr: Vmr,
        setup_action: Option<ActionId>,
    ) -> Result<Self> {
        vmr.check_compatible(program, table)?;
        if vmr.table() != table {
            return Err(CompileError::invalid_argument(format!(
                "rule set of table {} cannot be attached to table {}",
                program.table(vmr.table()).name(),
                program.table(table).name()
            )));
        }
        Ok(Self {
            table,
            vmr,
            setup_action,
            bits: None,
        })
    }

    /// Attachment table.
    #[must_use]
    pub fn table(&self) -> TableId {
        self.table
    }

    /// The rule set.
    #[must_use]
    pub fn vmr(&self) -> &Vmr {
        &self.vmr
    }

    /// Consume the classifier, keeping its rule set.
    #[must_use]
    pub fn into_vmr(self) -> Vmr {
        self.vmr
    }

    /// Action to run before the table, if any.
    #[must_use]
    pub fn setup_action(&self) -> Option<ActionId> {
        self.setup_action
    }

    /// Source key bits selected by [`reorder`](Self::reorder), if re-keyed.
    #[must_use]
    pub fn bits(&self) -> Option<&[usize]> {
        self.bits.as_deref()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vmr.len()
    }

    /// `true` if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vmr.is_empty()
    }

    /// Rule-set default action.
    #[must_use]
    pub fn default_action(&self) -> Option<&VmrAction> {
        self.vmr.default_action()
    }

    /// First node of the classifier's pipeline.
    #[must_use]
    pub fn entry_point(&self) -> NodeId {
        NodeId::Table(self.table)
    }

    /// `{table → rule set}` for materialization.
    #[must_use]
    pub fn collect_vmrs(&self) -> BTreeMap<TableId, Vmr> {
        BTreeMap::from([(self.table, self.vmr.clone())])
    }

    /// Same table, rule set made of the entries at `indices` in that order.
    ///
    /// Indices may repeat or permute. The default action is kept.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] for an out-of-range index.
    pub fn subset(&self, program: &Program, indices: &[usize]) -> Result<Self> {
        let mut vmr = self.vmr.create_instance(program, self.table);
        for &i in indices {
            let entry = self.vmr.get(i).ok_or_else(|| {
                CompileError::invalid_argument(format!(
                    "entry index {i} out of range for a classifier of {} entries",
                    self.vmr.len()
                ))
            })?;
            vmr.push(entry.clone())?;
        }
        vmr.set_default_action(self.vmr.default_action().cloned());
        Ok(Self {
            table: self.table,
            vmr,
            setup_action: self.setup_action,
            bits: self.bits.clone(),
        })
    }

    /// Re-key onto a freshly allocated table matching only `bits` of the current key.
    ///
    /// Entry `e` becomes an entry whose value and mask at position `i` are
    /// `e`'s at `bits[i]`; action and priority are unchanged. The new table
    /// gets the source table's actions, next edges and default edge. The
    /// returned setup action fills the new key (after running this
    /// classifier's own setup action, if any).
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] for empty or out-of-range bits;
    /// [`CompileError::InvalidMask`] if a projected mask does not suit `kind`.
    pub fn reorder(
        &self,
        program: &mut Program,
        session: &mut Session,
        bits: &[usize],
        kind: MatchKind,
    ) -> Result<Self> {
        if bits.is_empty() {
            return Err(CompileError::invalid_argument(
                "cannot re-key a classifier onto zero bits",
            ));
        }
        let source_fields = program.table_key_fields(self.table);
        let subkeys = bits_to_subkeys(program, &source_fields, bits)?;

        let source_name = program.table(self.table).name().to_owned();
        let table_name = session
            .namespace_mut()
            .nested_name(&format!("{source_name}_r"));
        let (key, compress) = session.add_key(program, &table_name, &subkeys)?;

        let table = program.add_table(
            &table_name,
            vec![MatchField::new(key, kind)],
            Vec::new(),
            None,
        )?;
        adopt_actions(program, table, self.table)?;
        let default_next = program.table(self.table).default_next();
        program.table_mut(table).set_default_next(default_next);

        let key_path = program.field_path(key);
        let mut vmr = self.vmr.create_instance(program, table);
        for entry in &self.vmr {
            let value: BitVec = bits.iter().map(|&b| entry.value[b]).collect();
            let mask: BitVec = bits.iter().map(|&b| entry.mask[b]).collect();
            check_projected_mask(&table_name, &key_path, kind, &mask)?;
            vmr.push(VmrEntry::new(value, mask, entry.action.clone(), entry.priority)?)?;
        }
        vmr.set_default_action(self.vmr.default_action().cloned());

        let setup_action = match self.setup_action {
            None => compress,
            Some(previous) => {
                let combined = program.add_action(
                    &session
                        .namespace_mut()
                        .nested_name(&format!("setup_{table_name}")),
                    Vec::new(),
                )?;
                program.add_call(combined, previous, Vec::new())?;
                program.add_call(combined, compress, Vec::new())?;
                combined
            }
        };

        debug!(
            "re-keyed {source_name} onto {table_name}: {} bits, {} entries",
            bits.len(),
            vmr.len()
        );
        Ok(Self {
            table,
            vmr,
            setup_action: Some(setup_action),
            bits: Some(bits.to_vec()),
        })
    }
}

fn check_projected_mask(table: &str, field: &str, kind: MatchKind, mask: &BitSlice) -> Result<()> {
    let reason = match kind {
        MatchKind::Exact if !mask.all() => "exact match requires an all-ones mask",
        MatchKind::Lpm if !is_prefix(mask) => {
            "prefix match requires a contiguous mask from the most significant bit"
        }
        _ => return Ok(()),
    };
    Err(CompileError::InvalidMask {
        table: table.to_owned(),
        field: field.to_owned(),
        reason: reason.to_owned(),
    })
}
