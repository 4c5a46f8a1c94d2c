//! Control-flow rewriting: chaining, redirection and action adoption.
//!
//! These functions edit edges only. They never create or remove nodes.

use log::debug;

use crate::{CompileError, ConditionalId, NodeId, Program, Result, TableId};

/// Make every table in `tables` unconditionally continue with the next one.
///
/// Every action edge and the default edge of each table except the last is
/// pointed at its successor. The last table keeps its edges.
pub fn chain_tables(program: &mut Program, tables: &[TableId]) {
    for pair in tables.windows(2) {
        let next = Some(NodeId::Table(pair[1]));
        let table = program.table_mut(pair[0]);
        table.set_default_next(next);
        for action in table.actions().to_vec() {
            table.set_next(action, next);
        }
    }
    if tables.len() > 1 {
        let names: Vec<_> = tables.iter().map(|&t| program.table(t).name()).collect();
        debug!("chained {}", names.join(" -> "));
    }
}

/// Replace every edge pointing at `original` with one pointing at `target`.
///
/// Scans default edges and per-action edges of every table, both branches of
/// every conditional, and the ingress entry point.
pub fn redirect(program: &mut Program, original: NodeId, target: NodeId) {
    let tables: Vec<TableId> = program.tables().map(|(id, _)| id).collect();
    for id in tables {
        let table = program.table_mut(id);
        if table.default_next() == Some(original) {
            table.set_default_next(Some(target));
        }
        for action in table.actions().to_vec() {
            if table.next_of(action) == Some(original) {
                table.set_next(action, Some(target));
            }
        }
    }

    let conditionals: Vec<ConditionalId> = program.conditionals().map(|(id, _)| id).collect();
    for id in conditionals {
        let conditional = program.conditional_mut(id);
        if conditional.on_true() == Some(original) {
            conditional.set_branch(true, Some(target));
        }
        if conditional.on_false() == Some(original) {
            conditional.set_branch(false, Some(target));
        }
    }

    if program.ingress() == Some(original) {
        program.set_ingress(Some(target));
    }
    debug!(
        "redirected {} -> {}",
        program.node_name(original),
        program.node_name(target)
    );
}

/// Copy `src`'s actions, with their next edges, into `dst`.
///
/// `dst` takes `src`'s default action if it has none of its own.
///
/// # Errors
///
/// [`CompileError::IncompatibleDefaultAction`] if both tables carry
/// different default actions. `dst` is left untouched in that case.
pub fn adopt_actions(program: &mut Program, dst: TableId, src: TableId) -> Result<()> {
    let source = program.table(src);
    let edges: Vec<_> = source
        .actions()
        .iter()
        .map(|&a| (a, source.next_of(a)))
        .collect();
    let theirs = source.default_action();
    let mine = program.table(dst).default_action();

    if let (Some(m), Some(t)) = (mine, theirs) {
        if m != t {
            return Err(CompileError::IncompatibleDefaultAction {
                mine: program.action(m).name().to_owned(),
                theirs: program.action(t).name().to_owned(),
            });
        }
    }

    let table = program.table_mut(dst);
    for (action, next) in edges {
        table.add_action(action, next);
    }
    if mine.is_none() {
        table.set_default_action(theirs);
    }
    Ok(())
}
