//! Multi-group compiler: merge ≥2 classifiers into one pipeline stage.
//!
//! ```text
//!   init ─► member_0 ─► member_1 ─► … ─► set_max_prio ─► dispatcher
//! ```
//!
//! Each member writes its matched entry's priority into its own slot of a
//! [`PriorityEncoder`]. The finalize table selects the maximum into the
//! winner field, and the dispatcher, keyed exactly on that field, executes
//! the winning entry's original action.
//!
//! Members are not edited in place: each gets a freshly built rule set whose
//! entries call the group's `set_prio` action, and the merged classifier
//! owns those rebuilt members.

use std::collections::{BTreeMap, HashMap};

use bitvec::prelude::*;
use log::debug;

use crate::rewrite::{adopt_actions, chain_tables};
use crate::{
    bits_from_u64, ActionId, Classifier, CompileError, MatchField, MatchKind, Namespace, NodeId,
    PriorityEncoder, Program, Result, Session, TableId, Vmr, VmrAction, VmrEntry,
};

/// Several classifiers merged behind a priority encoder and a dispatcher.
#[derive(Debug, Clone)]
pub struct MultiGroupClassifier {
    namespace: Namespace,
    encoder: PriorityEncoder,
    dispatcher: Classifier,
    members: Vec<Classifier>,
    setup_action: ActionId,
    finalize: TableId,
}

impl MultiGroupClassifier {
    /// Merge `classifiers`, in order, into one stage named after `name`.
    ///
    /// All argument checks run before the program is touched:
    ///
    /// - at least two members, each on a distinct table
    /// - entry priorities pairwise distinct, within and across groups
    /// - every priority is non-zero and fits the session's priority width
    /// - every member carries the same rule-set default action
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`], [`CompileError::DuplicatePriority`],
    /// [`CompileError::PriorityOverflow`] or
    /// [`CompileError::IncompatibleDefaultAction`] from the checks above.
    /// Errors raised after the checks leave scratch objects in `program`;
    /// the program must then be discarded.
    pub fn new(
        program: &mut Program,
        session: &mut Session,
        name: &str,
        classifiers: Vec<Classifier>,
    ) -> Result<Self> {
        let default = check_members(program, session.priority_width(), &classifiers)?;
        let width = session.priority_width();

        let mut namespace = session.namespace_mut().nested(name);
        let mut encoder = session.create_priority_encoder(program, &mut namespace)?;

        let dispatcher_table = program.add_table(
            &namespace.nested_name("dispatcher"),
            vec![MatchField::new(encoder.prio(), MatchKind::Exact)],
            Vec::new(),
            None,
        )?;
        let default_next = program.table(classifiers[0].table()).default_next();
        program.table_mut(dispatcher_table).set_default_next(default_next);
        let mut dispatcher_vmr = classifiers[0]
            .vmr()
            .create_instance(program, dispatcher_table);
        dispatcher_vmr.set_default_action(default);

        let setup_action = program.add_action(&namespace.nested_name("init"), Vec::new())?;
        program.add_call(setup_action, encoder.setup_action(), Vec::new())?;

        let mut members = Vec::with_capacity(classifiers.len());
        for member in &classifiers {
            adopt_actions(program, dispatcher_table, member.table())?;
            if let Some(member_setup) = member.setup_action() {
                program.add_call(setup_action, member_setup, Vec::new())?;
            }

            let set_prio = encoder.add(program, &mut namespace)?;
            let table = program.table_mut(member.table());
            table.add_action(set_prio, None);
            // a miss leaves the slot at zero; the dispatcher runs the default
            table.set_default_action(None);

            let mut rebuilt = member.vmr().create_instance(program, member.table());
            for entry in member.vmr() {
                dispatcher_vmr.push(VmrEntry::new(
                    bits_from_u64(entry.priority, width),
                    BitVec::repeat(true, width),
                    entry.action.clone(),
                    entry.priority,
                )?)?;
                rebuilt.push(VmrEntry::new(
                    entry.value.clone(),
                    entry.mask.clone(),
                    VmrAction::bound(set_prio, vec![entry.priority]),
                    entry.priority,
                )?)?;
            }
            members.push(Classifier::new(
                program,
                member.table(),
                rebuilt,
                member.setup_action(),
            )?);
        }

        let set_max =
            encoder.create_set_max_priority_action(program, &mut namespace, session.primitives_mut())?;
        let finalize = program.add_action_table(set_max)?;

        let mut order: Vec<TableId> = members.iter().map(Classifier::table).collect();
        order.push(finalize);
        order.push(dispatcher_table);
        chain_tables(program, &order);

        let dispatcher = Classifier::new(program, dispatcher_table, dispatcher_vmr, None)?;
        debug!(
            "merged {} groups into {} ({} dispatcher entries)",
            members.len(),
            namespace.fullname(),
            dispatcher.len()
        );
        Ok(Self {
            namespace,
            encoder,
            dispatcher,
            members,
            setup_action,
            finalize,
        })
    }

    /// Action to run before the entry point: encoder init, then every member's setup.
    #[must_use]
    pub fn setup_action(&self) -> ActionId {
        self.setup_action
    }

    /// First member's table.
    #[must_use]
    pub fn entry_point(&self) -> NodeId {
        self.members[0].entry_point()
    }

    /// The dispatcher classifier.
    #[must_use]
    pub fn dispatcher(&self) -> &Classifier {
        &self.dispatcher
    }

    /// Rebuilt members, in merge order.
    #[must_use]
    pub fn members(&self) -> &[Classifier] {
        &self.members
    }

    /// The keyless table running the set-max action.
    #[must_use]
    pub fn finalize_table(&self) -> TableId {
        self.finalize
    }

    /// The priority encoder shared by all members.
    #[must_use]
    pub fn encoder(&self) -> &PriorityEncoder {
        &self.encoder
    }

    /// Namespace holding the merged stage's objects.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always `false`; a merged classifier has at least two members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// `{table → rule set}` for the dispatcher and every member.
    #[must_use]
    pub fn collect_vmrs(&self) -> BTreeMap<TableId, Vmr> {
        let mut vmrs = self.dispatcher.collect_vmrs();
        for member in &self.members {
            vmrs.extend(member.collect_vmrs());
        }
        vmrs
    }
}

/// Validate the members; returns the shared rule-set default action.
fn check_members(
    program: &Program,
    width: usize,
    classifiers: &[Classifier],
) -> Result<Option<VmrAction>> {
    if classifiers.len() < 2 {
        return Err(CompileError::invalid_argument(format!(
            "the number of classifiers must not be less than two, got {}",
            classifiers.len()
        )));
    }

    let mut tables: Vec<TableId> = classifiers.iter().map(Classifier::table).collect();
    tables.sort_unstable();
    if let Some(pair) = tables.windows(2).find(|w| w[0] == w[1]) {
        return Err(CompileError::invalid_argument(format!(
            "table {} appears in more than one group",
            program.table(pair[0]).name()
        )));
    }

    let limit = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
    let mut seen: HashMap<u64, usize> = HashMap::new();
    for (group, classifier) in classifiers.iter().enumerate() {
        for entry in classifier.vmr() {
            if entry.priority == 0 {
                return Err(CompileError::invalid_argument(format!(
                    "group {group} has an entry with priority 0, which marks a group without a match"
                )));
            }
            if entry.priority > limit {
                return Err(CompileError::PriorityOverflow {
                    priority: entry.priority,
                    width,
                });
            }
            if let Some(&first) = seen.get(&entry.priority) {
                return Err(CompileError::DuplicatePriority {
                    priority: entry.priority,
                    first_group: first,
                    second_group: group,
                });
            }
            seen.insert(entry.priority, group);
        }
    }

    let default = classifiers[0].default_action();
    for classifier in &classifiers[1..] {
        let other = classifier.default_action();
        let compatible = match (default, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.equivalent(program, b),
            _ => false,
        };
        if !compatible {
            let describe = |action: Option<&VmrAction>| {
                action.map_or_else(
                    || "none".to_owned(),
                    |a| program.action(a.action()).name().to_owned(),
                )
            };
            return Err(CompileError::IncompatibleDefaultAction {
                mine: describe(default),
                theirs: describe(other),
            });
        }
    }
    Ok(default.cloned())
}
