//! Priority encoder: per-group priority slots plus a max-selection action.

use log::debug;

use crate::session::PrimitiveCache;
use crate::{
    ActionId, CallArg, CompileError, FieldId, HeaderId, InstanceId, Namespace, Param, Program,
    Result,
};

/// Computes the maximum of several per-group priority contributions.
///
/// The encoder owns a scratch header (`prios_t`, instance `prios`) holding a
/// winner field `prio` and one `prio_{i}` field per group. Each group writes
/// its matched entry's priority into its slot through the action returned by
/// [`add`](Self::add); the shared setup action zeroes every slot first, so an
/// unmatched group contributes 0. The finalize action writes the maximum
/// into the winner field.
#[derive(Debug, Clone)]
pub struct PriorityEncoder {
    header: HeaderId,
    instance: InstanceId,
    prio: FieldId,
    width: usize,
    subprios: Vec<FieldId>,
    setup_action: ActionId,
    set_max_action: Option<ActionId>,
}

impl PriorityEncoder {
    /// Create the scratch header, the winner field and an empty setup action.
    ///
    /// # Errors
    ///
    /// Propagates name clashes from the [`Program`].
    pub fn new(program: &mut Program, namespace: &mut Namespace, width: usize) -> Result<Self> {
        let header = program.add_header(&namespace.nested_name("prios_t"))?;
        program.add_header_field(header, "prio", width)?;
        let instance = program.add_instance(header, &namespace.nested_name("prios"), true)?;
        let prio = program.instance_field(instance, "prio")?;
        let setup_action = program.add_action(&namespace.nested_name("init_prios"), vec![])?;
        Ok(Self {
            header,
            instance,
            prio,
            width,
            subprios: Vec::new(),
            setup_action,
            set_max_action: None,
        })
    }

    /// The winner field holding the maximum priority.
    #[must_use]
    pub fn prio(&self) -> FieldId {
        self.prio
    }

    /// Width of every priority field.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Per-group priority fields in allocation order.
    #[must_use]
    pub fn subprios(&self) -> &[FieldId] {
        &self.subprios
    }

    /// Action zeroing every per-group field.
    #[must_use]
    pub fn setup_action(&self) -> ActionId {
        self.setup_action
    }

    /// Scratch header instance.
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Allocate the next per-group field.
    ///
    /// Returns a one-parameter action `set_prio_{i}(prio)` writing its
    /// argument into the new field, and appends `modify_field(prio_{i}, 0)`
    /// to the setup action.
    ///
    /// # Errors
    ///
    /// [`CompileError::IllegalState`] once the finalize action was built.
    pub fn add(&mut self, program: &mut Program, namespace: &mut Namespace) -> Result<ActionId> {
        if self.set_max_action.is_some() {
            return Err(CompileError::illegal_state(
                "cannot add a priority slot after the set-max action was created",
            ));
        }
        let idx = self.subprios.len();
        let name = format!("prio_{idx}");
        program.add_header_field(self.header, &name, self.width)?;
        let subprio = program.instance_field(self.instance, &name)?;

        let modify_field = PrimitiveCache::modify_field(program)?;
        let set_prio = program.add_action(
            &namespace.nested_name(&format!("set_prio_{idx}")),
            vec![Param::new("prio", self.width)],
        )?;
        program.add_call(set_prio, modify_field, vec![subprio.into(), "prio".into()])?;
        program.add_call(
            self.setup_action,
            modify_field,
            vec![subprio.into(), CallArg::Value(0)],
        )?;

        debug!("priority slot {}", program.field_path(subprio));
        self.subprios.push(subprio);
        Ok(set_prio)
    }

    /// Build, once, the action selecting the maximum of every per-group
    /// field into the winner field. Later calls return the same action.
    ///
    /// # Errors
    ///
    /// Propagates name clashes from the [`Program`].
    pub fn create_set_max_priority_action(
        &mut self,
        program: &mut Program,
        namespace: &mut Namespace,
        primitives: &mut PrimitiveCache,
    ) -> Result<ActionId> {
        if let Some(action) = self.set_max_action {
            return Ok(action);
        }
        let set_max = primitives.set_max(program, self.subprios.len())?;
        let action = program.add_action(&namespace.nested_name("set_max_prio"), vec![])?;
        let args = std::iter::once(self.prio)
            .chain(self.subprios.iter().copied())
            .map(CallArg::Field)
            .collect();
        program.add_call(action, set_max, args)?;
        self.set_max_action = Some(action);
        Ok(action)
    }
}
