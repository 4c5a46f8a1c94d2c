//! Program: arena-backed P4 program graph.
//!
//! One [`Program`] owns every header type, header instance, field, action,
//! table and conditional of a compilation. Records live in vectors and are
//! addressed by small copyable handles ([`FieldId`], [`TableId`], ...). Names
//! are a presentation concern: they are resolved to handles once, at the IR
//! provider boundary ([`Program::from_config`](crate::Program::from_config)),
//! and are otherwise only used for output and diagnostics.
//!
//! # Growth only
//!
//! Nothing is ever removed from a program. Header layouts only grow; the sole
//! exception is the trailing [`PADDING_FIELD`], which is dropped and re-added
//! whenever a field is appended so the layout stays byte aligned.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CompileError, Namespace, Result, PADDING_FIELD};

// ═══════════════════════════════════════════════════════════════════════════════
// Handles
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            /// Position of the record in its arena.
            #[must_use]
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}

handle!(
    /// Handle to a [`HeaderType`].
    HeaderId
);
handle!(
    /// Handle to a [`HeaderInstance`].
    InstanceId
);
handle!(
    /// Handle to a [`Field`].
    FieldId
);
handle!(
    /// Handle to an [`Action`] (compound or primitive).
    ActionId
);
handle!(
    /// Handle to a [`Table`].
    TableId
);
handle!(
    /// Handle to a [`Conditional`].
    ConditionalId
);

/// A control-flow node: either a match table or a boolean conditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    /// A match table.
    Table(TableId),
    /// A boolean branch.
    Conditional(ConditionalId),
}

impl From<TableId> for NodeId {
    fn from(id: TableId) -> Self {
        Self::Table(id)
    }
}

impl From<ConditionalId> for NodeId {
    fn from(id: ConditionalId) -> Self {
        Self::Conditional(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Headers and fields
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered `name → width` layout shared by all instances of a header.
#[derive(Debug, Clone)]
pub struct HeaderType {
    name: String,
    layout: Vec<(String, usize)>,
    instances: Vec<InstanceId>,
}

impl HeaderType {
    /// Header type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field layout in declaration order, including any trailing padding.
    #[must_use]
    pub fn layout(&self) -> &[(String, usize)] {
        &self.layout
    }

    /// Total width in bits (always a multiple of 8 once non-empty).
    #[must_use]
    pub fn width(&self) -> usize {
        self.layout.iter().map(|(_, width)| width).sum()
    }
}

/// A live instance of a header type; holds the concrete [`Field`] records.
#[derive(Debug, Clone)]
pub struct HeaderInstance {
    name: String,
    header: HeaderId,
    metadata: bool,
    fields: Vec<FieldId>,
}

impl HeaderInstance {
    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The header type this instance follows.
    #[must_use]
    pub fn header(&self) -> HeaderId {
        self.header
    }

    /// Whether this is a metadata instance (not parsed from the packet).
    #[must_use]
    pub fn is_metadata(&self) -> bool {
        self.metadata
    }

    /// Fields in layout order.
    #[must_use]
    pub fn fields(&self) -> &[FieldId] {
        &self.fields
    }
}

/// A named bit range of a header instance. Identity is `(instance, name)`.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    instance: InstanceId,
    width: usize,
    offset: usize,
}

impl Field {
    /// Field name within its instance.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning header instance.
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Width in bits.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Bit offset from the start of the header.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// `true` for the alignment padding field.
    #[must_use]
    pub fn is_padding(&self) -> bool {
        self.name == PADDING_FIELD
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Actions
// ═══════════════════════════════════════════════════════════════════════════════

/// A runtime parameter of a compound action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Parameter name (referenced by [`CallArg::Param`]).
    pub name: String,
    /// Width of the runtime data in bits.
    pub width: usize,
}

impl Param {
    /// Create a parameter.
    pub fn new(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            width,
        }
    }
}

/// Argument type accepted by a primitive parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// A field reference.
    Field,
    /// An integer (literal or runtime data).
    Int,
    /// Either of the above.
    FieldOrInt,
}

/// Access mode of a primitive parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The primitive reads the argument.
    Read,
    /// The primitive writes the argument (must be a field).
    Write,
}

/// A typed parameter of a primitive action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveParam {
    /// Parameter name.
    pub name: String,
    /// Accepted argument type.
    pub ty: ParamType,
    /// Read or write.
    pub access: Access,
}

impl PrimitiveParam {
    /// Create a primitive parameter.
    pub fn new(name: impl Into<String>, ty: ParamType, access: Access) -> Self {
        Self {
            name: name.into(),
            ty,
            access,
        }
    }
}

/// Whether an action is a fixed hardware primitive or a user-level composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// Ordered primitive calls over runtime parameters.
    Compound {
        /// Runtime parameters.
        params: Vec<Param>,
    },
    /// A hardware-level operation (bit compression, max selection, ...).
    Primitive {
        /// Typed parameters.
        params: Vec<PrimitiveParam>,
    },
}

/// A resolved argument of a [`Call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    /// A field reference.
    Field(FieldId),
    /// An integer literal.
    Value(u64),
    /// Back-reference to the calling action's parameter at this index.
    Param(usize),
}

/// An unresolved argument accepted by [`Program::add_call`].
///
/// Parameter back-references are given by name and resolved against the
/// calling action's signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    /// A field reference.
    Field(FieldId),
    /// An integer literal.
    Value(u64),
    /// A parameter of the calling action, by name.
    Param(String),
}

impl From<FieldId> for CallArg {
    fn from(field: FieldId) -> Self {
        Self::Field(field)
    }
}

impl From<u64> for CallArg {
    fn from(value: u64) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for CallArg {
    fn from(param: &str) -> Self {
        Self::Param(param.to_owned())
    }
}

/// One invocation inside an action's call sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// The invoked action.
    pub callee: ActionId,
    /// Bound arguments, one per callee parameter.
    pub args: Vec<Arg>,
}

/// A named action: parameter list plus ordered call sequence.
#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    kind: ActionKind,
    calls: Vec<Call>,
}

impl Action {
    /// Action name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compound or primitive signature.
    #[must_use]
    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    /// Call sequence (empty for primitives).
    #[must_use]
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// `true` for hardware primitives.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(self.kind, ActionKind::Primitive { .. })
    }

    /// Number of parameters.
    #[must_use]
    pub fn arity(&self) -> usize {
        match &self.kind {
            ActionKind::Compound { params } => params.len(),
            ActionKind::Primitive { params } => params.len(),
        }
    }

    /// Parameter names in signature order.
    #[must_use]
    pub fn param_names(&self) -> Vec<&str> {
        match &self.kind {
            ActionKind::Compound { params } => params.iter().map(|p| p.name.as_str()).collect(),
            ActionKind::Primitive { params } => params.iter().map(|p| p.name.as_str()).collect(),
        }
    }

    /// Runtime data widths of a compound action (empty for primitives).
    #[must_use]
    pub fn param_widths(&self) -> Vec<usize> {
        match &self.kind {
            ActionKind::Compound { params } => params.iter().map(|p| p.width).collect(),
            ActionKind::Primitive { .. } => Vec::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tables and conditionals
// ═══════════════════════════════════════════════════════════════════════════════

/// How a key field is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// All bits must match.
    Exact,
    /// Arbitrary mask.
    Ternary,
    /// Contiguous most-significant mask (longest prefix).
    Lpm,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Ternary => write!(f, "ternary"),
            Self::Lpm => write!(f, "lpm"),
        }
    }
}

impl FromStr for MatchKind {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exact" => Ok(Self::Exact),
            "ternary" => Ok(Self::Ternary),
            "lpm" => Ok(Self::Lpm),
            other => Err(CompileError::invalid_argument(format!(
                "unknown match kind \"{other}\", allowed kinds are: exact, ternary, lpm"
            ))),
        }
    }
}

/// One component of a table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchField {
    /// Matched field.
    pub field: FieldId,
    /// Match kind.
    pub kind: MatchKind,
}

impl MatchField {
    /// Create a key component.
    #[must_use]
    pub fn new(field: FieldId, kind: MatchKind) -> Self {
        Self { field, kind }
    }
}

/// A match-action table with its outgoing control-flow edges.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    match_fields: Vec<MatchField>,
    actions: Vec<ActionId>,
    next: HashMap<ActionId, Option<NodeId>>,
    default_next: Option<NodeId>,
    default_action: Option<ActionId>,
}

impl Table {
    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key description in match order.
    #[must_use]
    pub fn match_fields(&self) -> &[MatchField] {
        &self.match_fields
    }

    /// Permitted actions, in insertion order, without duplicates.
    #[must_use]
    pub fn actions(&self) -> &[ActionId] {
        &self.actions
    }

    /// `true` if `action` is permitted in this table.
    #[must_use]
    pub fn has_action(&self, action: ActionId) -> bool {
        self.actions.contains(&action)
    }

    /// Node executed after `action` (`None` ends the pipeline or the action is unknown).
    #[must_use]
    pub fn next_of(&self, action: ActionId) -> Option<NodeId> {
        self.next.get(&action).copied().flatten()
    }

    /// Node executed when the lookup takes the default path.
    #[must_use]
    pub fn default_next(&self) -> Option<NodeId> {
        self.default_next
    }

    /// Zero-parameter action executed on a miss, fixed at program level.
    #[must_use]
    pub fn default_action(&self) -> Option<ActionId> {
        self.default_action
    }

    /// Add a permitted action with its next node; an existing action only gets its edge updated.
    pub fn add_action(&mut self, action: ActionId, next: Option<NodeId>) {
        if !self.actions.contains(&action) {
            self.actions.push(action);
        }
        self.next.insert(action, next);
    }

    /// Point the edge taken after `action` at `next`.
    pub fn set_next(&mut self, action: ActionId, next: Option<NodeId>) {
        self.next.insert(action, next);
    }

    /// Point the default path at `next`.
    pub fn set_default_next(&mut self, next: Option<NodeId>) {
        self.default_next = next;
    }

    pub(crate) fn set_default_action(&mut self, action: Option<ActionId>) {
        self.default_action = action;
    }
}

/// A boolean branch in the control flow.
#[derive(Debug, Clone)]
pub struct Conditional {
    name: String,
    on_true: Option<NodeId>,
    on_false: Option<NodeId>,
}

impl Conditional {
    /// Conditional name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node taken when the condition holds.
    #[must_use]
    pub fn on_true(&self) -> Option<NodeId> {
        self.on_true
    }

    /// Node taken otherwise.
    #[must_use]
    pub fn on_false(&self) -> Option<NodeId> {
        self.on_false
    }

    /// Set the branch for `condition`.
    pub fn set_branch(&mut self, condition: bool, next: Option<NodeId>) {
        if condition {
            self.on_true = next;
        } else {
            self.on_false = next;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Program
// ═══════════════════════════════════════════════════════════════════════════════

/// The program graph: arenas of every object plus per-kind name indexes.
///
/// `Program` is not synchronized. All compiler operations on one program must
/// be serialized by the caller.
///
/// A fresh program always contains the built-in primitives `modify_field`,
/// `drop` and `no_op`.
#[derive(Debug, Clone)]
pub struct Program {
    headers: Vec<HeaderType>,
    instances: Vec<HeaderInstance>,
    fields: Vec<Field>,
    actions: Vec<Action>,
    tables: Vec<Table>,
    conditionals: Vec<Conditional>,

    header_names: HashMap<String, HeaderId>,
    instance_names: HashMap<String, InstanceId>,
    action_names: HashMap<String, ActionId>,
    table_names: HashMap<String, TableId>,
    conditional_names: HashMap<String, ConditionalId>,

    ingress: Option<NodeId>,
    sessions: Namespace,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    /// Create a program containing only the built-in primitives.
    #[must_use]
    pub fn new() -> Self {
        let mut program = Self {
            headers: Vec::new(),
            instances: Vec::new(),
            fields: Vec::new(),
            actions: Vec::new(),
            tables: Vec::new(),
            conditionals: Vec::new(),
            header_names: HashMap::new(),
            instance_names: HashMap::new(),
            action_names: HashMap::new(),
            table_names: HashMap::new(),
            conditional_names: HashMap::new(),
            ingress: None,
            sessions: Namespace::root(),
        };
        program.push_action(
            "modify_field",
            ActionKind::Primitive {
                params: vec![
                    PrimitiveParam::new("dst", ParamType::Field, Access::Write),
                    PrimitiveParam::new("src", ParamType::FieldOrInt, Access::Read),
                ],
            },
        );
        program.push_action("drop", ActionKind::Primitive { params: vec![] });
        program.push_action("no_op", ActionKind::Primitive { params: vec![] });
        program
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Headers
    // ───────────────────────────────────────────────────────────────────────────

    /// Declare an empty header type.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if the name is taken.
    pub fn add_header(&mut self, name: &str) -> Result<HeaderId> {
        if self.header_names.contains_key(name) {
            return Err(duplicate("header", name));
        }
        let id = HeaderId(self.headers.len());
        self.headers.push(HeaderType {
            name: name.to_owned(),
            layout: Vec::new(),
            instances: Vec::new(),
        });
        self.header_names.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Append a field to a header layout and to every instance of it.
    ///
    /// The trailing padding is dropped and re-computed so the layout stays a
    /// multiple of 8 bits.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] for a zero width, a reserved or duplicate name.
    pub fn add_header_field(&mut self, header: HeaderId, name: &str, width: usize) -> Result<()> {
        if width == 0 {
            return Err(CompileError::invalid_argument(format!(
                "field {name} must have a non-zero width"
            )));
        }
        if name == PADDING_FIELD {
            return Err(CompileError::invalid_argument(format!(
                "{PADDING_FIELD} is reserved for header alignment"
            )));
        }

        let header_type = &mut self.headers[header.0];
        if header_type.layout.iter().any(|(existing, _)| existing == name) {
            return Err(CompileError::invalid_argument(format!(
                "header {} already has a field {name}",
                header_type.name
            )));
        }

        if header_type
            .layout
            .last()
            .is_some_and(|(last, _)| last == PADDING_FIELD)
        {
            header_type.layout.pop();
        }
        header_type.layout.push((name.to_owned(), width));
        let total = header_type.width();
        if total % 8 != 0 {
            header_type
                .layout
                .push((PADDING_FIELD.to_owned(), 8 - total % 8));
        }

        for instance in header_type.instances.clone() {
            self.sync_instance(instance);
        }
        Ok(())
    }

    /// Header type by handle.
    #[must_use]
    pub fn header(&self, id: HeaderId) -> &HeaderType {
        &self.headers[id.0]
    }

    /// Resolve a header type name.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] if no header has this name.
    pub fn header_by_name(&self, name: &str) -> Result<HeaderId> {
        lookup(&self.header_names, "header", name)
    }

    /// Create an instance of a header type.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if the name is taken.
    pub fn add_instance(
        &mut self,
        header: HeaderId,
        name: &str,
        metadata: bool,
    ) -> Result<InstanceId> {
        if self.instance_names.contains_key(name) {
            return Err(duplicate("header instance", name));
        }
        let id = InstanceId(self.instances.len());
        self.instances.push(HeaderInstance {
            name: name.to_owned(),
            header,
            metadata,
            fields: Vec::new(),
        });
        self.instance_names.insert(name.to_owned(), id);
        self.headers[header.0].instances.push(id);
        self.sync_instance(id);
        Ok(id)
    }

    /// Header instance by handle.
    #[must_use]
    pub fn instance(&self, id: InstanceId) -> &HeaderInstance {
        &self.instances[id.0]
    }

    /// Resolve a header instance name.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] if no instance has this name.
    pub fn instance_by_name(&self, name: &str) -> Result<InstanceId> {
        lookup(&self.instance_names, "header instance", name)
    }

    /// Field of an instance by name.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] if the instance has no such field.
    pub fn instance_field(&self, instance: InstanceId, name: &str) -> Result<FieldId> {
        self.instances[instance.0]
            .fields
            .iter()
            .copied()
            .find(|f| self.fields[f.0].name == name)
            .ok_or_else(|| CompileError::UnknownName {
                kind: "field",
                name: format!("{}.{name}", self.instances[instance.0].name),
            })
    }

    /// Resolve an `instance.field` path.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] for a malformed path or unknown names.
    pub fn field_by_path(&self, path: &str) -> Result<FieldId> {
        let (instance, field) = path.split_once('.').ok_or_else(|| CompileError::UnknownName {
            kind: "field",
            name: path.to_owned(),
        })?;
        let instance = self.instance_by_name(instance)?;
        self.instance_field(instance, field)
    }

    /// Field by handle.
    #[must_use]
    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.0]
    }

    /// `instance.field` display path.
    #[must_use]
    pub fn field_path(&self, id: FieldId) -> String {
        let field = &self.fields[id.0];
        format!("{}.{}", self.instances[field.instance.0].name, field.name)
    }

    fn sync_instance(&mut self, id: InstanceId) {
        let instance = &mut self.instances[id.0];
        if let Some(&last) = instance.fields.last() {
            if self.fields[last.0].is_padding() {
                instance.fields.pop();
            }
        }

        let layout = self.headers[instance.header.0].layout.clone();
        let mut offset = 0;
        for (name, width) in layout {
            let present = self.instances[id.0]
                .fields
                .iter()
                .any(|f| self.fields[f.0].name == name);
            if !present {
                let field = FieldId(self.fields.len());
                self.fields.push(Field {
                    name,
                    instance: id,
                    width,
                    offset,
                });
                self.instances[id.0].fields.push(field);
            }
            offset += width;
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Actions
    // ───────────────────────────────────────────────────────────────────────────

    /// Declare a compound action with an empty call sequence.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if the name is taken, a parameter
    /// name repeats or a parameter width is zero.
    pub fn add_action(&mut self, name: &str, params: Vec<Param>) -> Result<ActionId> {
        if self.action_names.contains_key(name) {
            return Err(duplicate("action", name));
        }
        for (i, param) in params.iter().enumerate() {
            if param.width == 0 {
                return Err(CompileError::invalid_argument(format!(
                    "parameter {} of action {name} must have a non-zero width",
                    param.name
                )));
            }
            if params[..i].iter().any(|p| p.name == param.name) {
                return Err(CompileError::invalid_argument(format!(
                    "action {name} declares parameter {} twice",
                    param.name
                )));
            }
        }
        Ok(self.push_action(name, ActionKind::Compound { params }))
    }

    /// Declare a primitive action.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if the name is taken.
    pub fn add_primitive(&mut self, name: &str, params: Vec<PrimitiveParam>) -> Result<ActionId> {
        if self.action_names.contains_key(name) {
            return Err(duplicate("action", name));
        }
        Ok(self.push_action(name, ActionKind::Primitive { params }))
    }

    fn push_action(&mut self, name: &str, kind: ActionKind) -> ActionId {
        let id = ActionId(self.actions.len());
        self.actions.push(Action {
            name: name.to_owned(),
            kind,
            calls: Vec::new(),
        });
        self.action_names.insert(name.to_owned(), id);
        id
    }

    /// Append a call to `callee` at the end of `action`'s call sequence.
    ///
    /// Parameter back-references are resolved by name against `action`'s
    /// signature. Calls into primitives are checked for arity and argument
    /// kind; calls into compound actions for arity only.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if `action` is a primitive, a
    /// back-reference names an undeclared parameter, the arguments do not fit
    /// the callee's signature, or the call would make the action recursive.
    pub fn add_call(&mut self, action: ActionId, callee: ActionId, args: Vec<CallArg>) -> Result<()> {
        let caller = &self.actions[action.0];
        let ActionKind::Compound { params } = &caller.kind else {
            return Err(CompileError::invalid_argument(format!(
                "cannot add calls to primitive action {}",
                caller.name
            )));
        };
        if action == callee || self.calls_transitively(callee, action) {
            return Err(CompileError::invalid_argument(format!(
                "calling {} from {} would make it recursive",
                self.actions[callee.0].name, caller.name
            )));
        }

        let resolved = args
            .into_iter()
            .map(|arg| match arg {
                CallArg::Field(field) => Ok(Arg::Field(field)),
                CallArg::Value(value) => Ok(Arg::Value(value)),
                CallArg::Param(name) => params
                    .iter()
                    .position(|p| p.name == name)
                    .map(Arg::Param)
                    .ok_or_else(|| {
                        CompileError::invalid_argument(format!(
                            "{name} is not one of the parameters of {}: [{}]",
                            caller.name,
                            caller.param_names().join(", ")
                        ))
                    }),
            })
            .collect::<Result<Vec<_>>>()?;

        self.check_signature(callee, &resolved)?;
        self.actions[action.0].calls.push(Call {
            callee,
            args: resolved,
        });
        Ok(())
    }

    fn check_signature(&self, callee: ActionId, args: &[Arg]) -> Result<()> {
        let target = &self.actions[callee.0];
        if args.len() != target.arity() {
            return Err(CompileError::invalid_argument(format!(
                "{} expects {} arguments, got {}",
                target.name,
                target.arity(),
                args.len()
            )));
        }
        if let ActionKind::Primitive { params } = &target.kind {
            for (param, arg) in params.iter().zip(args) {
                let accepted = match (param.ty, arg) {
                    (_, Arg::Field(_)) if param.access == Access::Write => true,
                    (_, _) if param.access == Access::Write => false,
                    (ParamType::FieldOrInt, _)
                    | (ParamType::Field, Arg::Field(_))
                    | (ParamType::Int, Arg::Value(_) | Arg::Param(_)) => true,
                    _ => false,
                };
                if !accepted {
                    return Err(CompileError::invalid_argument(format!(
                        "argument {arg:?} does not fit parameter {} of {}",
                        param.name, target.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn calls_transitively(&self, from: ActionId, target: ActionId) -> bool {
        let mut stack = vec![from];
        let mut seen = Vec::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            stack.extend(self.actions[current.0].calls.iter().map(|c| c.callee));
        }
        false
    }

    /// Action by handle.
    #[must_use]
    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.0]
    }

    /// Resolve an action name.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] if no action has this name.
    pub fn action_by_name(&self, name: &str) -> Result<ActionId> {
        lookup(&self.action_names, "action", name)
    }

    /// Primitive calls of `action`, with nested compound calls inlined and
    /// their back-references substituted by the caller's arguments.
    #[must_use]
    pub fn flat_calls(&self, action: ActionId) -> Vec<Call> {
        let mut out = Vec::new();
        self.flatten_into(action, None, &mut out);
        out
    }

    fn flatten_into(&self, action: ActionId, bound: Option<&[Arg]>, out: &mut Vec<Call>) {
        for call in &self.actions[action.0].calls {
            let args: Vec<Arg> = call
                .args
                .iter()
                .map(|arg| match (arg, bound) {
                    (Arg::Param(i), Some(bound)) => bound.get(*i).copied().unwrap_or(*arg),
                    _ => *arg,
                })
                .collect();
            if self.actions[call.callee.0].is_primitive() {
                out.push(Call {
                    callee: call.callee,
                    args,
                });
            } else {
                self.flatten_into(call.callee, Some(&args), out);
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Tables
    // ───────────────────────────────────────────────────────────────────────────

    /// Declare a table. Every action starts with no next node.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if the name is taken or the default
    /// action takes parameters.
    pub fn add_table(
        &mut self,
        name: &str,
        match_fields: Vec<MatchField>,
        actions: Vec<ActionId>,
        default_action: Option<ActionId>,
    ) -> Result<TableId> {
        if self.table_names.contains_key(name) {
            return Err(duplicate("table", name));
        }
        if let Some(default) = default_action {
            let action = &self.actions[default.0];
            if action.arity() != 0 {
                return Err(CompileError::invalid_argument(format!(
                    "default action {} of table {name} must not have parameters",
                    action.name
                )));
            }
        }

        let id = TableId(self.tables.len());
        let mut table = Table {
            name: name.to_owned(),
            match_fields,
            actions: Vec::new(),
            next: HashMap::new(),
            default_next: None,
            default_action,
        };
        for action in actions {
            table.add_action(action, None);
        }
        self.tables.push(table);
        self.table_names.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Declare a keyless table whose only behaviour is its default `action`.
    ///
    /// The table is named after the action.
    ///
    /// # Errors
    ///
    /// Same as [`add_table`](Self::add_table).
    pub fn add_action_table(&mut self, action: ActionId) -> Result<TableId> {
        let name = self.actions[action.0].name.clone();
        self.add_table(&name, Vec::new(), Vec::new(), Some(action))
    }

    /// Table by handle.
    #[must_use]
    pub fn table(&self, id: TableId) -> &Table {
        &self.tables[id.0]
    }

    /// Mutable table by handle.
    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        &mut self.tables[id.0]
    }

    /// Resolve a table name.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] if no table has this name.
    pub fn table_by_name(&self, name: &str) -> Result<TableId> {
        lookup(&self.table_names, "table", name)
    }

    /// All tables with their handles, in creation order.
    pub fn tables(&self) -> impl Iterator<Item = (TableId, &Table)> {
        self.tables.iter().enumerate().map(|(i, t)| (TableId(i), t))
    }

    /// Key fields of a table, padding excluded, in match order.
    #[must_use]
    pub fn table_key_fields(&self, id: TableId) -> Vec<FieldId> {
        self.tables[id.0]
            .match_fields
            .iter()
            .map(|mf| mf.field)
            .filter(|f| !self.fields[f.0].is_padding())
            .collect()
    }

    /// Key width of a table in bits (padding excluded).
    #[must_use]
    pub fn table_key_width(&self, id: TableId) -> usize {
        self.table_key_fields(id)
            .iter()
            .map(|f| self.fields[f.0].width)
            .sum()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Conditionals and control flow
    // ───────────────────────────────────────────────────────────────────────────

    /// Declare a boolean branch.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if the name is taken.
    pub fn add_conditional(
        &mut self,
        name: &str,
        on_true: Option<NodeId>,
        on_false: Option<NodeId>,
    ) -> Result<ConditionalId> {
        if self.conditional_names.contains_key(name) {
            return Err(duplicate("conditional", name));
        }
        let id = ConditionalId(self.conditionals.len());
        self.conditionals.push(Conditional {
            name: name.to_owned(),
            on_true,
            on_false,
        });
        self.conditional_names.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Conditional by handle.
    #[must_use]
    pub fn conditional(&self, id: ConditionalId) -> &Conditional {
        &self.conditionals[id.0]
    }

    /// Mutable conditional by handle.
    pub fn conditional_mut(&mut self, id: ConditionalId) -> &mut Conditional {
        &mut self.conditionals[id.0]
    }

    /// All conditionals with their handles.
    pub fn conditionals(&self) -> impl Iterator<Item = (ConditionalId, &Conditional)> {
        self.conditionals
            .iter()
            .enumerate()
            .map(|(i, c)| (ConditionalId(i), c))
    }

    /// Resolve a control-flow node name (tables take precedence over conditionals).
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] if neither a table nor a conditional has this name.
    pub fn node_by_name(&self, name: &str) -> Result<NodeId> {
        if let Some(&table) = self.table_names.get(name) {
            return Ok(NodeId::Table(table));
        }
        self.conditional_names
            .get(name)
            .map(|&c| NodeId::Conditional(c))
            .ok_or_else(|| CompileError::UnknownName {
                kind: "node",
                name: name.to_owned(),
            })
    }

    /// Display name of a control-flow node.
    #[must_use]
    pub fn node_name(&self, node: NodeId) -> &str {
        match node {
            NodeId::Table(t) => &self.tables[t.0].name,
            NodeId::Conditional(c) => &self.conditionals[c.0].name,
        }
    }

    /// Entry node of the ingress pipeline.
    #[must_use]
    pub fn ingress(&self) -> Option<NodeId> {
        self.ingress
    }

    /// Set the entry node of the ingress pipeline.
    pub fn set_ingress(&mut self, node: Option<NodeId>) {
        self.ingress = node;
    }

    /// Allocate a root namespace for one compilation session.
    ///
    /// Successive sessions on the same program get distinct roots
    /// (`p4t`, `p4t_1`, ...), so their scratch objects never collide.
    pub fn open_session_namespace(&mut self, base: &str) -> Namespace {
        self.sessions.nested(base)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Validation
    // ───────────────────────────────────────────────────────────────────────────

    /// Check structural invariants: every edge points at an existing node,
    /// default actions take no parameters, back-references are in range.
    ///
    /// # Errors
    ///
    /// [`CompileError::IllegalState`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            let edges = table
                .next
                .values()
                .flatten()
                .chain(table.default_next.iter());
            for &node in edges {
                if !self.node_exists(node) {
                    return Err(CompileError::illegal_state(format!(
                        "table {} points at a missing node {node:?}",
                        table.name
                    )));
                }
            }
            if let Some(default) = table.default_action {
                if self.actions[default.0].arity() != 0 {
                    return Err(CompileError::illegal_state(format!(
                        "default action of table {} takes parameters",
                        table.name
                    )));
                }
            }
        }

        for conditional in &self.conditionals {
            for node in [conditional.on_true, conditional.on_false].into_iter().flatten() {
                if !self.node_exists(node) {
                    return Err(CompileError::illegal_state(format!(
                        "conditional {} points at a missing node {node:?}",
                        conditional.name
                    )));
                }
            }
        }

        for action in &self.actions {
            for call in &action.calls {
                let out_of_range = call
                    .args
                    .iter()
                    .any(|arg| matches!(arg, Arg::Param(i) if *i >= action.arity()));
                if out_of_range {
                    return Err(CompileError::illegal_state(format!(
                        "action {} references an undeclared parameter",
                        action.name
                    )));
                }
            }
        }

        if let Some(ingress) = self.ingress {
            if !self.node_exists(ingress) {
                return Err(CompileError::illegal_state("ingress points at a missing node"));
            }
        }
        Ok(())
    }

    fn node_exists(&self, node: NodeId) -> bool {
        match node {
            NodeId::Table(t) => t.0 < self.tables.len(),
            NodeId::Conditional(c) => c.0 < self.conditionals.len(),
        }
    }
}

fn lookup<T: Copy>(index: &HashMap<String, T>, kind: &'static str, name: &str) -> Result<T> {
    index.get(name).copied().ok_or_else(|| CompileError::UnknownName {
        kind,
        name: name.to_owned(),
    })
}

fn duplicate(kind: &str, name: &str) -> CompileError {
    CompileError::invalid_argument(format!("{kind} {name} already exists"))
}
