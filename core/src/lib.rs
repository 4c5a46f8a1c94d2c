//! p4t: classifier compiler for P4 match-action pipelines
//!
//! Compiles a prioritized rule set bound to one match table into an equivalent
//! pipeline of simpler tables. First-match priority semantics are preserved
//! while each table's key gets narrower, or several independently keyed groups
//! are merged into one stage.
//!
//! # Architecture
//!
//! Leaf to root:
//!
//! - [`Namespace`]: hierarchical, collision-free name allocation
//! - [`Program`]: arena of headers, fields, actions, tables and conditionals addressed by handles
//! - [`Vmr`]: ordered value/mask/action/priority entries bound to one table
//! - [`KeyConstructor`]: builds a new key field from bit ranges of existing fields
//! - [`PriorityEncoder`]: per-group priority slots plus a max-selection action
//! - [`Classifier`]: table + rule set + optional setup action (`subset`, `reorder`)
//! - [`MultiGroupClassifier`]: merges ≥2 classifiers behind a dispatcher table
//! - [`rewrite`]: control-flow chaining and redirection
//! - [`StepRegistry`]: named optimization steps over a [`ProgramGraph`]
//!
//! # Example
//!
//! ```
//! use p4t::prelude::*;
//!
//! let mut program = Program::new();
//! let header = program.add_header("meta_t").unwrap();
//! program.add_header_field(header, "a", 2).unwrap();
//! program.add_header_field(header, "b", 2).unwrap();
//! let meta = program.add_instance(header, "meta", true).unwrap();
//! let drop = program.action_by_name("drop").unwrap();
//!
//! let a = program.instance_field(meta, "a").unwrap();
//! let b = program.instance_field(meta, "b").unwrap();
//! let table = program
//!     .add_table(
//!         "acl",
//!         vec![MatchField::new(a, MatchKind::Ternary), MatchField::new(b, MatchKind::Ternary)],
//!         vec![drop],
//!         None,
//!     )
//!     .unwrap();
//!
//! let mut vmr = Vmr::new(&program, table);
//! vmr.push(VmrEntry::ternary("01*1", VmrAction::Unbound(drop), 3).unwrap()).unwrap();
//!
//! let classifier = Classifier::new(&program, table, vmr, None).unwrap();
//! let mut session = Session::new(&mut program, CompilerConfig::default()).unwrap();
//! let narrow = classifier.reorder(&mut program, &mut session, &[3, 1], MatchKind::Ternary).unwrap();
//!
//! assert_eq!(narrow.vmr().bit_width(), 2);
//! assert_eq!(narrow.vmr()[0].priority, 3);
//! ```

// ═══════════════════════════════════════════════════════════════════════════════
// Modules
// ═══════════════════════════════════════════════════════════════════════════════

mod classifier;
mod config;
mod graph;
mod keys;
mod materialize;
mod multigroup;
mod namespace;
mod priority;
mod program;
mod registry;
pub mod rewrite;
mod session;
mod steps;
mod vmr;

// ═══════════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════════

pub use classifier::Classifier;
pub use config::{
    ActionConfig, ArgConfig, CallConfig, CompilerConfig, ConditionalConfig, DefaultEntryConfig,
    EntriesConfig, EntryConfig, FieldConfig, HeaderConfig, InstanceConfig, ParamConfig,
    ProgramConfig, ReadConfig, TableConfig, TableEntriesConfig,
};
pub use graph::ProgramGraph;
pub use keys::{bits_to_subkeys, KeyConstructor, Subkey};
pub use materialize::{
    materialize, Materializer, RecordingMaterializer, RuntimeCommand, RuntimeMatch,
};
pub use multigroup::MultiGroupClassifier;
pub use namespace::Namespace;
pub use priority::PriorityEncoder;
pub use program::{
    Access, Action, ActionId, ActionKind, Arg, Call, CallArg, Conditional, ConditionalId, Field,
    FieldId, HeaderId, HeaderInstance, HeaderType, InstanceId, MatchField, MatchKind, NodeId,
    Param, ParamType, PrimitiveParam, Program, Table, TableId,
};
pub use registry::{register_core_steps, StepFn, StepRegistry, StepRegistryBuilder};
pub use session::{PrimitiveCache, Session};
pub use steps::{partition, rekey, PartitionGroup};
pub use vmr::{bits_from_u64, bits_to_u64, is_prefix, MatchParam, Vmr, VmrAction, VmrEntry};

// ═══════════════════════════════════════════════════════════════════════════════
// Prelude
// ═══════════════════════════════════════════════════════════════════════════════

/// Prelude module for convenient imports.
///
/// ```
/// use p4t::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Compiler
        Classifier,
        CompileError,
        CompilerConfig,
        // Program graph
        MatchField,
        MatchKind,
        MultiGroupClassifier,
        NodeId,
        Program,
        ProgramGraph,
        Session,
        // Registry
        StepRegistry,
        StepRegistryBuilder,
        TableId,
        // Rule sets
        Vmr,
        VmrAction,
        VmrEntry,
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════════

/// Default width of the winner field and of every per-group priority field.
///
/// Priorities above `2^width - 1` are rejected at merge time with
/// [`CompileError::PriorityOverflow`], never truncated.
pub const DEFAULT_PRIORITY_WIDTH: usize = 16;

/// Maximum supported priority field width (priorities are `u64`).
pub const MAX_PRIORITY_WIDTH: usize = 64;

/// Name of the trailing field that pads a header layout to a byte boundary.
pub const PADDING_FIELD: &str = "_padding";

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Result alias used throughout the compiler.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors from classifier compilation.
///
/// All errors are detected synchronously at the call boundary. There is no
/// rollback: a compilation that fails part-way may leave scratch fields and
/// names reserved in the [`Program`], and that program must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// A mask violates the exact/prefix constraint of its key field.
    #[error("invalid mask for {table}.{field}: {reason}")]
    InvalidMask {
        /// Table the entry is bound to.
        table: String,
        /// Key field whose sub-mask is invalid.
        field: String,
        /// What is wrong with the mask.
        reason: String,
    },

    /// A rule set or entry width differs from the table key width.
    #[error("{context}: expected {expected} bits, got {actual}")]
    BitWidthMismatch {
        /// Expected width in bits.
        expected: usize,
        /// Actual width in bits.
        actual: usize,
        /// Where the mismatch was detected.
        context: String,
    },

    /// A malformed argument (too few classifiers, unknown parameter, bad bit index).
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What is wrong with the argument.
        reason: String,
    },

    /// An operation was called in a state that no longer permits it.
    #[error("illegal state: {reason}")]
    IllegalState {
        /// What was attempted.
        reason: String,
    },

    /// Two tables being merged carry different default actions.
    #[error("default actions are incompatible, mine: {mine}, theirs: {theirs}")]
    IncompatibleDefaultAction {
        /// Default action already present on the receiving side.
        mine: String,
        /// Default action of the merged side.
        theirs: String,
    },

    /// The requested optimization step was never registered.
    #[error("unknown optimization step \"{name}\"{}", format_available(.available))]
    UnknownOptimizationStep {
        /// The requested step name.
        name: String,
        /// Step names that ARE registered (sorted).
        available: Vec<String>,
    },

    /// Two merged groups contain entries with the same priority.
    #[error(
        "priority {priority} appears in group {first_group} and group {second_group}, \
        dispatcher keys would be ambiguous"
    )]
    DuplicatePriority {
        /// The shared priority.
        priority: u64,
        /// Index of the group where the priority was first seen.
        first_group: usize,
        /// Index of the group where it was seen again.
        second_group: usize,
    },

    /// A priority does not fit the configured winner field width.
    #[error("priority {priority} does not fit in a {width}-bit priority field")]
    PriorityOverflow {
        /// The offending priority.
        priority: u64,
        /// Configured priority width.
        width: usize,
    },

    /// A name did not resolve to an object of the expected kind.
    #[error("unknown {kind} \"{name}\"")]
    UnknownName {
        /// Object kind (`"table"`, `"action"`, `"field"`, ...).
        kind: &'static str,
        /// The unresolved name.
        name: String,
    },

    /// Configuration deserialization or validation failed.
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// The underlying error message.
        message: String,
    },
}

impl CompileError {
    /// Short, stable name of the error kind (used by conformance fixtures).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMask { .. } => "InvalidMask",
            Self::BitWidthMismatch { .. } => "BitWidthMismatch",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::IllegalState { .. } => "IllegalState",
            Self::IncompatibleDefaultAction { .. } => "IncompatibleDefaultAction",
            Self::UnknownOptimizationStep { .. } => "UnknownOptimizationStep",
            Self::DuplicatePriority { .. } => "DuplicatePriority",
            Self::PriorityOverflow { .. } => "PriorityOverflow",
            Self::UnknownName { .. } => "UnknownName",
            Self::InvalidConfig { .. } => "InvalidConfig",
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }
}

fn format_available(available: &[String]) -> String {
    if available.is_empty() {
        ", no steps are registered".to_owned()
    } else {
        format!(", registered: {}", available.join(", "))
    }
}
