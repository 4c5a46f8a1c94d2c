//! Config types: compiler settings, program description, runtime entries.
//!
//! These types are serde-deserializable so a program graph and its rule sets
//! can be loaded from JSON or YAML. Names are resolved to arena handles
//! exactly once, here.
//!
//! | Config type | Produces | Loader |
//! |-------------|----------|--------|
//! | [`CompilerConfig`] | session settings | [`CompilerConfig::validate()`] |
//! | [`ProgramConfig`] | [`Program`] | [`Program::from_config()`] |
//! | [`EntriesConfig`] | `{table → Vmr}` | [`EntriesConfig::load()`] |
//!
//! # Program example
//!
//! ```yaml
//! headers:
//!   - name: meta_t
//!     fields: [{ name: a, width: 2 }, { name: b, width: 2 }]
//! instances:
//!   - { name: meta, header: meta_t, metadata: true }
//! actions:
//!   - name: set_a
//!     params: [{ name: x, width: 2 }]
//!     calls:
//!       - action: modify_field
//!         args: [{ field: meta.a }, { param: x }]
//! tables:
//!   - name: acl
//!     reads: [{ field: meta.a, kind: ternary }, { field: meta.b, kind: ternary }]
//!     actions: [set_a, drop]
//! ingress: acl
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    CallArg, CompileError, MatchField, MatchKind, MatchParam, NodeId, Param, Program, Result,
    TableId, Vmr, VmrAction, DEFAULT_PRIORITY_WIDTH, MAX_PRIORITY_WIDTH,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Compiler settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for one compilation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    /// Width of the winner field and of every per-group priority field.
    pub priority_width: usize,

    /// Base name of the session root namespace.
    pub namespace: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            priority_width: DEFAULT_PRIORITY_WIDTH,
            namespace: "p4t".to_owned(),
        }
    }
}

impl CompilerConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidConfig`] for a priority width outside
    /// `1..=64` or an empty namespace.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PRIORITY_WIDTH).contains(&self.priority_width) {
            return Err(CompileError::InvalidConfig {
                message: format!(
                    "priority_width must be in 1..={MAX_PRIORITY_WIDTH}, got {}",
                    self.priority_width
                ),
            });
        }
        if self.namespace.is_empty() {
            return Err(CompileError::InvalidConfig {
                message: "namespace must not be empty".to_owned(),
            });
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Program description
// ═══════════════════════════════════════════════════════════════════════════════

/// A whole program graph.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    /// Header types.
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,

    /// Header instances.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    /// Compound actions (built-in primitives are always present).
    #[serde(default)]
    pub actions: Vec<ActionConfig>,

    /// Match tables.
    #[serde(default)]
    pub tables: Vec<TableConfig>,

    /// Boolean branches.
    #[serde(default)]
    pub conditionals: Vec<ConditionalConfig>,

    /// Entry node of the ingress pipeline.
    #[serde(default)]
    pub ingress: Option<String>,
}

/// A header type.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderConfig {
    /// Header type name.
    pub name: String,
    /// Fields in layout order.
    pub fields: Vec<FieldConfig>,
}

/// One header field.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    /// Field name.
    pub name: String,
    /// Width in bits.
    pub width: usize,
}

/// A header instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// Instance name.
    pub name: String,
    /// Header type name.
    pub header: String,
    /// Metadata instance (not parsed from the packet).
    #[serde(default)]
    pub metadata: bool,
}

/// A compound action.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    /// Action name.
    pub name: String,
    /// Runtime parameters.
    #[serde(default)]
    pub params: Vec<ParamConfig>,
    /// Ordered calls.
    #[serde(default)]
    pub calls: Vec<CallConfig>,
}

/// A runtime parameter.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamConfig {
    /// Parameter name.
    pub name: String,
    /// Data width in bits.
    pub width: usize,
}

/// One call inside an action.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallConfig {
    /// Callee name.
    pub action: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<ArgConfig>,
}

/// A call argument: `{ field: inst.f }`, `{ value: 5 }` or `{ param: x }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgConfig {
    /// A field path.
    Field(String),
    /// An integer literal.
    Value(u64),
    /// A parameter of the calling action.
    Param(String),
}

/// A match table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    /// Table name.
    pub name: String,
    /// Key fields in match order.
    #[serde(default)]
    pub reads: Vec<ReadConfig>,
    /// Permitted action names.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Zero-parameter default action.
    #[serde(default)]
    pub default_action: Option<String>,
    /// `action → next node` (absent or null ends the pipeline).
    #[serde(default)]
    pub next: BTreeMap<String, Option<String>>,
    /// Next node on the default path.
    #[serde(default)]
    pub default_next: Option<String>,
}

/// One key field of a table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadConfig {
    /// Field path `instance.field`.
    pub field: String,
    /// Match kind.
    pub kind: MatchKind,
}

/// A boolean branch.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalConfig {
    /// Conditional name.
    pub name: String,
    /// Node taken when true.
    #[serde(default)]
    pub on_true: Option<String>,
    /// Node taken when false.
    #[serde(default)]
    pub on_false: Option<String>,
}

impl Program {
    /// Build a program from its description.
    ///
    /// Objects are created in dependency order: headers, instances, action
    /// signatures, action bodies, tables and conditionals, then edges.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] for unresolved references and any
    /// error the builders raise.
    pub fn from_config(config: &ProgramConfig) -> Result<Self> {
        let mut program = Self::new();

        for header in &config.headers {
            let id = program.add_header(&header.name)?;
            for field in &header.fields {
                program.add_header_field(id, &field.name, field.width)?;
            }
        }

        for instance in &config.instances {
            let header = program.header_by_name(&instance.header)?;
            program.add_instance(header, &instance.name, instance.metadata)?;
        }

        for action in &config.actions {
            let params = action
                .params
                .iter()
                .map(|p| Param::new(p.name.clone(), p.width))
                .collect();
            program.add_action(&action.name, params)?;
        }
        for action in &config.actions {
            let caller = program.action_by_name(&action.name)?;
            for call in &action.calls {
                let callee = program.action_by_name(&call.action)?;
                let args = call
                    .args
                    .iter()
                    .map(|arg| -> Result<CallArg> {
                        Ok(match arg {
                            ArgConfig::Field(path) => CallArg::Field(program.field_by_path(path)?),
                            ArgConfig::Value(value) => CallArg::Value(*value),
                            ArgConfig::Param(name) => CallArg::Param(name.clone()),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                program.add_call(caller, callee, args)?;
            }
        }

        for table in &config.tables {
            let reads = table
                .reads
                .iter()
                .map(|r| -> Result<MatchField> {
                    Ok(MatchField::new(program.field_by_path(&r.field)?, r.kind))
                })
                .collect::<Result<Vec<_>>>()?;
            let actions = table
                .actions
                .iter()
                .map(|a| program.action_by_name(a))
                .collect::<Result<Vec<_>>>()?;
            let default_action = table
                .default_action
                .as_deref()
                .map(|a| program.action_by_name(a))
                .transpose()?;
            program.add_table(&table.name, reads, actions, default_action)?;
        }

        for conditional in &config.conditionals {
            program.add_conditional(&conditional.name, None, None)?;
        }

        for table in &config.tables {
            let id = program.table_by_name(&table.name)?;
            for (action, next) in &table.next {
                let action_id = program.action_by_name(action)?;
                if !program.table(id).has_action(action_id) {
                    return Err(CompileError::invalid_argument(format!(
                        "table {} has an edge for action {action}, which it does not permit",
                        table.name
                    )));
                }
                let next = resolve_node(&program, next.as_deref())?;
                program.table_mut(id).set_next(action_id, next);
            }
            let default_next = resolve_node(&program, table.default_next.as_deref())?;
            program.table_mut(id).set_default_next(default_next);
        }

        for conditional in &config.conditionals {
            let on_true = resolve_node(&program, conditional.on_true.as_deref())?;
            let on_false = resolve_node(&program, conditional.on_false.as_deref())?;
            let NodeId::Conditional(id) = program.node_by_name(&conditional.name)? else {
                return Err(CompileError::invalid_argument(format!(
                    "conditional {} shares its name with a table",
                    conditional.name
                )));
            };
            let node = program.conditional_mut(id);
            node.set_branch(true, on_true);
            node.set_branch(false, on_false);
        }

        let ingress = resolve_node(&program, config.ingress.as_deref())?;
        program.set_ingress(ingress);
        program.validate()?;
        Ok(program)
    }
}

fn resolve_node(program: &Program, name: Option<&str>) -> Result<Option<NodeId>> {
    name.map(|n| program.node_by_name(n)).transpose()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runtime entries
// ═══════════════════════════════════════════════════════════════════════════════

/// Rule sets for several tables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntriesConfig {
    /// Per-table entries.
    #[serde(default)]
    pub tables: Vec<TableEntriesConfig>,
}

/// Entries and default of one table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableEntriesConfig {
    /// Table name.
    pub table: String,
    /// Entries in order.
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
    /// Default action.
    #[serde(default)]
    pub default: Option<DefaultEntryConfig>,
}

/// One entry: a match string per key field, an action, data, a priority.
///
/// Match strings are `"5"` (exact), `"10/2"` (value/prefix length) or
/// `"0x2&&&0x3"` (value&&&mask).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryConfig {
    /// Match strings in key order.
    #[serde(rename = "match")]
    pub match_key: Vec<String>,
    /// Action name.
    pub action: String,
    /// Action data.
    #[serde(default)]
    pub data: Vec<u64>,
    /// Entry priority.
    #[serde(default)]
    pub priority: u64,
}

/// A default action with data.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultEntryConfig {
    /// Action name.
    pub action: String,
    /// Action data.
    #[serde(default)]
    pub data: Vec<u64>,
}

impl EntriesConfig {
    /// Canonicalize every entry into rule sets keyed by table.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] for unknown tables or actions,
    /// [`CompileError::InvalidMask`] for masks that do not suit their field,
    /// [`CompileError::InvalidArgument`] for malformed match strings, actions
    /// not permitted in the table, or data that does not fit its parameters.
    pub fn load(&self, program: &Program) -> Result<BTreeMap<TableId, Vmr>> {
        let mut vmrs = BTreeMap::new();
        for table_entries in &self.tables {
            let table = program.table_by_name(&table_entries.table)?;
            let vmr = vmrs
                .entry(table)
                .or_insert_with(|| Vmr::new(program, table));
            for entry in &table_entries.entries {
                let params = entry
                    .match_key
                    .iter()
                    .map(|s| MatchParam::parse(s))
                    .collect::<Result<Vec<_>>>()?;
                let action = resolve_action(program, table, &entry.action, &entry.data)?;
                vmr.push(Vmr::canonicalize(program, table, &params, action, entry.priority)?)?;
            }
            if let Some(default) = &table_entries.default {
                let action = resolve_action(program, table, &default.action, &default.data)?;
                vmr.set_default_action(Some(action));
            }
        }
        Ok(vmrs)
    }
}

fn resolve_action(program: &Program, table: TableId, name: &str, data: &[u64]) -> Result<VmrAction> {
    let action = program.action_by_name(name)?;
    let t = program.table(table);
    if !t.has_action(action) && t.default_action() != Some(action) {
        return Err(CompileError::invalid_argument(format!(
            "action {name} is not permitted in table {}",
            t.name()
        )));
    }

    let vmr_action = if data.is_empty() {
        VmrAction::Unbound(action)
    } else {
        VmrAction::bound(action, data.to_vec())
    };
    vmr_action.check_signature(program)?;
    for (value, width) in data.iter().zip(program.action(action).param_widths()) {
        if width < 64 && value >> width != 0 {
            return Err(CompileError::invalid_argument(format!(
                "value {value} does not fit a {width}-bit parameter of {name}"
            )));
        }
    }
    Ok(vmr_action)
}

/// Parse a decimal, `0x` hexadecimal or `0b` binary integer.
pub(crate) fn parse_int(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2)
    } else {
        s.parse()
    };
    parsed.map_err(|e| CompileError::invalid_argument(format!("cannot parse {s:?} as an integer: {e}")))
}
