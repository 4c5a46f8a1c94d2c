//! Compilation session: namespace, primitive cache, key constructor, config.
//!
//! Everything here is scoped to exactly one session. A new session on the
//! same [`Program`] gets a fresh root namespace (`p4t`, `p4t_1`, ...) and
//! empty caches, so two sessions never share scratch objects.

use std::collections::HashMap;

use log::debug;

use crate::{
    Access, ActionId, CompileError, CompilerConfig, FieldId, KeyConstructor, Namespace, ParamType,
    PrimitiveParam, PriorityEncoder, Program, Result, Subkey,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Primitive cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Arity-specific primitives, memoized by arity.
///
/// | Primitive | Parameters |
/// |-----------|------------|
/// | `compress_k` | `dst`, then `src{i}`, `from{i}`, `to{i}` for `i < k` |
/// | `set_max_field_k` | `dst`, then `src{i}` for `i < k` |
///
/// A primitive already declared in the program under the same name (by an
/// earlier session) is reused.
#[derive(Debug, Clone, Default)]
pub struct PrimitiveCache {
    compress: HashMap<usize, ActionId>,
    set_max: HashMap<usize, ActionId>,
}

impl PrimitiveCache {
    /// `compress_k`: concatenate `k` bit ranges into `dst`.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if an unrelated action already uses the name.
    pub fn compress(&mut self, program: &mut Program, arity: usize) -> Result<ActionId> {
        if let Some(&action) = self.compress.get(&arity) {
            return Ok(action);
        }
        let mut params = vec![PrimitiveParam::new("dst", ParamType::Field, Access::Write)];
        for i in 0..arity {
            params.push(PrimitiveParam::new(format!("src{i}"), ParamType::Field, Access::Read));
            params.push(PrimitiveParam::new(format!("from{i}"), ParamType::Int, Access::Read));
            params.push(PrimitiveParam::new(format!("to{i}"), ParamType::Int, Access::Read));
        }
        let action = declare(program, &format!("compress_{arity}"), params)?;
        self.compress.insert(arity, action);
        Ok(action)
    }

    /// `set_max_field_k`: write the maximum of `k` fields into `dst`.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if an unrelated action already uses the name.
    pub fn set_max(&mut self, program: &mut Program, arity: usize) -> Result<ActionId> {
        if let Some(&action) = self.set_max.get(&arity) {
            return Ok(action);
        }
        let mut params = vec![PrimitiveParam::new("dst", ParamType::Field, Access::Write)];
        for i in 0..arity {
            params.push(PrimitiveParam::new(format!("src{i}"), ParamType::Field, Access::Read));
        }
        let action = declare(program, &format!("set_max_field_{arity}"), params)?;
        self.set_max.insert(arity, action);
        Ok(action)
    }

    /// The built-in `modify_field` primitive.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownName`] if the program lacks it.
    pub fn modify_field(program: &Program) -> Result<ActionId> {
        program.action_by_name("modify_field")
    }

    /// Number of memoized primitives.
    #[must_use]
    pub fn len(&self) -> usize {
        self.compress.len() + self.set_max.len()
    }

    /// `true` if nothing has been memoized yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn declare(program: &mut Program, name: &str, params: Vec<PrimitiveParam>) -> Result<ActionId> {
    if let Ok(existing) = program.action_by_name(name) {
        let action = program.action(existing);
        let same = matches!(action.kind(), crate::ActionKind::Primitive { params: p } if *p == params);
        if same {
            return Ok(existing);
        }
        return Err(CompileError::invalid_argument(format!(
            "action {name} exists but is not the expected primitive"
        )));
    }
    debug!("declaring primitive {name}");
    program.add_primitive(name, params)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════════════════════════

/// State shared by every compiler operation of one session.
#[derive(Debug, Clone)]
pub struct Session {
    namespace: Namespace,
    primitives: PrimitiveCache,
    keys: KeyConstructor,
    config: CompilerConfig,
}

impl Session {
    /// Open a session on `program`.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidConfig`] for an invalid config; name clashes
    /// while creating the key scratch header.
    pub fn new(program: &mut Program, config: CompilerConfig) -> Result<Self> {
        config.validate()?;
        let mut namespace = program.open_session_namespace(&config.namespace);
        let keys = KeyConstructor::new(program, &mut namespace)?;
        debug!("session {} opened", namespace.fullname());
        Ok(Self {
            namespace,
            primitives: PrimitiveCache::default(),
            keys,
            config,
        })
    }

    /// Session root namespace.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Mutable session root namespace.
    pub fn namespace_mut(&mut self) -> &mut Namespace {
        &mut self.namespace
    }

    /// Session config.
    #[must_use]
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Width of priority fields created in this session.
    #[must_use]
    pub fn priority_width(&self) -> usize {
        self.config.priority_width
    }

    /// Primitive cache.
    pub fn primitives_mut(&mut self) -> &mut PrimitiveCache {
        &mut self.primitives
    }

    /// The session's key constructor.
    #[must_use]
    pub fn keys(&self) -> &KeyConstructor {
        &self.keys
    }

    /// Build a new key field from `subkeys`. See [`KeyConstructor::add`].
    ///
    /// # Errors
    ///
    /// Same as [`KeyConstructor::add`].
    pub fn add_key(
        &mut self,
        program: &mut Program,
        name: &str,
        subkeys: &[Subkey],
    ) -> Result<(FieldId, ActionId)> {
        self.keys.add(
            program,
            &mut self.namespace,
            &mut self.primitives,
            name,
            subkeys,
        )
    }

    /// Create a priority encoder whose objects are named in `namespace`.
    ///
    /// # Errors
    ///
    /// Propagates name clashes from the [`Program`].
    pub fn create_priority_encoder(
        &self,
        program: &mut Program,
        namespace: &mut Namespace,
    ) -> Result<PriorityEncoder> {
        PriorityEncoder::new(program, namespace, self.config.priority_width)
    }
}
