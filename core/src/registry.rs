//! Step registry for named optimization steps.
//!
//! A step is a plain function that takes a [`ProgramGraph`] by value and
//! returns the rewritten graph:
//!
//! | Concern | Type | Construction |
//! |---------|------|--------------|
//! | Step signature | [`StepFn`] | `fn(ProgramGraph, &[String]) -> Result<ProgramGraph>` |
//! | Registration | [`StepRegistryBuilder`] | `builder.step("name", f)` |
//! | Dispatch | [`StepRegistry`] | `registry.run("name", graph, &args)` |
//!
//! The registry is immutable once built. Startup code composes registration
//! functions such as [`register_core_steps`].
//!
//! # Example
//!
//! ```
//! use p4t::prelude::*;
//! use p4t::register_core_steps;
//!
//! let registry = register_core_steps(StepRegistryBuilder::new()).build();
//! assert_eq!(registry.names(), vec!["partition", "rekey"]);
//! ```

use std::collections::HashMap;

use log::debug;

use crate::{CompileError, ProgramGraph, Result};

/// An optimization step.
///
/// An error drops the input graph; callers must not reuse it.
pub type StepFn = fn(ProgramGraph, &[String]) -> Result<ProgramGraph>;

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for a [`StepRegistry`].
#[derive(Debug, Clone, Default)]
pub struct StepRegistryBuilder {
    steps: HashMap<String, StepFn>,
}

impl StepRegistryBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `step` under `name`. A later registration of the same name wins.
    #[must_use]
    pub fn step(mut self, name: &str, step: StepFn) -> Self {
        self.steps.insert(name.to_owned(), step);
        self
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> StepRegistry {
        StepRegistry { steps: self.steps }
    }
}

/// Register the built-in steps `partition` and `rekey`.
#[must_use]
pub fn register_core_steps(builder: StepRegistryBuilder) -> StepRegistryBuilder {
    builder
        .step("partition", crate::partition)
        .step("rekey", crate::rekey)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable map from step name to [`StepFn`].
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, StepFn>,
}

impl StepRegistry {
    /// Number of registered steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// `true` if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run step `name` on `graph` and validate the result.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownOptimizationStep`] if `name` is not registered;
    /// any error from the step or from [`ProgramGraph::validate`].
    pub fn run(&self, name: &str, graph: ProgramGraph, args: &[String]) -> Result<ProgramGraph> {
        let step = self
            .steps
            .get(name)
            .ok_or_else(|| CompileError::UnknownOptimizationStep {
                name: name.to_owned(),
                available: self.names().into_iter().map(str::to_owned).collect(),
            })?;
        debug!("running step {name} with args {args:?}");
        let graph = step(graph, args)?;
        graph.validate()?;
        Ok(graph)
    }
}
