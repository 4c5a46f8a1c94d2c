//! Namespace: hierarchical, collision-free name allocation.
//!
//! Every object the compiler adds to a [`Program`](crate::Program) gets its
//! name from a namespace, so that repeated rewrites of the same table never
//! produce clashing header, field, action or table names.

use std::collections::HashSet;

/// A node in the name tree.
///
/// A namespace remembers the names of the children allocated directly under
/// it. Requesting a name that is already taken yields the same base name with
/// a numeric suffix (`name_1`, `name_2`, ...). Full names join the path from
/// the root with `_`, skipping an empty root.
///
/// ```
/// use p4t::Namespace;
///
/// let mut root = Namespace::new("p4t");
/// assert_eq!(root.nested_name("keys"), "p4t_keys");
/// assert_eq!(root.nested_name("keys"), "p4t_keys_1");
///
/// let mut merged = root.nested("acl");
/// assert_eq!(merged.nested_name("dispatcher"), "p4t_acl_dispatcher");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    fullname: String,
    children: HashSet<String>,
}

impl Namespace {
    /// Create a root namespace with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            fullname: name.into(),
            children: HashSet::new(),
        }
    }

    /// Create an anonymous root namespace; its children's full names carry no prefix.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// The full name of this namespace (path from the root joined with `_`).
    #[must_use]
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Allocate a child namespace whose name is as close to `name` as possible.
    pub fn nested(&mut self, name: &str) -> Namespace {
        let mut candidate = name.to_owned();
        let mut suffix = 1usize;
        while self.children.contains(&candidate) {
            candidate = format!("{name}_{suffix}");
            suffix += 1;
        }
        self.children.insert(candidate.clone());

        let fullname = if self.fullname.is_empty() {
            candidate
        } else {
            format!("{}_{}", self.fullname, candidate)
        };
        Namespace::new(fullname)
    }

    /// Allocate a child and return only its full name.
    pub fn nested_name(&mut self, name: &str) -> String {
        self.nested(name).fullname
    }
}
