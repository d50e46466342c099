//! Registered user callbacks.
//!
//! Dynamical systems and relations may delegate their right-hand side, output
//! function or Jacobians to user code. Callbacks are registered by name in a
//! [`PluginRegistry`] and resolved once, when the model object is built.
//!
//! Every callback has the signature `(time, state, out, z)`:
//! - `state` is the relevant state slice (for Lagrangian forces, `[q; v]`)
//! - `out` is the destination, column-major for matrices
//! - `z` are the free parameters of the owning system
//!
//! Callbacks must be pure functions of their arguments.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A user function writing its result into `out`.
pub type Callback = Arc<dyn Fn(f64, &[f64], &mut [f64], &[f64]) + Send + Sync>;

/// What a registered callback produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    /// Output is a vector.
    Vector,
    /// Output is a column-major matrix.
    Matrix,
}

#[derive(Clone)]
struct Entry {
    kind: PluginKind,
    function: Callback,
}

/// Name → callback table.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    entries: HashMap<String, Entry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vector-valued function, replacing any previous one with that name.
    pub fn register_vector<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(f64, &[f64], &mut [f64], &[f64]) + Send + Sync + 'static,
    {
        self.entries.insert(
            name.into(),
            Entry {
                kind: PluginKind::Vector,
                function: Arc::new(f),
            },
        );
    }

    /// Register a matrix-valued function (column-major output).
    pub fn register_matrix<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(f64, &[f64], &mut [f64], &[f64]) + Send + Sync + 'static,
    {
        self.entries.insert(
            name.into(),
            Entry {
                kind: PluginKind::Matrix,
                function: Arc::new(f),
            },
        );
    }

    /// Resolve a vector function by name.
    pub fn vector(&self, name: &str) -> Result<Callback> {
        self.resolve(name, PluginKind::Vector)
    }

    /// Resolve a matrix function by name.
    pub fn matrix(&self, name: &str) -> Result<Callback> {
        self.resolve(name, PluginKind::Matrix)
    }

    fn resolve(&self, name: &str, kind: PluginKind) -> Result<Callback> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::UnknownPlugin(name.to_string()))?;
        if entry.kind != kind {
            return Err(Error::InvalidConfiguration(format!(
                "plugin '{}' is registered as {:?}, requested as {:?}",
                name, entry.kind, kind
            )));
        }
        Ok(Arc::clone(&entry.function))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("PluginRegistry").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_call() {
        let mut registry = PluginRegistry::new();
        registry.register_vector("spring", |_t, x, out, z| {
            out[0] = -z[0] * x[0];
        });

        let f = registry.vector("spring").unwrap();
        let mut out = [0.0];
        f(0.0, &[2.0], &mut out, &[3.0]);
        assert_eq!(out[0], -6.0);
    }

    #[test]
    fn test_unknown_plugin_is_error() {
        let registry = PluginRegistry::new();
        assert!(matches!(registry.vector("missing"), Err(Error::UnknownPlugin(_))));
    }

    #[test]
    fn test_kind_mismatch_is_error() {
        let mut registry = PluginRegistry::new();
        registry.register_matrix("jac", |_t, _x, out, _z| out.fill(0.0));
        assert!(registry.vector("jac").is_err());
        assert!(registry.matrix("jac").is_ok());
    }
}
