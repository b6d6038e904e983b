use crate::protocol::Value;
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};

/// Entry point of a worker. Invoked after all sandbox layers are applied,
/// with the exact argument sequence from the spawn request. Its stdout and
/// stderr are the captured pipes the controller reads from. A returned error
/// (or a panic) terminates the worker with
/// [`crate::ExitStatus::ENTRY_FAILED`] after writing a trace to stderr.
pub type EntryFn = fn(&[Value]) -> Result<()>;

/// Collaborator boundary towards the host's module system.
///
/// The fork-server consumes, but does not define, "load named module" and
/// "resolve reference to a callable". Imports happen once, in the fork-server
/// process, before any sandboxing: whatever a loader pulls in is shared with
/// every subsequently spawned worker.
pub trait ModuleLoader {
    /// Load the named module into this process.
    fn import(&self, module: &str) -> Result<()>;

    /// Resolve a dotted entry function reference to a callable.
    fn resolve(&self, reference: &str) -> Result<EntryFn>;
}

/// In-process loader backed by a static registry.
///
/// Embedders that link their worker code into the same binary register
/// modules and entry functions up front; `import` then degenerates to a
/// presence check.
#[derive(Default)]
pub struct Registry {
    modules: HashSet<String>,
    entries: HashMap<String, EntryFn>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register an importable module name.
    pub fn with_module(mut self, name: impl Into<String>) -> Registry {
        self.modules.insert(name.into());
        self
    }

    /// Register an entry function under a dotted reference.
    pub fn with_entry(mut self, reference: impl Into<String>, entry: EntryFn) -> Registry {
        self.entries.insert(reference.into(), entry);
        self
    }
}

impl ModuleLoader for Registry {
    fn import(&self, module: &str) -> Result<()> {
        if self.modules.contains(module) {
            Ok(())
        } else {
            Err(anyhow!("unknown module {module}"))
        }
    }

    fn resolve(&self, reference: &str) -> Result<EntryFn> {
        self.entries
            .get(reference)
            .copied()
            .ok_or_else(|| anyhow!("unknown entry function {reference}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn nop(_: &[Value]) -> Result<()> {
        Ok(())
    }

    #[test]
    fn registry_import() {
        let registry = Registry::new().with_module("math_helpers");
        assert!(registry.import("math_helpers").is_ok());
        assert!(registry.import("other").is_err());
    }

    #[test]
    fn registry_resolve() {
        let registry = Registry::new().with_entry("math_helpers.add", nop);
        assert!(registry.resolve("math_helpers.add").is_ok());
        assert!(registry.resolve("math_helpers.sub").is_err());
    }
}
