//! Explicit registration of hooks, runners, merge strategies and executor
//! backends. A run only ever sees what was registered here.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{builtin_backends, BackendFactory};
use crate::extension;
use crate::hooks::{self, Hook};
use crate::merge::Merger;
use crate::runner::Runner;
use crate::samples::DEFAULT_KIND;

#[derive(Clone)]
pub struct Registry {
    hooks: Vec<Hook>,
    runners: Vec<Runner>,
    merger: Merger,
    kind: String,
    backends: BTreeMap<String, BackendFactory>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("hooks", &self.hooks)
            .field("runners", &self.runners)
            .field("kind", &self.kind)
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            runners: Vec::new(),
            merger: Merger::default(),
            kind: DEFAULT_KIND.to_string(),
            backends: builtin_backends(),
        }
    }

    /// Registry holding the built-in backends plus the shell hooks and
    /// runners declared in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        extension::register_all(&mut registry, config)?;
        Ok(registry)
    }

    pub fn hook(&mut self, hook: Hook) -> &mut Self {
        self.hooks.push(hook);
        self
    }

    pub fn runner(&mut self, runner: Runner) -> &mut Self {
        self.runners.push(runner);
        self
    }

    pub fn backend(&mut self, name: impl Into<String>, factory: BackendFactory) -> &mut Self {
        self.backends.insert(name.into(), factory);
        self
    }

    /// Merge strategy for one metadata key.
    pub fn merge_strategy<F>(&mut self, key: &str, strategy: F) -> &mut Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.merger.register_metadata(key, strategy);
        self
    }

    /// Name of the data extension the run's collection is tagged with.
    pub fn kind(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kind = kind.into();
        self
    }

    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    pub fn runners(&self) -> &[Runner] {
        &self.runners
    }

    pub fn merger(&self) -> &Merger {
        &self.merger
    }

    pub fn collection_kind(&self) -> &str {
        &self.kind
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }

    pub fn find_backend(&self, name: &str) -> Result<BackendFactory> {
        self.backends.get(name).cloned().ok_or_else(|| {
            Error::extension_not_found("executor", name)
                .with_hint(format!("Available executors: {}", self.backend_names().join(", ")))
        })
    }

    /// Hooks in execution order, plus warnings about dangling references.
    pub fn resolve_hooks(&self) -> Result<(Vec<Hook>, Vec<String>)> {
        hooks::resolve(&self.hooks)
    }
}
