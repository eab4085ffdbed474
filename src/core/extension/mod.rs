//! Declarative shell extensions.
//!
//! Hooks and runners listed under `hooks:` / `runners:` in the run config are
//! turned into [`Hook`]s and [`Runner`]s whose bodies run a templated shell
//! command through the executor.

mod shell;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hooks::{Hook, HookCondition, HookStage};
use crate::output::OutputGlob;
use crate::registry::Registry;
use crate::runner::Runner;

/// `before:` / `after:` accept a single label or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Constraint {
    One(String),
    Many(Vec<String>),
}

impl Default for Constraint {
    fn default() -> Self {
        Constraint::Many(Vec::new())
    }
}

impl Constraint {
    pub fn labels(&self) -> Vec<String> {
        match self {
            Constraint::One(label) => vec![label.clone()],
            Constraint::Many(labels) => labels.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Constraint::Many(labels) if labels.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    pub label: String,
    pub stage: HookStage,
    #[serde(default)]
    pub condition: HookCondition,
    #[serde(default, skip_serializing_if = "Constraint::is_empty")]
    pub before: Constraint,
    #[serde(default, skip_serializing_if = "Constraint::is_empty")]
    pub after: Constraint,
    pub command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSpec {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_by: Option<String>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputGlob>,
    /// Skip the partition when this checkpoint is up to date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl HookSpec {
    pub fn build(&self) -> Result<Hook> {
        require_command(&self.label, &self.command, "hooks")?;
        let spec = Arc::new(self.clone());
        let mut hook = Hook::new(self.label.clone(), self.stage, move |ctx| {
            shell::run_hook(&spec, ctx)
        })
        .condition(self.condition);
        for label in self.before.labels() {
            hook = hook.before(label);
        }
        for label in self.after.labels() {
            hook = hook.after(label);
        }
        hook.edges()?;
        Ok(hook)
    }
}

impl RunnerSpec {
    pub fn build(&self) -> Result<Runner> {
        require_command(&self.label, &self.command, "runners")?;
        let spec = Arc::new(self.clone());
        let runner = Runner::new(self.label.clone(), move |ctx| shell::run_runner(&spec, ctx));
        Ok(match &self.split_by {
            Some(key) => runner.split_by(key.clone()),
            None => runner,
        })
    }
}

fn require_command(label: &str, command: &str, section: &str) -> Result<()> {
    if label.trim().is_empty() {
        return Err(Error::config_missing_key(format!("{}[].label", section), None));
    }
    if command.trim().is_empty() {
        return Err(Error::config_invalid_value(
            format!("{}.{}.command", section, label),
            None,
            "command must not be empty",
        ));
    }
    Ok(())
}

/// Build every hook and runner declared in `config` into `registry`.
pub fn register_all(registry: &mut Registry, config: &Config) -> Result<()> {
    for spec in &config.hooks {
        registry.hook(spec.build()?);
        tracing::debug!(label = %spec.label, stage = spec.stage.as_str(), "Registered shell hook");
    }

    let mut seen = HashSet::new();
    for spec in &config.runners {
        if !seen.insert(spec.label.as_str()) {
            return Err(Error::validation_invalid_argument(
                "runners",
                format!("Duplicate runner label '{}'", spec.label),
                Some(spec.label.clone()),
                None,
            ));
        }
        registry.runner(spec.build()?);
        tracing::debug!(label = %spec.label, split_by = ?spec.split_by, "Registered shell runner");
    }
    Ok(())
}
