//! Pre/post lifecycle hooks around the runner phase.
//!
//! Hooks declare `before`/`after` constraints on other hook labels, or on
//! everything via [`Hook::before_all`] / [`Hook::after_all`]. "Everything"
//! is modelled with two synthetic nodes: unconstrained hooks sit after
//! `before_all` and before `after_all`, so a hook placed before
//! `before_all` precedes all of them.
//!
//! Pre-hooks see the whole collection. A pre-hook error fails every current
//! sample and skips the remaining pre-hooks. Post-hooks see the subset named
//! by their [`HookCondition`]; an error marks that subset failed and the
//! next post-hook still runs. Cancellation stops either stage with the last
//! good collection.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cleanup::Cleaner;
use crate::config::Config;
use crate::engine::pool::panic_message;
use crate::engine::CancelToken;
use crate::error::{Error, Result};
use crate::executor::{BackendFactory, Executor};
use crate::samples::Samples;
use crate::utils::io;

pub const BEFORE_ALL: &str = "before_all";
pub const AFTER_ALL: &str = "after_all";
const ALL: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStage {
    Pre,
    Post,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::Pre => "pre",
            HookStage::Post => "post",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookCondition {
    #[default]
    Always,
    Complete,
    Failed,
}

/// What a hook body receives.
pub struct HookContext<'a> {
    pub samples: Samples,
    pub config: &'a Config,
    /// `workdir/tag`
    pub workdir: PathBuf,
    pub executor: &'a Executor,
    pub cleaner: &'a mut Cleaner,
    pub cancel: &'a CancelToken,
    pub label: &'a str,
    pub timestamp: &'a str,
}

/// Return `Ok(None)` to leave the collection unchanged.
pub type HookFn = Arc<dyn Fn(HookContext<'_>) -> Result<Option<Samples>> + Send + Sync>;

#[derive(Clone)]
pub struct Hook {
    pub label: String,
    pub stage: HookStage,
    pub condition: HookCondition,
    before: Vec<String>,
    after: Vec<String>,
    body: HookFn,
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("label", &self.label)
            .field("stage", &self.stage)
            .field("condition", &self.condition)
            .field("before", &self.before)
            .field("after", &self.after)
            .finish()
    }
}

impl Hook {
    pub fn new<F>(label: impl Into<String>, stage: HookStage, body: F) -> Self
    where
        F: Fn(HookContext<'_>) -> Result<Option<Samples>> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            stage,
            condition: HookCondition::Always,
            before: Vec::new(),
            after: Vec::new(),
            body: Arc::new(body),
        }
    }

    pub fn pre<F>(label: impl Into<String>, body: F) -> Self
    where
        F: Fn(HookContext<'_>) -> Result<Option<Samples>> + Send + Sync + 'static,
    {
        Self::new(label, HookStage::Pre, body)
    }

    pub fn post<F>(label: impl Into<String>, body: F) -> Self
    where
        F: Fn(HookContext<'_>) -> Result<Option<Samples>> + Send + Sync + 'static,
    {
        Self::new(label, HookStage::Post, body)
    }

    pub fn condition(mut self, condition: HookCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Run before the hook labelled `other`. `"all"` means every hook.
    pub fn before(mut self, other: impl Into<String>) -> Self {
        self.before.push(other.into());
        self
    }

    /// Run after the hook labelled `other`. `"all"` means every hook.
    pub fn after(mut self, other: impl Into<String>) -> Self {
        self.after.push(other.into());
        self
    }

    pub fn before_all(self) -> Self {
        self.before(ALL)
    }

    pub fn after_all(self) -> Self {
        self.after(ALL)
    }

    /// Effective `(before, after)` node lists with "all" mapped onto the
    /// synthetic nodes.
    pub fn edges(&self) -> Result<(Vec<String>, Vec<String>)> {
        let before_all = self.before.iter().any(|b| b == ALL);
        let after_all = self.after.iter().any(|a| a == ALL);
        let named = |list: &[String]| -> Vec<String> {
            list.iter().filter(|l| *l != ALL).cloned().collect()
        };
        let mut before = named(self.before.as_slice());
        let mut after = named(self.after.as_slice());

        match (before_all, after_all) {
            (true, true) => {
                return Err(Error::hook_invalid_constraint(
                    &self.label,
                    "cannot be both before and after all hooks",
                ))
            }
            (true, false) => before.insert(0, BEFORE_ALL.to_string()),
            (false, true) => after.push(AFTER_ALL.to_string()),
            (false, false) => {
                before.push(AFTER_ALL.to_string());
                after.push(BEFORE_ALL.to_string());
            }
        }
        Ok((before, after))
    }
}

/// Order hooks so every `before`/`after` constraint holds.
///
/// Ties resolve by label, so the order is stable for a given hook set.
/// References to labels that are not registered are kept as ordering
/// points and reported as warnings.
pub fn resolve(hooks: &[Hook]) -> Result<(Vec<Hook>, Vec<String>)> {
    let mut by_label: BTreeMap<&str, &Hook> = BTreeMap::new();
    for hook in hooks {
        if hook.label == BEFORE_ALL || hook.label == AFTER_ALL || hook.label == ALL {
            return Err(Error::hook_invalid_constraint(
                &hook.label,
                "label is reserved",
            ));
        }
        if by_label.insert(hook.label.as_str(), hook).is_some() {
            return Err(Error::hook_duplicate_label(&hook.label));
        }
    }

    // node -> nodes that must precede it
    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut warnings = Vec::new();
    for hook in hooks {
        let (before, after) = hook.edges()?;
        deps.entry(hook.label.clone()).or_default();
        for target in before {
            warn_unknown(&by_label, &hook.label, &target, &mut warnings);
            deps.entry(target).or_default().insert(hook.label.clone());
        }
        for source in after {
            warn_unknown(&by_label, &hook.label, &source, &mut warnings);
            deps.entry(source.clone()).or_default();
            deps.entry(hook.label.clone()).or_default().insert(source);
        }
    }

    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (node, preceding) in &deps {
        indegree.insert(node.as_str(), preceding.len());
        for parent in preceding {
            dependents.entry(parent.as_str()).or_default().push(node.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut order: Vec<&str> = Vec::with_capacity(deps.len());
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &child in dependents.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(count) = indegree.get_mut(child) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    if order.len() != deps.len() {
        let pending: Vec<String> = indegree
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(node, _)| node.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        return Err(Error::hook_cycle(pending));
    }

    let ordered = order
        .into_iter()
        .filter_map(|node| by_label.get(node).map(|hook| (*hook).clone()))
        .collect();
    Ok((ordered, warnings))
}

fn warn_unknown(
    known: &BTreeMap<&str, &Hook>,
    label: &str,
    target: &str,
    warnings: &mut Vec<String>,
) {
    if target != BEFORE_ALL && target != AFTER_ALL && !known.contains_key(target) {
        warnings.push(format!(
            "Hook '{}' references unknown hook '{}'",
            label, target
        ));
    }
}

/// Shared resources for running one stage of hooks.
pub struct HookEnv<'a> {
    pub config: &'a Arc<Config>,
    pub backend: &'a BackendFactory,
    pub cleaner: &'a mut Cleaner,
    pub cancel: &'a CancelToken,
    pub timestamp: &'a str,
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub samples: Samples,
    pub failed: Vec<String>,
    pub interrupted: bool,
}

/// Run every hook of `stage`, in the given (already resolved) order.
pub fn run_hooks(
    hooks: &[Hook],
    stage: HookStage,
    samples: Samples,
    env: &mut HookEnv<'_>,
) -> StageOutcome {
    let mut outcome = StageOutcome {
        samples,
        failed: Vec::new(),
        interrupted: false,
    };

    for hook in hooks.iter().filter(|h| h.stage == stage) {
        match stage {
            HookStage::Pre => {
                let input = outcome.samples.clone();
                match invoke(hook, input, env) {
                    Ok(samples) => outcome.samples = samples,
                    Err(err) => {
                        let interrupted = err.is_interrupt() || env.cancel.is_cancelled();
                        let reason = if interrupted {
                            tracing::warn!(label = %hook.label, "Pre-hook interrupted, failing all samples");
                            format!("Hook {} interrupted", hook.label)
                        } else {
                            tracing::error!(label = %hook.label, error = %err.reason(), "Pre-hook failed");
                            format!("Hook {} failed: {}", hook.label, err.reason())
                        };
                        outcome.samples.fail_all(&reason);
                        outcome.failed.push(hook.label.clone());
                        outcome.interrupted = interrupted;
                        break;
                    }
                }
            }
            HookStage::Post => {
                let (subset, mut complement) = match hook.condition {
                    HookCondition::Always => (outcome.samples.clone(), Samples {
                        samples: Vec::new(),
                        ..outcome.samples.clone()
                    }),
                    HookCondition::Complete => {
                        (outcome.samples.complete(), outcome.samples.failed())
                    }
                    HookCondition::Failed => {
                        (outcome.samples.failed(), outcome.samples.complete())
                    }
                };
                // outputs after the hook are whatever the subset comes back with
                complement.clear_outputs();
                if hook.condition != HookCondition::Always && subset.is_empty() {
                    tracing::debug!(label = %hook.label, "No matching samples, skipping post-hook");
                    continue;
                }

                match invoke(hook, subset.clone(), env) {
                    Ok(result) => outcome.samples = result.union(&complement),
                    Err(err) if err.is_interrupt() || env.cancel.is_cancelled() => {
                        tracing::warn!(label = %hook.label, "Post-hook interrupted, stopping");
                        outcome.failed.push(hook.label.clone());
                        outcome.interrupted = true;
                        break;
                    }
                    Err(err) => {
                        tracing::error!(label = %hook.label, error = %err.reason(), "Post-hook failed");
                        let mut failed = subset;
                        failed.fail_all(&format!("Hook {} failed: {}", hook.label, err.reason()));
                        outcome.samples = failed.union(&complement);
                        outcome.failed.push(hook.label.clone());
                    }
                }
            }
        }
    }
    outcome
}

fn invoke(hook: &Hook, samples: Samples, env: &mut HookEnv<'_>) -> Result<Samples> {
    env.cancel.check(&hook.label)?;
    tracing::info!(label = %hook.label, stage = hook.stage.as_str(), samples = samples.len(), "Running hook");

    let workdir = env.config.run_dir();
    io::ensure_dir(&workdir, "create hook workdir")?;
    let executor = Executor::new(
        &hook.label,
        &workdir,
        Arc::clone(env.config),
        (env.backend)(env.config.as_ref()),
        env.cancel,
    )?;

    let fallback = samples.clone();
    let ctx = HookContext {
        samples,
        config: env.config.as_ref(),
        workdir,
        executor: &executor,
        cleaner: &mut *env.cleaner,
        cancel: env.cancel,
        label: &hook.label,
        timestamp: env.timestamp,
    };
    let result = catch_unwind(AssertUnwindSafe(|| (hook.body)(ctx)));
    executor.terminate();

    let returned = match result {
        Ok(result) => result?,
        Err(payload) => {
            return Err(Error::hook_failed(
                &hook.label,
                format!("panicked: {}", panic_message(payload.as_ref())),
            ))
        }
    };
    env.cancel.check(&hook.label)?;

    match returned {
        Some(samples) => Ok(samples),
        None => {
            tracing::debug!(label = %hook.label, "Hook did not return samples");
            Ok(fallback)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::builtin_backends;
    use crate::output::Output;
    use crate::sample::Sample;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn noop(label: &str) -> Hook {
        Hook::pre(label, |_| Ok(None))
    }

    fn labels(hooks: &[Hook]) -> Vec<&str> {
        hooks.iter().map(|h| h.label.as_str()).collect()
    }

    fn position(order: &[&str], label: &str) -> usize {
        order.iter().position(|l| *l == label).unwrap()
    }

    #[test]
    fn cycle_is_an_error() {
        let hooks = vec![noop("a").before("b"), noop("b").before("a")];
        let err = resolve(&hooks).unwrap_err();
        assert_eq!(err.code.as_str(), "hook.cycle");
        assert!(err.details["pending"].as_array().unwrap().len() >= 2);
    }

    #[test]
    fn before_all_and_explicit_edges_are_honored() {
        for _ in 0..20 {
            let hooks = vec![
                noop("a"),
                noop("b").before("a"),
                noop("x"),
                noop("c").before_all(),
            ];
            let (ordered, warnings) = resolve(&hooks).unwrap();
            let order = labels(&ordered);
            assert!(warnings.is_empty());
            assert_eq!(order.len(), 4);
            assert!(position(&order, "c") < position(&order, "a"));
            assert!(position(&order, "c") < position(&order, "b"));
            assert!(position(&order, "c") < position(&order, "x"));
            assert!(position(&order, "b") < position(&order, "a"));
        }
    }

    #[test]
    fn registration_order_does_not_matter() {
        let forward = vec![noop("z").after_all(), noop("m"), noop("a").before_all()];
        let mut backward = forward.clone();
        backward.reverse();
        let (f, _) = resolve(&forward).unwrap();
        let (b, _) = resolve(&backward).unwrap();
        assert_eq!(labels(&f), vec!["a", "m", "z"]);
        assert_eq!(labels(&f), labels(&b));
    }

    #[test]
    fn both_all_constraints_are_rejected() {
        let hooks = vec![noop("a").before_all().after_all()];
        let err = resolve(&hooks).unwrap_err();
        assert_eq!(err.code.as_str(), "hook.invalid_constraint");
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let err = resolve(&[noop("a"), noop("a")]).unwrap_err();
        assert_eq!(err.code.as_str(), "hook.duplicate_label");
    }

    #[test]
    fn unknown_reference_is_a_warning() {
        let (ordered, warnings) = resolve(&[noop("a").after("ghost")]).unwrap();
        assert_eq!(labels(&ordered), vec!["a"]);
        assert_eq!(warnings.len(), 1);
    }

    struct Fixture {
        _dir: TempDir,
        config: Arc<Config>,
        backend: BackendFactory,
        cleaner: Cleaner,
        cancel: CancelToken,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = Config::default();
            config.workdir = dir.path().to_path_buf();
            config.logdir = dir.path().join("logs");
            config.tag = "t".to_string();
            config.executor.workers = 1;
            let cleaner = Cleaner::new(config.run_dir());
            Self {
                _dir: dir,
                config: Arc::new(config),
                backend: builtin_backends()["mock"].clone(),
                cleaner,
                cancel: CancelToken::new(),
            }
        }

        fn run(&mut self, hooks: &[Hook], stage: HookStage, samples: Samples) -> StageOutcome {
            let mut env = HookEnv {
                config: &self.config,
                backend: &self.backend,
                cleaner: &mut self.cleaner,
                cancel: &self.cancel,
                timestamp: "t",
            };
            run_hooks(hooks, stage, samples, &mut env)
        }
    }

    fn collection() -> Samples {
        let mut a = Sample::new("a", Vec::<PathBuf>::new());
        a.processed = true;
        let b = Sample::new("b", Vec::<PathBuf>::new());
        let mut c = Sample::new("c", Vec::<PathBuf>::new());
        c.processed = true;
        Samples::new(vec![a, b, c])
    }

    #[test]
    fn pre_hook_failure_fails_all_and_stops_stage() {
        let mut fx = Fixture::new();
        let ran = Arc::new(Mutex::new(false));
        let r = Arc::clone(&ran);
        let hooks = vec![
            Hook::pre("broken", |_| Err(Error::hook_failed("broken", "no reference genome"))),
            Hook::pre("later", move |_| {
                *r.lock().unwrap() = true;
                Ok(None)
            })
            .after("broken"),
        ];
        let (hooks, _) = resolve(&hooks).unwrap();

        let out = fx.run(&hooks, HookStage::Pre, collection());
        assert_eq!(out.failed, vec!["broken"]);
        assert!(!*ran.lock().unwrap());
        assert!(out.samples.iter().all(|s| s
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("Hook broken failed:")));
    }

    #[test]
    fn pre_hook_panic_is_a_failure() {
        let mut fx = Fixture::new();
        let hooks = vec![Hook::pre("panicky", |_| panic!("bad input"))];
        let out = fx.run(&hooks, HookStage::Pre, collection());
        assert!(out.samples.iter().all(|s| s.failure_reason.is_some()));
        assert!(!out.interrupted);
    }

    #[test]
    fn pre_hook_replacement_is_used() {
        let mut fx = Fixture::new();
        let hooks = vec![Hook::pre("add", |ctx| {
            let mut samples = ctx.samples;
            samples.push(Sample::new("new", Vec::<PathBuf>::new()));
            Ok(Some(samples))
        })];
        let out = fx.run(&hooks, HookStage::Pre, collection());
        assert_eq!(out.samples.unique_ids(), vec!["a", "b", "c", "new"]);
    }

    #[test]
    fn post_hook_sees_only_its_condition_subset() {
        let mut fx = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let hooks = vec![Hook::post("report", move |ctx| {
            *s.lock().unwrap() = ctx.samples.unique_ids();
            Ok(None)
        })
        .condition(HookCondition::Complete)];

        let out = fx.run(&hooks, HookStage::Post, collection());
        assert_eq!(*seen.lock().unwrap(), vec!["a", "c"]);
        assert_eq!(out.samples.len(), 3);
    }

    fn with_output(mut samples: Samples) -> Samples {
        samples.add_output(Output::new("/w/a.bam", "/r/a.bam"));
        samples
    }

    #[test]
    fn post_hook_can_strip_outputs() {
        let mut fx = Fixture::new();
        let strip = |ctx: HookContext<'_>| {
            let mut samples = ctx.samples;
            samples.clear_outputs();
            Ok(Some(samples))
        };

        let always = vec![Hook::post("deliver", strip)];
        let out = fx.run(&always, HookStage::Post, with_output(collection()));
        assert!(out.samples.output.is_empty());
        assert_eq!(out.samples.len(), 3);

        let complete = vec![Hook::post("deliver", strip).condition(HookCondition::Complete)];
        let out = fx.run(&complete, HookStage::Post, with_output(collection()));
        assert!(out.samples.output.is_empty());
        assert_eq!(out.samples.unique_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn post_hook_without_result_keeps_outputs() {
        let mut fx = Fixture::new();
        let hooks = vec![
            Hook::post("noop", |_| Ok(None)).condition(HookCondition::Failed),
            Hook::post("broken", |_| Err(Error::hook_failed("broken", "disk full")))
                .condition(HookCondition::Complete),
        ];
        let (hooks, _) = resolve(&hooks).unwrap();
        let out = fx.run(&hooks, HookStage::Post, with_output(collection()));
        assert_eq!(out.samples.output.len(), 1);
        assert_eq!(out.failed, vec!["broken"]);
    }

    #[test]
    fn post_hook_failure_marks_subset_and_continues() {
        let mut fx = Fixture::new();
        let ran = Arc::new(Mutex::new(false));
        let r = Arc::clone(&ran);
        let hooks = vec![
            Hook::post("deliver", |_| Err(Error::hook_failed("deliver", "disk full")))
                .condition(HookCondition::Complete),
            Hook::post("notify", move |_| {
                *r.lock().unwrap() = true;
                Ok(None)
            })
            .after("deliver"),
        ];
        let (hooks, _) = resolve(&hooks).unwrap();

        let out = fx.run(&hooks, HookStage::Post, collection());
        assert!(*ran.lock().unwrap());
        assert_eq!(out.samples.len(), 3);
        assert!(out.samples.complete().is_empty());
        assert_eq!(out.failed, vec!["deliver"]);
    }

    #[test]
    fn failed_condition_skips_when_nothing_failed() {
        let mut fx = Fixture::new();
        let mut all_ok = collection();
        all_ok.mark_processed();
        let hooks = vec![Hook::post("on_failure", |_| panic!("should not run"))
            .condition(HookCondition::Failed)];
        let out = fx.run(&hooks, HookStage::Post, all_ok);
        assert!(out.failed.is_empty());
    }

    #[test]
    fn cancelled_post_stage_keeps_last_good_collection() {
        let mut fx = Fixture::new();
        let token = fx.cancel.clone();
        let hooks = vec![
            Hook::post("first", move |ctx| {
                token.cancel();
                let mut samples = ctx.samples;
                samples.fail_all("should be discarded");
                Ok(Some(samples))
            }),
            Hook::post("second", |_| panic!("should not run")).after("first"),
        ];
        let (hooks, _) = resolve(&hooks).unwrap();
        let input = collection();
        let out = fx.run(&hooks, HookStage::Post, input.clone());
        assert!(out.interrupted);
        assert_eq!(out.samples, input);
    }
}
