//! One run: load samples, pre-hooks, runner dispatch, post-hooks, output
//! check and cleanup. Also the dry `plan` view of the same steps.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::cleanup::{Cleaner, CleanupSummary};
use crate::config::Config;
use crate::engine::CancelToken;
use crate::error::Result;
use crate::hooks::{run_hooks, Hook, HookCondition, HookEnv, HookStage};
use crate::output::OutputDecl;
use crate::registry::Registry;
use crate::runner::{start_runners, DispatchEnv, RunnerSummary};
use crate::samples::Samples;
use crate::utils::io;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tag: String,
    pub status: RunStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Samples present at the end that were not in the loaded set.
    pub extra: usize,
    pub runners: Vec<RunnerSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_hooks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub cleanup: CleanupSummary,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub samples: Samples,
    pub report: RunReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedHook {
    pub label: String,
    pub stage: HookStage,
    pub condition: HookCondition,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedPartition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_value: Option<String>,
    pub workdir: PathBuf,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedRunner {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_by: Option<String>,
    pub partitions: Vec<PlannedPartition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub tag: String,
    pub executor: String,
    pub samples: usize,
    pub hooks: Vec<PlannedHook>,
    pub runners: Vec<PlannedRunner>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Samples from `config.samples_file`, or an empty collection.
pub fn load_samples(config: &Config, kind: &str) -> Result<Samples> {
    match &config.samples_file {
        Some(path) => {
            let samples = Samples::from_manifest(path, kind)?;
            tracing::info!(path = %path.display(), count = samples.len(), "Loaded samples");
            Ok(samples)
        }
        None => {
            tracing::warn!("No samples file configured, starting with an empty collection");
            Ok(Samples::default().with_kind(kind))
        }
    }
}

/// Resolve everything a run would do without executing anything.
pub fn plan(registry: &Registry, config: &Config) -> Result<RunPlan> {
    registry.find_backend(&config.executor.name)?;
    let (hooks, warnings) = registry.resolve_hooks()?;
    let samples = load_samples(config, registry.collection_kind())?;

    let runners = registry
        .runners()
        .iter()
        .map(|runner| PlannedRunner {
            label: runner.label.clone(),
            split_by: runner.split_by.clone(),
            partitions: runner
                .partitions(&samples, config)
                .into_iter()
                .map(|p| PlannedPartition {
                    split_value: p.split_value,
                    workdir: p.workdir,
                    samples: p.samples.unique_ids(),
                })
                .collect(),
        })
        .collect();

    Ok(RunPlan {
        tag: config.tag.clone(),
        executor: config.executor.name.clone(),
        samples: samples.len(),
        hooks: hooks.iter().map(planned_hook).collect(),
        runners,
        warnings,
    })
}

fn planned_hook(hook: &Hook) -> PlannedHook {
    PlannedHook {
        label: hook.label.clone(),
        stage: hook.stage,
        condition: hook.condition,
    }
}

/// Execute a full run. Only invalid hook constraints, an unknown executor,
/// and config or manifest errors are returned as `Err`; everything else
/// ends up on the samples and in the report.
pub fn run(registry: &Registry, config: Arc<Config>, cancel: &CancelToken) -> Result<RunOutcome> {
    let started = Instant::now();
    let backend = registry.find_backend(&config.executor.name)?;
    let (hooks, mut warnings) = registry.resolve_hooks()?;
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }
    let samples = load_samples(&config, registry.collection_kind())?;
    let original = samples.uuids();

    let run_dir = config.run_dir();
    io::ensure_dir(&run_dir, "create run directory")?;
    let mut cleaner = Cleaner::new(&run_dir);
    cleaner.register(&run_dir, false)?;

    let timestamp = config.tag.clone();
    let mut failed_hooks = Vec::new();
    let mut runners = Vec::new();

    let pre = run_hooks(
        &hooks,
        HookStage::Pre,
        samples,
        &mut HookEnv {
            config: &config,
            backend: &backend,
            cleaner: &mut cleaner,
            cancel,
            timestamp: &timestamp,
        },
    );
    failed_hooks.extend(pre.failed);
    let mut samples = pre.samples;
    let mut interrupted = pre.interrupted;

    if !interrupted {
        validate_files(&mut samples);

        let pending = samples.unprocessed();
        let dispatch = start_runners(
            registry.runners(),
            pending,
            &mut DispatchEnv {
                config: &config,
                backend: &backend,
                merger: registry.merger(),
                cleaner: &mut cleaner,
                cancel,
                timestamp: &timestamp,
            },
        );
        interrupted = dispatch.interrupted;
        if let Some(reason) = dispatch.aborted {
            warnings.push(format!("Runner dispatch aborted: {}", reason));
        }
        runners = dispatch.runners;
        samples = samples.union(&dispatch.samples);
    }

    if !interrupted {
        for sample in samples.iter_mut().filter(|s| s.is_unprocessed()) {
            sample.fail("Sample was not processed");
        }
        let post = run_hooks(
            &hooks,
            HookStage::Post,
            samples,
            &mut HookEnv {
                config: &config,
                backend: &backend,
                cleaner: &mut cleaner,
                cancel,
                timestamp: &timestamp,
            },
        );
        failed_hooks.extend(post.failed);
        samples = post.samples;
        interrupted = post.interrupted;
    }

    warnings.extend(missing_outputs(&samples));

    let failed = samples.failed().len();
    if failed > 0 || !config.clean || interrupted {
        cleaner.unregister(&run_dir);
    }
    let cleanup = cleaner.clean();
    for error in &cleanup.errors {
        tracing::warn!("Cleanup failed: {}", error);
    }

    let completed = samples.complete().len();
    let status = if interrupted {
        RunStatus::Interrupted
    } else if failed == 0 {
        RunStatus::Success
    } else if completed == 0 {
        RunStatus::Failed
    } else {
        RunStatus::PartialSuccess
    };
    let report = RunReport {
        tag: config.tag.clone(),
        status,
        total: samples.len(),
        completed,
        failed,
        extra: samples.iter().filter(|s| !original.contains(&s.uuid())).count(),
        runners,
        failed_hooks,
        warnings,
        cleanup,
        elapsed_secs: started.elapsed().as_secs_f64(),
    };
    tracing::info!(
        status = ?report.status,
        completed = report.completed,
        failed = report.failed,
        extra = report.extra,
        elapsed = report.elapsed_secs,
        "Run finished"
    );

    Ok(RunOutcome { samples, report })
}

/// Fail samples whose files are not all present before any runner sees them.
fn validate_files(samples: &mut Samples) {
    for sample in samples.iter_mut().filter(|s| s.is_unprocessed()) {
        let missing: Vec<String> = sample
            .missing_files()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        if missing.is_empty() {
            continue;
        }
        tracing::warn!(sample = %sample.id, missing = ?missing, "Sample files missing");
        sample.fail(format!("Missing files: {}", missing.join(", ")));
    }
}

fn missing_outputs(samples: &Samples) -> Vec<String> {
    let mut warnings = Vec::new();
    for decl in &samples.output {
        match decl {
            OutputDecl::Literal(output) if !output.optional && !output.dst.exists() => {
                warnings.push(format!(
                    "Output {} was not copied to {} (should be done by a post-hook)",
                    output.src.display(),
                    output.dst.display()
                ));
            }
            OutputDecl::Glob(glob) if !glob.optional => {
                warnings.push(format!("Output pattern '{}' was never resolved", glob.src));
            }
            _ => {}
        }
    }
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorCode};
    use crate::output::Output;
    use crate::runner::Runner;
    use crate::sample::Sample;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn setup(dir: &TempDir, ids: &[&str]) -> Config {
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let mut manifest = String::new();
        for id in ids {
            let file = data.join(format!("{}.fq", id));
            fs::write(&file, id).unwrap();
            manifest.push_str(&format!("- id: {}\n  files: [{}]\n", id, file.display()));
        }
        let manifest_path = dir.path().join("samples.yaml");
        fs::write(&manifest_path, manifest).unwrap();

        let mut config = Config::default();
        config.workdir = dir.path().join("work");
        config.samples_file = Some(manifest_path);
        config.tag = "run1".into();
        config.executor.name = "mock".into();
        config.workers = 2;
        config.executor.workers = 1;
        config.finalize(chrono::Local::now()).unwrap();
        config
    }

    #[test]
    fn failing_sample_is_isolated_and_post_hook_sees_complete() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(setup(&dir, &["a", "b", "c"]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_hook = Arc::clone(&seen);

        let mut registry = Registry::new();
        registry
            .runner(
                Runner::new("align", |ctx| {
                    let mut samples = ctx.samples;
                    for s in samples.iter_mut().filter(|s| s.id == "b") {
                        s.fail("bad reads");
                    }
                    Ok(Some(samples))
                })
                .split_by("id"),
            )
            .hook(
                Hook::post("report", move |ctx| {
                    *seen_by_hook.lock().unwrap() = ctx.samples.unique_ids();
                    Ok(None)
                })
                .condition(HookCondition::Complete),
            );

        let out = run(&registry, config, &CancelToken::new()).unwrap();
        assert_eq!(out.samples.complete().unique_ids(), vec!["a", "c"]);
        assert_eq!(out.samples.failed().unique_ids(), vec!["b"]);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "c"]);
        assert_eq!(out.report.status, RunStatus::PartialSuccess);
        assert_eq!(out.report.runners[0].failed, 1);
    }

    #[test]
    fn pre_hook_failure_skips_runners() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(setup(&dir, &["a", "b"]));
        let mut registry = Registry::new();
        registry
            .hook(Hook::pre("fetch", |_| Err(Error::hook_failed("fetch", "offline"))))
            .runner(Runner::new("align", |_| panic!("must not run")));

        let out = run(&registry, config, &CancelToken::new()).unwrap();
        assert_eq!(out.report.failed, 2);
        assert_eq!(out.report.failed_hooks, vec!["fetch"]);
        assert!(out.samples.samples[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("Hook fetch failed"));
    }

    #[test]
    fn missing_files_fail_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir, &["a", "b"]);
        fs::remove_file(dir.path().join("data/b.fq")).unwrap();
        let mut registry = Registry::new();
        registry.runner(Runner::new("align", |ctx| Ok(Some(ctx.samples))));

        let out = run(&registry, Arc::new(config), &CancelToken::new()).unwrap();
        let failed = out.samples.failed();
        let b = &failed.samples[0];
        assert_eq!(b.id, "b");
        assert!(b.failure_reason.as_deref().unwrap().starts_with("Missing files"));
        assert_eq!(out.samples.complete().unique_ids(), vec!["a"]);
    }

    #[test]
    fn cycle_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(setup(&dir, &["a"]));
        let mut registry = Registry::new();
        registry
            .hook(Hook::pre("x", |_| Ok(None)).before("y"))
            .hook(Hook::pre("y", |_| Ok(None)).before("x"));
        let err = run(&registry, config, &CancelToken::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::HookCycle);
    }

    #[test]
    fn unresolved_outputs_are_reported() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(setup(&dir, &["a"]));
        let mut registry = Registry::new();
        registry.runner(Runner::new("align", |ctx| {
            let mut samples = ctx.samples;
            samples.add_output(Output::new(ctx.workdir.join("a.bam"), "/nowhere/a.bam"));
            Ok(Some(samples))
        }));
        let out = run(&registry, config, &CancelToken::new()).unwrap();
        assert!(out.report.warnings.iter().any(|w| w.contains("post-hook")));
    }

    #[test]
    fn clean_run_removes_scratch() {
        let dir = TempDir::new().unwrap();
        let mut config = setup(&dir, &["a"]);
        config.clean = true;
        let run_dir = config.run_dir();
        let mut registry = Registry::new();
        registry.runner(Runner::new("align", |ctx| Ok(Some(ctx.samples))));

        let out = run(&registry, Arc::new(config), &CancelToken::new()).unwrap();
        assert_eq!(out.report.status, RunStatus::Success);
        assert!(!run_dir.exists());
    }

    #[test]
    fn plan_lists_partitions_without_running() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir, &["a", "b"]);
        let mut registry = Registry::new();
        registry
            .runner(Runner::new("align", |_| panic!("must not run")).split_by("id"))
            .hook(Hook::post("report", |_| Ok(None)));

        let plan = plan(&registry, &config).unwrap();
        assert_eq!(plan.samples, 2);
        assert_eq!(plan.runners[0].partitions.len(), 2);
        assert_eq!(plan.runners[0].partitions[1].samples, vec!["b"]);
        assert_eq!(plan.hooks[0].label, "report");
        assert!(!config.run_dir().exists());
    }

    #[test]
    fn samples_without_manifest_start_empty() {
        let mut config = Config::default();
        config.samples_file = None;
        let samples = load_samples(&config, "reads").unwrap();
        assert!(samples.is_empty());
        assert_eq!(samples.kind, "reads");
    }

    #[test]
    fn extra_samples_counted_against_manifest() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(setup(&dir, &["a"]));
        let mut registry = Registry::new();
        registry.runner(Runner::new("demux", |ctx| {
            let mut samples = ctx.samples;
            samples.push(Sample::new("a_2", Vec::<PathBuf>::new()));
            Ok(Some(samples))
        }));
        let out = run(&registry, config, &CancelToken::new()).unwrap();
        assert_eq!(out.report.extra, 1);
        assert_eq!(out.report.total, 2);
    }
}
