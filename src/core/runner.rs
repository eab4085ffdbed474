//! Runner dispatch.
//!
//! Every partition of every runner is executed on a bounded worker pool.
//! Partitions cross the pool boundary only as JSON snapshots, so no
//! `Samples` value is shared between workers. Results are folded back with
//! the merge operator in submission order.

use serde::Serialize;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::checkpoint::Checkpoints;
use crate::cleanup::{Cleaner, DeferredCleaner};
use crate::config::Config;
use crate::engine::pool::panic_message;
use crate::engine::{CancelToken, WorkerPool};
use crate::error::{ErrorCode, Result};
use crate::executor::{BackendFactory, Executor};
use crate::merge::Merger;
use crate::output::{OutputDecl, ResolveScope};
use crate::samples::{Samples, UNKNOWN_SPLIT};
use crate::utils::io;

const COLLECT_POLL: Duration = Duration::from_millis(100);

/// What a runner body receives for one partition.
pub struct RunnerContext<'a> {
    pub samples: Samples,
    pub config: &'a Config,
    /// `workdir/tag/label[/split value]`
    pub workdir: PathBuf,
    pub executor: &'a Executor,
    pub checkpoints: &'a mut Checkpoints,
    pub cleaner: &'a mut DeferredCleaner,
    pub cancel: &'a CancelToken,
    pub label: &'a str,
    pub timestamp: &'a str,
    pub split_value: Option<&'a str>,
}

pub type RunnerFn = Arc<dyn Fn(RunnerContext<'_>) -> Result<Option<Samples>> + Send + Sync>;

#[derive(Clone)]
pub struct Runner {
    pub label: String,
    pub split_by: Option<String>,
    body: RunnerFn,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("label", &self.label)
            .field("split_by", &self.split_by)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub split_value: Option<String>,
    pub workdir: PathBuf,
    pub samples: Samples,
}

impl Runner {
    pub fn new<F>(label: impl Into<String>, body: F) -> Self
    where
        F: Fn(RunnerContext<'_>) -> Result<Option<Samples>> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            split_by: None,
            body: Arc::new(body),
        }
    }

    pub fn split_by(mut self, key: impl Into<String>) -> Self {
        self.split_by = Some(key.into());
        self
    }

    /// One partition per split value, or a single partition holding the
    /// whole collection when no split key is set.
    pub fn partitions(&self, samples: &Samples, config: &Config) -> Vec<Partition> {
        let base = config.run_dir().join(&self.label);
        match &self.split_by {
            None => vec![Partition {
                split_value: None,
                workdir: base,
                samples: samples.clone(),
            }],
            Some(key) => samples
                .split(Some(key))
                .into_iter()
                .map(|(value, group)| {
                    let dir = if value.is_empty() { UNKNOWN_SPLIT } else { value.as_str() };
                    Partition {
                        workdir: base.join(dir),
                        split_value: Some(value),
                        samples: group,
                    }
                })
                .collect(),
        }
    }
}

/// Per-runner counts relative to the dispatched sample set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerSummary {
    pub label: String,
    pub partitions: usize,
    pub completed: usize,
    pub failed: usize,
    pub extra: usize,
}

pub struct DispatchEnv<'a> {
    pub config: &'a Arc<Config>,
    pub backend: &'a BackendFactory,
    pub merger: &'a Merger,
    pub cleaner: &'a mut Cleaner,
    pub cancel: &'a CancelToken,
    pub timestamp: &'a str,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub samples: Samples,
    pub runners: Vec<RunnerSummary>,
    pub interrupted: bool,
    /// Set when dispatch was abandoned and the input returned unchanged.
    pub aborted: Option<String>,
}

impl DispatchOutcome {
    fn unchanged(samples: Samples) -> Self {
        Self {
            samples,
            runners: Vec::new(),
            interrupted: false,
            aborted: None,
        }
    }

    fn abort(samples: Samples, reason: String) -> Self {
        tracing::error!("Runner dispatch aborted: {}", reason);
        Self {
            aborted: Some(reason),
            ..Self::unchanged(samples)
        }
    }
}

struct PartitionTask {
    runner: Runner,
    snapshot: String,
    workdir: PathBuf,
    split_value: Option<String>,
    config: Arc<Config>,
    backend: BackendFactory,
    cancel: CancelToken,
    timestamp: String,
}

struct PartitionResult {
    index: usize,
    result: Result<(String, DeferredCleaner)>,
}

/// Run all runners over `samples` and fold their partitions together.
pub fn start_runners(runners: &[Runner], samples: Samples, env: &mut DispatchEnv<'_>) -> DispatchOutcome {
    if samples.is_empty() {
        tracing::warn!("No samples to process");
        return DispatchOutcome::unchanged(samples);
    }
    if runners.is_empty() {
        tracing::warn!("No runners to execute");
        let mut samples = samples;
        for sample in samples.iter_mut().filter(|s| s.is_unprocessed()) {
            sample.fail("Sample was not processed");
        }
        return DispatchOutcome::unchanged(samples);
    }

    let mut labels = Vec::new();
    let mut inputs = Vec::new();
    let mut tasks = Vec::new();
    let mut tokens = Vec::new();
    for runner in runners {
        for partition in runner.partitions(&samples, env.config) {
            let snapshot = match partition.samples.to_snapshot() {
                Ok(snapshot) => snapshot,
                Err(err) => return DispatchOutcome::abort(samples, err.reason()),
            };
            let token = env.cancel.child();
            tokens.push(token.clone());
            labels.push(runner.label.clone());
            inputs.push(partition.samples);
            tasks.push(PartitionTask {
                runner: runner.clone(),
                snapshot,
                workdir: partition.workdir,
                split_value: partition.split_value,
                config: Arc::clone(env.config),
                backend: Arc::clone(env.backend),
                cancel: token,
                timestamp: env.timestamp.to_string(),
            });
        }
    }

    let total = tasks.len();
    tracing::info!(runners = runners.len(), partitions = total, workers = env.config.workers, "Starting runners");

    let mut pool = match WorkerPool::new("runner", env.config.workers) {
        Ok(pool) => pool,
        Err(err) => return DispatchOutcome::abort(samples, err.reason()),
    };
    let (sender, receiver) = mpsc::channel::<PartitionResult>();
    for (index, task) in tasks.into_iter().enumerate() {
        let sender = sender.clone();
        let queued = pool.execute(move || {
            let result = run_partition(task);
            let _ = sender.send(PartitionResult { index, result });
        });
        if let Err(err) = queued {
            cancel_all(&tokens);
            return DispatchOutcome::abort(samples, err.reason());
        }
    }
    drop(sender);

    let mut results: Vec<Option<Samples>> = vec![None; total];
    let mut deferred: Vec<DeferredCleaner> = Vec::new();
    let mut received = 0;
    while received < total {
        if env.cancel.is_cancelled() {
            tracing::error!("Interrupted, telling runners to shut down");
            cancel_all(&tokens);
            pool.join();
            return DispatchOutcome {
                interrupted: true,
                ..DispatchOutcome::unchanged(samples)
            };
        }
        match receiver.recv_timeout(COLLECT_POLL) {
            Ok(PartitionResult { index, result }) => {
                received += 1;
                let label = &labels[index];
                let decoded = result.and_then(|(snapshot, cleaner)| {
                    Samples::from_snapshot(&snapshot).map(|samples| (samples, cleaner))
                });
                match decoded {
                    Ok((partition, cleaner)) => {
                        results[index] = Some(partition);
                        deferred.push(cleaner);
                    }
                    Err(err) => {
                        tracing::error!(label = %label, error = %err.reason(), "Partition could not run");
                        let mut failed = inputs[index].clone();
                        failed.clear_outputs();
                        failed.fail_all(&format!("Runner '{}' failed: {}", label, err.reason()));
                        results[index] = Some(failed);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    pool.join();

    if received < total {
        return DispatchOutcome::abort(
            samples,
            format!("collected {} of {} partition results", received, total),
        );
    }

    let original = samples.uuids();
    let mut summaries: Vec<RunnerSummary> = Vec::new();
    let mut merged: Option<Samples> = None;
    for (index, partition) in results.into_iter().enumerate() {
        let Some(partition) = partition else {
            return DispatchOutcome::abort(samples, format!("missing result for partition {}", index));
        };
        summarize(&mut summaries, &labels[index], &partition, &original);
        merged = match merged {
            None => Some(partition),
            Some(acc) => match acc.merge_with(&partition, env.merger) {
                Ok(next) => Some(next),
                Err(err) => return DispatchOutcome::abort(samples, err.reason()),
            },
        };
    }

    for cleaner in deferred {
        if let Err(err) = env.cleaner.apply(cleaner) {
            tracing::warn!(error = %err.reason(), "Ignoring cleanup registration");
        }
    }

    for summary in &summaries {
        tracing::info!(
            label = %summary.label,
            completed = summary.completed,
            failed = summary.failed,
            extra = summary.extra,
            "Runner finished"
        );
    }

    DispatchOutcome {
        samples: merged.unwrap_or(samples),
        runners: summaries,
        interrupted: false,
        aborted: None,
    }
}

fn cancel_all(tokens: &[CancelToken]) {
    for token in tokens {
        token.cancel();
    }
}

fn summarize(summaries: &mut Vec<RunnerSummary>, label: &str, partition: &Samples, original: &HashSet<Uuid>) {
    let index = match summaries.iter().position(|s| s.label == label) {
        Some(index) => index,
        None => {
            summaries.push(RunnerSummary {
                label: label.to_string(),
                ..Default::default()
            });
            summaries.len() - 1
        }
    };
    let summary = &mut summaries[index];
    summary.partitions += 1;
    for sample in partition {
        if !original.contains(&sample.uuid()) {
            summary.extra += 1;
        }
        if sample.is_complete() {
            summary.completed += 1;
        } else {
            summary.failed += 1;
        }
    }
}

/// Body of one pool task. Returns the encoded result collection and the
/// cleanup calls the body made.
fn run_partition(task: PartitionTask) -> Result<(String, DeferredCleaner)> {
    let label = task.runner.label.as_str();
    // still queued when the run was interrupted
    task.cancel.check(label)?;
    let mut samples = Samples::from_snapshot(&task.snapshot)?;
    io::ensure_dir(&task.workdir, "create runner workdir")?;

    let mut cleaner = DeferredCleaner::default();
    let mut checkpoints = Checkpoints::new(
        &task.workdir,
        &task.config.resultdir,
        task.config.template_vars(),
    );
    let executor = Executor::new(
        label,
        &task.workdir,
        Arc::clone(&task.config),
        (task.backend)(task.config.as_ref()),
        &task.cancel,
    )?;

    tracing::info!(label = %label, split = ?task.split_value, samples = samples.len(), "Runner started");
    let ctx = RunnerContext {
        samples: samples.clone(),
        config: task.config.as_ref(),
        workdir: task.workdir.clone(),
        executor: &executor,
        checkpoints: &mut checkpoints,
        cleaner: &mut cleaner,
        cancel: &task.cancel,
        label,
        timestamp: &task.timestamp,
        split_value: task.split_value.as_deref(),
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| (task.runner.body)(ctx)));

    let failure = match outcome {
        Ok(Ok(_)) if task.cancel.is_cancelled() => Some(format!("Runner '{}' interrupted", label)),
        Ok(Ok(returned)) => {
            match returned {
                Some(replacement) => samples = replacement,
                None => tracing::debug!(label = %label, "Runner did not return samples"),
            }
            samples.mark_processed();
            None
        }
        Ok(Err(err)) if err.is_interrupt() => Some(format!("Runner '{}' interrupted", label)),
        Ok(Err(err)) if err.code == ErrorCode::RunnerExit => Some(err.message.clone()),
        Ok(Err(err)) => Some(format!("Unhandled error in runner '{}': {}", label, err.reason())),
        Err(payload) => Some(format!(
            "Runner '{}' panicked: {}",
            label,
            panic_message(payload.as_ref())
        )),
    };

    executor.terminate();
    if let Some(reason) = failure {
        tracing::warn!(label = %label, "{}", reason);
        samples.clear_outputs();
        samples.fail_all(&reason);
        executor.reap();
    }
    drop(executor);

    resolve_outputs(&mut samples, &task.workdir, &task.config, label);

    for sample in samples.iter_mut().filter(|s| s.is_unprocessed()) {
        sample.fail("Sample was not processed");
    }
    for sample in samples.iter() {
        match &sample.failure_reason {
            None => tracing::debug!(label = %label, sample = %sample.id, "Sample processed"),
            Some(reason) => tracing::debug!(label = %label, sample = %sample.id, reason = %reason, "Sample failed"),
        }
    }
    let failed = samples.failed().len();
    if failed > 0 {
        tracing::error!(label = %label, failed, "Samples failed");
        cleaner.unregister(&task.workdir);
    }

    Ok((samples.to_snapshot()?, cleaner))
}

/// Replace glob outputs with concrete records resolved against the complete
/// samples. Globs are dropped when nothing completed.
fn resolve_outputs(samples: &mut Samples, workdir: &Path, config: &Config, label: &str) {
    let globs: Vec<OutputDecl> = samples.output.iter().filter(|d| d.is_glob()).cloned().collect();
    if globs.is_empty() {
        return;
    }

    let complete = samples.complete();
    let vars = config.template_vars();
    let scope = ResolveScope {
        workdir,
        resultdir: &config.resultdir,
        vars: &vars,
    };
    for decl in globs {
        samples.output.remove(&decl);
        let OutputDecl::Glob(glob) = decl else { continue };
        if complete.is_empty() {
            tracing::warn!(label = %label, pattern = %glob.src, "Dropping output glob, no samples completed");
            continue;
        }
        match glob.resolve(&complete, &scope) {
            Ok(resolution) => {
                for warning in resolution.warnings {
                    tracing::warn!(label = %label, "{}", warning);
                }
                for output in resolution.outputs {
                    samples.add_output(output);
                }
            }
            Err(err) => tracing::warn!(label = %label, error = %err.reason(), "Failed to resolve output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::executor::builtin_backends;
    use crate::output::OutputGlob;
    use crate::sample::Sample;
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        config: Arc<Config>,
        backend: BackendFactory,
        merger: Merger,
        cleaner: Cleaner,
        cancel: CancelToken,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = Config::default();
            config.workdir = dir.path().to_path_buf();
            config.resultdir = dir.path().join("results");
            config.logdir = dir.path().join("logs");
            config.tag = "t".to_string();
            config.workers = 3;
            config.executor.workers = 1;
            let cleaner = Cleaner::new(config.run_dir());
            Self {
                dir,
                config: Arc::new(config),
                backend: builtin_backends()["mock"].clone(),
                merger: Merger::default(),
                cleaner,
                cancel: CancelToken::new(),
            }
        }

        fn dispatch(&mut self, runners: &[Runner], samples: Samples) -> DispatchOutcome {
            let mut env = DispatchEnv {
                config: &self.config,
                backend: &self.backend,
                merger: &self.merger,
                cleaner: &mut self.cleaner,
                cancel: &self.cancel,
                timestamp: "t",
            };
            start_runners(runners, samples, &mut env)
        }
    }

    fn abc() -> Samples {
        Samples::new(vec![
            Sample::new("a", Vec::<PathBuf>::new()),
            Sample::new("b", Vec::<PathBuf>::new()),
            Sample::new("c", Vec::<PathBuf>::new()),
        ])
    }

    #[test]
    fn partitions_follow_split_key() {
        let fx = Fixture::new();
        let samples = Samples::new(vec![
            Sample::new("a", Vec::<PathBuf>::new()).with_metadata("lane", json!(1)),
            Sample::new("b", Vec::<PathBuf>::new()),
        ]);
        let runner = Runner::new("align", |_| Ok(None)).split_by("lane");
        let parts = runner.partitions(&samples, &fx.config);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].workdir, fx.dir.path().join("t/align/1"));
        assert_eq!(parts[1].workdir, fx.dir.path().join("t/align/unknown"));

        let whole = Runner::new("qc", |_| Ok(None)).partitions(&samples, &fx.config);
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].workdir, fx.dir.path().join("t/qc"));
    }

    #[test]
    fn failing_partition_is_isolated() {
        let mut fx = Fixture::new();
        let runner = Runner::new("align", |ctx| {
            if ctx.split_value == Some("b") {
                return Err(Error::runner_failed("align", "segfault"));
            }
            Ok(None)
        })
        .split_by("id");

        let out = fx.dispatch(&[runner], abc());
        assert_eq!(out.samples.complete().unique_ids(), vec!["a", "c"]);
        assert_eq!(out.samples.failed().unique_ids(), vec!["b"]);
        let reason = out.samples.failed().samples[0].failure_reason.clone().unwrap();
        assert!(reason.contains("align"));
        assert_eq!(out.runners[0].completed, 2);
        assert_eq!(out.runners[0].failed, 1);
        assert_eq!(out.runners[0].partitions, 3);
    }

    #[test]
    fn panicking_partition_is_isolated() {
        let mut fx = Fixture::new();
        let runner = Runner::new("call", |ctx| {
            if ctx.samples.samples[0].id == "c" {
                panic!("index out of bounds");
            }
            Ok(None)
        })
        .split_by("id");

        let out = fx.dispatch(&[runner], abc());
        assert_eq!(out.samples.failed().unique_ids(), vec!["c"]);
        assert!(out.samples.failed().samples[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("panicked"));
    }

    #[test]
    fn two_runners_merge_into_one_collection() {
        let mut fx = Fixture::new();
        let qc = Runner::new("qc", |ctx| {
            let mut samples = ctx.samples;
            for s in samples.iter_mut() {
                s.metadata.insert("qc".into(), json!("pass"));
            }
            Ok(Some(samples))
        });
        let align = Runner::new("align", |ctx| {
            let mut samples = ctx.samples;
            for s in samples.iter_mut() {
                s.add_file(ctx.workdir.join(format!("{}.bam", s.id)));
            }
            Ok(Some(samples))
        })
        .split_by("id");

        let out = fx.dispatch(&[qc, align], abc());
        assert_eq!(out.samples.len(), 3);
        assert!(out.samples.iter().all(|s| s.is_complete()));
        assert!(out.samples.iter().all(|s| s.metadata["qc"] == json!("pass")));
        assert!(out.samples.iter().all(|s| s.files.len() == 1));
    }

    #[test]
    fn extra_samples_are_counted() {
        let mut fx = Fixture::new();
        let runner = Runner::new("demux", |ctx| {
            let mut samples = ctx.samples;
            samples.push(Sample::new("a_lane2", Vec::<PathBuf>::new()));
            Ok(Some(samples))
        });
        let out = fx.dispatch(&[runner], abc());
        assert_eq!(out.samples.len(), 4);
        assert_eq!(out.runners[0].extra, 1);
        assert_eq!(out.runners[0].completed, 4);
    }

    #[test]
    fn no_runners_fails_samples() {
        let mut fx = Fixture::new();
        let out = fx.dispatch(&[], abc());
        assert!(out.samples.iter().all(|s| s.failure_reason.as_deref() == Some("Sample was not processed")));
    }

    #[test]
    fn failed_partition_keeps_workdir() {
        let mut fx = Fixture::new();
        let runner = Runner::new("align", |_| Err(Error::runner_exit("align", 2)));
        fx.cleaner.register(fx.config.run_dir(), false).unwrap();
        let out = fx.dispatch(&[runner], abc());

        assert!(out.samples.iter().all(|s| s
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("non-zero status (2)")));
        fx.cleaner.clean();
        assert!(fx.dir.path().join("t/align").exists());
    }

    #[test]
    fn glob_outputs_resolve_against_complete_samples() {
        let mut fx = Fixture::new();
        let runner = Runner::new("align", |ctx| {
            let mut samples = ctx.samples;
            for s in samples.iter_mut() {
                fs::write(ctx.workdir.join(format!("{}.bam", s.id)), "bam").unwrap();
                if s.id == "b" {
                    s.fail("low coverage");
                }
            }
            samples.add_output(OutputGlob::new("{{sample.id}}.bam").dst_dir("bams"));
            Ok(Some(samples))
        });

        let out = fx.dispatch(&[runner], abc());
        let dsts: Vec<PathBuf> = out
            .samples
            .output
            .iter()
            .filter_map(|d| match d {
                OutputDecl::Literal(o) => Some(o.dst.clone()),
                OutputDecl::Glob(_) => None,
            })
            .collect();
        let results = fx.dir.path().join("results/bams");
        assert_eq!(dsts, vec![results.join("a.bam"), results.join("c.bam")]);
    }

    #[test]
    fn globs_dropped_when_nothing_completes() {
        let mut fx = Fixture::new();
        let runner = Runner::new("align", |ctx| {
            let mut samples = ctx.samples;
            samples.fail_all("nope");
            samples.add_output(OutputGlob::new("*.bam"));
            Ok(Some(samples))
        });
        let out = fx.dispatch(&[runner], abc());
        assert!(out.samples.output.is_empty());
    }

    #[test]
    fn cancellation_returns_input_unchanged() {
        let mut fx = Fixture::new();
        let token = fx.cancel.clone();
        let runner = Runner::new("slow", move |ctx| {
            token.cancel();
            ctx.cancel.sleep(Duration::from_secs(30));
            Ok(None)
        });
        let input = abc();
        let out = fx.dispatch(&[runner], input.clone());
        assert!(out.interrupted);
        assert_eq!(out.samples, input);
    }

    #[test]
    fn queued_partitions_do_not_start_after_cancel() {
        let mut fx = Fixture::new();
        Arc::make_mut(&mut fx.config).workers = 1;
        let token = fx.cancel.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let runner = Runner::new("align", move |ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            token.cancel();
            Ok(Some(ctx.samples))
        })
        .split_by("lane");
        let input = Samples::new(
            (1..=3)
                .map(|lane| Sample::new(format!("s{}", lane), Vec::<PathBuf>::new()).with_metadata("lane", json!(lane)))
                .collect(),
        );

        let out = fx.dispatch(&[runner], input.clone());

        assert!(out.interrupted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.samples, input);
    }

    #[test]
    fn empty_input_is_returned_as_is() {
        let mut fx = Fixture::new();
        let runner = Runner::new("never", |_| panic!("should not run"));
        let out = fx.dispatch(&[runner], Samples::default());
        assert!(out.samples.is_empty());
        assert!(out.runners.is_empty());
    }
}
