use std::collections::HashMap;

use super::{HookSpec, RunnerSpec};
use crate::error::{Error, Result};
use crate::executor::{JobHandle, JobStatus, SubmitOptions};
use crate::hooks::HookContext;
use crate::output::{collection_vars, sample_vars, ResolveScope};
use crate::runner::RunnerContext;
use crate::samples::Samples;
use crate::utils::template::{self, TemplateVars};

fn render_command(command: &str, vars: &HashMap<String, String>, label: &str) -> String {
    let rendered = template::render_map(command, vars);
    let missing = template::unresolved(&rendered);
    if !missing.is_empty() {
        tracing::warn!(label = %label, missing = ?missing, "Command has unresolved placeholders");
    }
    rendered
}

fn with_env(
    mut opts: SubmitOptions,
    env: &std::collections::BTreeMap<String, String>,
    vars: &HashMap<String, String>,
) -> SubmitOptions {
    for (key, value) in env {
        opts = opts.env(key.clone(), template::render_map(value, vars));
    }
    opts
}

/// Run the hook's command once for the whole collection. Any non-zero exit
/// is a hook failure.
pub(super) fn run_hook(spec: &HookSpec, ctx: HookContext<'_>) -> Result<Option<Samples>> {
    let config_vars = ctx.config.template_vars();
    let scope = ResolveScope {
        workdir: &ctx.workdir,
        resultdir: &ctx.config.resultdir,
        vars: &config_vars,
    };
    let mut vars = collection_vars(&ctx.samples, &scope);
    vars.insert(TemplateVars::LABEL.to_string(), ctx.label.to_string());

    let command = render_command(&spec.command, &vars, ctx.label);
    let opts = with_env(
        SubmitOptions::new().name(ctx.label).workdir(&ctx.workdir),
        &spec.env,
        &vars,
    );
    let (handle, _) = ctx.executor.submit_shell(&command, opts)?;
    match handle.wait() {
        JobStatus::Success => Ok(None),
        JobStatus::Terminated { .. } => Err(Error::interrupted(ctx.label)),
        status => Err(Error::hook_failed(
            ctx.label,
            format!("command exited with status {}", status.exit_code().unwrap_or(-1)),
        )),
    }
}

/// Run the runner's command once per sample of the partition. A sample
/// whose command exits non-zero is failed, the others pass through.
pub(super) fn run_runner(spec: &RunnerSpec, ctx: RunnerContext<'_>) -> Result<Option<Samples>> {
    let mut samples = ctx.samples;
    for output in &spec.outputs {
        samples.add_output(output.clone());
    }

    if let Some(name) = &spec.checkpoint {
        if ctx.checkpoints.get(name).check_with(&samples, spec.command.as_str()) {
            tracing::info!(label = %ctx.label, checkpoint = %name, "Checkpoint up to date, skipping");
            return Ok(Some(samples));
        }
    }

    let config_vars = ctx.config.template_vars();
    let scope = ResolveScope {
        workdir: &ctx.workdir,
        resultdir: &ctx.config.resultdir,
        vars: &config_vars,
    };
    let mut base = collection_vars(&samples, &scope);
    base.insert(TemplateVars::LABEL.to_string(), ctx.label.to_string());
    if let Some(value) = ctx.split_value {
        base.insert(TemplateVars::SPLIT_VALUE.to_string(), value.to_string());
    }

    let mut jobs: Vec<(uuid::Uuid, JobHandle)> = Vec::new();
    for sample in samples.iter() {
        let vars = sample_vars(&base, sample);
        let command = render_command(&spec.command, &vars, ctx.label);
        let mut opts = SubmitOptions::new()
            .name(format!("{}:{}", ctx.label, sample.id))
            .workdir(&ctx.workdir);
        if let Some(cpus) = spec.cpus {
            opts = opts.cpus(cpus);
        }
        if let Some(memory) = spec.memory {
            opts = opts.memory(memory);
        }
        let (handle, _) = ctx.executor.submit_shell(&command, with_env(opts, &spec.env, &vars))?;
        jobs.push((sample.uuid(), handle));
    }

    for (uuid, handle) in jobs {
        let status = handle.wait();
        ctx.cancel.check(ctx.label)?;
        if status.is_success() {
            continue;
        }
        if let Some(sample) = samples.get_mut(uuid) {
            sample.fail(format!(
                "Command exited with status {}",
                status.exit_code().unwrap_or(-1)
            ));
        }
    }

    if let Some(name) = &spec.checkpoint {
        if samples.iter().all(|s| s.failure_reason.is_none()) {
            if let Err(err) = ctx.checkpoints.get(name).store_with(&samples, spec.command.as_str()) {
                tracing::warn!(label = %ctx.label, error = %err.reason(), "Could not store checkpoint");
            }
        }
    }
    Ok(Some(samples))
}
