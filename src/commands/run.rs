use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use batchwrap::engine::CancelToken;
use batchwrap::pipeline::{self, RunReport, RunStatus};
use batchwrap::{log_status, Error, Registry, Samples};

use super::{init_logging, CmdResult, GlobalArgs, INTERRUPTED_EXIT_CODE};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Only log to the console
    #[arg(long)]
    pub no_log_file: bool,

    /// Leave the final sample collection out of the output
    #[arg(long)]
    pub summary_only: bool,
}

#[derive(Serialize)]
pub struct RunOutput {
    pub report: RunReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<Samples>,
}

pub fn run(args: RunArgs, global: &GlobalArgs) -> CmdResult<RunOutput> {
    let config = global.load_config()?;
    init_logging(&config, "batchwrap", !args.no_log_file)?;
    let registry = Registry::from_config(&config)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::error!("Interrupted, shutting down");
        handler_token.cancel();
    })
    .map_err(|e| Error::internal_unexpected(format!("install Ctrl-C handler: {}", e)))?;

    log_status!(
        "run",
        "Starting run {} ({} hooks, {} runners, executor {})",
        config.tag,
        registry.hooks().len(),
        registry.runners().len(),
        config.executor.name
    );

    let outcome = pipeline::run(&registry, Arc::new(config), &cancel)?;
    let report = outcome.report;

    for runner in &report.runners {
        log_status!(
            runner.label,
            "{} completed, {} failed, {} new",
            runner.completed,
            runner.failed,
            runner.extra
        );
    }
    log_status!(
        "run",
        "{} of {} samples completed in {:.1}s",
        report.completed,
        report.total,
        report.elapsed_secs
    );

    let exit_code = if report.status == RunStatus::Interrupted {
        INTERRUPTED_EXIT_CODE
    } else {
        0
    };
    let samples = (!args.summary_only).then_some(outcome.samples);
    Ok((RunOutput { report, samples }, exit_code))
}
