use clap::Args;
use serde_json::{json, Value};
use std::path::PathBuf;

use batchwrap::config::Config;
use batchwrap::logs;

pub mod plan;
pub mod run;

pub type CmdResult<T> = batchwrap::Result<(T, i32)>;

/// Exit code for a run stopped by Ctrl-C.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Flags shared by every subcommand. Each one overrides the matching key of
/// the config file.
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Run configuration (YAML)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Sample manifest (YAML or JSON)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub samples: Option<PathBuf>,

    /// Root of working directories
    #[arg(long, global = true)]
    pub workdir: Option<PathBuf>,

    /// Base directory for declared outputs
    #[arg(long, global = true)]
    pub resultdir: Option<PathBuf>,

    /// Run namespace (defaults to the start timestamp)
    #[arg(long, global = true)]
    pub tag: Option<String>,

    /// Executor backend (subprocess, mock)
    #[arg(long, global = true)]
    pub executor: Option<String>,

    /// Concurrent runner partitions
    #[arg(short = 'j', long, global = true)]
    pub workers: Option<usize>,

    /// Remove the run's scratch directory when every sample completes
    #[arg(long, global = true)]
    pub clean: bool,

    /// Console and file log level
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Extra template values as KEY=VALUE, available as {{config.KEY}}
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

impl GlobalArgs {
    /// Config file (or defaults) with command-line overrides applied, then
    /// finalized.
    pub fn load_config(&self) -> batchwrap::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(samples) = &self.samples {
            config.samples_file = Some(samples.clone());
        }
        if let Some(workdir) = &self.workdir {
            config.workdir = workdir.clone();
        }
        if let Some(resultdir) = &self.resultdir {
            config.resultdir = resultdir.clone();
        }
        if let Some(tag) = &self.tag {
            config.tag = tag.clone();
        }
        if let Some(executor) = &self.executor {
            config.executor.name = executor.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.clean {
            config.clean = true;
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        for pair in &self.set {
            let (key, value) = parse_kv(pair)?;
            config.extra.insert(key, value);
        }

        config.finalize(chrono::Local::now())?;
        Ok(config)
    }
}

fn parse_kv(pair: &str) -> batchwrap::Result<(String, Value)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), parse_value(value)))
        }
        _ => Err(batchwrap::Error::validation_invalid_argument(
            "set",
            format!("Expected KEY=VALUE, got '{}'", pair),
            Some(pair.to_string()),
            None,
        )),
    }
}

fn parse_value(s: &str) -> Value {
    // Try JSON first (handles arrays, objects, quoted strings)
    if let Ok(v) = serde_json::from_str(s) {
        return v;
    }
    json!(s)
}

/// Install logging for a command. The file layer is only added when
/// `with_file` is set and the config enables it.
pub(crate) fn init_logging(config: &Config, label: &str, with_file: bool) -> batchwrap::Result<()> {
    let file = (with_file && config.log.file).then(|| config.log_file(label));
    logs::init(&config.log.level, file.as_deref())
}

macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (batchwrap::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Run(args) => dispatch!(args, global, run),
        crate::Commands::Plan(args) => dispatch!(args, global, plan),
    }
}
