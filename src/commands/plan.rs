use clap::Args;

use batchwrap::pipeline::{self, RunPlan};
use batchwrap::Registry;

use super::{init_logging, CmdResult, GlobalArgs};

/// Show the resolved hook order and runner partitions without running
/// anything.
#[derive(Args, Debug)]
pub struct PlanArgs {}

pub fn run(_args: PlanArgs, global: &GlobalArgs) -> CmdResult<RunPlan> {
    let config = global.load_config()?;
    init_logging(&config, "plan", false)?;
    let registry = Registry::from_config(&config)?;
    let plan = pipeline::plan(&registry, &config)?;
    Ok((plan, 0))
}
