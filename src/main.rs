use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{plan, run, GlobalArgs};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "batchwrap")]
#[command(version = VERSION)]
#[command(about = "Run hooks and parallel runners over a collection of samples")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute pre-hooks, runners and post-hooks over the sample manifest
    Run(run::RunArgs),
    /// Show hook order and runner partitions without executing anything
    Plan(plan::PlanArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let (json_result, exit_code) = commands::run_json(cli.command, &cli.global);
    if let Err(err) = output::print_json_result(json_result, exit_code) {
        eprintln!("{}", err);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
