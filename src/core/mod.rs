// Public modules
pub mod checkpoint;
pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod extension;
pub mod hooks;
pub mod logs;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod sample;
pub mod samples;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
pub use hooks::{Hook, HookCondition, HookContext, HookStage};
pub use pipeline::{RunOutcome, RunPlan, RunReport, RunStatus};
pub use registry::Registry;
pub use runner::{Runner, RunnerContext};
pub use sample::Sample;
pub use samples::Samples;
