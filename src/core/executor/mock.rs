use std::sync::Mutex;

use super::{Backend, JobSpec};
use crate::engine::CancelToken;
use crate::error::Result;
use crate::utils::shell;

/// Logs what it would run and reports a fixed exit code.
#[derive(Debug, Default)]
pub struct MockBackend {
    exit_code: i32,
    submitted: Mutex<Vec<Vec<String>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    /// Argv of every job seen so far, in submission order.
    pub fn submitted(&self) -> Vec<Vec<String>> {
        self.submitted
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn run(&self, job: &JobSpec, cancel: &CancelToken) -> Result<i32> {
        cancel.check(&job.name)?;
        tracing::info!(
            label = %job.name,
            job = %job.id,
            workdir = %job.workdir.display(),
            "Would run: {}",
            shell::quote_args(&job.argv)
        );
        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.push(job.argv.clone());
        }
        Ok(self.exit_code)
    }
}
