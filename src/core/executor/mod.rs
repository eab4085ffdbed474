//! Scoped job execution.
//!
//! An [`Executor`] owns a bounded worker pool and a [`Backend`] that actually
//! runs jobs. One executor is created per hook or runner invocation and torn
//! down at the end of it; dropping it terminates whatever is still running.
//!
//! Every job has a completion lock held until its callback has fired, so a
//! terminal [`JobStatus`] is observable by waiting on the [`JobHandle`].

pub mod mock;
pub mod process_tree;
pub mod subprocess;

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::pool::panic_message;
use crate::engine::{CancelToken, WorkerPool};
use crate::error::{Error, Result};
use crate::utils::{io, shell};

pub use mock::MockBackend;
pub use subprocess::SubprocessBackend;

/// Exit status reported for a job stopped through the default termination
/// hook (128 + SIGTERM).
pub const TERMINATED_EXIT_CODE: i32 = 143;

/// Everything a backend needs to run one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: Uuid,
    pub name: String,
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub logdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub inherit_env: bool,
    pub cpus: usize,
    pub memory: u64,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Run the job to completion and return its exit code. Implementations
    /// poll `cancel` and tear the job down when it trips.
    fn run(&self, job: &JobSpec, cancel: &CancelToken) -> Result<i32>;

    /// Force a running job into a terminal state and return its exit
    /// status, or `None` when the job is no longer running.
    fn terminate_hook(&self, _job_id: Uuid) -> Option<i32> {
        Some(TERMINATED_EXIT_CODE)
    }

    /// Clean up processes left behind by finished or failed jobs.
    fn reap(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Failed { code: i32 },
    Terminated { code: i32 },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobStatus::Running => None,
            JobStatus::Success => Some(0),
            JobStatus::Failed { code } | JobStatus::Terminated { code } => Some(*code),
        }
    }
}

#[derive(Debug)]
struct JobState {
    status: Mutex<JobStatus>,
    done: Condvar,
}

/// Shared view of one job's completion lock.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    name: String,
    state: Arc<JobState>,
}

impl JobHandle {
    fn new(id: Uuid, name: String) -> Self {
        Self {
            id,
            name,
            state: Arc::new(JobState {
                status: Mutex::new(JobStatus::Running),
                done: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> JobStatus {
        match self.state.status.lock() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Block until the job's lock is released.
    pub fn wait(&self) -> JobStatus {
        let mut status = match self.state.status.lock() {
            Ok(status) => status,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !status.is_finished() {
            status = match self.state.done.wait(status) {
                Ok(status) => status,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *status
    }

    /// `Ok(())` on success, `executor.job_failed` otherwise.
    pub fn result(&self) -> Result<()> {
        match self.wait() {
            JobStatus::Success => Ok(()),
            status => Err(Error::executor_job_failed(
                self.id.to_string(),
                status.exit_code().unwrap_or(-1),
            )),
        }
    }

    fn release(&self, status: JobStatus) {
        let mut guard = match self.state.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = status;
        self.state.done.notify_all();
    }
}

pub type JobCallback = Box<dyn FnOnce(&JobHandle, JobStatus) + Send + 'static>;

/// Options for [`Executor::submit`].
#[derive(Default)]
pub struct SubmitOptions {
    name: Option<String>,
    job_id: Option<Uuid>,
    wait: bool,
    workdir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    exclude_os_env: bool,
    cpus: Option<usize>,
    memory: Option<u64>,
    on_success: Option<JobCallback>,
    on_error: Option<JobCallback>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn job_id(mut self, id: Uuid) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Start from an empty environment instead of the inherited one.
    pub fn exclude_os_env(mut self) -> Self {
        self.exclude_os_env = true;
        self
    }

    pub fn cpus(mut self, cpus: usize) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn memory(mut self, megabytes: u64) -> Self {
        self.memory = Some(megabytes);
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&JobHandle, JobStatus) + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&JobHandle, JobStatus) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }
}

struct TrackedJob {
    handle: JobHandle,
    cancel: CancelToken,
}

pub struct Executor {
    label: String,
    workdir: PathBuf,
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    pool: Mutex<Option<WorkerPool>>,
    jobs: Mutex<HashMap<Uuid, TrackedJob>>,
    cancel: CancelToken,
    terminated: AtomicBool,
}

impl Executor {
    pub fn new(
        label: &str,
        workdir: &Path,
        config: Arc<Config>,
        backend: Arc<dyn Backend>,
        parent: &CancelToken,
    ) -> Result<Self> {
        let pool = WorkerPool::new(&format!("{}-jobs", label), config.executor.workers)?;
        tracing::debug!(label, backend = backend.name(), workers = config.executor.workers, "Executor ready");
        Ok(Self {
            label: label.to_string(),
            workdir: workdir.to_path_buf(),
            config,
            backend,
            pool: Mutex::new(Some(pool)),
            jobs: Mutex::new(HashMap::new()),
            cancel: parent.child(),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Submit `argv` as a job. Returns its handle and id immediately unless
    /// `opts.wait` is set.
    pub fn submit(&self, argv: Vec<String>, opts: SubmitOptions) -> Result<(JobHandle, Uuid)> {
        if self.is_terminated() {
            return Err(Error::executor_terminated());
        }
        self.cancel.check(&self.label)?;
        if argv.is_empty() {
            return Err(Error::validation_invalid_argument(
                "argv",
                "Cannot submit an empty command",
                None,
                None,
            ));
        }

        let id = opts.job_id.unwrap_or_else(Uuid::new_v4);
        let name = opts.name.unwrap_or_else(|| self.label.clone());
        let workdir = opts
            .workdir
            .unwrap_or_else(|| self.workdir.join(id.to_string()));
        io::ensure_dir(&workdir, "create job directory")?;

        let spec = JobSpec {
            id,
            name: name.clone(),
            argv,
            workdir,
            logdir: self.config.logdir.clone(),
            env: opts.env,
            inherit_env: !opts.exclude_os_env,
            cpus: opts.cpus.unwrap_or(self.config.executor.cpus),
            memory: opts.memory.unwrap_or(self.config.executor.memory),
        };

        let handle = JobHandle::new(id, name);
        let token = self.cancel.child();
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(
                id,
                TrackedJob {
                    handle: handle.clone(),
                    cancel: token.clone(),
                },
            );
        }

        tracing::info!(label = %spec.name, job = %id, "Submitting: {}", shell::quote_args(&spec.argv));

        let backend = Arc::clone(&self.backend);
        let task_handle = handle.clone();
        let on_success = opts.on_success;
        let on_error = opts.on_error;
        let task = move || {
            let status = run_job(backend.as_ref(), &spec, &token);
            let callback = if status.is_success() { on_success } else { on_error };
            if let Some(callback) = callback {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&task_handle, status))) {
                    tracing::error!(
                        label = %spec.name,
                        job = %spec.id,
                        "Job callback panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            task_handle.release(status);
        };

        let queued = match self.pool.lock() {
            Ok(pool) => match pool.as_ref() {
                Some(pool) => pool.execute(task),
                None => Err(Error::executor_terminated()),
            },
            Err(_) => Err(Error::internal_unexpected("executor pool lock poisoned")),
        };
        if let Err(err) = queued {
            handle.release(JobStatus::Failed { code: -1 });
            self.forget(id);
            return Err(err);
        }

        if opts.wait {
            handle.wait();
        }
        Ok((handle, id))
    }

    /// Submit a shell command line through `sh -c`.
    pub fn submit_shell(&self, command: &str, opts: SubmitOptions) -> Result<(JobHandle, Uuid)> {
        self.submit(shell::sh_argv(command), opts)
    }

    /// Wait for one job, or for every tracked job when `job_id` is `None`.
    pub fn wait(&self, job_id: Option<Uuid>) -> Result<()> {
        let handles: Vec<JobHandle> = match self.jobs.lock() {
            Ok(jobs) => match job_id {
                Some(id) => vec![jobs
                    .get(&id)
                    .map(|j| j.handle.clone())
                    .ok_or_else(|| {
                        Error::validation_invalid_argument(
                            "job_id",
                            format!("Unknown job {}", id),
                            Some(id.to_string()),
                            None,
                        )
                    })?],
                None => jobs.values().map(|j| j.handle.clone()).collect(),
            },
            Err(_) => return Err(Error::internal_unexpected("executor job table poisoned")),
        };
        for handle in handles {
            handle.wait();
        }
        Ok(())
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(&job_id).map(|j| j.handle.status()))
    }

    /// Stop the pool: cancel every job, run the backend's termination hook
    /// for those still running, wait for all locks and join the workers.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let running: Vec<(Uuid, JobHandle, CancelToken)> = match self.jobs.lock() {
            Ok(jobs) => jobs
                .iter()
                .filter(|(_, j)| !j.handle.status().is_finished())
                .map(|(id, j)| (*id, j.handle.clone(), j.cancel.clone()))
                .collect(),
            Err(_) => Vec::new(),
        };

        for (id, handle, cancel) in &running {
            cancel.cancel();
            if let Some(code) = self.backend.terminate_hook(*id) {
                tracing::warn!(label = %handle.name(), job = %id, code, "Job terminated");
            }
        }
        for (_, handle, _) in &running {
            handle.wait();
        }

        let pool = self.pool.lock().ok().and_then(|mut pool| pool.take());
        if let Some(mut pool) = pool {
            pool.join();
        }
        tracing::debug!(label = %self.label, terminated = running.len(), "Executor terminated");
    }

    /// Clean up anything the backend left behind.
    pub fn reap(&self) {
        self.backend.reap();
    }

    fn forget(&self, id: Uuid) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&id);
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_job(backend: &dyn Backend, spec: &JobSpec, cancel: &CancelToken) -> JobStatus {
    match backend.run(spec, cancel) {
        Ok(0) if !cancel.is_cancelled() => JobStatus::Success,
        Ok(code) if cancel.is_cancelled() => JobStatus::Terminated { code },
        Ok(code) => {
            tracing::warn!(label = %spec.name, job = %spec.id, code, "Job exited with non-zero status");
            backend.terminate_hook(spec.id);
            JobStatus::Failed { code }
        }
        Err(err) if err.is_interrupt() || cancel.is_cancelled() => JobStatus::Terminated {
            code: backend.terminate_hook(spec.id).unwrap_or(TERMINATED_EXIT_CODE),
        },
        Err(err) => {
            tracing::error!(label = %spec.name, job = %spec.id, error = %err.reason(), "Job failed to run");
            JobStatus::Failed { code: -1 }
        }
    }
}

pub type BackendFactory = Arc<dyn Fn(&Config) -> Arc<dyn Backend> + Send + Sync>;

/// Factories for the backends every registry starts with.
pub fn builtin_backends() -> BTreeMap<String, BackendFactory> {
    let mut backends: BTreeMap<String, BackendFactory> = BTreeMap::new();
    backends.insert(
        "subprocess".to_string(),
        Arc::new(|config: &Config| {
            Arc::new(SubprocessBackend::new(config.grace_period())) as Arc<dyn Backend>
        }),
    );
    backends.insert(
        "mock".to_string(),
        Arc::new(|_: &Config| Arc::new(MockBackend::new()) as Arc<dyn Backend>),
    );
    backends
}
