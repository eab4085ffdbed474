use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::process_tree;
use super::{Backend, JobSpec};
use crate::engine::CancelToken;
use crate::error::{Error, Result};
use crate::utils::io;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs each job as a child process in its own process group, with stdout
/// and stderr captured to `<logdir>/subprocess/<job id>.{out,err}`.
pub struct SubprocessBackend {
    grace: Duration,
    /// Root pid of every job started, which is also its process group id.
    pids: Mutex<HashMap<Uuid, i32>>,
}

impl SubprocessBackend {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pids: Mutex::new(HashMap::new()),
        }
    }

    fn track(&self, id: Uuid, pid: i32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.insert(id, pid);
        }
    }

    fn pid_of(&self, id: Uuid) -> Option<i32> {
        self.pids.lock().ok().and_then(|p| p.get(&id).copied())
    }

    fn command(&self, job: &JobSpec) -> Result<Command> {
        let (program, args) = job
            .argv
            .split_first()
            .ok_or_else(|| Error::executor_spawn_failed("", "empty command"))?;

        let log_dir = job.logdir.join("subprocess");
        io::ensure_dir(&log_dir, "create subprocess log directory")?;
        let stdout = create_log(&log_dir, job.id, "out")?;
        let stderr = create_log(&log_dir, job.id, "err")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&job.workdir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        if !job.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&job.env)
            .env("BATCHWRAP_JOB_ID", job.id.to_string())
            .env("BATCHWRAP_CPUS", job.cpus.to_string());
        if job.memory > 0 {
            cmd.env("BATCHWRAP_MEMORY_MB", job.memory.to_string());
        }
        Ok(cmd)
    }
}

fn create_log(dir: &std::path::Path, id: Uuid, ext: &str) -> Result<File> {
    File::create(dir.join(format!("{}.{}", id, ext)))
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("create job .{} log", ext))))
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

impl Backend for SubprocessBackend {
    fn name(&self) -> &str {
        "subprocess"
    }

    fn run(&self, job: &JobSpec, cancel: &CancelToken) -> Result<i32> {
        let mut child = self
            .command(job)?
            .spawn()
            .map_err(|e| Error::executor_spawn_failed(job.argv[0].clone(), e.to_string()))?;
        let pid = child.id() as i32;
        self.track(job.id, pid);
        tracing::debug!(label = %job.name, job = %job.id, pid, "Job started");

        loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(exit_code(status)),
                Ok(None) => {}
                Err(e) => break Err(Error::internal_io(e.to_string(), Some("wait for job".to_string()))),
            }
            if cancel.is_cancelled() {
                let outcome = process_tree::terminate_tree(pid, self.grace);
                let code = match child.wait() {
                    Ok(status) => exit_code(status),
                    Err(_) => outcome.exit_code(),
                };
                break Ok(code);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Terminate the job's tree while its root runs. Once the root has
    /// exited, only stragglers left in its process group are cleaned up and
    /// `None` is returned.
    fn terminate_hook(&self, job_id: Uuid) -> Option<i32> {
        let pid = self.pid_of(job_id)?;
        if !process_tree::is_alive(pid) {
            let leftovers: BTreeSet<i32> = process_tree::group_members(pid).into_iter().collect();
            if !leftovers.is_empty() {
                process_tree::terminate_pids(pid, leftovers, self.grace);
            }
            return None;
        }
        let outcome = process_tree::terminate_tree(pid, self.grace);
        tracing::debug!(
            job = %job_id,
            pid,
            signalled = outcome.signalled.len(),
            killed = outcome.killed.len(),
            "Job terminated"
        );
        Some(outcome.exit_code())
    }

    /// Terminate anything still alive in a process group this backend
    /// started, including children orphaned by jobs that already exited.
    fn reap(&self) {
        let groups: BTreeSet<i32> = match self.pids.lock() {
            Ok(pids) => pids.values().copied().collect(),
            Err(_) => return,
        };
        for pgid in groups {
            let members: BTreeSet<i32> = process_tree::group_members(pgid).into_iter().collect();
            if members.is_empty() {
                continue;
            }
            tracing::warn!(pgid, count = members.len(), "Reaping leftover processes");
            process_tree::terminate_pids(pgid, members, self.grace);
        }
    }
}
