//! Process table inspection and the terminate → wait → kill sequence.
//!
//! The table is read from `/proc` when available, otherwise from
//! `ps -eo pid=,ppid=,pgid=,stat=`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::process::Command;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminateOutcome {
    pub signalled: Vec<i32>,
    pub killed: Vec<i32>,
}

impl TerminateOutcome {
    /// Shell-style status of the root process: 143 after SIGTERM, 137 when
    /// it had to be killed.
    pub fn exit_code(&self) -> i32 {
        if self.killed.is_empty() {
            128 + libc::SIGTERM
        } else {
            128 + libc::SIGKILL
        }
    }
}

pub fn snapshot() -> Vec<ProcInfo> {
    match read_proc() {
        Some(table) => table,
        None => read_ps(),
    }
}

fn read_proc() -> Option<Vec<ProcInfo>> {
    let entries = fs::read_dir("/proc").ok()?;
    let mut table = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let pid: i32 = match name.to_string_lossy().parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        let stat = match fs::read_to_string(entry.path().join("stat")) {
            Ok(stat) => stat,
            Err(_) => continue,
        };
        if let Some((state, ppid, pgid)) = parse_stat(&stat) {
            if matches!(state, 'Z' | 'X') {
                continue;
            }
            table.push(ProcInfo { pid, ppid, pgid });
        }
    }
    Some(table)
}

/// `(state, ppid, pgid)` from a `/proc/<pid>/stat` line. The command name
/// may contain spaces and parentheses, so parsing starts after the last `)`.
fn parse_stat(stat: &str) -> Option<(char, i32, i32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgid = fields.next()?.parse().ok()?;
    Some((state, ppid, pgid))
}

fn read_ps() -> Vec<ProcInfo> {
    let output = match Command::new("ps").args(["-eo", "pid=,ppid=,pgid=,stat="]).output() {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            let pgid = fields.next()?.parse().ok()?;
            let state = fields.next().unwrap_or("");
            if state.starts_with('Z') {
                return None;
            }
            Some(ProcInfo { pid, ppid, pgid })
        })
        .collect()
}

/// Every process below `pid` in the parent tree of `table`.
fn descendants_in(table: &[ProcInfo], pid: i32) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for info in table {
        children.entry(info.ppid).or_default().push(info.pid);
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([pid]);
    while let Some(current) = queue.pop_front() {
        if let Some(kids) = children.get(&current) {
            for &kid in kids {
                if kid != pid && !found.contains(&kid) {
                    found.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    found
}

pub fn group_members(pgid: i32) -> Vec<i32> {
    snapshot()
        .into_iter()
        .filter(|info| info.pgid == pgid)
        .map(|info| info.pid)
        .collect()
}

/// True while `pid` exists and is not a zombie.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !matches!(parse_stat(&stat), Some(('Z', _, _)) | Some(('X', _, _))),
        Err(_) if std::path::Path::new("/proc/self").exists() => false,
        Err(_) => {
            // SAFETY: signal 0 only performs the existence and permission check.
            unsafe { libc::kill(pid, 0) == 0 }
        }
    }
}

pub fn signal(pid: i32, sig: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: plain syscall on a positive pid.
    unsafe { libc::kill(pid, sig) == 0 }
}

pub fn signal_group(pgid: i32, sig: i32) -> bool {
    if pgid <= 1 {
        return false;
    }
    // SAFETY: plain syscall on a process group id above init.
    unsafe { libc::killpg(pgid, sig) == 0 }
}

/// Terminate the tree rooted at `pid`, including its process group.
///
/// SIGTERM goes to the group and to every enumerated descendant, then the
/// survivors get up to `grace` to exit before SIGKILL.
pub fn terminate_tree(pid: i32, grace: Duration) -> TerminateOutcome {
    let table = snapshot();
    let mut targets: BTreeSet<i32> = BTreeSet::new();
    targets.insert(pid);
    targets.extend(descendants_in(&table, pid));
    targets.extend(table.iter().filter(|i| i.pgid == pid).map(|i| i.pid));

    terminate_pids(pid, targets, grace)
}

/// Terminate an explicit set of pids, signalling `pgid` as a group too.
pub fn terminate_pids(pgid: i32, targets: BTreeSet<i32>, grace: Duration) -> TerminateOutcome {
    let own = std::process::id() as i32;
    let targets: Vec<i32> = targets.into_iter().filter(|&p| p != own && p > 1).collect();

    let mut outcome = TerminateOutcome::default();
    signal_group(pgid, libc::SIGTERM);
    for &pid in &targets {
        if signal(pid, libc::SIGTERM) {
            outcome.signalled.push(pid);
        }
    }

    let survivors = wait_until_gone(&targets, grace);
    if survivors.is_empty() {
        return outcome;
    }

    tracing::warn!(
        pgid,
        survivors = ?survivors,
        "Processes ignored SIGTERM, sending SIGKILL"
    );
    signal_group(pgid, libc::SIGKILL);
    for &pid in &survivors {
        signal(pid, libc::SIGKILL);
        outcome.killed.push(pid);
    }
    wait_until_gone(&survivors, KILL_WAIT);
    outcome
}

fn wait_until_gone(pids: &[i32], timeout: Duration) -> Vec<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        let alive: Vec<i32> = pids.iter().copied().filter(|&p| is_alive(p)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stat_handles_parens_in_name() {
        let stat = "1234 (my (odd) prog) S 1 1234 1234 0 -1 4194560";
        assert_eq!(parse_stat(stat), Some(('S', 1, 1234)));
    }

    #[test]
    fn descendants_walks_the_tree() {
        let table = vec![
            ProcInfo { pid: 10, ppid: 1, pgid: 10 },
            ProcInfo { pid: 11, ppid: 10, pgid: 10 },
            ProcInfo { pid: 12, ppid: 11, pgid: 10 },
            ProcInfo { pid: 20, ppid: 1, pgid: 20 },
        ];
        assert_eq!(descendants_in(&table, 10), vec![11, 12]);
        assert!(descendants_in(&table, 20).is_empty());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id() as i32));
        assert!(!is_alive(0));
    }

    #[test]
    fn exit_code_reflects_kill() {
        let mut outcome = TerminateOutcome::default();
        assert_eq!(outcome.exit_code(), 143);
        outcome.killed.push(1);
        assert_eq!(outcome.exit_code(), 137);
    }
}
