//! Scratch-path cleanup for a run.
//!
//! The coordinator owns a [`Cleaner`] rooted at the run directory. Runner
//! partitions get a [`DeferredCleaner`] that only records calls; the
//! coordinator replays them after consolidation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupSummary {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kept: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Cleaner {
    root: PathBuf,
    registered: BTreeSet<PathBuf>,
    kept: BTreeSet<PathBuf>,
}

impl Cleaner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registered: BTreeSet::new(),
            kept: BTreeSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Schedule `path` for removal. Paths outside the root are refused
    /// unless `allow_outside` is set.
    pub fn register(&mut self, path: impl Into<PathBuf>, allow_outside: bool) -> Result<()> {
        let path = path.into();
        if !allow_outside && !path.starts_with(&self.root) {
            return Err(Error::validation_invalid_argument(
                "path",
                format!(
                    "Refusing to register {} for cleanup outside {}",
                    path.display(),
                    self.root.display()
                ),
                None,
                None,
            ));
        }
        self.kept.remove(&path);
        self.registered.insert(path);
        Ok(())
    }

    /// Protect `path` (and everything beneath it) from removal, even when an
    /// ancestor is registered.
    pub fn unregister(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.registered.remove(&path);
        self.kept.insert(path);
    }

    pub fn is_registered(&self, path: &Path) -> bool {
        self.registered.contains(path)
    }

    pub fn apply(&mut self, deferred: DeferredCleaner) -> Result<()> {
        for op in deferred.ops {
            match op {
                CleanupOp::Register {
                    path,
                    allow_outside,
                } => self.register(path, allow_outside)?,
                CleanupOp::Unregister { path } => self.unregister(path),
            }
        }
        Ok(())
    }

    /// Remove every registered path except kept subtrees. Failures are
    /// collected, never raised.
    pub fn clean(&mut self) -> CleanupSummary {
        let mut summary = CleanupSummary {
            kept: self.kept.iter().cloned().collect(),
            ..Default::default()
        };

        let registered = std::mem::take(&mut self.registered);
        for path in registered {
            if self.kept.iter().any(|k| path.starts_with(k)) {
                continue;
            }
            self.remove_except(&path, &mut summary);
        }
        summary
    }

    fn remove_except(&self, path: &Path, summary: &mut CleanupSummary) {
        if !path.exists() {
            return;
        }

        let shelters_kept = self.kept.iter().any(|k| k.starts_with(path) && k != path);
        if !shelters_kept {
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match result {
                Ok(()) => summary.removed.push(path.to_path_buf()),
                Err(e) => summary.errors.push(format!("{}: {}", path.display(), e)),
            }
            return;
        }

        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) => {
                summary.errors.push(format!("{}: {}", path.display(), e));
                return;
            }
        };
        for entry in entries.flatten() {
            let child = entry.path();
            if self.kept.contains(&child) {
                continue;
            }
            self.remove_except(&child, summary);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CleanupOp {
    Register { path: PathBuf, allow_outside: bool },
    Unregister { path: PathBuf },
}

/// Records cleanup calls made inside a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeferredCleaner {
    ops: Vec<CleanupOp>,
}

impl DeferredCleaner {
    pub fn register(&mut self, path: impl Into<PathBuf>, allow_outside: bool) {
        self.ops.push(CleanupOp::Register {
            path: path.into(),
            allow_outside,
        });
    }

    pub fn unregister(&mut self, path: impl Into<PathBuf>) {
        self.ops.push(CleanupOp::Unregister { path: path.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[CleanupOp] {
        &self.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn refuses_paths_outside_root() {
        let dir = TempDir::new().unwrap();
        let mut cleaner = Cleaner::new(dir.path().join("run"));
        let err = cleaner.register("/etc", false).unwrap_err();
        assert_eq!(err.code.as_str(), "validation.invalid_argument");
        assert!(cleaner.register("/tmp/elsewhere", true).is_ok());
    }

    #[test]
    fn clean_removes_registered_and_keeps_unregistered_subtrees() {
        let dir = TempDir::new().unwrap();
        let run = dir.path().join("run");
        let failed = run.join("align/b");
        fs::create_dir_all(&failed).unwrap();
        fs::create_dir_all(run.join("align/a")).unwrap();
        fs::write(failed.join("log.txt"), "why").unwrap();
        fs::write(run.join("align/a/tmp.bam"), "x").unwrap();

        let mut cleaner = Cleaner::new(&run);
        cleaner.register(&run, false).unwrap();
        cleaner.unregister(&failed);
        let summary = cleaner.clean();

        assert!(failed.join("log.txt").exists());
        assert!(!run.join("align/a").exists());
        assert_eq!(summary.kept, vec![failed]);
        assert!(summary.errors.is_empty());
    }

    #[test]
    fn unregistering_root_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let run = dir.path().join("run");
        fs::create_dir_all(&run).unwrap();

        let mut cleaner = Cleaner::new(&run);
        cleaner.register(&run, false).unwrap();
        cleaner.unregister(&run);
        let summary = cleaner.clean();

        assert!(run.exists());
        assert!(summary.removed.is_empty());
    }

    #[test]
    fn deferred_calls_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let run = dir.path().join("run");
        let part = run.join("r1");
        fs::create_dir_all(&part).unwrap();

        let mut deferred = DeferredCleaner::default();
        deferred.register(&part, false);
        deferred.unregister(&part);

        let snapshot = serde_json::to_string(&deferred).unwrap();
        let deferred: DeferredCleaner = serde_json::from_str(&snapshot).unwrap();

        let mut cleaner = Cleaner::new(&run);
        cleaner.apply(deferred).unwrap();
        assert!(!cleaner.is_registered(&part));
        cleaner.clean();
        assert!(part.exists());
    }
}
