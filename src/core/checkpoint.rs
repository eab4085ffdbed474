//! Content fingerprints for named units of cacheable work.
//!
//! A checkpoint tracks every file of the partition's samples plus the
//! sources of outputs tagged with the checkpoint's name. Each path is hashed
//! from its relative path, size and modification time (whole seconds),
//! salted with caller context and the checkpoint name. State lives in
//! `<workdir>/.checkpoints.<name>.json`.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use uuid::Uuid;

use crate::error::Result;
use crate::output::{OutputDecl, ResolveScope, DEFAULT_CHECKPOINT};
use crate::samples::Samples;
use crate::utils::io;

pub type FileHashes = BTreeMap<String, String>;

/// Lazily created checkpoints for one working directory.
#[derive(Debug, Clone)]
pub struct Checkpoints {
    workdir: PathBuf,
    resultdir: PathBuf,
    vars: HashMap<String, String>,
    map: BTreeMap<String, Checkpoint>,
}

impl Checkpoints {
    pub fn new(
        workdir: impl Into<PathBuf>,
        resultdir: impl Into<PathBuf>,
        vars: HashMap<String, String>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            resultdir: resultdir.into(),
            vars,
            map: BTreeMap::new(),
        }
    }

    pub fn get(&mut self, name: &str) -> &Checkpoint {
        let workdir = &self.workdir;
        let resultdir = &self.resultdir;
        let vars = &self.vars;
        self.map
            .entry(name.to_string())
            .or_insert_with(|| Checkpoint::new(name, workdir, resultdir, vars.clone()))
    }

    pub fn main(&mut self) -> &Checkpoint {
        self.get(DEFAULT_CHECKPOINT)
    }

    pub fn names(&self) -> Vec<&str> {
        self.map.keys().map(|k| k.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    label: String,
    workdir: PathBuf,
    resultdir: PathBuf,
    vars: HashMap<String, String>,
    file: PathBuf,
}

impl Checkpoint {
    pub fn new(
        label: &str,
        workdir: &Path,
        resultdir: &Path,
        vars: HashMap<String, String>,
    ) -> Self {
        Self {
            label: label.to_string(),
            workdir: workdir.to_path_buf(),
            resultdir: resultdir.to_path_buf(),
            vars,
            file: workdir.join(format!(".checkpoints.{}.json", label)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Paths fingerprinted for `samples`, directories expanded to their files.
    pub fn paths(&self, samples: &Samples) -> BTreeSet<PathBuf> {
        let mut paths: BTreeSet<PathBuf> = samples
            .iter()
            .flat_map(|s| s.files.iter().cloned())
            .collect();

        let scope = ResolveScope {
            workdir: &self.workdir,
            resultdir: &self.resultdir,
            vars: &self.vars,
        };
        for decl in samples.output.iter().filter(|d| d.checkpoint() == self.label) {
            match decl {
                OutputDecl::Literal(output) => {
                    paths.insert(output.src.clone());
                }
                OutputDecl::Glob(glob) => match glob.resolve(samples, &scope) {
                    Ok(resolution) => paths.extend(resolution.outputs.into_iter().map(|o| o.src)),
                    Err(err) => {
                        tracing::debug!(label = %self.label, error = %err, "Skipping output glob in fingerprint")
                    }
                },
            }
        }

        let mut expanded = BTreeSet::new();
        for path in paths {
            if path.is_dir() {
                expanded.extend(files_under(&path));
            } else {
                expanded.insert(path);
            }
        }
        expanded
    }

    pub fn hashes(&self, samples: &Samples, context: &Value) -> FileHashes {
        let base = format!("{}|{}", context, self.label);
        self.paths(samples)
            .into_iter()
            .map(|path| {
                let key = self.relative_key(&path);
                let fingerprint = match std::fs::metadata(&path) {
                    Ok(meta) => {
                        let mtime = meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                        format!("{}|{}|{}|{}", base, key, meta.len(), mtime)
                    }
                    Err(_) => format!("{}|{}|missing:{}", base, key, Uuid::new_v4()),
                };
                (key, sha256_hex(&fingerprint))
            })
            .collect()
    }

    pub fn check(&self, samples: &Samples) -> bool {
        self.check_with(samples, ())
    }

    /// True when stored state exists and matches the current fingerprints
    /// exactly. Unreadable state counts as a miss.
    pub fn check_with<C: Serialize>(&self, samples: &Samples, context: C) -> bool {
        let stored: FileHashes = match io::read_json(&self.file, "load checkpoint") {
            Ok(stored) => stored,
            Err(err) => {
                tracing::debug!(label = %self.label, reason = %err.reason(), "Checkpoint miss");
                return false;
            }
        };
        let current = self.hashes(samples, &context_value(context));
        let hit = stored == current;
        tracing::debug!(label = %self.label, hit, files = current.len(), "Checkpoint checked");
        hit
    }

    pub fn store(&self, samples: &Samples) -> Result<()> {
        self.store_with(samples, ())
    }

    pub fn store_with<C: Serialize>(&self, samples: &Samples, context: C) -> Result<()> {
        let hashes = self.hashes(samples, &context_value(context));
        if let Some(parent) = self.file.parent() {
            io::ensure_dir(parent, "create checkpoint directory")?;
        }
        io::write_json(&self.file, &hashes, "store checkpoint")?;
        tracing::debug!(label = %self.label, files = hashes.len(), "Checkpoint stored");
        Ok(())
    }

    pub fn digest(&self, samples: &Samples) -> String {
        self.digest_with(samples, ())
    }

    /// Single combined hash over all current per-file hashes.
    pub fn digest_with<C: Serialize>(&self, samples: &Samples, context: C) -> String {
        let hashes = self.hashes(samples, &context_value(context));
        let mut hasher = Sha256::new();
        for (path, hash) in &hashes {
            hasher.update(path.as_bytes());
            hasher.update(b"=");
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    fn relative_key(&self, path: &Path) -> String {
        path.strip_prefix(&self.workdir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }
}

fn context_value<C: Serialize>(context: C) -> Value {
    serde_json::to_value(context).unwrap_or(Value::Null)
}

fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    let pattern = dir.join("**").join("*");
    match glob::glob(&pattern.to_string_lossy()) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect(),
        Err(_) => Vec::new(),
    }
}
