//! Sample collections: views, partitioning, the union and merge operators,
//! snapshot encoding and manifest loading.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::merge::Merger;
use crate::output::OutputDecl;
use crate::sample::Sample;
use crate::utils::io;

pub const DEFAULT_KIND: &str = "samples";

/// Partition key used when a sample lacks the split attribute.
pub const UNKNOWN_SPLIT: &str = "unknown";

fn default_kind() -> String {
    DEFAULT_KIND.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Samples {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub samples: Vec<Sample>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub output: BTreeSet<OutputDecl>,
}

impl Default for Samples {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Samples {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            kind: default_kind(),
            samples,
            output: BTreeSet::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Sample> {
        self.samples.iter_mut()
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn get(&self, uuid: Uuid) -> Option<&Sample> {
        self.samples.iter().find(|s| s.uuid() == uuid)
    }

    pub fn get_mut(&mut self, uuid: Uuid) -> Option<&mut Sample> {
        self.samples.iter_mut().find(|s| s.uuid() == uuid)
    }

    pub fn find(&self, uuid: Uuid) -> Result<&Sample> {
        self.get(uuid)
            .ok_or_else(|| Error::samples_not_found(uuid.to_string()))
    }

    pub fn uuids(&self) -> HashSet<Uuid> {
        self.samples.iter().map(|s| s.uuid()).collect()
    }

    /// Distinct sample ids in first-appearance order.
    pub fn unique_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.samples
            .iter()
            .filter(|s| seen.insert(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn add_output(&mut self, decl: impl Into<OutputDecl>) {
        self.output.insert(decl.into());
    }

    pub fn clear_outputs(&mut self) {
        self.output.clear();
    }

    /// Subset matching `pred`, keeping the declared outputs.
    pub fn filtered<F: Fn(&Sample) -> bool>(&self, pred: F) -> Samples {
        Samples {
            kind: self.kind.clone(),
            samples: self.samples.iter().filter(|s| pred(s)).cloned().collect(),
            output: self.output.clone(),
        }
    }

    pub fn complete(&self) -> Samples {
        self.filtered(Sample::is_complete)
    }

    /// Failed samples. Outputs are not carried into this view.
    pub fn failed(&self) -> Samples {
        let mut view = self.filtered(Sample::is_failed);
        view.output.clear();
        view
    }

    pub fn unprocessed(&self) -> Samples {
        self.filtered(Sample::is_unprocessed)
    }

    pub fn with_files(&self) -> Samples {
        self.filtered(Sample::files_exist)
    }

    pub fn without_files(&self) -> Samples {
        self.filtered(|s| !s.files_exist())
    }

    /// Group samples by the value of `key`, in first-appearance order.
    ///
    /// Without a key every sample forms its own group, keyed by uuid.
    pub fn split(&self, key: Option<&str>) -> Vec<(String, Samples)> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Sample>> = HashMap::new();

        for sample in &self.samples {
            let value = match key {
                Some(key) => sample
                    .attribute(key)
                    .unwrap_or_else(|| UNKNOWN_SPLIT.to_string()),
                None => sample.uuid().to_string(),
            };
            if !groups.contains_key(&value) {
                order.push(value.clone());
            }
            groups.entry(value).or_default().push(sample.clone());
        }

        order
            .into_iter()
            .map(|value| {
                let members = groups.remove(&value).unwrap_or_default();
                let group = Samples {
                    kind: self.kind.clone(),
                    samples: members,
                    output: self.output.clone(),
                };
                (value, group)
            })
            .collect()
    }

    /// Union (`|`): samples of `other` replace same-uuid samples of `self`,
    /// the rest are appended. Output sets are unioned.
    pub fn union(&self, other: &Samples) -> Samples {
        let mut out = self.clone();
        for sample in &other.samples {
            match out.get_mut(sample.uuid()) {
                Some(existing) => *existing = sample.clone(),
                None => out.samples.push(sample.clone()),
            }
        }
        out.output.extend(other.output.iter().cloned());
        out
    }

    pub fn merge(&self, other: &Samples) -> Result<Samples> {
        self.merge_with(other, &Merger::default())
    }

    /// Merge (⨂) with field strategies from `merger`.
    ///
    /// Samples present on both sides are merged field by field; samples on
    /// only one side pass through. Order is `self` first, then samples only
    /// present in `other`.
    pub fn merge_with(&self, other: &Samples, merger: &Merger) -> Result<Samples> {
        if self.kind != other.kind {
            return Err(Error::samples_type_mismatch(&self.kind, &other.kind));
        }

        let mut samples = Vec::with_capacity(self.len().max(other.len()));
        for sample in &self.samples {
            match other.get(sample.uuid()) {
                Some(theirs) => samples.push(sample.merge(theirs, merger)?),
                None => samples.push(sample.clone()),
            }
        }
        let ours = self.uuids();
        samples.extend(
            other
                .samples
                .iter()
                .filter(|s| !ours.contains(&s.uuid()))
                .cloned(),
        );

        let mut output = self.output.clone();
        output.extend(other.output.iter().cloned());

        Ok(Samples {
            kind: self.kind.clone(),
            samples,
            output,
        })
    }

    pub fn fail_all(&mut self, reason: &str) {
        for sample in &mut self.samples {
            sample.fail(reason);
        }
    }

    pub fn mark_processed(&mut self) {
        for sample in &mut self.samples {
            sample.processed = true;
        }
    }

    pub fn to_snapshot(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::internal_json(e.to_string(), Some("encode samples".to_string())))
    }

    pub fn from_snapshot(snapshot: &str) -> Result<Samples> {
        serde_json::from_str(snapshot)
            .map_err(|e| Error::validation_invalid_json(e, Some("decode samples".to_string())))
    }

    /// Load a manifest of `{id, files, ...}` records from YAML or JSON.
    ///
    /// Either a bare list or a `samples:` mapping is accepted. Extra keys on
    /// a record land in the sample's metadata; relative file paths are
    /// resolved against the manifest's directory.
    pub fn from_manifest(path: &Path, kind: &str) -> Result<Samples> {
        let content = io::read_file(path, "read sample manifest")?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let manifest: Manifest = if is_json {
            serde_json::from_str(&content).map_err(|e| {
                Error::validation_invalid_json(e, Some(path.display().to_string()))
            })?
        } else {
            serde_yml::from_str(&content).map_err(|e| {
                Error::config_invalid_yaml(path.display().to_string(), e.to_string())
            })?
        };

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let samples = manifest
            .into_records()
            .into_iter()
            .map(|record| {
                let files = record.files.into_iter().map(|f| {
                    if f.is_absolute() {
                        f
                    } else {
                        base.join(f)
                    }
                });
                let mut sample = Sample::new(record.id, files);
                sample.metadata = record.extra;
                sample
            })
            .collect();

        Ok(Samples::new(samples).with_kind(kind))
    }
}

impl IntoIterator for Samples {
    type Item = Sample;
    type IntoIter = std::vec::IntoIter<Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.into_iter()
    }
}

impl<'a> IntoIterator for &'a Samples {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

#[derive(Debug, Deserialize)]
struct ManifestRecord {
    id: String,
    #[serde(default)]
    files: Vec<PathBuf>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Manifest {
    List(Vec<ManifestRecord>),
    Wrapped { samples: Vec<ManifestRecord> },
}

impl Manifest {
    fn into_records(self) -> Vec<ManifestRecord> {
        match self {
            Manifest::List(records) => records,
            Manifest::Wrapped { samples } => samples,
        }
    }
}
