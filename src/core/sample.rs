use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::merge::Merger;

/// One unit of work.
///
/// `uuid` is assigned at construction and never changes; it is the merge
/// identity. `id` is a user-facing name and may repeat across samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default = "Uuid::new_v4")]
    uuid: Uuid,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Sample {
    pub fn new<P: Into<PathBuf>>(id: impl Into<String>, files: impl IntoIterator<Item = P>) -> Self {
        let mut sample = Self {
            id: id.into(),
            files: Vec::new(),
            processed: false,
            failure_reason: None,
            uuid: Uuid::new_v4(),
            metadata: Map::new(),
        };
        for file in files {
            sample.add_file(file);
        }
        sample
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Append a file unless it is already tracked.
    pub fn add_file(&mut self, file: impl Into<PathBuf>) {
        let file = file.into();
        if !self.files.contains(&file) {
            self.files.push(file);
        }
    }

    /// Mark this sample permanently failed. A second, different reason is
    /// appended on a new line.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.failure_reason = match self.failure_reason.take() {
            Some(existing) if existing.lines().any(|line| line == reason) => Some(existing),
            Some(existing) => Some(format!("{}\n{}", existing, reason)),
            None => Some(reason),
        };
    }

    pub fn is_failed(&self) -> bool {
        self.failure_reason.is_some() || !self.processed
    }

    pub fn is_complete(&self) -> bool {
        !self.is_failed()
    }

    pub fn is_unprocessed(&self) -> bool {
        !self.processed && self.failure_reason.is_none()
    }

    pub fn files_exist(&self) -> bool {
        self.files.iter().all(|f| f.exists())
    }

    pub fn missing_files(&self) -> Vec<&Path> {
        self.files
            .iter()
            .filter(|f| !f.exists())
            .map(|f| f.as_path())
            .collect()
    }

    /// Attribute value used for partitioning. Built-in fields are looked up
    /// by name, anything else in `metadata`.
    pub fn attribute(&self, key: &str) -> Option<String> {
        match key {
            "id" => Some(self.id.clone()),
            "uuid" => Some(self.uuid.to_string()),
            "processed" => Some(self.processed.to_string()),
            _ => match self.metadata.get(key)? {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            },
        }
    }

    /// Field-wise merge with another view of the same sample.
    ///
    /// Both sides are serialized and every field except the identity fields
    /// is combined through `merger`.
    pub fn merge(&self, other: &Sample, merger: &Merger) -> Result<Sample> {
        if self.uuid != other.uuid {
            return Err(Error::samples_uuid_mismatch(
                self.uuid.to_string(),
                other.uuid.to_string(),
            ));
        }

        let left = to_object(self)?;
        let right = to_object(other)?;

        let mut merged = left.clone();
        let keys: Vec<&String> = left.keys().chain(right.keys()).collect();
        for key in keys {
            if key == "id" || key == "uuid" {
                continue;
            }
            let l = left.get(key).unwrap_or(&Value::Null);
            let r = right.get(key).unwrap_or(&Value::Null);
            match merger.merge_field(key, l, r) {
                Value::Null => merged.remove(key),
                value => merged.insert(key.clone(), value),
            };
        }

        serde_json::from_value(Value::Object(merged))
            .map_err(|e| Error::internal_json(e.to_string(), Some("merge sample".to_string())))
    }
}

fn to_object(sample: &Sample) -> Result<Map<String, Value>> {
    match serde_json::to_value(sample) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::internal_unexpected("sample did not serialize to an object")),
        Err(e) => Err(Error::internal_json(e.to_string(), Some("merge sample".to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_sample_is_failed_until_processed() {
        let mut s = Sample::new("a", ["r1.fq"]);
        assert!(s.is_failed());
        assert!(s.is_unprocessed());
        s.processed = true;
        assert!(s.is_complete());
        s.fail("boom");
        assert!(s.is_failed());
        assert!(!s.is_unprocessed());
    }

    #[test]
    fn files_are_an_ordered_set() {
        let s = Sample::new("a", ["r1.fq", "r2.fq", "r1.fq"]);
        assert_eq!(s.files, vec![PathBuf::from("r1.fq"), PathBuf::from("r2.fq")]);
    }

    #[test]
    fn samples_with_same_id_have_distinct_uuids() {
        let a = Sample::new("x", Vec::<PathBuf>::new());
        let b = Sample::new("x", Vec::<PathBuf>::new());
        assert_ne!(a.uuid(), b.uuid());
    }

    #[test]
    fn fail_appends_distinct_reasons() {
        let mut s = Sample::new("a", Vec::<PathBuf>::new());
        s.fail("first");
        s.fail("second");
        s.fail("first");
        assert_eq!(s.failure_reason.as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn attribute_reads_builtin_and_metadata() {
        let s = Sample::new("a", Vec::<PathBuf>::new())
            .with_metadata("lane", json!(3))
            .with_metadata("group", json!("ctrl"));
        assert_eq!(s.attribute("id").as_deref(), Some("a"));
        assert_eq!(s.attribute("lane").as_deref(), Some("3"));
        assert_eq!(s.attribute("group").as_deref(), Some("ctrl"));
        assert_eq!(s.attribute("missing"), None);
    }

    #[test]
    fn merge_combines_fields() {
        let merger = Merger::default();
        let mut left = Sample::new("a", ["x"]);
        left.processed = true;
        let mut right = left.clone();
        right.add_file("y");
        right.fail("runner b failed");
        right.metadata.insert("qc".into(), json!({"ok": false}));

        let merged = left.merge(&right, &merger).unwrap();
        assert_eq!(merged.uuid(), left.uuid());
        assert_eq!(merged.files, vec![PathBuf::from("x"), PathBuf::from("y")]);
        assert_eq!(merged.failure_reason.as_deref(), Some("runner b failed"));
        assert!(merged.processed);
        assert_eq!(merged.metadata["qc"], json!({"ok": false}));
    }

    #[test]
    fn merge_rejects_different_uuids() {
        let merger = Merger::default();
        let a = Sample::new("a", Vec::<PathBuf>::new());
        let b = Sample::new("a", Vec::<PathBuf>::new());
        let err = a.merge(&b, &merger).unwrap_err();
        assert_eq!(err.code.as_str(), "samples.uuid_mismatch");
    }

    #[test]
    fn uuid_survives_serialization() {
        let s = Sample::new("a", ["f"]);
        let text = serde_json::to_string(&s).unwrap();
        let back: Sample = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
    }
}
