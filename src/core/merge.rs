//! Field-wise merge strategies used by the sample merge operator.
//!
//! A [`Merger`] maps serialized field names to strategy functions. Fields
//! without a registered strategy fall back to [`merge_values`]. Metadata is
//! merged key by key; extensions register per-key strategies under
//! `metadata.<key>`.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct Merger {
    strategies: HashMap<String, MergeFn>,
}

impl std::fmt::Debug for Merger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields: Vec<&String> = self.strategies.keys().collect();
        fields.sort();
        f.debug_struct("Merger").field("fields", &fields).finish()
    }
}

impl Default for Merger {
    fn default() -> Self {
        let mut merger = Self {
            strategies: HashMap::new(),
        };
        merger.register("files", union_arrays);
        merger.register("failure_reason", join_reasons);
        merger.register("processed", logical_and);
        merger
    }
}

impl Merger {
    pub fn register<F>(&mut self, field: impl Into<String>, strategy: F) -> &mut Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.strategies.insert(field.into(), Arc::new(strategy));
        self
    }

    pub fn register_metadata<F>(&mut self, key: &str, strategy: F) -> &mut Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.register(format!("metadata.{}", key), strategy)
    }

    pub fn merge_field(&self, field: &str, left: &Value, right: &Value) -> Value {
        if let Some(strategy) = self.strategies.get(field) {
            return strategy(left, right);
        }
        if field == "metadata" {
            return self.merge_metadata(left, right);
        }
        merge_values(left, right)
    }

    fn merge_metadata(&self, left: &Value, right: &Value) -> Value {
        match (left, right) {
            (Value::Object(l), Value::Object(r)) => {
                let mut out = l.clone();
                for (key, rv) in r {
                    let merged = match l.get(key) {
                        Some(lv) => match self.strategies.get(&format!("metadata.{}", key)) {
                            Some(strategy) => strategy(lv, rv),
                            None => merge_values(lv, rv),
                        },
                        None => rv.clone(),
                    };
                    out.insert(key.clone(), merged);
                }
                Value::Object(out)
            }
            _ => merge_values(left, right),
        }
    }
}

/// Default strategy. Null yields the other side, mappings merge
/// recursively, scalar arrays concatenate without duplicates, anything else
/// takes the right-hand value.
pub fn merge_values(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Null, other) | (other, Value::Null) => other.clone(),
        (Value::Object(l), Value::Object(r)) => Value::Object(merge_mappings(l, r)),
        (Value::Array(l), Value::Array(r)) if all_scalars(l) && all_scalars(r) => {
            union_arrays(left, right)
        }
        (_, r) => r.clone(),
    }
}

pub fn merge_mappings(left: &Map<String, Value>, right: &Map<String, Value>) -> Map<String, Value> {
    let mut out = left.clone();
    for (key, rv) in right {
        let merged = match left.get(key) {
            Some(lv) => merge_values(lv, rv),
            None => rv.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}

fn all_scalars(items: &[Value]) -> bool {
    items
        .iter()
        .all(|v| !matches!(v, Value::Array(_) | Value::Object(_)))
}

/// Ordered set union: left items first, then right items not yet seen.
pub fn union_arrays(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Array(l), Value::Array(r)) => {
            let mut out = l.clone();
            for item in r {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        (Value::Null, other) | (other, Value::Null) => other.clone(),
        (_, r) => r.clone(),
    }
}

/// Newline-join when both sides carry a reason; lines already present on
/// the left are not repeated.
pub fn join_reasons(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::String(l), Value::String(r)) => {
            if l.lines().any(|line| line == r) {
                Value::String(l.clone())
            } else {
                Value::String(format!("{}\n{}", l, r))
            }
        }
        (Value::Null, other) | (other, Value::Null) => other.clone(),
        (_, r) => r.clone(),
    }
}

pub fn logical_and(left: &Value, right: &Value) -> Value {
    match (left.as_bool(), right.as_bool()) {
        (Some(l), Some(r)) => Value::Bool(l && r),
        (Some(v), None) | (None, Some(v)) => Value::Bool(v),
        (None, None) => Value::Bool(false),
    }
}
