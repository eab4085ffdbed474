//! `{{key}}` template rendering for shell commands and output patterns.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

pub struct TemplateVars;

impl TemplateVars {
    pub const WORKDIR: &'static str = "workdir";
    pub const RESULTDIR: &'static str = "resultdir";
    pub const TAG: &'static str = "tag";
    pub const LABEL: &'static str = "label";
    pub const SPLIT_VALUE: &'static str = "split";
    pub const SAMPLE_ID: &'static str = "sample.id";
    pub const SAMPLE_UUID: &'static str = "sample.uuid";
    pub const SAMPLE_FILES: &'static str = "sample.files";
    pub const SAMPLES_LEN: &'static str = "samples.len";
    pub const SAMPLES_IDS: &'static str = "samples.ids";
}

/// Replace every `{{key}}` with its value. Unknown placeholders stay as-is.
pub fn render_map(template: &str, variables: &HashMap<String, String>) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }

    result
}

/// Names of placeholders still present after rendering.
pub fn unresolved(rendered: &str) -> Vec<String> {
    let Ok(placeholder) = Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}") else {
        return Vec::new();
    };
    placeholder
        .captures_iter(rendered)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Flatten a JSON value into dotted template variables under `prefix`.
///
/// Scalars render bare, arrays of scalars render space-separated, nested
/// objects recurse with `prefix.key`.
pub fn insert_json(vars: &mut HashMap<String, String>, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                insert_json(vars, &format!("{}.{}", prefix, key), inner);
            }
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(scalar_text).collect();
            vars.insert(prefix.to_string(), parts.join(" "));
        }
        other => {
            if let Some(text) = scalar_text(other) {
                vars.insert(prefix.to_string(), text);
            }
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_replaces_all_occurrences() {
        let out = render_map(
            "{{workdir}}/{{sample.id}}.bam {{sample.id}}",
            &vars(&[("workdir", "/tmp/w"), ("sample.id", "s1")]),
        );
        assert_eq!(out, "/tmp/w/s1.bam s1");
    }

    #[test]
    fn unresolved_lists_leftover_placeholders() {
        let out = render_map("{{a}} {{ b }} {{c}}", &vars(&[("a", "1")]));
        assert_eq!(unresolved(&out), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn insert_json_flattens_nested_objects() {
        let mut vars = HashMap::new();
        insert_json(
            &mut vars,
            "config",
            &json!({"genome": "hg38", "opts": {"threads": 4}, "lanes": [1, 2]}),
        );
        assert_eq!(vars["config.genome"], "hg38");
        assert_eq!(vars["config.opts.threads"], "4");
        assert_eq!(vars["config.lanes"], "1 2");
    }
}
