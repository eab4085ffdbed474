//! Declared outputs: literal src/dst copy records and lazily resolved globs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::sample::Sample;
use crate::samples::Samples;
use crate::utils::shell;
use crate::utils::template::{self, TemplateVars};

pub const DEFAULT_CHECKPOINT: &str = "main";

fn default_checkpoint() -> String {
    DEFAULT_CHECKPOINT.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Output {
    pub src: PathBuf,
    pub dst: PathBuf,
    #[serde(default = "default_checkpoint")]
    pub checkpoint: String,
    #[serde(default)]
    pub optional: bool,
}

impl Output {
    pub fn new(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            checkpoint: default_checkpoint(),
            optional: false,
        }
    }

    pub fn checkpoint(mut self, name: impl Into<String>) -> Self {
        self.checkpoint = name.into();
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }
}

/// Glob-form output. Patterns may reference `{{workdir}}`, `{{sample.*}}`,
/// `{{samples.*}}` and `{{config.*}}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputGlob {
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_name: Option<String>,
    #[serde(default = "default_checkpoint")]
    pub checkpoint: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputDecl {
    Literal(Output),
    Glob(OutputGlob),
}

impl OutputDecl {
    pub fn checkpoint(&self) -> &str {
        match self {
            OutputDecl::Literal(o) => &o.checkpoint,
            OutputDecl::Glob(g) => &g.checkpoint,
        }
    }

    pub fn is_glob(&self) -> bool {
        matches!(self, OutputDecl::Glob(_))
    }
}

impl From<Output> for OutputDecl {
    fn from(output: Output) -> Self {
        OutputDecl::Literal(output)
    }
}

impl From<OutputGlob> for OutputDecl {
    fn from(glob: OutputGlob) -> Self {
        OutputDecl::Glob(glob)
    }
}

#[derive(Debug, Default)]
pub struct GlobResolution {
    pub outputs: Vec<Output>,
    pub warnings: Vec<String>,
}

/// Directories a glob is resolved against.
#[derive(Debug, Clone)]
pub struct ResolveScope<'a> {
    pub workdir: &'a Path,
    pub resultdir: &'a Path,
    pub vars: &'a HashMap<String, String>,
}

impl OutputGlob {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst_dir: None,
            dst_name: None,
            checkpoint: default_checkpoint(),
            optional: false,
        }
    }

    pub fn dst_dir(mut self, pattern: impl Into<String>) -> Self {
        self.dst_dir = Some(pattern.into());
        self
    }

    pub fn dst_name(mut self, pattern: impl Into<String>) -> Self {
        self.dst_name = Some(pattern.into());
        self
    }

    pub fn checkpoint(mut self, name: impl Into<String>) -> Self {
        self.checkpoint = name.into();
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Resolve against every sample of `samples`, or once at collection level
    /// when the collection is empty.
    pub fn resolve(&self, samples: &Samples, scope: &ResolveScope<'_>) -> Result<GlobResolution> {
        let mut resolution = GlobResolution::default();
        let base = collection_vars(samples, scope);

        if samples.is_empty() {
            self.resolve_with(&base, scope, &mut resolution)?;
            return Ok(resolution);
        }

        for sample in samples.iter() {
            let vars = sample_vars(&base, sample);
            self.resolve_with(&vars, scope, &mut resolution)?;
        }

        resolution.outputs.sort();
        resolution.outputs.dedup();
        Ok(resolution)
    }

    fn resolve_with(
        &self,
        vars: &HashMap<String, String>,
        scope: &ResolveScope<'_>,
        resolution: &mut GlobResolution,
    ) -> Result<()> {
        let rendered = template::render_map(&self.src, vars);
        let pattern = absolutize(scope.workdir, &rendered);
        let pattern_text = pattern.to_string_lossy().to_string();

        let entries = glob::glob(&pattern_text)
            .map_err(|e| Error::output_invalid_pattern(pattern_text.clone(), e.to_string()))?;
        let matches: Vec<PathBuf> = entries.filter_map(|entry| entry.ok()).collect();

        if matches.is_empty() {
            if !self.optional {
                resolution
                    .warnings
                    .push(format!("No files matched output pattern '{}'", pattern_text));
            }
            return Ok(());
        }

        let dst_dir = match &self.dst_dir {
            Some(dir) => absolutize(scope.resultdir, &template::render_map(dir, vars)),
            None => scope.resultdir.to_path_buf(),
        };

        let dst_name = match &self.dst_name {
            Some(_) if matches.len() > 1 => {
                resolution.warnings.push(format!(
                    "Output pattern '{}' matched {} files; ignoring dst_name",
                    pattern_text,
                    matches.len()
                ));
                None
            }
            Some(name) => Some(template::render_map(name, vars)),
            None => None,
        };

        for src in matches {
            let name = match &dst_name {
                Some(name) => PathBuf::from(name),
                None => match src.file_name() {
                    Some(name) => PathBuf::from(name),
                    None => continue,
                },
            };
            resolution.outputs.push(Output {
                dst: dst_dir.join(name),
                src,
                checkpoint: self.checkpoint.clone(),
                optional: self.optional,
            });
        }
        Ok(())
    }
}

/// Template variables describing a whole collection within `scope`.
pub fn collection_vars(samples: &Samples, scope: &ResolveScope<'_>) -> HashMap<String, String> {
    let mut vars = scope.vars.clone();
    vars.insert(
        TemplateVars::WORKDIR.to_string(),
        scope.workdir.to_string_lossy().to_string(),
    );
    vars.insert(
        TemplateVars::RESULTDIR.to_string(),
        scope.resultdir.to_string_lossy().to_string(),
    );
    vars.insert(TemplateVars::SAMPLES_LEN.to_string(), samples.len().to_string());
    vars.insert(TemplateVars::SAMPLES_IDS.to_string(), samples.unique_ids().join(" "));
    vars
}

/// `base` extended with the `sample.*` variables of one sample.
pub fn sample_vars(base: &HashMap<String, String>, sample: &Sample) -> HashMap<String, String> {
    let mut vars = base.clone();
    vars.insert(TemplateVars::SAMPLE_ID.to_string(), sample.id.clone());
    vars.insert(TemplateVars::SAMPLE_UUID.to_string(), sample.uuid().to_string());
    vars.insert(
        TemplateVars::SAMPLE_FILES.to_string(),
        shell::quote_paths(&sample.files),
    );
    template::insert_json(
        &mut vars,
        "sample.meta",
        &serde_json::Value::Object(sample.metadata.clone()),
    );
    vars
}

fn absolutize(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
