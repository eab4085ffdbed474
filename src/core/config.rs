//! Run configuration.
//!
//! Loaded from YAML, overridden from the command line, then frozen by
//! [`Config::finalize`] before a run starts. Unknown top-level keys are kept
//! in `extra` and exposed to templates as `{{config.<key>}}`.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::extension::{HookSpec, RunnerSpec};
use crate::utils::io;
use crate::utils::template;

pub const TAG_FORMAT: &str = "%Y%m%d_%H%M%S";

fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_workdir() -> PathBuf {
    PathBuf::from("./out")
}

fn default_executor_name() -> String {
    "subprocess".to_string()
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_name")]
    pub name: String,
    #[serde(default = "host_parallelism")]
    pub cpus: usize,
    /// Advisory memory per job, in megabytes. 0 means unset.
    #[serde(default)]
    pub memory: u64,
    #[serde(default = "host_parallelism")]
    pub workers: usize,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: default_executor_name(),
            cpus: host_parallelism(),
            memory: 0,
            workers: host_parallelism(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write `<logdir>/<label>.<tag>.log`.
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    #[serde(default)]
    pub resultdir: PathBuf,
    #[serde(default)]
    pub logdir: PathBuf,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples_file: Option<PathBuf>,
    #[serde(default)]
    pub clean: bool,
    #[serde(default = "host_parallelism")]
    pub workers: usize,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runners: Vec<RunnerSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            resultdir: PathBuf::new(),
            logdir: PathBuf::new(),
            tag: String::new(),
            samples_file: None,
            clean: false,
            workers: host_parallelism(),
            executor: ExecutorConfig::default(),
            log: LogConfig::default(),
            hooks: Vec::new(),
            runners: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let content = io::read_file(path, "read config")?;
        Self::from_yaml(&content, &path.display().to_string())
    }

    pub fn from_yaml(content: &str, source: &str) -> Result<Config> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yml::from_str(content).map_err(|e| Error::config_invalid_yaml(source, e.to_string()))
    }

    /// Fill derived defaults and validate. Must run once before the config is
    /// shared with a run.
    pub fn finalize(&mut self, started: DateTime<Local>) -> Result<()> {
        if self.tag.trim().is_empty() {
            self.tag = started.format(TAG_FORMAT).to_string();
        }
        if self.tag.contains('/') {
            return Err(Error::config_invalid_value(
                "tag",
                Some(self.tag.clone()),
                "tag must not contain '/'",
            ));
        }

        self.workdir = expand(&self.workdir);
        self.resultdir = if self.resultdir.as_os_str().is_empty() {
            self.workdir.join("results")
        } else {
            expand(&self.resultdir)
        };
        self.logdir = if self.logdir.as_os_str().is_empty() {
            self.workdir.join("logs")
        } else {
            expand(&self.logdir)
        };
        self.samples_file = self.samples_file.as_deref().map(expand);

        if self.workers == 0 {
            return Err(Error::config_invalid_value(
                "workers",
                Some("0".to_string()),
                "workers must be at least 1",
            ));
        }
        if self.executor.workers == 0 {
            return Err(Error::config_invalid_value(
                "executor.workers",
                Some("0".to_string()),
                "executor.workers must be at least 1",
            ));
        }
        Ok(())
    }

    /// `workdir/tag`, the scratch root of one run.
    pub fn run_dir(&self) -> PathBuf {
        self.workdir.join(&self.tag)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.executor.grace_period_secs)
    }

    pub fn log_file(&self, label: &str) -> PathBuf {
        self.logdir.join(format!("{}.{}.log", label, self.tag))
    }

    /// Variables shared by every template rendered during a run.
    pub fn template_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        template::insert_json(&mut vars, "config", &Value::Object(self.extra.clone()));
        for (key, value) in [
            ("tag", self.tag.clone()),
            ("resultdir", self.resultdir.to_string_lossy().to_string()),
            ("logdir", self.logdir.to_string_lossy().to_string()),
        ] {
            vars.insert(format!("config.{}", key), value.clone());
            vars.insert(key.to_string(), value);
        }
        vars.insert(
            "config.workdir".to_string(),
            self.workdir.to_string_lossy().to_string(),
        );
        vars
    }
}

fn expand(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(text.as_ref()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn started() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
    }

    #[test]
    fn empty_yaml_is_all_defaults() {
        let mut config = Config::from_yaml("", "inline").unwrap();
        config.finalize(started()).unwrap();
        assert_eq!(config.tag, "20240305_140709");
        assert_eq!(config.resultdir, PathBuf::from("./out/results"));
        assert_eq!(config.logdir, PathBuf::from("./out/logs"));
        assert_eq!(config.run_dir(), PathBuf::from("./out/20240305_140709"));
        assert_eq!(config.executor.name, "subprocess");
        assert_eq!(config.grace_period(), Duration::from_secs(10));
    }

    #[test]
    fn extra_keys_become_template_vars() {
        let yaml = "workdir: /w\ntag: t1\ngenome: hg38\naligner:\n  threads: 8\n";
        let mut config = Config::from_yaml(yaml, "inline").unwrap();
        config.finalize(started()).unwrap();

        let vars = config.template_vars();
        assert_eq!(vars["config.genome"], "hg38");
        assert_eq!(vars["config.aligner.threads"], "8");
        assert_eq!(vars["tag"], "t1");
        assert_eq!(vars["config.workdir"], "/w");
        assert_eq!(config.log_file("batchwrap"), PathBuf::from("/w/logs/batchwrap.t1.log"));
    }

    #[test]
    fn executor_section_parses() {
        let yaml = "executor:\n  name: mock\n  cpus: 2\n  grace_period_secs: 1\n";
        let config = Config::from_yaml(yaml, "inline").unwrap();
        assert_eq!(config.executor.name, "mock");
        assert_eq!(config.executor.cpus, 2);
        assert_eq!(config.grace_period(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_yaml_is_reported() {
        let err = Config::from_yaml("workdir: [", "broken.yaml").unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_yaml");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = Config::from_yaml("workers: 0", "inline").unwrap();
        let err = config.finalize(started()).unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_value");
    }
}
