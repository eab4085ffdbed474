use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidValue,
    ConfigInvalidYaml,

    ValidationInvalidArgument,
    ValidationInvalidJson,

    HookCycle,
    HookDuplicateLabel,
    HookInvalidConstraint,
    HookFailed,

    RunnerFailed,
    RunnerExit,
    Interrupted,

    SamplesTypeMismatch,
    SamplesUuidMismatch,
    SamplesNotFound,

    ExecutorTerminated,
    ExecutorJobFailed,
    ExecutorSpawnFailed,

    OutputInvalidPattern,
    ExtensionNotFound,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::ConfigInvalidYaml => "config.invalid_yaml",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationInvalidJson => "validation.invalid_json",

            ErrorCode::HookCycle => "hook.cycle",
            ErrorCode::HookDuplicateLabel => "hook.duplicate_label",
            ErrorCode::HookInvalidConstraint => "hook.invalid_constraint",
            ErrorCode::HookFailed => "hook.failed",

            ErrorCode::RunnerFailed => "runner.failed",
            ErrorCode::RunnerExit => "runner.exit",
            ErrorCode::Interrupted => "run.interrupted",

            ErrorCode::SamplesTypeMismatch => "samples.type_mismatch",
            ErrorCode::SamplesUuidMismatch => "samples.uuid_mismatch",
            ErrorCode::SamplesNotFound => "samples.not_found",

            ErrorCode::ExecutorTerminated => "executor.terminated",
            ErrorCode::ExecutorJobFailed => "executor.job_failed",
            ErrorCode::ExecutorSpawnFailed => "executor.spawn_failed",

            ErrorCode::OutputInvalidPattern => "output.invalid_pattern",
            ErrorCode::ExtensionNotFound => "extension.not_found",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMissingKeyDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookCycleDetails {
    pub pending: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelledFailureDetails {
    pub label: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailedDetails {
    pub job_id: String,
    pub exit_code: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalJsonErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        let details = to_details(ConfigMissingKeyDetails {
            key: key.into(),
            path,
        });
        Self::new(
            ErrorCode::ConfigMissingKey,
            "Missing required configuration key",
            details,
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.clone(),
        });
        Self::new(
            ErrorCode::ConfigInvalidValue,
            format!("Invalid configuration value: {}", problem),
            details,
        )
    }

    pub fn config_invalid_yaml(path: impl Into<String>, error: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorCode::ConfigInvalidYaml,
            format!("Invalid YAML in {}", path),
            serde_json::json!({ "path": path, "error": error.into() }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            id,
            tried,
        });

        Self::new(ErrorCode::ValidationInvalidArgument, problem, details)
    }

    pub fn validation_invalid_json(err: serde_json::Error, context: Option<String>) -> Self {
        let details = serde_json::json!({
            "error": err.to_string(),
            "context": context,
        });

        Self::new(ErrorCode::ValidationInvalidJson, "Invalid JSON", details)
    }

    pub fn hook_cycle(pending: Vec<String>) -> Self {
        let message = format!(
            "Hook ordering constraints contain a cycle between: {}",
            pending.join(", ")
        );
        Self::new(
            ErrorCode::HookCycle,
            message,
            to_details(HookCycleDetails { pending }),
        )
        .with_hint("Check the before/after constraints of the listed hooks")
    }

    pub fn hook_duplicate_label(label: impl Into<String>) -> Self {
        let label = label.into();
        Self::new(
            ErrorCode::HookDuplicateLabel,
            format!("Duplicate hook label '{}'", label),
            serde_json::json!({ "label": label }),
        )
    }

    pub fn hook_invalid_constraint(label: impl Into<String>, problem: impl Into<String>) -> Self {
        let label = label.into();
        let problem = problem.into();
        Self::new(
            ErrorCode::HookInvalidConstraint,
            format!("Hook '{}': {}", label, problem),
            to_details(LabelledFailureDetails {
                label,
                reason: problem,
            }),
        )
    }

    pub fn hook_failed(label: impl Into<String>, reason: impl Into<String>) -> Self {
        let label = label.into();
        let reason = reason.into();
        Self::new(
            ErrorCode::HookFailed,
            format!("Hook '{}' failed: {}", label, reason),
            to_details(LabelledFailureDetails { label, reason }),
        )
    }

    pub fn runner_failed(label: impl Into<String>, reason: impl Into<String>) -> Self {
        let label = label.into();
        let reason = reason.into();
        Self::new(
            ErrorCode::RunnerFailed,
            format!("Runner '{}' failed: {}", label, reason),
            to_details(LabelledFailureDetails { label, reason }),
        )
    }

    /// A runner body giving up with a process-style exit status.
    pub fn runner_exit(label: impl Into<String>, code: i32) -> Self {
        let label = label.into();
        Self::new(
            ErrorCode::RunnerExit,
            format!("Runner '{}' exited with non-zero status ({})", label, code),
            serde_json::json!({ "label": label, "exitCode": code }),
        )
    }

    pub fn interrupted(label: impl Into<String>) -> Self {
        let label = label.into();
        Self::new(
            ErrorCode::Interrupted,
            format!("'{}' interrupted", label),
            serde_json::json!({ "label": label }),
        )
    }

    pub fn samples_type_mismatch(this: impl Into<String>, that: impl Into<String>) -> Self {
        let this = this.into();
        let that = that.into();
        Self::new(
            ErrorCode::SamplesTypeMismatch,
            format!("Cannot merge samples of kind '{}' with '{}'", this, that),
            serde_json::json!({ "this": this, "that": that }),
        )
    }

    pub fn samples_uuid_mismatch(this: impl Into<String>, that: impl Into<String>) -> Self {
        let this = this.into();
        let that = that.into();
        Self::new(
            ErrorCode::SamplesUuidMismatch,
            "Cannot merge samples with different UUIDs",
            serde_json::json!({ "this": this, "that": that }),
        )
    }

    pub fn samples_not_found(uuid: impl Into<String>) -> Self {
        let uuid = uuid.into();
        Self::new(
            ErrorCode::SamplesNotFound,
            format!("Sample with UUID {} not found", uuid),
            serde_json::json!({ "uuid": uuid }),
        )
    }

    pub fn executor_terminated() -> Self {
        Self::new(
            ErrorCode::ExecutorTerminated,
            "Executor has been terminated",
            Value::Object(serde_json::Map::new()),
        )
    }

    pub fn executor_job_failed(job_id: impl Into<String>, exit_code: i32) -> Self {
        let job_id = job_id.into();
        Self::new(
            ErrorCode::ExecutorJobFailed,
            format!("Job {} failed with exit code {}", job_id, exit_code),
            to_details(JobFailedDetails { job_id, exit_code }),
        )
    }

    pub fn executor_spawn_failed(program: impl Into<String>, error: impl Into<String>) -> Self {
        let program = program.into();
        let error = error.into();
        Self::new(
            ErrorCode::ExecutorSpawnFailed,
            format!("Failed to start '{}': {}", program, error),
            serde_json::json!({ "program": program, "error": error }),
        )
    }

    pub fn output_invalid_pattern(pattern: impl Into<String>, error: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let error = error.into();
        Self::new(
            ErrorCode::OutputInvalidPattern,
            format!("Invalid output pattern '{}': {}", pattern, error),
            serde_json::json!({ "pattern": pattern, "error": error }),
        )
    }

    pub fn extension_not_found(kind: &str, name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::ExtensionNotFound,
            format!("No {} named '{}' is registered", kind, name),
            serde_json::json!({ "kind": kind, "name": name }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalIoErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalJsonErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn is_interrupt(&self) -> bool {
        self.code == ErrorCode::Interrupted
    }

    /// Human-readable reason, including the underlying error detail when the
    /// message alone is generic.
    pub fn reason(&self) -> String {
        match self.details.get("error").and_then(|v| v.as_str()) {
            Some(detail) if !self.message.contains(detail) => {
                format!("{}: {}", self.message, detail)
            }
            _ => self.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_dotted() {
        assert_eq!(ErrorCode::HookCycle.as_str(), "hook.cycle");
        assert_eq!(ErrorCode::Interrupted.as_str(), "run.interrupted");
    }

    #[test]
    fn hook_cycle_lists_pending_nodes() {
        let err = Error::hook_cycle(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.code, ErrorCode::HookCycle);
        assert!(err.message.contains("a, b"));
        assert_eq!(err.details["pending"][1], "b");
        assert_eq!(err.hints.len(), 1);
    }

    #[test]
    fn reason_includes_io_detail() {
        let err = Error::internal_io("permission denied", Some("write".to_string()));
        assert_eq!(err.reason(), "IO error: permission denied");
    }

    #[test]
    fn only_interrupted_is_an_interrupt() {
        assert!(Error::interrupted("x").is_interrupt());
        assert!(!Error::hook_cycle(vec!["a".into()]).is_interrupt());
    }
}
