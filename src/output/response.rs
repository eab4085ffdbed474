//! JSON envelope printed on stdout for every command.
//!
//! Success carries the command's data, failure carries the error code,
//! message, details and hints. The process exit code travels alongside so
//! scripts can tell an interrupted run (130) from a failed one.

use batchwrap::error::Hint;
use batchwrap::{Error, ErrorCode, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

#[derive(Debug, Serialize)]
pub struct EnvelopeError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Hint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl From<Error> for EnvelopeError {
    fn from(err: Error) -> Self {
        Self {
            code: err.code.as_str(),
            message: err.message,
            details: err.details,
            hints: err.hints,
            retryable: err.retryable,
        }
    }
}

impl Envelope {
    pub fn new(result: Result<Value>, exit_code: i32) -> Self {
        match result {
            Ok(data) => Self {
                success: exit_code == 0,
                exit_code,
                data: Some(data),
                error: None,
            },
            Err(err) => Self {
                success: false,
                exit_code,
                data: None,
                error: Some(err.into()),
            },
        }
    }
}

/// Serialize a command's `(data, exit_code)` result, choosing the exit
/// code for errors from their code.
pub fn map_cmd_result_to_json<T: Serialize>(result: Result<(T, i32)>) -> (Result<Value>, i32) {
    let (data, exit_code) = match result {
        Ok(ok) => ok,
        Err(err) => {
            let exit_code = exit_code_for_error(err.code);
            return (Err(err), exit_code);
        }
    };
    match serde_json::to_value(data) {
        Ok(value) => (Ok(value), exit_code),
        Err(err) => (
            Err(Error::internal_json(err.to_string(), Some("serialize response".to_string()))),
            1,
        ),
    }
}

fn exit_code_for_error(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::Interrupted => crate::commands::INTERRUPTED_EXIT_CODE,
        _ => 1,
    }
}

pub fn print_json_result(result: Result<Value>, exit_code: i32) -> Result<()> {
    let envelope = Envelope::new(result, exit_code);
    let payload = serde_json::to_string_pretty(&envelope)
        .map_err(|e| Error::internal_json(e.to_string(), Some("serialize envelope".to_string())))?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    match writeln!(handle, "{}", payload) {
        Ok(()) => Ok(()),
        // reader went away, e.g. `batchwrap plan | head`
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(Error::internal_io(e.to_string(), Some("write stdout".to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_exit_codes() {
        let (json, code) = map_cmd_result_to_json::<()>(Err(Error::hook_cycle(vec!["a".into()])));
        assert!(json.is_err());
        assert_eq!(code, 1);

        let (_, code) = map_cmd_result_to_json::<()>(Err(Error::interrupted("run")));
        assert_eq!(code, 130);
    }

    #[test]
    fn error_envelope_carries_code_and_hints() {
        let err = Error::extension_not_found("executor", "slurm").with_hint("Try subprocess");
        let envelope = Envelope::new(Err(err), 1);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["exit_code"], 1);
        assert_eq!(value["error"]["code"], "extension.not_found");
        assert_eq!(value["error"]["hints"][0]["message"], "Try subprocess");
    }

    #[test]
    fn interrupted_run_is_not_a_success() {
        let envelope = Envelope::new(Ok(serde_json::json!({"status": "interrupted"})), 130);
        assert!(!envelope.success);
        assert_eq!(envelope.data.unwrap()["status"], "interrupted");
    }
}
