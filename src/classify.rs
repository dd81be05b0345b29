//! Closed failure taxonomy and the mapping from every abnormal path onto it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::function::{RequestError, ThrownError};
use crate::sandbox::{HostError, HostExit};

/// Name used for deadline failures, reported as a guest exception.
pub const TIMEOUT_ERROR: &str = "TimeoutError";

/// Serialized externally tagged: unit variants become plain strings and a
/// guest exception becomes `{"UserCodeException": "<name>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    ActionFieldWrongType,
    CodeGenerationFieldWrongType,
    ConfirmationFieldWrongType,
    InvalidRequest,
    InvalidReturnType,
    KilledExecution,
    ManagementFieldWrongType,
    QualificationFieldWrongType,
    SandboxFailure,
    UserCodeException(String),
    ValidationFieldWrongType,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::UserCodeException(name) => write!(f, "UserCodeException({name})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// `{kind, message}` carried by a failure Result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FunctionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(secs: u64) -> Self {
        Self::new(
            FailureKind::UserCodeException(TIMEOUT_ERROR.to_string()),
            format!("function timed out after {secs} seconds"),
        )
    }

    pub fn invalid_return(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidReturnType, message)
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SandboxFailure, message)
    }
}

impl From<ThrownError> for FunctionFailure {
    fn from(thrown: ThrownError) -> Self {
        let name = if thrown.name.is_empty() {
            "Error".to_string()
        } else {
            thrown.name
        };
        Self::new(FailureKind::UserCodeException(name), thrown.message)
    }
}

impl From<&RequestError> for FunctionFailure {
    fn from(err: &RequestError) -> Self {
        Self::new(FailureKind::InvalidRequest, err.to_string())
    }
}

impl From<&HostError> for FunctionFailure {
    fn from(err: &HostError) -> Self {
        match err {
            HostError::Timeout(secs) => Self::timeout(*secs),
            HostError::HeapLimit(_) | HostError::OutputLimit(_) => {
                Self::new(FailureKind::KilledExecution, err.to_string())
            }
            HostError::Spawn(_)
            | HostError::Io(_)
            | HostError::Bootstrap(_)
            | HostError::Panicked => Self::sandbox(err.to_string()),
        }
    }
}

/// Classifies an invocation that ended without a result payload.
///
/// An abnormal exit surfaces the captured diagnostics; a clean exit with
/// nothing to show is a transport error.
pub fn missing_result(exit: &HostExit) -> FunctionFailure {
    let diagnostics = exit.stderr.trim();
    if !exit.success {
        let message = if diagnostics.is_empty() {
            match exit.code {
                Some(code) => format!("no output received from function run (exit code {code})"),
                None => "no output received from function run".to_string(),
            }
        } else {
            diagnostics.to_string()
        };
        return FunctionFailure::new(FailureKind::KilledExecution, message);
    }
    FunctionFailure::invalid_return("no output received from function run")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timeout_message() {
        let failure = FunctionFailure::timeout(3);
        assert_eq!(failure.message, "function timed out after 3 seconds");
        assert_eq!(
            serde_json::to_value(&failure.kind).unwrap(),
            json!({"UserCodeException": "TimeoutError"})
        );
    }

    #[test]
    fn test_unit_kinds_serialize_as_strings() {
        assert_eq!(
            serde_json::to_value(FailureKind::ActionFieldWrongType).unwrap(),
            json!("ActionFieldWrongType")
        );
        assert_eq!(
            serde_json::to_value(FailureKind::InvalidReturnType).unwrap(),
            json!("InvalidReturnType")
        );
    }

    #[test]
    fn test_thrown_error_keeps_name_and_message() {
        let failure = FunctionFailure::from(ThrownError::new("RangeError", "out of range"));
        assert_eq!(
            failure.kind,
            FailureKind::UserCodeException("RangeError".into())
        );
        assert_eq!(failure.message, "out of range");

        let anonymous = FunctionFailure::from(ThrownError::new("", "thrown string"));
        assert_eq!(anonymous.kind, FailureKind::UserCodeException("Error".into()));
    }

    #[test]
    fn test_host_timeout_maps_to_timeout_error() {
        let failure = FunctionFailure::from(&HostError::Timeout(10));
        assert_eq!(failure, FunctionFailure::timeout(10));
    }

    #[test]
    fn test_heap_limit_is_killed_execution() {
        let failure = FunctionFailure::from(&HostError::HeapLimit(64));
        assert_eq!(failure.kind, FailureKind::KilledExecution);
    }

    #[test]
    fn test_missing_result_after_crash_uses_stderr() {
        let exit = HostExit {
            success: false,
            code: Some(1),
            stderr: "thread panicked\n".into(),
        };
        let failure = missing_result(&exit);
        assert_eq!(failure.kind, FailureKind::KilledExecution);
        assert_eq!(failure.message, "thread panicked");
    }

    #[test]
    fn test_missing_result_after_silent_crash_is_not_empty() {
        let exit = HostExit {
            success: false,
            code: None,
            stderr: String::new(),
        };
        let failure = missing_result(&exit);
        assert_eq!(failure.kind, FailureKind::KilledExecution);
        assert_eq!(failure.message, "no output received from function run");
    }

    #[test]
    fn test_missing_result_after_clean_exit() {
        let exit = HostExit {
            success: true,
            code: Some(0),
            stderr: String::new(),
        };
        assert_eq!(
            missing_result(&exit).kind,
            FailureKind::InvalidReturnType
        );
    }
}
