//! Request and result contracts shared by every function kind.
//!
//! A [`Request`] arrives as one JSON document on standard input. It is parsed
//! once, stays immutable for its whole lifetime, and produces exactly one
//! [`FunctionResult`]. Everything the guest prints along the way travels as
//! [`OutputLine`]s, always emitted before the terminal result.

pub mod storage;

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::classify::FunctionFailure;
use crate::function_kinds::{
    ActionRunSuccess, ConfirmationSuccess, ManagementSuccess, ResolverFunctionSuccess,
    SchemaVariantDefinitionSuccess,
};

pub use storage::{RequestStorage, StorageAccess, StorageArea};

/// Closed set of function kinds.
///
/// The kind selects the argument shape, the wrapper template, the capability
/// set and the result contract. Each kind maps to exactly one of each; the
/// exhaustive matches in `function_kinds` and `sandbox::capabilities` keep it
/// that way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FunctionKind {
    ActionRun,
    Before,
    Confirmation,
    Management,
    ResolverFunction,
    SchemaVariantDefinition,
    Validation,
}

impl FunctionKind {
    pub const ALL: [FunctionKind; 7] = [
        FunctionKind::ActionRun,
        FunctionKind::Before,
        FunctionKind::Confirmation,
        FunctionKind::Management,
        FunctionKind::ResolverFunction,
        FunctionKind::SchemaVariantDefinition,
        FunctionKind::Validation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionKind::ActionRun => "actionRun",
            FunctionKind::Before => "before",
            FunctionKind::Confirmation => "confirmation",
            FunctionKind::Management => "management",
            FunctionKind::ResolverFunction => "resolverFunction",
            FunctionKind::SchemaVariantDefinition => "schemaVariantDefinition",
            FunctionKind::Validation => "validation",
        }
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunctionKind {
    type Err = RequestError;

    /// Case-insensitive; `-` and `_` are ignored so `resolver_function`,
    /// `resolverfunction` and `resolverFunction` all parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        FunctionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().to_lowercase() == normalized)
            .ok_or_else(|| RequestError::UnknownKind(s.to_string()))
    }
}

/// Protocol errors: the request cannot be turned into an invocation.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to parse request: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("request is missing required field `executionId`")]
    MissingExecutionId,
    #[error("unknown function kind `{0}`")]
    UnknownKind(String),
    #[error("codeBase64 is not valid base64: {0}")]
    InvalidCode(#[source] base64::DecodeError),
    #[error("decoded guest code is not valid UTF-8")]
    CodeNotUtf8,
    #[error("invalid handler name `{0}`")]
    InvalidHandler(String),
    #[error("invalid {kind} request: {source}")]
    InvalidPayload {
        kind: FunctionKind,
        source: serde_json::Error,
    },
}

/// Guest code plus the name of its entry point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Func {
    #[serde(default)]
    pub handler: String,
    #[serde(default)]
    pub code_base64: String,
}

impl Func {
    pub fn new(handler: impl Into<String>, source: &str) -> Self {
        Self {
            handler: handler.into(),
            code_base64: base64::engine::general_purpose::STANDARD.encode(source),
        }
    }

    /// Decodes `codeBase64` into guest source text.
    pub fn source(&self) -> Result<String, RequestError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.code_base64.trim())
            .map_err(RequestError::InvalidCode)?;
        String::from_utf8(bytes).map_err(|_| RequestError::CodeNotUtf8)
    }
}

/// A preparatory function run before the main invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeFunction {
    #[serde(flatten)]
    pub func: Func,
    #[serde(default)]
    pub arg: Value,
}

/// One execution request as delivered on standard input.
///
/// Kind-specific fields are kept in `payload` and interpreted by
/// [`crate::function_kinds::KindPayload::parse`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default)]
    execution_id: Option<String>,
    #[serde(default)]
    pub handler: String,
    #[serde(default)]
    pub code_base64: String,
    #[serde(default)]
    pub before: Vec<BeforeFunction>,
    /// Deadline in seconds for each invocation of this request.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Request {
    pub fn parse(input: &str) -> Result<Self, RequestError> {
        let request: Request = serde_json::from_str(input).map_err(RequestError::Malformed)?;
        if request.execution_id.is_none() {
            return Err(RequestError::MissingExecutionId);
        }
        Ok(request)
    }

    pub fn execution_id(&self) -> &str {
        self.execution_id.as_deref().unwrap_or_default()
    }

    pub fn func(&self) -> Func {
        Func {
            handler: self.handler.clone(),
            code_base64: self.code_base64.clone(),
        }
    }
}

/// Best-effort extraction of `executionId` from raw input, used when the
/// request itself cannot be parsed. Falls back to the empty string.
pub fn sniff_execution_id(input: &str) -> String {
    serde_json::from_str::<Value>(input)
        .ok()
        .and_then(|v| v.get("executionId").and_then(Value::as_str).map(String::from))
        .unwrap_or_default()
}

/// How a guest invocation ended, as reported by the wrapper's completion
/// callback. Serialized as `{"value": …}`, `"undefined"` or
/// `{"thrown": {"name", "message"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Value(Value),
    Undefined,
    Thrown(ThrownError),
}

impl Outcome {
    /// The returned value with `undefined` mapped to `None`.
    pub fn returned(self) -> Result<Option<Value>, ThrownError> {
        match self {
            Outcome::Value(value) => Ok(Some(value)),
            Outcome::Undefined => Ok(None),
            Outcome::Thrown(thrown) => Err(thrown),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrownError {
    pub name: String,
    pub message: String,
}

impl ThrownError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = std::convert::Infallible;

    /// Unknown levels collapse to `info`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        })
    }
}

/// A diagnostic record produced while a guest function runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub execution_id: String,
    pub stream: OutputStream,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub message: String,
}

impl OutputLine {
    pub fn new(
        execution_id: impl Into<String>,
        stream: OutputStream,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            stream,
            level,
            group: None,
            message: message.into(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Terminal result of a request. The `status` discriminant fully determines
/// the shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum FunctionResult {
    Success(ResultSuccess),
    Failure(ResultFailure),
}

impl FunctionResult {
    pub fn success(execution_id: impl Into<String>, data: SuccessData, error: Option<String>) -> Self {
        FunctionResult::Success(ResultSuccess {
            execution_id: execution_id.into(),
            error,
            data,
        })
    }

    pub fn failure(execution_id: impl Into<String>, error: FunctionFailure) -> Self {
        FunctionResult::Failure(ResultFailure {
            execution_id: execution_id.into(),
            error,
        })
    }

    pub fn execution_id(&self) -> &str {
        match self {
            FunctionResult::Success(success) => &success.execution_id,
            FunctionResult::Failure(failure) => &failure.execution_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FunctionResult::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSuccess {
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: SuccessData,
}

/// Kind-specific fields of a successful result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SuccessData {
    ActionRun(ActionRunSuccess),
    Before,
    Confirmation(ConfirmationSuccess),
    Management(ManagementSuccess),
    ResolverFunction(ResolverFunctionSuccess),
    SchemaVariantDefinition(SchemaVariantDefinitionSuccess),
    Validation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFailure {
    pub execution_id: String,
    pub error: FunctionFailure,
}

/// The terminal record written to standard output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    #[serde(flatten)]
    pub result: FunctionResult,
    #[serde(skip_serializing_if = "RequestStorage::is_empty")]
    pub request_storage: RequestStorage,
}

/// Every record on standard output, tagged by `protocol`.
#[derive(Debug, Serialize)]
#[serde(tag = "protocol", rename_all = "camelCase")]
pub enum Message<'a> {
    Output(&'a OutputLine),
    Result(&'a ResultRecord),
}
