use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{present, require_object, KindContract, Resolved};
use crate::classify::{FailureKind, FunctionFailure};
use crate::function::SuccessData;
use crate::sandbox::wrapper::Template;

/// Declared shape of a resolver's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseType {
    Action,
    Array,
    Boolean,
    CodeGeneration,
    Float,
    Identity,
    Integer,
    Json,
    Map,
    Object,
    Qualification,
    String,
    Unset,
    Void,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentView {
    #[serde(default)]
    pub properties: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverComponent {
    pub data: ComponentView,
    #[serde(default)]
    pub parents: Vec<ComponentView>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverFunctionPayload {
    pub component: ResolverComponent,
    pub response_type: ResponseType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolverFunctionSuccess {
    pub data: Value,
    pub unset: bool,
}

fn mismatch(response_type: ResponseType, expected: &str) -> FunctionFailure {
    FunctionFailure::invalid_return(format!(
        "Return type must be {expected} for response type {response_type}"
    ))
}

fn check_qualification(value: Value) -> Result<Value, FunctionFailure> {
    let wrong = |message: &str| FunctionFailure::new(FailureKind::QualificationFieldWrongType, message);
    let object = require_object(Some(value))?;
    let result = match present(&object, "result") {
        Some(Value::String(result)) => result.as_str(),
        _ => return Err(wrong("The result field type must be string")),
    };
    if !matches!(result, "success" | "warning" | "failure") {
        return Err(wrong(
            "The result field must be one of 'success', 'warning' or 'failure'",
        ));
    }
    match present(&object, "message") {
        Some(Value::String(_)) => {}
        None if result == "success" => {}
        None => {
            return Err(wrong(
                "The message field type must be string when result is not 'success'",
            ))
        }
        Some(_) => return Err(wrong("The message field type must be string")),
    }
    Ok(Value::Object(object))
}

fn check_code_generation(value: Value) -> Result<Value, FunctionFailure> {
    let object = require_object(Some(value))?;
    for field in ["format", "code"] {
        if !matches!(present(&object, field), Some(Value::String(_))) {
            return Err(FunctionFailure::new(
                FailureKind::CodeGenerationFieldWrongType,
                format!("The {field} field type must be string"),
            ));
        }
    }
    Ok(Value::Object(object))
}

impl KindContract for ResolverFunctionPayload {
    fn arguments(&self) -> Vec<Value> {
        vec![
            self.component.data.properties.clone(),
            serde_json::to_value(&self.component).unwrap_or(Value::Null),
        ]
    }

    fn template(&self) -> Template {
        Template::RESOLVER_FUNCTION
    }

    fn resolve(&self, returned: Option<Value>) -> Result<Resolved, FunctionFailure> {
        let response_type = self.response_type;
        let value = match returned {
            None | Some(Value::Null) => {
                if matches!(response_type, ResponseType::Qualification | ResponseType::CodeGeneration) {
                    return Err(FunctionFailure::invalid_return(format!(
                        "Return value must not be null or undefined for response type {response_type}"
                    )));
                }
                return Ok(SuccessData::ResolverFunction(ResolverFunctionSuccess {
                    data: Value::Null,
                    unset: true,
                })
                .into());
            }
            Some(value) => value,
        };

        let data = match response_type {
            ResponseType::Unset => return Err(mismatch(response_type, "null or undefined")),
            ResponseType::Array if !value.is_array() => return Err(mismatch(response_type, "an array")),
            ResponseType::Boolean if !value.is_boolean() => {
                return Err(mismatch(response_type, "a boolean"))
            }
            ResponseType::Integer
                if !(value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|n| n.fract() == 0.0)) =>
            {
                return Err(mismatch(response_type, "an integer"))
            }
            ResponseType::Float if !value.is_number() => return Err(mismatch(response_type, "a number")),
            ResponseType::String if !value.is_string() => return Err(mismatch(response_type, "a string")),
            ResponseType::Map | ResponseType::Object if !value.is_object() => {
                return Err(mismatch(response_type, "an object"))
            }
            ResponseType::Qualification => check_qualification(value)?,
            ResponseType::CodeGeneration => check_code_generation(value)?,
            _ => value,
        };

        Ok(SuccessData::ResolverFunction(ResolverFunctionSuccess { data, unset: false }).into())
    }
}
