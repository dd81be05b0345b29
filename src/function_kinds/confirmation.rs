use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{present, require_object, KindContract, Resolved};
use crate::classify::{FailureKind, FunctionFailure};
use crate::function::SuccessData;
use crate::sandbox::wrapper::Template;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfirmationPayload {
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationSuccess {
    pub success: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recommended_actions: Vec<String>,
}

fn wrong(message: &str) -> FunctionFailure {
    FunctionFailure::new(FailureKind::ConfirmationFieldWrongType, message)
}

impl KindContract for ConfirmationPayload {
    fn arguments(&self) -> Vec<Value> {
        vec![self.args.clone()]
    }

    fn template(&self) -> Template {
        Template::CONFIRMATION
    }

    fn resolve(&self, returned: Option<Value>) -> Result<Resolved, FunctionFailure> {
        let object = require_object(returned)?;

        let Some(Value::Bool(success)) = present(&object, "success") else {
            return Err(wrong("The success field type must be boolean"));
        };
        let success = *success;

        let actions = present(&object, "recommendedActions");
        let recommended_actions = match (success, actions) {
            (true, None) => Vec::new(),
            (true, Some(_)) => {
                return Err(wrong(
                    "The recommendedActions field type must be undefined when success is true",
                ))
            }
            (false, Some(Value::Array(items))) if !items.is_empty() => items
                .iter()
                .map(|item| item.as_str().map(String::from))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| wrong("The recommendedActions field must only contain strings"))?,
            (false, _) => {
                return Err(wrong(
                    "The recommendedActions field type must be a non-empty array of strings when success is false",
                ))
            }
        };

        Ok(SuccessData::Confirmation(ConfirmationSuccess {
            success,
            recommended_actions,
        })
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolve(value: Value) -> Result<Resolved, FunctionFailure> {
        ConfirmationPayload::default().resolve(Some(value))
    }

    #[test]
    fn test_success_without_actions() {
        let resolved = resolve(json!({"success": true})).unwrap();
        assert_eq!(
            serde_json::to_value(&resolved.data).unwrap(),
            json!({"success": true})
        );
    }

    #[test]
    fn test_success_with_actions_is_rejected() {
        let failure = resolve(json!({"success": true, "recommendedActions": ["create"]})).unwrap_err();
        assert_eq!(failure.kind, FailureKind::ConfirmationFieldWrongType);
    }

    #[test]
    fn test_failure_needs_non_empty_string_actions() {
        for bad in [
            json!({"success": false}),
            json!({"success": false, "recommendedActions": []}),
            json!({"success": false, "recommendedActions": ["create", 7]}),
            json!({"success": "yes"}),
        ] {
            assert_eq!(
                resolve(bad).unwrap_err().kind,
                FailureKind::ConfirmationFieldWrongType
            );
        }

        let resolved = resolve(json!({"success": false, "recommendedActions": ["refresh"]})).unwrap();
        assert_eq!(
            serde_json::to_value(&resolved.data).unwrap(),
            json!({"success": false, "recommendedActions": ["refresh"]})
        );
    }
}
