use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{optional_string, present, require_object, KindContract, Resolved};
use crate::classify::{FailureKind, FunctionFailure};
use crate::function::SuccessData;
use crate::sandbox::wrapper::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagementHealth {
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementPayload {
    #[serde(default)]
    pub this_component: Value,
    #[serde(default)]
    pub components: Value,
    #[serde(default)]
    pub current_view: Value,
    #[serde(default)]
    pub variant_socket_map: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementSuccess {
    pub health: ManagementHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Value>,
}

fn wrong(message: &str) -> FunctionFailure {
    FunctionFailure::new(FailureKind::ManagementFieldWrongType, message)
}

impl KindContract for ManagementPayload {
    fn arguments(&self) -> Vec<Value> {
        vec![json!({
            "thisComponent": self.this_component,
            "components": self.components,
            "currentView": self.current_view,
            "variantSocketMap": self.variant_socket_map,
        })]
    }

    fn template(&self) -> Template {
        Template::MANAGEMENT
    }

    fn resolve(&self, returned: Option<Value>) -> Result<Resolved, FunctionFailure> {
        let object = require_object(returned)?;

        let health = match present(&object, "status") {
            Some(Value::String(status)) if status == "ok" => ManagementHealth::Ok,
            Some(Value::String(status)) if status == "error" => ManagementHealth::Error,
            Some(Value::String(_)) => {
                return Err(wrong("The status field must be one of 'ok' or 'error'"))
            }
            _ => return Err(wrong("The status field type must be string")),
        };

        let message = optional_string(&object, "message", FailureKind::ManagementFieldWrongType)?;
        if health == ManagementHealth::Error && message.is_none() {
            return Err(wrong("The message field type must be string when status is 'error'"));
        }

        let operations = match present(&object, "operations") {
            None => None,
            Some(ops @ Value::Object(_)) => Some(ops.clone()),
            Some(_) => return Err(wrong("The operations field type must be object")),
        };

        Ok(SuccessData::Management(ManagementSuccess {
            health,
            message,
            operations,
        })
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(value: Value) -> Result<Resolved, FunctionFailure> {
        ManagementPayload::default().resolve(Some(value))
    }

    #[test]
    fn test_arguments_bundle_component_context() {
        let payload = ManagementPayload {
            this_component: json!({"name": "vpc"}),
            components: json!({}),
            current_view: json!("DEFAULT"),
            variant_socket_map: json!({}),
        };
        assert_eq!(
            payload.arguments(),
            vec![json!({
                "thisComponent": {"name": "vpc"},
                "components": {},
                "currentView": "DEFAULT",
                "variantSocketMap": {}
            })]
        );
    }

    #[test]
    fn test_ok_with_operations() {
        let resolved = resolve(json!({
            "status": "ok",
            "message": "created",
            "operations": {"create": {"subnet": {"kind": "Subnet"}}}
        }))
        .unwrap();
        let json = serde_json::to_value(&resolved.data).unwrap();
        assert_eq!(json["health"], json!("ok"));
        assert_eq!(json["message"], json!("created"));
        assert_eq!(json["operations"]["create"]["subnet"]["kind"], json!("Subnet"));
    }

    #[test]
    fn test_error_requires_message() {
        assert_eq!(
            resolve(json!({"status": "error"})).unwrap_err().kind,
            FailureKind::ManagementFieldWrongType
        );
        assert!(resolve(json!({"status": "error", "message": "nope"})).is_ok());
    }

    #[test]
    fn test_field_types() {
        for bad in [
            json!({"status": "warning"}),
            json!({"status": 1}),
            json!({"status": "ok", "operations": []}),
            json!({"status": "ok", "message": 5}),
        ] {
            assert_eq!(
                resolve(bad).unwrap_err().kind,
                FailureKind::ManagementFieldWrongType
            );
        }
    }
}
