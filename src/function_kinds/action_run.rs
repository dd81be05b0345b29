use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{optional_string, present, require_object, KindContract, Resolved};
use crate::classify::{FailureKind, FunctionFailure};
use crate::function::SuccessData;
use crate::sandbox::wrapper::Template;

/// Resource health reported by action and management functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Ok,
    Warning,
    Error,
}

impl FromStr for Health {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Health::Ok),
            "warning" => Ok(Health::Warning),
            "error" => Ok(Health::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionRunPayload {
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRunSuccess {
    pub payload: Value,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

fn wrong(message: &str) -> FunctionFailure {
    FunctionFailure::new(FailureKind::ActionFieldWrongType, message)
}

impl KindContract for ActionRunPayload {
    fn arguments(&self) -> Vec<Value> {
        vec![self.args.clone()]
    }

    fn template(&self) -> Template {
        Template::ACTION_RUN
    }

    fn resolve(&self, returned: Option<Value>) -> Result<Resolved, FunctionFailure> {
        let object = require_object(returned)?;

        let status = match present(&object, "status") {
            Some(Value::String(status)) => status.as_str(),
            _ => return Err(wrong("The status field type must be string")),
        };
        let health = Health::from_str(status)
            .map_err(|_| wrong("The status field must be one of 'ok', 'warning' or 'error'"))?;

        let message = present(&object, "message");
        match (health, message) {
            (Health::Ok, Some(_)) => {
                return Err(wrong("The message field type must be undefined when status is 'ok'"))
            }
            (Health::Warning | Health::Error, Some(Value::String(_))) | (Health::Ok, None) => {}
            (Health::Warning | Health::Error, _) => {
                return Err(wrong("The message field type must be string when status is not 'ok'"))
            }
        }
        let message = optional_string(&object, "message", FailureKind::ActionFieldWrongType)?;
        let resource_id = optional_string(&object, "resourceId", FailureKind::ActionFieldWrongType)?;

        Ok(SuccessData::ActionRun(ActionRunSuccess {
            payload: object.get("payload").cloned().unwrap_or(Value::Null),
            health,
            message,
            resource_id,
        })
        .into())
    }
}
