use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::{present, require_object, GuestSource, KindContract, Resolved};
use crate::classify::{FailureKind, FunctionFailure};
use crate::format::FormatDescription;
use crate::function::{Func, RequestError, SuccessData};
use crate::sandbox::wrapper::Template;

/// Handler used when the request carries a validation format instead of
/// guest code.
pub const BUILTIN_HANDLER: &str = "__validateFormat";

const BUILTIN_SOURCE: &str = r#"
function __validateFormat(input, format) {
  const { error } = Joi.build(format).validate(input.value);
  return error ? { valid: false, message: error.message } : { valid: true };
}
"#;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationPayload {
    /// `None` is `undefined`; an explicit `null` stays `Some(Null)`.
    #[serde(default, deserialize_with = "defined")]
    pub value: Option<Value>,
    /// Joi description, accepted as JSON text or as an object.
    #[serde(default, deserialize_with = "format_description")]
    pub validation_format: Option<Value>,
}

fn defined<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

fn format_description<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    let description = match raw {
        Value::Null => return Ok(None),
        Value::String(text) => serde_json::from_str(&text).map_err(D::Error::custom)?,
        other => other,
    };
    // Reject structurally broken descriptions before any code runs.
    FormatDescription::from_value(description.clone()).map_err(D::Error::custom)?;
    Ok(Some(description))
}

impl KindContract for ValidationPayload {
    fn arguments(&self) -> Vec<Value> {
        match &self.validation_format {
            Some(format) => {
                let input = match &self.value {
                    Some(value) => json!({ "value": value }),
                    None => json!({}),
                };
                vec![input, format.clone()]
            }
            None => vec![self.value.clone().unwrap_or(Value::Null)],
        }
    }

    fn template(&self) -> Template {
        match self.validation_format {
            Some(_) => Template::VALIDATION_FORMAT,
            None => Template::VALIDATION,
        }
    }

    fn guest(&self, func: &Func) -> Result<GuestSource, RequestError> {
        if self.validation_format.is_some() {
            return Ok(GuestSource {
                code: BUILTIN_SOURCE.to_string(),
                handler: BUILTIN_HANDLER.to_string(),
            });
        }
        Ok(GuestSource {
            code: func.source()?,
            handler: func.handler.clone(),
        })
    }

    fn resolve(&self, returned: Option<Value>) -> Result<Resolved, FunctionFailure> {
        let wrong = |message: &str| FunctionFailure::new(FailureKind::ValidationFieldWrongType, message);
        let object = require_object(returned)?;

        let Some(Value::Bool(valid)) = present(&object, "valid") else {
            return Err(wrong("The valid field type must be boolean"));
        };
        let message = match present(&object, "message") {
            None => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(_) => return Err(wrong("The message field type must be string")),
        };
        if !valid && message.is_none() {
            return Err(wrong("The message field type must be string when valid is false"));
        }

        Ok(Resolved {
            data: SuccessData::Validation,
            error: if *valid { None } else { message },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> ValidationPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_format_text_is_parsed() {
        let payload = parse(json!({
            "value": "foobar",
            "validationFormat": "{\"type\":\"number\"}"
        }));
        assert_eq!(payload.validation_format, Some(json!({"type": "number"})));
        assert_eq!(payload.template(), Template::VALIDATION_FORMAT);
        assert_eq!(
            payload.arguments(),
            vec![json!({"value": "foobar"}), json!({"type": "number"})]
        );
    }

    #[test]
    fn test_undefined_value_is_omitted() {
        let payload = parse(json!({"validationFormat": {"type": "string"}}));
        assert_eq!(payload.value, None);
        assert_eq!(payload.arguments()[0], json!({}));

        let payload = parse(json!({"value": null, "validationFormat": {"type": "string"}}));
        assert_eq!(payload.value, Some(Value::Null));
        assert_eq!(payload.arguments()[0], json!({"value": null}));
    }

    #[test]
    fn test_broken_format_is_rejected_at_parse() {
        let result: Result<ValidationPayload, _> =
            serde_json::from_value(json!({"value": 1, "validationFormat": "{nope"}));
        assert!(result.is_err());
        let result: Result<ValidationPayload, _> =
            serde_json::from_value(json!({"value": 1, "validationFormat": {"type": "spaceship"}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_builtin_guest_replaces_caller_code() {
        let payload = parse(json!({"value": 1, "validationFormat": {"type": "number"}}));
        let guest = payload.guest(&Func::new("ignored", "garbage(")).unwrap();
        assert_eq!(guest.handler, BUILTIN_HANDLER);

        let legacy = parse(json!({"value": 1}));
        let guest = legacy.guest(&Func::new("check", "function check(v) {}")).unwrap();
        assert_eq!(guest.handler, "check");
        assert_eq!(legacy.arguments(), vec![json!(1)]);
    }

    #[test]
    fn test_invalid_result_reports_error_on_success() {
        let payload = ValidationPayload::default();
        let resolved = payload
            .resolve(Some(json!({"valid": false, "message": "\"value\" must be a number"})))
            .unwrap();
        assert_eq!(resolved.data, SuccessData::Validation);
        assert_eq!(resolved.error.as_deref(), Some("\"value\" must be a number"));

        let resolved = payload.resolve(Some(json!({"valid": true}))).unwrap();
        assert_eq!(resolved.error, None);
    }

    #[test]
    fn test_field_types() {
        let payload = ValidationPayload::default();
        for bad in [
            json!({"valid": "yes"}),
            json!({"valid": false}),
            json!({"valid": true, "message": 4}),
        ] {
            assert_eq!(
                payload.resolve(Some(bad)).unwrap_err().kind,
                FailureKind::ValidationFieldWrongType
            );
        }
    }
}
