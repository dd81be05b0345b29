//! Per-kind request payloads and result contracts.
//!
//! Each kind knows three things: the positional arguments its handler
//! receives, the wrapper template that calls it, and the ordered structural
//! checks its return value must pass. Checks short-circuit on the first
//! violation and every violation carries a named [`FailureKind`].

pub mod action_run;
pub mod before;
pub mod confirmation;
pub mod management;
pub mod resolver_function;
pub mod schema_variant_definition;
pub mod validation;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::classify::{FailureKind, FunctionFailure};
use crate::function::{Func, FunctionKind, RequestError, SuccessData};
use crate::sandbox::wrapper::Template;

pub use action_run::{ActionRunPayload, ActionRunSuccess, Health};
pub use before::BeforePayload;
pub use confirmation::{ConfirmationPayload, ConfirmationSuccess};
pub use management::{ManagementPayload, ManagementSuccess};
pub use resolver_function::{ResolverFunctionPayload, ResolverFunctionSuccess, ResponseType};
pub use schema_variant_definition::{SchemaVariantDefinitionPayload, SchemaVariantDefinitionSuccess};
pub use validation::ValidationPayload;

/// Guest source and the handler to invoke in it.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestSource {
    pub code: String,
    pub handler: String,
}

/// A validated return value, ready to become a success Result.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub data: SuccessData,
    pub error: Option<String>,
}

impl From<SuccessData> for Resolved {
    fn from(data: SuccessData) -> Self {
        Self { data, error: None }
    }
}

pub trait KindContract {
    /// Positional arguments handed to the handler, in order.
    fn arguments(&self) -> Vec<Value>;

    fn template(&self) -> Template;

    /// The code to run. Most kinds run the caller's code as-is.
    fn guest(&self, func: &Func) -> Result<GuestSource, RequestError> {
        Ok(GuestSource {
            code: func.source()?,
            handler: func.handler.clone(),
        })
    }

    /// Checks the handler's return value (`None` is `undefined`).
    fn resolve(&self, returned: Option<Value>) -> Result<Resolved, FunctionFailure>;
}

/// Kind-specific request fields, parsed once per Request.
#[derive(Debug, Clone)]
pub enum KindPayload {
    ActionRun(ActionRunPayload),
    Before(BeforePayload),
    Confirmation(ConfirmationPayload),
    Management(ManagementPayload),
    ResolverFunction(ResolverFunctionPayload),
    SchemaVariantDefinition(SchemaVariantDefinitionPayload),
    Validation(ValidationPayload),
}

fn from_fields<T: DeserializeOwned>(kind: FunctionKind, fields: Map<String, Value>) -> Result<T, RequestError> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|source| RequestError::InvalidPayload { kind, source })
}

impl KindPayload {
    pub fn parse(kind: FunctionKind, fields: Map<String, Value>) -> Result<Self, RequestError> {
        Ok(match kind {
            FunctionKind::ActionRun => KindPayload::ActionRun(from_fields(kind, fields)?),
            FunctionKind::Before => KindPayload::Before(from_fields(kind, fields)?),
            FunctionKind::Confirmation => KindPayload::Confirmation(from_fields(kind, fields)?),
            FunctionKind::Management => KindPayload::Management(from_fields(kind, fields)?),
            FunctionKind::ResolverFunction => {
                KindPayload::ResolverFunction(from_fields(kind, fields)?)
            }
            FunctionKind::SchemaVariantDefinition => {
                KindPayload::SchemaVariantDefinition(from_fields(kind, fields)?)
            }
            FunctionKind::Validation => KindPayload::Validation(from_fields(kind, fields)?),
        })
    }

    pub fn kind(&self) -> FunctionKind {
        match self {
            KindPayload::ActionRun(_) => FunctionKind::ActionRun,
            KindPayload::Before(_) => FunctionKind::Before,
            KindPayload::Confirmation(_) => FunctionKind::Confirmation,
            KindPayload::Management(_) => FunctionKind::Management,
            KindPayload::ResolverFunction(_) => FunctionKind::ResolverFunction,
            KindPayload::SchemaVariantDefinition(_) => FunctionKind::SchemaVariantDefinition,
            KindPayload::Validation(_) => FunctionKind::Validation,
        }
    }

    pub fn contract(&self) -> &dyn KindContract {
        match self {
            KindPayload::ActionRun(payload) => payload,
            KindPayload::Before(payload) => payload,
            KindPayload::Confirmation(payload) => payload,
            KindPayload::Management(payload) => payload,
            KindPayload::ResolverFunction(payload) => payload,
            KindPayload::SchemaVariantDefinition(payload) => payload,
            KindPayload::Validation(payload) => payload,
        }
    }
}

// ── Shared checks ───────────────────────────────────────

/// Rejects `null`/`undefined` and non-objects with `InvalidReturnType`.
pub(crate) fn require_object(returned: Option<Value>) -> Result<Map<String, Value>, FunctionFailure> {
    match returned {
        None | Some(Value::Null) => Err(FunctionFailure::invalid_return(
            "Return value must not be null or undefined",
        )),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(FunctionFailure::invalid_return("Return type must be an object")),
    }
}

/// A field counts as absent when missing or `null`.
pub(crate) fn present<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    object.get(field).filter(|value| !value.is_null())
}

/// Optional string field; any other present type is a violation of `kind`.
pub(crate) fn optional_string(
    object: &Map<String, Value>,
    field: &str,
    kind: FailureKind,
) -> Result<Option<String>, FunctionFailure> {
    match present(object, field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(FunctionFailure::new(
            kind,
            format!("The {field} field type must be string"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_every_kind_parses_minimal_payload() {
        for kind in FunctionKind::ALL {
            let minimal = match kind {
                FunctionKind::ResolverFunction => json!({
                    "component": {"data": {"properties": {}, "kind": "standard"}, "parents": []},
                    "responseType": "object"
                }),
                _ => json!({}),
            };
            let payload = KindPayload::parse(kind, fields(minimal)).unwrap();
            assert_eq!(payload.kind(), kind);
        }
    }

    #[test]
    fn test_null_and_undefined_rejected_for_strict_kinds() {
        let strict = [
            FunctionKind::ActionRun,
            FunctionKind::Confirmation,
            FunctionKind::Management,
            FunctionKind::SchemaVariantDefinition,
            FunctionKind::Validation,
        ];
        for kind in strict {
            let payload = KindPayload::parse(kind, Map::new()).unwrap();
            for returned in [None, Some(Value::Null)] {
                let failure = payload.contract().resolve(returned).unwrap_err();
                assert_eq!(failure.kind, FailureKind::InvalidReturnType, "{kind}");
            }
        }
    }

    #[test]
    fn test_invalid_payload_is_request_error() {
        let err = KindPayload::parse(
            FunctionKind::ResolverFunction,
            fields(json!({"responseType": "spaceship"})),
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::InvalidPayload { .. }));
    }

    #[test]
    fn test_present_treats_null_as_absent() {
        let object = fields(json!({"a": null, "b": 1}));
        assert!(present(&object, "a").is_none());
        assert!(present(&object, "missing").is_none());
        assert_eq!(present(&object, "b"), Some(&json!(1)));
    }
}
