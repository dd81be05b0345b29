use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{require_object, KindContract, Resolved};
use crate::classify::FunctionFailure;
use crate::function::SuccessData;
use crate::sandbox::wrapper::Template;

/// Schema authoring takes no input; the handler builds an asset definition
/// with the builder capabilities and returns it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaVariantDefinitionPayload {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaVariantDefinitionSuccess {
    pub definition: Value,
}

impl KindContract for SchemaVariantDefinitionPayload {
    fn arguments(&self) -> Vec<Value> {
        Vec::new()
    }

    fn template(&self) -> Template {
        Template::SCHEMA_VARIANT_DEFINITION
    }

    fn resolve(&self, returned: Option<Value>) -> Result<Resolved, FunctionFailure> {
        let definition = require_object(returned)?;
        Ok(SuccessData::SchemaVariantDefinition(SchemaVariantDefinitionSuccess {
            definition: Value::Object(definition),
        })
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FailureKind;
    use serde_json::json;

    #[test]
    fn test_definition_must_be_object() {
        let payload = SchemaVariantDefinitionPayload::default();
        assert!(payload.arguments().is_empty());
        let resolved = payload.resolve(Some(json!({"props": []}))).unwrap();
        assert_eq!(
            serde_json::to_value(&resolved.data).unwrap(),
            json!({"definition": {"props": []}})
        );
        assert_eq!(
            payload.resolve(Some(json!([]))).unwrap_err().kind,
            FailureKind::InvalidReturnType
        );
    }
}
