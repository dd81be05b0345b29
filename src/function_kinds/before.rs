use serde::Deserialize;
use serde_json::Value;

use super::{KindContract, Resolved};
use crate::classify::FunctionFailure;
use crate::function::SuccessData;
use crate::sandbox::wrapper::Template;

/// A before-hook: runs for its side effects on request storage. Its return
/// value is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BeforePayload {
    #[serde(default)]
    pub arg: Value,
}

impl KindContract for BeforePayload {
    fn arguments(&self) -> Vec<Value> {
        vec![self.arg.clone()]
    }

    fn template(&self) -> Template {
        Template::BEFORE
    }

    fn resolve(&self, _returned: Option<Value>) -> Result<Resolved, FunctionFailure> {
        Ok(SuccessData::Before.into())
    }
}
