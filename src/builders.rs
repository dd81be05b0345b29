//! Fluent schema-authoring builders exposed to schema variant definitions.
//!
//! Guest code drives these through thin JavaScript classes; every fluent call
//! is forwarded here and checked immediately, so an out-of-order or
//! ill-typed call throws at the call site rather than producing a broken
//! definition later.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BuilderError {
    #[error("unknown builder `{0}`")]
    UnknownBuilder(String),
    #[error("unknown builder handle {0}")]
    UnknownHandle(u32),
    #[error("{builder}.{method} is not a function")]
    UnknownMethod {
        builder: &'static str,
        method: String,
    },
    #[error("{builder}.{method}: argument {index} must be {expected}")]
    WrongArgument {
        builder: &'static str,
        method: String,
        index: usize,
        expected: &'static str,
    },
    #[error("{builder}.{method}: `{value}` is not one of {allowed}")]
    InvalidChoice {
        builder: &'static str,
        method: String,
        value: String,
        allowed: &'static str,
    },
    #[error("{builder}.{method} must be called after {required}")]
    OutOfOrder {
        builder: &'static str,
        method: String,
        required: &'static str,
    },
    #[error("{builder}.{method} is only valid for {allowed} props, not `{kind}`")]
    WrongPropKind {
        builder: &'static str,
        method: String,
        allowed: &'static str,
        kind: String,
    },
    #[error("{builder}.build: missing required field `{field}`")]
    Missing {
        builder: &'static str,
        field: &'static str,
    },
}

// ── Definitions ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueFromKind {
    InputSocket,
    OutputSocket,
    Prop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueFrom {
    pub kind: ValueFromKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prop_path: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketArity {
    Many,
    One,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketDefinition {
    pub name: String,
    pub arity: SocketArity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_hidden: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationKind {
    CustomValidation,
    IntegerIsBetweenTwoIntegers,
    IntegerIsNotEmpty,
    StringEquals,
    StringHasPrefix,
    StringInStringArray,
    StringIsHexColor,
    StringIsNotEmpty,
    StringIsValidIpAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDefinition {
    pub kind: ValidationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub func_unique_id: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_expected: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WidgetKind {
    Array,
    Checkbox,
    CodeEditor,
    Color,
    ComboBox,
    Header,
    Map,
    Password,
    Secret,
    Select,
    Text,
    TextArea,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropWidgetDefinition {
    pub kind: WidgetKind,
    #[serde(default)]
    pub options: Vec<WidgetOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapKeyFunc {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SiPropValueFromKind {
    Color,
    Name,
    ResourcePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiPropValueFromDefinition {
    pub kind: SiPropValueFromKind,
    pub value_from: ValueFrom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropKind {
    Array,
    Boolean,
    Integer,
    Map,
    Object,
    String,
}

impl PropKind {
    fn as_str(&self) -> &'static str {
        match self {
            PropKind::Array => "array",
            PropKind::Boolean => "boolean",
            PropKind::Integer => "integer",
            PropKind::Map => "map",
            PropKind::Object => "object",
            PropKind::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropDefinition {
    pub name: String,
    pub kind: PropKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_link_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<PropDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<Box<PropDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<PropWidgetDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validations: Option<Vec<ValidationDefinition>>,
    /// Joi description serialized as JSON text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_key_funcs: Option<Vec<MapKeyFunc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretPropDefinition {
    #[serde(flatten)]
    pub prop: PropDefinition,
    pub has_input_socket: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretDefinition {
    pub name: String,
    #[serde(default)]
    pub props: Vec<PropDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub props: Vec<PropDefinition>,
    pub secret_props: Vec<SecretPropDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_definition: Option<Vec<PropDefinition>>,
    pub resource_props: Vec<PropDefinition>,
    pub si_prop_value_froms: Vec<SiPropValueFromDefinition>,
    pub input_sockets: Vec<SocketDefinition>,
    pub output_sockets: Vec<SocketDefinition>,
    pub doc_links: BTreeMap<String, String>,
}

// ── Call arguments ──────────────────────────────────────

/// One fluent method call as received from guest code.
pub struct Call<'a> {
    builder: &'static str,
    method: &'a str,
    args: &'a [Value],
}

impl<'a> Call<'a> {
    pub fn new(builder: &'static str, method: &'a str, args: &'a [Value]) -> Self {
        Self {
            builder,
            method,
            args,
        }
    }

    fn wrong(&self, index: usize, expected: &'static str) -> BuilderError {
        BuilderError::WrongArgument {
            builder: self.builder,
            method: self.method.to_string(),
            index,
            expected,
        }
    }

    fn unknown(&self) -> BuilderError {
        BuilderError::UnknownMethod {
            builder: self.builder,
            method: self.method.to_string(),
        }
    }

    fn out_of_order(&self, required: &'static str) -> BuilderError {
        BuilderError::OutOfOrder {
            builder: self.builder,
            method: self.method.to_string(),
            required,
        }
    }

    fn string(&self, index: usize) -> Result<String, BuilderError> {
        match self.args.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(self.wrong(index, "a string")),
        }
    }

    fn boolean(&self, index: usize) -> Result<bool, BuilderError> {
        match self.args.get(index) {
            Some(Value::Bool(b)) => Ok(*b),
            _ => Err(self.wrong(index, "a boolean")),
        }
    }

    fn number(&self, index: usize) -> Result<f64, BuilderError> {
        self.args
            .get(index)
            .and_then(Value::as_f64)
            .ok_or_else(|| self.wrong(index, "a number"))
    }

    fn value(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Null)
    }

    fn typed<T: DeserializeOwned>(&self, index: usize, expected: &'static str) -> Result<T, BuilderError> {
        let value = self.args.get(index).ok_or_else(|| self.wrong(index, expected))?;
        serde_json::from_value(value.clone()).map_err(|_| self.wrong(index, expected))
    }

    fn choice<T: DeserializeOwned>(&self, index: usize, allowed: &'static str) -> Result<T, BuilderError> {
        let raw = self.string(index)?;
        serde_json::from_value(Value::String(raw.clone())).map_err(|_| BuilderError::InvalidChoice {
            builder: self.builder,
            method: self.method.to_string(),
            value: raw,
            allowed,
        })
    }
}

fn missing(builder: &'static str, field: &'static str) -> BuilderError {
    BuilderError::Missing { builder, field }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, BuilderError> {
    // Every definition type serializes to a JSON object infallibly.
    Ok(serde_json::to_value(value).unwrap_or(Value::Null))
}

/// A stateful builder instance living inside one isolate.
pub trait Builder: Send {
    fn name(&self) -> &'static str;
    fn methods(&self) -> &'static [&'static str];
    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError>;
    fn build(&self) -> Result<Value, BuilderError>;
}

pub const BUILDER_NAMES: [&str; 10] = [
    "AssetBuilder",
    "MapKeyFuncBuilder",
    "PropBuilder",
    "PropWidgetDefinitionBuilder",
    "SecretDefinitionBuilder",
    "SecretPropBuilder",
    "SiPropValueFromDefinitionBuilder",
    "SocketDefinitionBuilder",
    "ValidationBuilder",
    "ValueFromBuilder",
];

pub fn new_builder(name: &str) -> Result<Box<dyn Builder>, BuilderError> {
    let builder: Box<dyn Builder> = match name {
        "AssetBuilder" => Box::<AssetBuilder>::default(),
        "MapKeyFuncBuilder" => Box::<MapKeyFuncBuilder>::default(),
        "PropBuilder" => Box::<PropBuilder>::default(),
        "PropWidgetDefinitionBuilder" => Box::<PropWidgetDefinitionBuilder>::default(),
        "SecretDefinitionBuilder" => Box::<SecretDefinitionBuilder>::default(),
        "SecretPropBuilder" => Box::<SecretPropBuilder>::default(),
        "SiPropValueFromDefinitionBuilder" => Box::<SiPropValueFromDefinitionBuilder>::default(),
        "SocketDefinitionBuilder" => Box::<SocketDefinitionBuilder>::default(),
        "ValidationBuilder" => Box::<ValidationBuilder>::default(),
        "ValueFromBuilder" => Box::<ValueFromBuilder>::default(),
        other => return Err(BuilderError::UnknownBuilder(other.to_string())),
    };
    Ok(builder)
}

/// Builders created by one invocation, addressed by handle.
#[derive(Default)]
pub struct BuilderArena {
    builders: Vec<Box<dyn Builder>>,
}

impl BuilderArena {
    pub fn create(&mut self, name: &str) -> Result<u32, BuilderError> {
        let builder = new_builder(name)?;
        self.builders.push(builder);
        Ok((self.builders.len() - 1) as u32)
    }

    pub fn call(&mut self, handle: u32, method: &str, args: &[Value]) -> Result<(), BuilderError> {
        let builder = self
            .builders
            .get_mut(handle as usize)
            .ok_or(BuilderError::UnknownHandle(handle))?;
        let call = Call::new(builder.name(), method, args);
        builder.call(&call)
    }

    pub fn build(&self, handle: u32) -> Result<Value, BuilderError> {
        self.builders
            .get(handle as usize)
            .ok_or(BuilderError::UnknownHandle(handle))?
            .build()
    }
}

// ── Builders ────────────────────────────────────────────

#[derive(Default)]
pub struct ValueFromBuilder {
    kind: Option<ValueFromKind>,
    socket_name: Option<String>,
    prop_path: Option<Vec<String>>,
}

impl Builder for ValueFromBuilder {
    fn name(&self) -> &'static str {
        "ValueFromBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &["setKind", "setSocketName", "setPropPath"]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        match call.method {
            "setKind" => self.kind = Some(call.choice(0, "[inputSocket, outputSocket, prop]")?),
            "setSocketName" => self.socket_name = Some(call.string(0)?),
            "setPropPath" => self.prop_path = Some(call.typed(0, "an array of strings")?),
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        let kind = self.kind.ok_or_else(|| missing(self.name(), "kind"))?;
        match kind {
            ValueFromKind::InputSocket | ValueFromKind::OutputSocket if self.socket_name.is_none() => {
                return Err(missing(self.name(), "socket_name"));
            }
            ValueFromKind::Prop if self.prop_path.is_none() => {
                return Err(missing(self.name(), "prop_path"));
            }
            _ => {}
        }
        to_json(&ValueFrom {
            kind,
            socket_name: self.socket_name.clone(),
            prop_path: self.prop_path.clone(),
        })
    }
}

#[derive(Default)]
pub struct SocketDefinitionBuilder {
    name: Option<String>,
    arity: Option<SocketArity>,
    ui_hidden: Option<bool>,
    value_from: Option<ValueFrom>,
}

impl Builder for SocketDefinitionBuilder {
    fn name(&self) -> &'static str {
        "SocketDefinitionBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &["setName", "setArity", "setUiHidden", "setValueFrom"]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        match call.method {
            "setName" => self.name = Some(call.string(0)?),
            "setArity" => {
                if self.name.is_none() {
                    return Err(call.out_of_order("setName"));
                }
                self.arity = Some(call.choice(0, "[many, one]")?);
            }
            "setUiHidden" => self.ui_hidden = Some(call.boolean(0)?),
            "setValueFrom" => self.value_from = Some(call.typed(0, "a ValueFrom")?),
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        let name = self.name.clone().ok_or_else(|| missing(self.name(), "name"))?;
        to_json(&SocketDefinition {
            name,
            arity: self.arity.unwrap_or(SocketArity::Many),
            ui_hidden: self.ui_hidden,
            value_from: self.value_from.clone(),
        })
    }
}

#[derive(Default)]
pub struct ValidationBuilder {
    kind: Option<ValidationKind>,
    func_unique_id: Option<Map<String, Value>>,
    lower_bound: Option<f64>,
    upper_bound: Option<f64>,
    expected: Option<Vec<String>>,
    display_expected: Option<bool>,
}

impl Builder for ValidationBuilder {
    fn name(&self) -> &'static str {
        "ValidationBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &[
            "setKind",
            "addFuncUniqueId",
            "setLowerBound",
            "setUpperBound",
            "addExpected",
            "setDisplayExpected",
        ]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        match call.method {
            "setKind" => {
                self.kind = Some(call.choice(
                    0,
                    "[customValidation, integerIsBetweenTwoIntegers, integerIsNotEmpty, \
                     stringEquals, stringHasPrefix, stringInStringArray, stringIsHexColor, \
                     stringIsNotEmpty, stringIsValidIpAddr]",
                )?)
            }
            "addFuncUniqueId" => {
                let key = call.string(0)?;
                self.func_unique_id
                    .get_or_insert_with(Map::new)
                    .insert(key, call.value(1));
            }
            "setLowerBound" => self.lower_bound = Some(call.number(0)?),
            "setUpperBound" => self.upper_bound = Some(call.number(0)?),
            "addExpected" => self.expected.get_or_insert_with(Vec::new).push(call.string(0)?),
            "setDisplayExpected" => self.display_expected = Some(call.boolean(0)?),
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        let kind = self.kind.ok_or_else(|| missing(self.name(), "kind"))?;
        to_json(&ValidationDefinition {
            kind,
            func_unique_id: self.func_unique_id.clone(),
            lower_bound: self.lower_bound,
            upper_bound: self.upper_bound,
            expected: self.expected.clone(),
            display_expected: self.display_expected,
        })
    }
}

#[derive(Default)]
pub struct PropWidgetDefinitionBuilder {
    kind: Option<WidgetKind>,
    options: Vec<WidgetOption>,
}

impl Builder for PropWidgetDefinitionBuilder {
    fn name(&self) -> &'static str {
        "PropWidgetDefinitionBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &["setKind", "addOption"]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        match call.method {
            "setKind" => {
                self.kind = Some(call.choice(
                    0,
                    "[array, checkbox, codeEditor, color, comboBox, header, map, password, \
                     secret, select, text, textArea]",
                )?)
            }
            "addOption" => self.options.push(WidgetOption {
                label: call.string(0)?,
                value: call.string(1)?,
            }),
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        let kind = self.kind.ok_or_else(|| missing(self.name(), "kind"))?;
        to_json(&PropWidgetDefinition {
            kind,
            options: self.options.clone(),
        })
    }
}

#[derive(Default)]
pub struct MapKeyFuncBuilder {
    key: Option<String>,
    value_from: Option<ValueFrom>,
}

impl Builder for MapKeyFuncBuilder {
    fn name(&self) -> &'static str {
        "MapKeyFuncBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &["setKey", "setValueFrom"]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        match call.method {
            "setKey" => self.key = Some(call.string(0)?),
            "setValueFrom" => self.value_from = Some(call.typed(0, "a ValueFrom")?),
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        let key = self.key.clone().ok_or_else(|| missing(self.name(), "key"))?;
        to_json(&MapKeyFunc {
            key,
            value_from: self.value_from.clone(),
        })
    }
}

#[derive(Default)]
pub struct SiPropValueFromDefinitionBuilder {
    kind: Option<SiPropValueFromKind>,
    value_from: Option<ValueFrom>,
}

impl Builder for SiPropValueFromDefinitionBuilder {
    fn name(&self) -> &'static str {
        "SiPropValueFromDefinitionBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &["setKind", "setValueFrom"]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        match call.method {
            "setKind" => self.kind = Some(call.choice(0, "[color, name, resourcePayload]")?),
            "setValueFrom" => self.value_from = Some(call.typed(0, "a ValueFrom")?),
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        let kind = self.kind.ok_or_else(|| missing(self.name(), "kind"))?;
        let value_from = self
            .value_from
            .clone()
            .ok_or_else(|| missing(self.name(), "valueFrom"))?;
        to_json(&SiPropValueFromDefinition { kind, value_from })
    }
}

/// Shared state of [`PropBuilder`] and [`SecretPropBuilder`].
#[derive(Default)]
struct PropState {
    name: Option<String>,
    kind: Option<PropKind>,
    doc_link_ref: Option<String>,
    doc_link: Option<String>,
    documentation: Option<String>,
    children: Vec<PropDefinition>,
    entry: Option<PropDefinition>,
    widget: Option<PropWidgetDefinition>,
    value_from: Option<ValueFrom>,
    hidden: Option<bool>,
    default_value: Option<Value>,
    validations: Vec<ValidationDefinition>,
    validation_format: Option<String>,
    map_key_funcs: Vec<MapKeyFunc>,
}

impl PropState {
    fn require_kind(&self, call: &Call<'_>, allowed: &[PropKind], label: &'static str) -> Result<(), BuilderError> {
        let kind = self.kind.ok_or_else(|| call.out_of_order("setKind"))?;
        if !allowed.contains(&kind) {
            return Err(BuilderError::WrongPropKind {
                builder: call.builder,
                method: call.method.to_string(),
                allowed: label,
                kind: kind.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Handles the calls common to every prop builder. Returns `false` for
    /// methods it does not know.
    fn apply(&mut self, call: &Call<'_>) -> Result<bool, BuilderError> {
        match call.method {
            "setName" => self.name = Some(call.string(0)?),
            "setDocLinkRef" => self.doc_link_ref = Some(call.string(0)?),
            "setDocLink" => self.doc_link = Some(call.string(0)?),
            "setDocumentation" => self.documentation = Some(call.string(0)?),
            "addValidation" => self.validations.push(call.typed(0, "a Validation")?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn definition(&self, builder: &'static str) -> Result<PropDefinition, BuilderError> {
        let name = self.name.clone().ok_or_else(|| missing(builder, "name"))?;
        let kind = self.kind.ok_or_else(|| missing(builder, "kind"))?;
        let children = match kind {
            PropKind::Object => Some(self.children.clone()),
            _ => None,
        };
        Ok(PropDefinition {
            name,
            kind,
            doc_link_ref: self.doc_link_ref.clone(),
            doc_link: self.doc_link.clone(),
            documentation: self.documentation.clone(),
            children,
            entry: self.entry.clone().map(Box::new),
            widget: self.widget.clone(),
            value_from: self.value_from.clone(),
            hidden: self.hidden,
            default_value: self.default_value.clone(),
            validations: (!self.validations.is_empty()).then(|| self.validations.clone()),
            validation_format: self.validation_format.clone(),
            map_key_funcs: (!self.map_key_funcs.is_empty()).then(|| self.map_key_funcs.clone()),
        })
    }
}

#[derive(Default)]
pub struct PropBuilder {
    state: PropState,
}

impl Builder for PropBuilder {
    fn name(&self) -> &'static str {
        "PropBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &[
            "setName",
            "setKind",
            "setDocLinkRef",
            "setDocumentation",
            "setDocLink",
            "addChild",
            "setEntry",
            "setWidget",
            "setValueFrom",
            "setHidden",
            "setDefaultValue",
            "addValidation",
            "setValidationFormat",
            "addMapKeyFunc",
        ]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        if self.state.apply(call)? {
            return Ok(());
        }
        let state = &mut self.state;
        match call.method {
            "setKind" => {
                state.kind = Some(call.choice(0, "[array, boolean, integer, map, object, string]")?)
            }
            "addChild" => {
                state.require_kind(call, &[PropKind::Object], "object")?;
                state.children.push(call.typed(0, "a PropDefinition")?);
            }
            "setEntry" => {
                state.require_kind(call, &[PropKind::Array, PropKind::Map], "array or map")?;
                state.entry = Some(call.typed(0, "a PropDefinition")?);
            }
            "addMapKeyFunc" => {
                state.require_kind(call, &[PropKind::Map], "map")?;
                state.map_key_funcs.push(call.typed(0, "a MapKeyFunc")?);
            }
            "setWidget" => state.widget = Some(call.typed(0, "a PropWidgetDefinition")?),
            "setValueFrom" => state.value_from = Some(call.typed(0, "a ValueFrom")?),
            "setHidden" => state.hidden = Some(call.boolean(0)?),
            "setDefaultValue" => state.default_value = Some(call.value(0)),
            "setValidationFormat" => {
                let format = call.value(0);
                if !format.is_object() {
                    return Err(call.wrong(0, "a Joi schema"));
                }
                state.validation_format = Some(format.to_string());
            }
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        let definition = self.state.definition(self.name())?;
        if matches!(definition.kind, PropKind::Array | PropKind::Map) && definition.entry.is_none() {
            return Err(missing(self.name(), "entry"));
        }
        to_json(&definition)
    }
}

#[derive(Default)]
pub struct SecretPropBuilder {
    state: PropState,
    secret_kind: Option<String>,
    has_input_socket: Option<bool>,
}

impl Builder for SecretPropBuilder {
    fn name(&self) -> &'static str {
        "SecretPropBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &[
            "setName",
            "setSecretKind",
            "setDocLinkRef",
            "setDocLink",
            "addValidation",
            "skipInputSocket",
        ]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        if self.state.apply(call)? {
            return Ok(());
        }
        match call.method {
            "setSecretKind" => self.secret_kind = Some(call.string(0)?),
            "skipInputSocket" => self.has_input_socket = Some(false),
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        let Some(secret_kind) = self.secret_kind.clone() else {
            return Err(BuilderError::OutOfOrder {
                builder: self.name(),
                method: "build".to_string(),
                required: "setSecretKind",
            });
        };
        let prop = PropState {
            name: self.state.name.clone(),
            kind: Some(PropKind::String),
            doc_link_ref: self.state.doc_link_ref.clone(),
            doc_link: self.state.doc_link.clone(),
            validations: self.state.validations.clone(),
            widget: Some(PropWidgetDefinition {
                kind: WidgetKind::Secret,
                options: vec![WidgetOption {
                    label: "secretKind".to_string(),
                    value: secret_kind,
                }],
            }),
            ..Default::default()
        };
        to_json(&SecretPropDefinition {
            prop: prop.definition(self.name())?,
            has_input_socket: self.has_input_socket.unwrap_or(true),
        })
    }
}

#[derive(Default)]
pub struct SecretDefinitionBuilder {
    name: Option<String>,
    props: Vec<PropDefinition>,
}

impl Builder for SecretDefinitionBuilder {
    fn name(&self) -> &'static str {
        "SecretDefinitionBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &["setName", "addProp"]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        match call.method {
            "setName" => self.name = Some(call.string(0)?),
            "addProp" => self.props.push(call.typed(0, "a PropDefinition")?),
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        let name = self.name.clone().ok_or_else(|| missing(self.name(), "name"))?;
        to_json(&SecretDefinition {
            name,
            props: self.props.clone(),
        })
    }
}

#[derive(Default)]
pub struct AssetBuilder {
    asset: Asset,
}

impl Builder for AssetBuilder {
    fn name(&self) -> &'static str {
        "AssetBuilder"
    }

    fn methods(&self) -> &'static [&'static str] {
        &[
            "addProp",
            "addSecretProp",
            "defineSecret",
            "addResourceProp",
            "addInputSocket",
            "addOutputSocket",
            "addSiPropValueFrom",
            "addDocLink",
        ]
    }

    fn call(&mut self, call: &Call<'_>) -> Result<(), BuilderError> {
        let asset = &mut self.asset;
        match call.method {
            "addProp" => asset.props.push(call.typed(0, "a PropDefinition")?),
            "addSecretProp" => asset
                .secret_props
                .push(call.typed(0, "a SecretPropDefinition")?),
            "defineSecret" => {
                let definition: SecretDefinition = call.typed(0, "a SecretDefinition")?;
                asset.secret_definition = Some(definition.props);
                asset.output_sockets.push(SocketDefinition {
                    name: definition.name,
                    arity: SocketArity::One,
                    ui_hidden: None,
                    value_from: None,
                });
            }
            "addResourceProp" => asset.resource_props.push(call.typed(0, "a PropDefinition")?),
            "addInputSocket" => asset.input_sockets.push(call.typed(0, "a SocketDefinition")?),
            "addOutputSocket" => asset.output_sockets.push(call.typed(0, "a SocketDefinition")?),
            "addSiPropValueFrom" => asset
                .si_prop_value_froms
                .push(call.typed(0, "a SiPropValueFromDefinition")?),
            "addDocLink" => {
                let key = call.string(0)?;
                asset.doc_links.insert(key, call.string(1)?);
            }
            _ => return Err(call.unknown()),
        }
        Ok(())
    }

    fn build(&self) -> Result<Value, BuilderError> {
        to_json(&self.asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(builder: &mut dyn Builder, method: &str, args: &[Value]) -> Result<(), BuilderError> {
        let call = Call::new(builder.name(), method, args);
        builder.call(&call)
    }

    #[test]
    fn test_socket_arity_requires_name() {
        let mut socket = SocketDefinitionBuilder::default();
        let err = apply(&mut socket, "setArity", &[json!("one")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "SocketDefinitionBuilder.setArity must be called after setName"
        );

        apply(&mut socket, "setName", &[json!("region")]).unwrap();
        apply(&mut socket, "setArity", &[json!("one")]).unwrap();
        assert_eq!(socket.build().unwrap(), json!({"name": "region", "arity": "one"}));
    }

    #[test]
    fn test_socket_arity_rejects_unknown_value() {
        let mut socket = SocketDefinitionBuilder::default();
        apply(&mut socket, "setName", &[json!("region")]).unwrap();
        let err = apply(&mut socket, "setArity", &[json!("several")]).unwrap_err();
        assert!(matches!(err, BuilderError::InvalidChoice { .. }));
    }

    #[test]
    fn test_prop_children_need_object_kind() {
        let mut prop = PropBuilder::default();
        let child = json!({"name": "x", "kind": "string"});
        let err = apply(&mut prop, "addChild", &[child.clone()]).unwrap_err();
        assert!(matches!(err, BuilderError::OutOfOrder { required: "setKind", .. }));

        apply(&mut prop, "setKind", &[json!("string")]).unwrap();
        let err = apply(&mut prop, "addChild", &[child.clone()]).unwrap_err();
        assert!(matches!(err, BuilderError::WrongPropKind { .. }));

        let mut object = PropBuilder::default();
        apply(&mut object, "setName", &[json!("config")]).unwrap();
        apply(&mut object, "setKind", &[json!("object")]).unwrap();
        apply(&mut object, "addChild", &[child]).unwrap();
        assert_eq!(
            object.build().unwrap(),
            json!({"name": "config", "kind": "object", "children": [{"name": "x", "kind": "string"}]})
        );
    }

    #[test]
    fn test_prop_entry_only_for_collections() {
        let mut prop = PropBuilder::default();
        apply(&mut prop, "setName", &[json!("tags")]).unwrap();
        apply(&mut prop, "setKind", &[json!("array")]).unwrap();
        assert_eq!(
            prop.build().unwrap_err(),
            BuilderError::Missing {
                builder: "PropBuilder",
                field: "entry"
            }
        );
        apply(&mut prop, "setEntry", &[json!({"name": "tag", "kind": "string"})]).unwrap();
        assert!(prop.build().is_ok());
    }

    #[test]
    fn test_prop_rejects_wrong_argument_type() {
        let mut prop = PropBuilder::default();
        let err = apply(&mut prop, "setName", &[json!(5)]).unwrap_err();
        assert_eq!(err.to_string(), "PropBuilder.setName: argument 0 must be a string");
    }

    #[test]
    fn test_unknown_method() {
        let mut prop = PropBuilder::default();
        let err = apply(&mut prop, "setColour", &[json!("red")]).unwrap_err();
        assert_eq!(err.to_string(), "PropBuilder.setColour is not a function");
    }

    #[test]
    fn test_secret_prop_requires_secret_kind() {
        let mut secret = SecretPropBuilder::default();
        apply(&mut secret, "setName", &[json!("credential")]).unwrap();
        assert!(matches!(
            secret.build(),
            Err(BuilderError::OutOfOrder { required: "setSecretKind", .. })
        ));

        apply(&mut secret, "setSecretKind", &[json!("AWS Credential")]).unwrap();
        let built = secret.build().unwrap();
        assert_eq!(built["kind"], json!("string"));
        assert_eq!(built["hasInputSocket"], json!(true));
        assert_eq!(
            built["widget"],
            json!({"kind": "secret", "options": [{"label": "secretKind", "value": "AWS Credential"}]})
        );
    }

    #[test]
    fn test_value_from_requires_target() {
        let mut value_from = ValueFromBuilder::default();
        apply(&mut value_from, "setKind", &[json!("inputSocket")]).unwrap();
        assert!(matches!(
            value_from.build(),
            Err(BuilderError::Missing { field: "socket_name", .. })
        ));
        apply(&mut value_from, "setSocketName", &[json!("Region")]).unwrap();
        assert_eq!(
            value_from.build().unwrap(),
            json!({"kind": "inputSocket", "socket_name": "Region"})
        );
    }

    #[test]
    fn test_asset_build_shape() {
        let mut arena = BuilderArena::default();
        let asset = arena.create("AssetBuilder").unwrap();
        let prop = arena.create("PropBuilder").unwrap();
        arena.call(prop, "setName", &[json!("region")]).unwrap();
        arena.call(prop, "setKind", &[json!("string")]).unwrap();
        let built_prop = arena.build(prop).unwrap();
        arena.call(asset, "addProp", &[built_prop]).unwrap();
        arena
            .call(asset, "addDocLink", &[json!("docs"), json!("https://example.test")])
            .unwrap();

        assert_eq!(
            arena.build(asset).unwrap(),
            json!({
                "props": [{"name": "region", "kind": "string"}],
                "secretProps": [],
                "resourceProps": [],
                "siPropValueFroms": [],
                "inputSockets": [],
                "outputSockets": [],
                "docLinks": {"docs": "https://example.test"}
            })
        );
    }

    #[test]
    fn test_define_secret_adds_output_socket() {
        let mut asset = AssetBuilder::default();
        apply(
            &mut asset,
            "defineSecret",
            &[json!({"name": "Docker Hub", "props": [{"name": "token", "kind": "string"}]})],
        )
        .unwrap();
        let built = asset.build().unwrap();
        assert_eq!(built["secretDefinition"], json!([{"name": "token", "kind": "string"}]));
        assert_eq!(built["outputSockets"], json!([{"name": "Docker Hub", "arity": "one"}]));
    }

    #[test]
    fn test_unknown_builder_and_handle() {
        let mut arena = BuilderArena::default();
        assert!(matches!(
            arena.create("ComponentBuilder"),
            Err(BuilderError::UnknownBuilder(_))
        ));
        assert_eq!(arena.build(7).unwrap_err(), BuilderError::UnknownHandle(7));
    }

    #[test]
    fn test_every_builder_name_constructs() {
        for name in BUILDER_NAMES {
            let builder = new_builder(name).unwrap();
            assert_eq!(builder.name(), name);
            assert!(!builder.methods().is_empty());
        }
    }
}
