//! Native evaluation of Joi `describe()`-style validation formats.
//!
//! Validation functions are authored against Joi and shipped to the sandbox
//! as the JSON description Joi produces. This module checks a value against
//! such a description and reports the first violation with Joi's wording, so
//! callers see the same messages they would see from Joi itself.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("validation format is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported rule `{rule}` for type `{kind}`")]
    UnknownRule { kind: FormatType, rule: String },
    #[error("rule `{rule}` is missing argument `{arg}`")]
    MissingArgument { rule: String, arg: &'static str },
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    #[default]
    Any,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FormatType::Any => "any",
            FormatType::Boolean => "boolean",
            FormatType::Number => "number",
            FormatType::String => "string",
            FormatType::Array => "array",
            FormatType::Object => "object",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Optional,
    Required,
    Forbidden,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
}

/// One node of a Joi description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatDescription {
    #[serde(rename = "type", default)]
    pub kind: FormatType,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<BTreeMap<String, FormatDescription>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<FormatDescription>,
}

/// Outcome of checking one value, shaped like Joi's `validate()` result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Validation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum Fail {
    Reject(String),
    Format(FormatError),
}

impl From<FormatError> for Fail {
    fn from(err: FormatError) -> Self {
        Fail::Format(err)
    }
}

fn reject(label: &str, text: impl fmt::Display) -> Fail {
    Fail::Reject(format!("\"{label}\" {text}"))
}

fn key_path(parent: Option<&str>, key: &str) -> String {
    match parent {
        Some(parent) => format!("{parent}.{key}"),
        None => key.to_string(),
    }
}

fn item_path(parent: Option<&str>, index: usize) -> String {
    match parent {
        Some(parent) => format!("{parent}[{index}]"),
        None => format!("[{index}]"),
    }
}

/// Renders a value the way Joi interpolates it into messages.
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl Rule {
    fn arg(&self, arg: &'static str) -> Result<&Value, FormatError> {
        self.args.get(arg).ok_or_else(|| FormatError::MissingArgument {
            rule: self.name.clone(),
            arg,
        })
    }

    fn number_arg(&self, arg: &'static str) -> Result<(f64, String), FormatError> {
        let value = self.arg(arg)?;
        let number = value.as_f64().ok_or_else(|| FormatError::MissingArgument {
            rule: self.name.clone(),
            arg,
        })?;
        Ok((number, display(value)))
    }
}

impl FormatDescription {
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_value(value: Value) -> Result<Self, FormatError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Checks `value` (`None` is JavaScript `undefined`). Rejections are
    /// reported in the returned [`Validation`]; only a broken description is
    /// an `Err`.
    pub fn validate(&self, value: Option<&Value>) -> Result<Validation, FormatError> {
        match self.check(value, None) {
            Ok(value) => Ok(Validation { value, error: None }),
            Err(Fail::Reject(message)) => Ok(Validation {
                value: value.cloned(),
                error: Some(message),
            }),
            Err(Fail::Format(err)) => Err(err),
        }
    }

    fn check(&self, value: Option<&Value>, path: Option<&str>) -> Result<Option<Value>, Fail> {
        let label = self
            .flags
            .label
            .as_deref()
            .or(path)
            .unwrap_or("value")
            .to_string();

        let value = value.or(self.flags.default.as_ref());
        let Some(value) = value else {
            return match self.flags.presence {
                Some(Presence::Required) => Err(reject(&label, "is required")),
                _ => Ok(None),
            };
        };
        if self.flags.presence == Some(Presence::Forbidden) {
            return Err(reject(&label, "is not allowed"));
        }
        if self.allow.iter().any(|allowed| loosely_equal(allowed, value)) {
            return Ok(Some(value.clone()));
        }
        if self.flags.only == Some(true) {
            let valids: Vec<String> = self.allow.iter().map(display).collect();
            let text = if valids.len() == 1 {
                format!("must be [{}]", valids.join(", "))
            } else {
                format!("must be one of [{}]", valids.join(", "))
            };
            return Err(reject(&label, text));
        }
        if self.invalid.iter().any(|denied| loosely_equal(denied, value)) {
            return Err(reject(&label, "contains an invalid value"));
        }

        let checked = match self.kind {
            FormatType::Any => value.clone(),
            FormatType::Boolean => self.check_boolean(value, &label)?,
            FormatType::Number => self.check_number(value, &label)?,
            FormatType::String => self.check_string(value, &label)?,
            FormatType::Array => self.check_array(value, &label, path)?,
            FormatType::Object => self.check_object(value, &label, path)?,
        };
        Ok(Some(checked))
    }

    fn unknown_rule(&self, rule: &Rule) -> Fail {
        Fail::Format(FormatError::UnknownRule {
            kind: self.kind,
            rule: rule.name.clone(),
        })
    }

    fn check_boolean(&self, value: &Value, label: &str) -> Result<Value, Fail> {
        let parsed = match value {
            Value::Bool(b) => *b,
            Value::String(s) if s.eq_ignore_ascii_case("true") => true,
            Value::String(s) if s.eq_ignore_ascii_case("false") => false,
            _ => return Err(reject(label, "must be a boolean")),
        };
        if let Some(rule) = self.rules.first() {
            return Err(self.unknown_rule(rule));
        }
        Ok(Value::Bool(parsed))
    }

    fn check_number(&self, value: &Value, label: &str) -> Result<Value, Fail> {
        let number = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        let Some(n) = number.filter(|n| n.is_finite()) else {
            return Err(reject(label, "must be a number"));
        };

        for rule in &self.rules {
            match rule.name.as_str() {
                "integer" => {
                    if n.fract() != 0.0 {
                        return Err(reject(label, "must be an integer"));
                    }
                }
                "min" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if n < limit {
                        return Err(reject(label, format!("must be greater than or equal to {shown}")));
                    }
                }
                "max" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if n > limit {
                        return Err(reject(label, format!("must be less than or equal to {shown}")));
                    }
                }
                "greater" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if n <= limit {
                        return Err(reject(label, format!("must be greater than {shown}")));
                    }
                }
                "less" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if n >= limit {
                        return Err(reject(label, format!("must be less than {shown}")));
                    }
                }
                "sign" => {
                    let sign = rule.arg("sign")?.as_str().unwrap_or_default();
                    if sign == "positive" && n <= 0.0 {
                        return Err(reject(label, "must be a positive number"));
                    }
                    if sign == "negative" && n >= 0.0 {
                        return Err(reject(label, "must be a negative number"));
                    }
                }
                "multiple" => {
                    let (base, shown) = rule.number_arg("base")?;
                    if base == 0.0 || (n / base).fract() != 0.0 {
                        return Err(reject(label, format!("must be a multiple of {shown}")));
                    }
                }
                "port" => {
                    if n.fract() != 0.0 || !(0.0..=65535.0).contains(&n) {
                        return Err(reject(label, "must be a valid port"));
                    }
                }
                _ => return Err(self.unknown_rule(rule)),
            }
        }
        Ok(number_value(n))
    }

    fn check_string(&self, value: &Value, label: &str) -> Result<Value, Fail> {
        let Value::String(s) = value else {
            return Err(reject(label, "must be a string"));
        };
        if s.is_empty() {
            return Err(reject(label, "is not allowed to be empty"));
        }
        let length = s.chars().count() as f64;

        for rule in &self.rules {
            match rule.name.as_str() {
                "min" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if length < limit {
                        return Err(reject(
                            label,
                            format!("length must be at least {shown} characters long"),
                        ));
                    }
                }
                "max" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if length > limit {
                        return Err(reject(
                            label,
                            format!("length must be less than or equal to {shown} characters long"),
                        ));
                    }
                }
                "length" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if length != limit {
                        return Err(reject(label, format!("length must be {shown} characters long")));
                    }
                }
                "pattern" => self.check_pattern(rule, s, label)?,
                "alphanum" => {
                    if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
                        return Err(reject(label, "must only contain alpha-numeric characters"));
                    }
                }
                "token" => {
                    if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        return Err(reject(
                            label,
                            "must only contain alpha-numeric and underscore characters",
                        ));
                    }
                }
                "case" => {
                    let direction = rule.arg("direction")?.as_str().unwrap_or_default();
                    if direction == "lower" && s.to_lowercase() != *s {
                        return Err(reject(label, "must only contain lowercase characters"));
                    }
                    if direction == "upper" && s.to_uppercase() != *s {
                        return Err(reject(label, "must only contain uppercase characters"));
                    }
                }
                "email" => {
                    if !Builtin::Email.matches(s) {
                        return Err(reject(label, "must be a valid email"));
                    }
                }
                "uri" => {
                    if !Builtin::Uri.matches(s) {
                        return Err(reject(label, "must be a valid uri"));
                    }
                }
                "hostname" => {
                    if !Builtin::Hostname.matches(s) {
                        return Err(reject(label, "must be a valid hostname"));
                    }
                }
                "guid" => {
                    if !Builtin::Guid.matches(s) {
                        return Err(reject(label, "must be a valid GUID"));
                    }
                }
                _ => return Err(self.unknown_rule(rule)),
            }
        }
        Ok(value.clone())
    }

    fn check_pattern(&self, rule: &Rule, s: &str, label: &str) -> Result<(), Fail> {
        let source = rule.arg("regex")?.as_str().unwrap_or_default().to_string();
        let regex = compile_js_regex(&source)?;
        let options = rule.args.get("options");
        let invert = options
            .and_then(|o| o.get("invert"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if regex.is_match(s) == invert {
            let name = options.and_then(|o| o.get("name")).and_then(Value::as_str);
            let text = match (name, invert) {
                (Some(name), false) => format!("with value \"{s}\" fails to match the {name} pattern"),
                (Some(name), true) => format!("with value \"{s}\" matches the inverted {name} pattern"),
                (None, false) => {
                    format!("with value \"{s}\" fails to match the required pattern: {source}")
                }
                (None, true) => {
                    format!("with value \"{s}\" matches the inverted pattern: {source}")
                }
            };
            return Err(reject(label, text));
        }
        Ok(())
    }

    fn check_array(&self, value: &Value, label: &str, path: Option<&str>) -> Result<Value, Fail> {
        let Value::Array(items) = value else {
            return Err(reject(label, "must be an array"));
        };

        let mut checked = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let item_path = item_path(path, index);
            let converted = match self.items.as_slice() {
                [] => item.clone(),
                [only] => only.check(Some(item), Some(&item_path))?.unwrap_or(Value::Null),
                many => {
                    let matched = many
                        .iter()
                        .find_map(|desc| desc.check(Some(item), Some(&item_path)).ok().flatten());
                    match matched {
                        Some(converted) => converted,
                        None => {
                            return Err(reject(&item_path, "does not match any of the allowed types"))
                        }
                    }
                }
            };
            checked.push(converted);
        }

        let count = checked.len() as f64;
        for rule in &self.rules {
            match rule.name.as_str() {
                "min" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if count < limit {
                        return Err(reject(label, format!("must contain at least {shown} items")));
                    }
                }
                "max" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if count > limit {
                        return Err(reject(
                            label,
                            format!("must contain less than or equal to {shown} items"),
                        ));
                    }
                }
                "length" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if count != limit {
                        return Err(reject(label, format!("must contain {shown} items")));
                    }
                }
                "unique" => {
                    for (index, item) in checked.iter().enumerate() {
                        if checked[..index].contains(item) {
                            return Err(reject(&item_path(path, index), "contains a duplicate value"));
                        }
                    }
                }
                _ => return Err(self.unknown_rule(rule)),
            }
        }
        Ok(Value::Array(checked))
    }

    fn check_object(&self, value: &Value, label: &str, path: Option<&str>) -> Result<Value, Fail> {
        let Value::Object(object) = value else {
            return Err(reject(label, "must be of type object"));
        };

        let mut checked = object.clone();
        if let Some(keys) = &self.keys {
            for (key, desc) in keys {
                let child = key_path(path, key);
                match desc.check(object.get(key), Some(&child))? {
                    Some(converted) => {
                        checked.insert(key.clone(), converted);
                    }
                    None => {
                        checked.remove(key);
                    }
                }
            }
            if self.flags.unknown != Some(true) {
                if let Some(extra) = object.keys().find(|k| !keys.contains_key(*k)) {
                    return Err(reject(&key_path(path, extra), "is not allowed"));
                }
            }
        }

        let count = checked.len() as f64;
        for rule in &self.rules {
            match rule.name.as_str() {
                "min" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if count < limit {
                        return Err(reject(label, format!("must have at least {shown} keys")));
                    }
                }
                "max" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if count > limit {
                        return Err(reject(
                            label,
                            format!("must have less than or equal to {shown} keys"),
                        ));
                    }
                }
                "length" => {
                    let (limit, shown) = rule.number_arg("limit")?;
                    if count != limit {
                        return Err(reject(label, format!("must have {shown} keys")));
                    }
                }
                _ => return Err(self.unknown_rule(rule)),
            }
        }
        Ok(Value::Object(checked))
    }
}

const EMAIL: &str = r"^[^\s@]+@[^\s@]+\.[^\s@]+$";
const URI: &str = r"^[A-Za-z][A-Za-z0-9+.\-]*:[^\s]+$";
const HOSTNAME: &str = r"^(?:[A-Za-z0-9](?:[A-Za-z0-9\-]{0,61}[A-Za-z0-9])?)(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]{0,61}[A-Za-z0-9])?)*$";
const GUID: &str = r"^[\[{(]?[0-9A-Fa-f]{8}-?[0-9A-Fa-f]{4}-?[0-9A-Fa-f]{4}-?[0-9A-Fa-f]{4}-?[0-9A-Fa-f]{12}[\]})]?$";

/// String formats with a fixed pattern, each compiled once per process.
#[derive(Debug, Clone, Copy)]
enum Builtin {
    Email,
    Uri,
    Hostname,
    Guid,
}

impl Builtin {
    fn regex(self) -> Option<&'static Regex> {
        static EMAIL_RE: OnceLock<Option<Regex>> = OnceLock::new();
        static URI_RE: OnceLock<Option<Regex>> = OnceLock::new();
        static HOSTNAME_RE: OnceLock<Option<Regex>> = OnceLock::new();
        static GUID_RE: OnceLock<Option<Regex>> = OnceLock::new();

        let (cell, pattern) = match self {
            Builtin::Email => (&EMAIL_RE, EMAIL),
            Builtin::Uri => (&URI_RE, URI),
            Builtin::Hostname => (&HOSTNAME_RE, HOSTNAME),
            Builtin::Guid => (&GUID_RE, GUID),
        };
        cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
    }

    fn matches(self, s: &str) -> bool {
        self.regex().is_some_and(|re| re.is_match(s))
    }
}

/// Compiles a JavaScript regex literal (`/body/flags`). A bare pattern
/// without slashes is accepted as-is.
fn compile_js_regex(source: &str) -> Result<Regex, FormatError> {
    let (body, flags) = match (source.strip_prefix('/'), source.rfind('/')) {
        (Some(_), Some(end)) if end > 0 => (&source[1..end], &source[end + 1..]),
        _ => (source, ""),
    };
    let inline: String = flags
        .chars()
        .filter(|f| matches!(f, 'i' | 'm' | 's'))
        .collect();
    let pattern = if inline.is_empty() {
        body.to_string()
    } else {
        format!("(?{inline}){body}")
    };
    Regex::new(&pattern).map_err(|source_err| FormatError::Pattern {
        pattern: source.to_string(),
        source: source_err,
    })
}
