//! RFC 6902 JSON Patch over `serde_json::Value`, addressed with RFC 6901
//! pointers.

use serde_json::{Map, Value};

use super::CodecError;

/// Parses a JSON pointer into unescaped reference tokens.
fn parse_pointer(pointer: &str) -> Result<Vec<String>, CodecError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(CodecError::Pointer(pointer.to_string()));
    };
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn array_index(token: &str, len: usize, allow_end: bool) -> Result<usize, CodecError> {
    if allow_end && token == "-" {
        return Ok(len);
    }
    let leading_zero = token.len() > 1 && token.starts_with('0');
    let index = token
        .parse::<usize>()
        .ok()
        .filter(|_| !leading_zero)
        .ok_or_else(|| CodecError::Patch(format!("invalid array index `{token}`")))?;
    let limit = if allow_end { len } else { len.saturating_sub(1) };
    if index > limit || (!allow_end && len == 0) {
        return Err(CodecError::Patch(format!(
            "array index {index} out of bounds (length {len})"
        )));
    }
    Ok(index)
}

fn resolve<'a>(doc: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    tokens.iter().try_fold(doc, |current, token| match current {
        Value::Object(map) => map.get(token),
        Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn resolve_mut<'a>(doc: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value, CodecError> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| CodecError::Patch(format!("path segment `{token}` does not exist")))?,
            Value::Array(items) => {
                let index = array_index(token, items.len(), false)?;
                &mut items[index]
            }
            _ => {
                return Err(CodecError::Patch(format!(
                    "cannot traverse into a scalar at `{token}`"
                )))
            }
        };
    }
    Ok(current)
}

fn add(doc: &mut Value, tokens: &[String], value: Value) -> Result<(), CodecError> {
    let Some((last, parent)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    match resolve_mut(doc, parent)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(items) => {
            let index = array_index(last, items.len(), true)?;
            items.insert(index, value);
        }
        _ => return Err(CodecError::Patch("parent of target is not a container".into())),
    }
    Ok(())
}

fn remove(doc: &mut Value, tokens: &[String]) -> Result<Value, CodecError> {
    let Some((last, parent)) = tokens.split_last() else {
        return Ok(std::mem::take(doc));
    };
    match resolve_mut(doc, parent)? {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| CodecError::Patch(format!("path segment `{last}` does not exist"))),
        Value::Array(items) => {
            let index = array_index(last, items.len(), false)?;
            Ok(items.remove(index))
        }
        _ => Err(CodecError::Patch("parent of target is not a container".into())),
    }
}

fn field<'a>(op: &'a Map<String, Value>, name: &str) -> Result<&'a Value, CodecError> {
    op.get(name)
        .ok_or_else(|| CodecError::Patch(format!("operation is missing `{name}`")))
}

fn pointer_field(op: &Map<String, Value>, name: &str) -> Result<Vec<String>, CodecError> {
    match field(op, name)? {
        Value::String(pointer) => parse_pointer(pointer),
        _ => Err(CodecError::Patch(format!("`{name}` must be a string"))),
    }
}

/// Applies `operations` to a copy of `doc`. The patch is atomic: on any
/// failing operation the original document is left untouched.
pub fn apply(doc: &Value, operations: &[Value]) -> Result<Value, CodecError> {
    let mut patched = doc.clone();
    for operation in operations {
        let Value::Object(op) = operation else {
            return Err(CodecError::Patch("operation must be an object".into()));
        };
        let path = pointer_field(op, "path")?;
        match field(op, "op")?.as_str().unwrap_or_default() {
            "add" => add(&mut patched, &path, field(op, "value")?.clone())?,
            "remove" => {
                remove(&mut patched, &path)?;
            }
            "replace" => {
                let target = resolve_mut(&mut patched, &path)?;
                *target = field(op, "value")?.clone();
            }
            "move" => {
                let from = pointer_field(op, "from")?;
                if path.starts_with(&from) && path.len() > from.len() {
                    return Err(CodecError::Patch("cannot move a value into itself".into()));
                }
                let value = remove(&mut patched, &from)?;
                add(&mut patched, &path, value)?;
            }
            "copy" => {
                let from = pointer_field(op, "from")?;
                let value = resolve(&patched, &from)
                    .cloned()
                    .ok_or_else(|| CodecError::Patch("copy source does not exist".into()))?;
                add(&mut patched, &path, value)?;
            }
            "test" => {
                let expected = field(op, "value")?;
                if resolve(&patched, &path) != Some(expected) {
                    return Err(CodecError::Patch("test operation failed".into()));
                }
            }
            other => return Err(CodecError::Patch(format!("unknown operation `{other}`"))),
        }
    }
    Ok(patched)
}

/// Produces the operations turning `from` into `to`.
pub fn compare(from: &Value, to: &Value) -> Vec<Value> {
    let mut operations = Vec::new();
    diff(from, to, String::new(), &mut operations);
    operations
}

fn diff(from: &Value, to: &Value, path: String, operations: &mut Vec<Value>) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old) in a {
                let child = format!("{path}/{}", escape_token(key));
                match b.get(key) {
                    Some(new) => diff(old, new, child, operations),
                    None => operations.push(serde_json::json!({"op": "remove", "path": child})),
                }
            }
            for (key, new) in b {
                if !a.contains_key(key) {
                    let child = format!("{path}/{}", escape_token(key));
                    operations.push(serde_json::json!({"op": "add", "path": child, "value": new}));
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let shared = a.len().min(b.len());
            for index in 0..shared {
                diff(&a[index], &b[index], format!("{path}/{index}"), operations);
            }
            // Remove from the end so earlier indices stay valid.
            for index in (shared..a.len()).rev() {
                operations.push(serde_json::json!({"op": "remove", "path": format!("{path}/{index}")}));
            }
            for (index, new) in b.iter().enumerate().skip(shared) {
                operations.push(serde_json::json!({"op": "add", "path": format!("{path}/{index}"), "value": new}));
            }
        }
        _ if from == to => {}
        _ => operations.push(serde_json::json!({"op": "replace", "path": path, "value": to})),
    }
}
