//! Request-scoped key/value store shared by before-hooks and the main
//! invocation.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{env, data}` store living for exactly one Request.
///
/// `env` holds strings only; `data` holds arbitrary JSON. Each invocation
/// receives a copy and reports its final snapshot, which replaces the
/// previous value wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStorage {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageArea {
    Env,
    Data,
}

impl FromStr for StorageArea {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "env" => Ok(StorageArea::Env),
            "data" => Ok(StorageArea::Data),
            other => Err(format!("unknown storage area `{other}`")),
        }
    }
}

/// Whether guest code may mutate the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageAccess {
    ReadOnly,
    ReadWrite,
}

impl RequestStorage {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.data.is_empty()
    }

    pub fn get(&self, area: StorageArea, key: &str) -> Option<Value> {
        match area {
            StorageArea::Env => self.env.get(key).map(|v| Value::String(v.clone())),
            StorageArea::Data => self.data.get(key).cloned(),
        }
    }

    pub fn keys(&self, area: StorageArea) -> Vec<String> {
        match area {
            StorageArea::Env => self.env.keys().cloned().collect(),
            StorageArea::Data => self.data.keys().cloned().collect(),
        }
    }

    /// Env values are coerced to strings: non-string JSON is stored as its
    /// JSON text.
    pub fn set(&mut self, area: StorageArea, key: impl Into<String>, value: Value) {
        match area {
            StorageArea::Env => {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                self.env.insert(key.into(), text);
            }
            StorageArea::Data => {
                self.data.insert(key.into(), value);
            }
        }
    }

    /// Returns whether the key existed.
    pub fn delete(&mut self, area: StorageArea, key: &str) -> bool {
        match area {
            StorageArea::Env => self.env.remove(key).is_some(),
            StorageArea::Data => self.data.remove(key).is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_env_values_are_strings() {
        let mut storage = RequestStorage::default();
        storage.set(StorageArea::Env, "a", json!(1));
        storage.set(StorageArea::Env, "b", json!("two"));
        assert_eq!(storage.get(StorageArea::Env, "a"), Some(json!("1")));
        assert_eq!(storage.get(StorageArea::Env, "b"), Some(json!("two")));
    }

    #[test]
    fn test_data_keeps_json() {
        let mut storage = RequestStorage::default();
        storage.set(StorageArea::Data, "obj", json!({"nested": [1, 2]}));
        assert_eq!(
            storage.get(StorageArea::Data, "obj"),
            Some(json!({"nested": [1, 2]}))
        );
        assert_eq!(storage.keys(StorageArea::Data), vec!["obj".to_string()]);
        assert!(storage.keys(StorageArea::Env).is_empty());
    }

    #[test]
    fn test_delete_reports_presence() {
        let mut storage = RequestStorage::default();
        storage.set(StorageArea::Data, "k", json!(true));
        assert!(storage.delete(StorageArea::Data, "k"));
        assert!(!storage.delete(StorageArea::Data, "k"));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_deserialize_partial_snapshot() {
        let storage: RequestStorage = serde_json::from_str(r#"{"env": {"x": "y"}}"#).unwrap();
        assert_eq!(storage.env.get("x").map(String::as_str), Some("y"));
        assert!(storage.data.is_empty());
    }

    #[test]
    fn test_area_from_str() {
        assert_eq!("env".parse::<StorageArea>().unwrap(), StorageArea::Env);
        assert!("secrets".parse::<StorageArea>().is_err());
    }
}
