//! Builtin capability: in-memory key/value store.
//!
//! State is process-wide and survives across invocations (it lives behind
//! an `Arc`), which makes it the simplest way for successive scripts to
//! pass data to each other. Keys are flat strings, values arbitrary JSON.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::capability::{require_str, Capability, CapabilityError, MethodSpec};

pub struct KvCapability {
    entries: RwLock<HashMap<String, Value>>,
}

impl KvCapability {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for KvCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for KvCapability {
    fn namespace(&self) -> &str {
        "kv"
    }

    fn description(&self) -> &str {
        "In-memory key/value store shared across invocations"
    }

    fn methods(&self) -> Vec<MethodSpec> {
        let key_schema = json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Entry key" }
            },
            "required": ["key"]
        });
        vec![
            MethodSpec::new("get", "Read an entry; fails with NOT_FOUND if absent", key_schema.clone()),
            MethodSpec::new(
                "set",
                "Store a value under a key, replacing any previous value",
                json!({
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "value": { "description": "Any JSON value" }
                    },
                    "required": ["key", "value"]
                }),
            ),
            MethodSpec::new("delete", "Remove an entry; returns whether it existed", key_schema),
            MethodSpec::new(
                "keys",
                "List all stored keys",
                json!({"type": "object", "properties": {}}),
            ),
        ]
    }

    async fn invoke(&self, method: &str, params: Value) -> Result<Value, CapabilityError> {
        match method {
            "get" => {
                let key = require_str(&params, "key")?;
                let entries = self.entries.read().await;
                entries.get(key).cloned().ok_or_else(|| {
                    CapabilityError::with_code("NOT_FOUND", format!("No entry for key '{key}'"))
                        .details(json!({"key": key}))
                })
            }
            "set" => {
                let key = require_str(&params, "key")?.to_string();
                let value = params
                    .get("value")
                    .cloned()
                    .ok_or_else(|| CapabilityError::new("Missing required parameter: value"))?;
                self.entries.write().await.insert(key, value);
                Ok(json!({"stored": true}))
            }
            "delete" => {
                let key = require_str(&params, "key")?;
                let existed = self.entries.write().await.remove(key).is_some();
                Ok(json!({"deleted": existed}))
            }
            "keys" => {
                let entries = self.entries.read().await;
                let mut keys: Vec<&str> = entries.keys().map(String::as_str).collect();
                keys.sort_unstable();
                Ok(json!(keys))
            }
            other => Err(CapabilityError::new(format!("Unknown method: kv.{other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let kv = KvCapability::new();
        kv.invoke("set", json!({"key": "a", "value": {"n": 1}}))
            .await
            .unwrap();
        let out = kv.invoke("get", json!({"key": "a"})).await.unwrap();
        assert_eq!(out, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found_with_details() {
        let kv = KvCapability::new();
        let err = kv.invoke("get", json!({"key": "ghost"})).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("NOT_FOUND"));
        assert_eq!(err.details.unwrap()["key"], json!("ghost"));
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let kv = KvCapability::new();
        kv.invoke("set", json!({"key": "a", "value": 1})).await.unwrap();
        let out = kv.invoke("delete", json!({"key": "a"})).await.unwrap();
        assert_eq!(out, json!({"deleted": true}));
        let out = kv.invoke("delete", json!({"key": "a"})).await.unwrap();
        assert_eq!(out, json!({"deleted": false}));
    }

    #[tokio::test]
    async fn test_keys_sorted() {
        let kv = KvCapability::new();
        kv.invoke("set", json!({"key": "b", "value": 1})).await.unwrap();
        kv.invoke("set", json!({"key": "a", "value": 2})).await.unwrap();
        let out = kv.invoke("keys", Value::Null).await.unwrap();
        assert_eq!(out, json!(["a", "b"]));
    }
}
