//! Capability registry — the process-wide surface shared by all
//! invocations.
//!
//! The engine reads it (dispatch, help catalogue) but never mutates it;
//! capability state consistency is each capability's own responsibility.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use super::{Capability, CapabilityError};

/// Code used when a script calls a namespace the registry doesn't know.
pub const UNKNOWN_CAPABILITY: &str = "UNKNOWN_CAPABILITY";
/// Code used when a script calls an unknown method of a known namespace.
pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";

#[derive(Default)]
pub struct CapabilityRegistry {
    // BTreeMap so the help catalogue and namespace binding order are stable.
    capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.namespace().to_string(), capability);
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn namespaces(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    /// The catalogue served to scripts through `help()` and used to build
    /// the namespace bindings.
    pub fn describe(&self) -> Value {
        let entries: Vec<Value> = self
            .capabilities
            .values()
            .map(|cap| {
                let methods: Vec<Value> = cap
                    .methods()
                    .iter()
                    .map(|m| {
                        json!({
                            "name": m.name,
                            "description": m.description,
                            "params": m.params_schema,
                        })
                    })
                    .collect();
                json!({
                    "namespace": cap.namespace(),
                    "description": cap.description(),
                    "methods": methods,
                })
            })
            .collect();
        Value::Array(entries)
    }

    /// Dispatches one capability call.
    pub async fn invoke(
        &self,
        namespace: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, CapabilityError> {
        let capability = self.capabilities.get(namespace).ok_or_else(|| {
            CapabilityError::with_code(
                UNKNOWN_CAPABILITY,
                format!("Unknown capability namespace: {namespace}"),
            )
        })?;

        if !capability.methods().iter().any(|m| m.name == method) {
            return Err(CapabilityError::with_code(
                UNKNOWN_METHOD,
                format!("Unknown method: {namespace}.{method}"),
            ));
        }

        capability.invoke(method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MethodSpec;
    use async_trait::async_trait;

    struct EchoCapability;

    #[async_trait]
    impl Capability for EchoCapability {
        fn namespace(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its parameters back"
        }

        fn methods(&self) -> Vec<MethodSpec> {
            vec![MethodSpec::new("say", "Returns the params unchanged", json!({"type": "object"}))]
        }

        async fn invoke(&self, _method: &str, params: Value) -> Result<Value, CapabilityError> {
            Ok(params)
        }
    }

    fn registry() -> CapabilityRegistry {
        let mut r = CapabilityRegistry::new();
        r.register(Arc::new(EchoCapability));
        r
    }

    #[tokio::test]
    async fn test_invoke_dispatches_to_namespace() {
        let r = registry();
        let out = r.invoke("echo", "say", json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_unknown_namespace_has_code() {
        let r = registry();
        let err = r.invoke("nope", "say", Value::Null).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some(UNKNOWN_CAPABILITY));
    }

    #[tokio::test]
    async fn test_unknown_method_has_code() {
        let r = registry();
        let err = r.invoke("echo", "shout", Value::Null).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some(UNKNOWN_METHOD));
    }

    #[test]
    fn test_describe_lists_namespaces_and_methods() {
        let r = registry();
        let catalogue = r.describe();
        assert_eq!(catalogue[0]["namespace"], json!("echo"));
        assert_eq!(catalogue[0]["methods"][0]["name"], json!("say"));
    }
}
