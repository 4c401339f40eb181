//! Builtin capability: identifier generation.

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::capability::{Capability, CapabilityError, MethodSpec};

pub struct RngCapability;

#[async_trait]
impl Capability for RngCapability {
    fn namespace(&self) -> &str {
        "rng"
    }

    fn description(&self) -> &str {
        "Unique identifier generation"
    }

    fn methods(&self) -> Vec<MethodSpec> {
        vec![MethodSpec::new(
            "uuid",
            "Generate a random v4 UUID string",
            json!({"type": "object", "properties": {}}),
        )]
    }

    async fn invoke(&self, method: &str, _params: Value) -> Result<Value, CapabilityError> {
        match method {
            "uuid" => Ok(json!(Uuid::new_v4().to_string())),
            other => Err(CapabilityError::new(format!("Unknown method: rng.{other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uuid_is_well_formed_and_unique() {
        let a = RngCapability.invoke("uuid", Value::Null).await.unwrap();
        let b = RngCapability.invoke("uuid", Value::Null).await.unwrap();
        let a = a.as_str().unwrap();
        assert_eq!(a.len(), 36);
        assert!(Uuid::parse_str(a).is_ok());
        assert_ne!(a, b.as_str().unwrap());
    }
}
