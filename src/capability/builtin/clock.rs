//! Builtin capability: wall-clock access and cooperative sleeping.
//!
//! `clock.sleep` is the canonical awaited suspension point for scripts —
//! useful on its own, and the easiest way to exercise the engine's
//! cooperative scheduling from a test script.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

use crate::capability::{Capability, CapabilityError, MethodSpec};

/// Upper bound for a single `clock.sleep` call. The invocation timeout is
/// the real budget; this just keeps one call from eating all of it silently.
const MAX_SLEEP_MS: u64 = 60_000;

pub struct ClockCapability;

#[async_trait]
impl Capability for ClockCapability {
    fn namespace(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Wall-clock time and cooperative sleeping"
    }

    fn methods(&self) -> Vec<MethodSpec> {
        vec![
            MethodSpec::new(
                "now",
                "Current time as { epochMs, iso }",
                json!({"type": "object", "properties": {}}),
            ),
            MethodSpec::new(
                "sleep",
                "Suspend the script for the given number of milliseconds",
                json!({
                    "type": "object",
                    "properties": {
                        "ms": { "type": "number", "description": "Milliseconds to sleep" }
                    },
                    "required": ["ms"]
                }),
            ),
        ]
    }

    async fn invoke(&self, method: &str, params: Value) -> Result<Value, CapabilityError> {
        match method {
            "now" => {
                let now = Utc::now();
                Ok(json!({
                    "epochMs": now.timestamp_millis(),
                    "iso": now.to_rfc3339(),
                }))
            }
            "sleep" => {
                let ms = params["ms"]
                    .as_u64()
                    .ok_or_else(|| CapabilityError::new("Missing required parameter: ms"))?;
                if ms > MAX_SLEEP_MS {
                    return Err(CapabilityError::with_code(
                        "SLEEP_TOO_LONG",
                        format!("sleep of {ms}ms exceeds the {MAX_SLEEP_MS}ms cap"),
                    )
                    .details(json!({"requestedMs": ms, "maxMs": MAX_SLEEP_MS})));
                }
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"sleptMs": ms}))
            }
            other => Err(CapabilityError::new(format!("Unknown method: clock.{other}"))),
        }
    }
}
