//! Failure normalizer — converges every thrown value on the single
//! `ExecutionFailure` shape.
//!
//! A thrown value carrying an explicit `code` (and optional `details`)
//! passes through unchanged; anything else — plain `Error`, string, number —
//! defaults to the caller-supplied code (`EXECUTION_ERROR` for the main
//! flow, `ASYNC_CALLBACK_ERROR` for timer callbacks).

use serde_json::Value;

use super::envelope::ExecutionFailure;

/// Builds a failure from the bridge's encoded error object
/// (`{code?, message, stack?, details?}`).
pub fn normalize(payload: Value, default_code: &str) -> ExecutionFailure {
    let Value::Object(map) = payload else {
        return ExecutionFailure::new(default_code, stringify(&payload));
    };

    let code = map
        .get("code")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default_code.to_string());
    let message = map
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "Unknown error".to_string());
    let stack = map
        .get("stack")
        .and_then(Value::as_str)
        .map(str::to_string);
    let details = map.get("details").cloned().filter(|d| !d.is_null());

    ExecutionFailure {
        code,
        message,
        stack,
        details,
    }
}

/// Parses the settle payload (a JSON-encoded error object) and normalizes
/// it. A missing or unparseable payload still produces a usable failure.
pub fn from_encoded(payload: Option<String>, default_code: &str) -> ExecutionFailure {
    match payload {
        Some(text) => match serde_json::from_str(&text) {
            Ok(value) => normalize(value, default_code),
            Err(_) => ExecutionFailure::new(default_code, text),
        },
        None => ExecutionFailure::new(default_code, "Unknown error"),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
