pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

/// A capability namespace exposed into the sandboxed scope.
///
/// Each namespace groups named async functions (methods). Inside a script
/// they appear as `namespace.method(params)` returning a Promise; the
/// engine never inspects what a method does, it only moves JSON values and
/// errors across the boundary.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Namespace identifier bound into the script's global scope.
    /// Must be lowercase alphanumeric + underscores (e.g. "kv").
    fn namespace(&self) -> &str;

    /// Human-readable description, surfaced by the script-side `help()`.
    fn description(&self) -> &str;

    /// The methods this namespace exposes, for discovery via `help()`.
    fn methods(&self) -> Vec<MethodSpec>;

    /// Executes one method. `params` is the (JSON-converted) single
    /// argument the script passed, `null` when called without one.
    async fn invoke(&self, method: &str, params: Value) -> Result<Value, CapabilityError>;
}

/// Documented signature of one capability method.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the parameters object.
    pub params_schema: Value,
}

impl MethodSpec {
    pub fn new(name: &str, description: &str, params_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params_schema,
        }
    }
}

/// Error thrown back into the script by a capability call.
///
/// `code` and `details` survive the crossing unchanged: a script that
/// catches the rejection sees them on the error object, and an uncaught
/// rejection carries them into the envelope's `error` field.
#[derive(Debug, Clone)]
pub struct CapabilityError {
    pub code: Option<String>,
    pub message: String,
    pub details: Option<Value>,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            details: None,
        }
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CapabilityError {}

impl From<anyhow::Error> for CapabilityError {
    fn from(err: anyhow::Error) -> Self {
        CapabilityError::new(err.to_string())
    }
}

pub use registry::CapabilityRegistry;

/// Extracts a required string parameter from a params object.
pub(crate) fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, CapabilityError> {
    params[key]
        .as_str()
        .ok_or_else(|| CapabilityError::new(format!("Missing required parameter: {key}")))
}
