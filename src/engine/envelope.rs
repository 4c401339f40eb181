//! The execution envelope — the single structured response returned for
//! every invocation, successful or not.
//!
//! The shape is part of the public contract: callers branch on `ok` and
//! `error.code` only, and the whole envelope is JSON-serializable so it can
//! be forwarded over any transport (stdio, HTTP, IPC) unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes surfaced via `error.code`.
pub mod codes {
    /// No executable script supplied.
    pub const EMPTY_CODE: &str = "EMPTY_CODE";
    /// Wall-clock budget exceeded before the script settled.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// The script exceeded the concurrent-timer cap.
    pub const TIMER_LIMIT: &str = "TIMER_LIMIT";
    /// Timer registration called with a non-callable handler.
    pub const INVALID_TIMER_HANDLER: &str = "INVALID_TIMER_HANDLER";
    /// A timer callback threw independently of the main flow.
    pub const ASYNC_CALLBACK_ERROR: &str = "ASYNC_CALLBACK_ERROR";
    /// Default for any other script or capability-call failure.
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    /// Envelope construction itself failed.
    pub const SERIALIZATION_ERROR: &str = "SERIALIZATION_ERROR";
}

/// Severity channel of a captured log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Maps a console method name to a channel. `debug`/`trace` and other
    /// console extras fold into `log`.
    pub fn from_console(name: &str) -> Self {
        match name {
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Log,
        }
    }
}

/// One captured console entry. Order in `ExecutionEnvelope::logs` is
/// emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Normalized failure shape. Every failure mode — thrown values, timeouts,
/// capability errors, timer callback errors — converges here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ExecutionFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stack: None,
            details: None,
        }
    }
}

/// Diagnostic metadata, present on every envelope regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMeta {
    /// The wall-clock budget this invocation ran under.
    pub timeout_ms: u64,
    /// Measured from invocation start to envelope construction.
    pub duration_ms: u64,
    /// The serialized result exceeded the size cap and was replaced.
    pub truncated_result: bool,
    /// Log entries were dropped or shortened.
    pub truncated_logs: bool,
    /// The script completed without an explicit return value.
    pub result_was_undefined: bool,
}

/// The full response shape. Invariants: `logs` is never null (may be
/// empty); `error` is null iff `ok`; `result` is null whenever `!ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEnvelope {
    pub ok: bool,
    pub result: Value,
    pub logs: Vec<LogEntry>,
    pub error: Option<ExecutionFailure>,
    pub meta: ExecutionMeta,
}

impl ExecutionEnvelope {
    pub fn success(result: Value, logs: Vec<LogEntry>, meta: ExecutionMeta) -> Self {
        Self {
            ok: true,
            result,
            logs,
            error: None,
            meta,
        }
    }

    pub fn failure(error: ExecutionFailure, logs: Vec<LogEntry>, meta: ExecutionMeta) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            logs,
            error: Some(error),
            meta,
        }
    }

    /// Minimal failure envelope for when the normal pipeline itself is
    /// unavailable (worker lost, envelope assembly failed). Must never fail.
    pub fn last_resort(
        code: &str,
        message: impl Into<String>,
        timeout_ms: u64,
        duration_ms: u64,
    ) -> Self {
        Self::failure(
            ExecutionFailure::new(code, message),
            Vec::new(),
            ExecutionMeta {
                timeout_ms,
                duration_ms,
                truncated_result: false,
                truncated_logs: false,
                result_was_undefined: false,
            },
        )
    }
}
