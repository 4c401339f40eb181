//! Fluux Sandbox — a sandboxed JavaScript execution engine for agent
//! skills.
//!
//! Scripts run in an isolated QuickJS context with a capability-scoped API
//! surface, a wall-clock budget and resource quotas. Every invocation —
//! success, thrown error, timeout, even serialization trouble — returns the
//! same structured [`ExecutionEnvelope`]; the engine never throws through
//! to the caller.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fluux_sandbox::capability::builtin::ClockCapability;
//! use fluux_sandbox::{CapabilityRegistry, Sandbox, SandboxConfig};
//!
//! # async fn demo() {
//! let mut registry = CapabilityRegistry::new();
//! registry.register(Arc::new(ClockCapability));
//!
//! let sandbox = Sandbox::new(Arc::new(registry), SandboxConfig::default());
//! let envelope = sandbox.execute("return await clock.now();").await;
//! assert!(envelope.ok);
//! # }
//! ```

pub mod capability;
pub mod config;
pub mod engine;

pub use capability::{Capability, CapabilityError, CapabilityRegistry, MethodSpec};
pub use config::{LimitsConfig, SandboxConfig};
pub use engine::envelope::{
    codes, ExecutionEnvelope, ExecutionFailure, ExecutionMeta, LogEntry, LogLevel,
};
pub use engine::Sandbox;
