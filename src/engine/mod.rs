//! The sandboxed execution engine.
//!
//! `Sandbox::execute` takes script text and always returns an
//! `ExecutionEnvelope` — it never panics the caller and never throws
//! through. Each invocation gets a dedicated OS thread with its own
//! current-thread Tokio runtime and a fresh QuickJS context, so scripts
//! share nothing but the capability registry.

pub mod envelope;

mod bindings;
mod encode;
mod failure;
mod invocation;
mod output;
mod timers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::capability::CapabilityRegistry;
use crate::config::{LimitsConfig, SandboxConfig};
use envelope::{codes, ExecutionEnvelope};

/// Slack past the script budget before the caller stops waiting for the
/// worker thread. Covers thread startup and envelope assembly; once spent,
/// the worker is abandoned, not joined.
const WORKER_GRACE: Duration = Duration::from_secs(2);

pub struct Sandbox {
    registry: Arc<CapabilityRegistry>,
    limits: LimitsConfig,
}

impl Sandbox {
    pub fn new(registry: Arc<CapabilityRegistry>, config: SandboxConfig) -> Self {
        Self {
            registry,
            limits: config.limits,
        }
    }

    /// Runs one script under the configured limits.
    pub async fn execute(&self, code: &str) -> ExecutionEnvelope {
        let started = Instant::now();
        let timeout_ms = self.limits.timeout_ms;

        if code.trim().is_empty() {
            return ExecutionEnvelope::last_resort(
                codes::EMPTY_CODE,
                "No executable script supplied",
                timeout_ms,
                elapsed_ms(started),
            );
        }

        let invocation_id = Uuid::new_v4();
        debug!(%invocation_id, chars = code.len(), "executing script");

        let (tx, rx) = oneshot::channel();
        let registry = Arc::clone(&self.registry);
        let limits = self.limits.clone();
        let code = code.to_string();

        let spawned = std::thread::Builder::new()
            .name(format!("sandbox-{invocation_id}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = tx.send(ExecutionEnvelope::last_resort(
                            codes::EXECUTION_ERROR,
                            format!("Failed to start the sandbox runtime: {err}"),
                            timeout_ms,
                            0,
                        ));
                        return;
                    }
                };
                let envelope = runtime.block_on(invocation::run(registry, limits, code));
                let _ = tx.send(envelope);
            });
        if let Err(err) = spawned {
            error!(%invocation_id, "failed to spawn sandbox worker: {err}");
            return ExecutionEnvelope::last_resort(
                codes::EXECUTION_ERROR,
                format!("Failed to spawn the sandbox worker: {err}"),
                timeout_ms,
                elapsed_ms(started),
            );
        }

        // The worker enforces the script deadline itself; this outer guard
        // only protects the caller if the worker wedges entirely.
        let guard = Duration::from_millis(timeout_ms) + WORKER_GRACE;
        match tokio::time::timeout(guard, rx).await {
            Ok(Ok(envelope)) => {
                debug!(
                    %invocation_id,
                    ok = envelope.ok,
                    duration_ms = envelope.meta.duration_ms,
                    "invocation finished"
                );
                envelope
            }
            Ok(Err(_)) => {
                error!(%invocation_id, "sandbox worker terminated without reporting");
                ExecutionEnvelope::last_resort(
                    codes::SERIALIZATION_ERROR,
                    "The sandbox worker terminated before producing an envelope",
                    timeout_ms,
                    elapsed_ms(started),
                )
            }
            Err(_) => {
                warn!(%invocation_id, "sandbox worker unresponsive past its budget, abandoning it");
                ExecutionEnvelope::last_resort(
                    codes::TIMEOUT,
                    format!("Execution timed out after {timeout_ms}ms (worker unresponsive)"),
                    timeout_ms,
                    elapsed_ms(started),
                )
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::builtin::{ClockCapability, KvCapability};
    use crate::capability::{Capability, CapabilityError, MethodSpec};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoCapability;

    #[async_trait]
    impl Capability for EchoCapability {
        fn namespace(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes parameters back, or fails on demand"
        }

        fn methods(&self) -> Vec<MethodSpec> {
            vec![
                MethodSpec::new("say", "Return the params unchanged", json!({"type": "object"})),
                MethodSpec::new("fail", "Always fail with ECHO_FAIL", json!({"type": "object"})),
            ]
        }

        async fn invoke(&self, method: &str, params: Value) -> Result<Value, CapabilityError> {
            match method {
                "say" => Ok(params),
                "fail" => Err(CapabilityError::with_code("ECHO_FAIL", "deliberate failure")
                    .details(json!({"hint": "requested"}))),
                other => Err(CapabilityError::new(format!("Unknown method: echo.{other}"))),
            }
        }
    }

    fn registry() -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(ClockCapability));
        registry.register(Arc::new(KvCapability::new()));
        registry.register(Arc::new(EchoCapability));
        Arc::new(registry)
    }

    fn sandbox() -> Sandbox {
        Sandbox::new(registry(), SandboxConfig::default())
    }

    fn sandbox_with(limits: LimitsConfig) -> Sandbox {
        Sandbox::new(registry(), SandboxConfig { limits })
    }

    fn short_limits(timeout_ms: u64) -> LimitsConfig {
        LimitsConfig {
            timeout_ms,
            ..LimitsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_returns_structured_value() {
        let env = sandbox()
            .execute("return { a: 1, list: [1, 2, 3], s: 'x' };")
            .await;
        assert!(env.ok, "unexpected failure: {:?}", env.error);
        assert_eq!(env.result, json!({"a": 1, "list": [1, 2, 3], "s": "x"}));
        assert!(env.error.is_none());
        assert!(!env.meta.result_was_undefined);
        assert_eq!(env.meta.timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn test_no_return_value_is_flagged_undefined() {
        let env = sandbox().execute("const x = 1;").await;
        assert!(env.ok);
        assert_eq!(env.result, Value::Null);
        assert!(env.meta.result_was_undefined);
    }

    #[tokio::test]
    async fn test_explicit_null_is_not_undefined() {
        let env = sandbox().execute("return null;").await;
        assert!(env.ok);
        assert_eq!(env.result, Value::Null);
        assert!(!env.meta.result_was_undefined);
    }

    #[tokio::test]
    async fn test_thrown_error_is_normalized() {
        let env = sandbox().execute("throw new Error('boom');").await;
        assert!(!env.ok);
        assert_eq!(env.result, Value::Null);
        let error = env.error.unwrap();
        assert_eq!(error.code, codes::EXECUTION_ERROR);
        assert_eq!(error.message, "boom");
        assert!(error.stack.is_some());
    }

    #[tokio::test]
    async fn test_empty_and_whitespace_scripts_are_rejected() {
        for code in ["", "   \n\t  "] {
            let env = sandbox().execute(code).await;
            assert!(!env.ok);
            assert_eq!(env.error.unwrap().code, codes::EMPTY_CODE);
        }
    }

    #[tokio::test]
    async fn test_console_output_is_captured_in_order() {
        let env = sandbox()
            .execute("console.log('a', 1); console.warn('w'); console.error({ x: 1 }); return 0;")
            .await;
        assert!(env.ok);
        assert_eq!(env.logs.len(), 3);
        assert_eq!(env.logs[0].message, "a 1");
        assert_eq!(env.logs[0].level, envelope::LogLevel::Log);
        assert_eq!(env.logs[1].level, envelope::LogLevel::Warn);
        assert_eq!(env.logs[2].message, r#"{"x":1}"#);
        assert_eq!(env.logs[2].level, envelope::LogLevel::Error);
        assert!(!env.meta.truncated_logs);
    }

    #[tokio::test]
    async fn test_log_entry_cap_drops_overflow() {
        let env = sandbox()
            .execute("for (let i = 0; i < 250; i++) console.log('entry', i); return 'done';")
            .await;
        assert!(env.ok);
        assert_eq!(env.logs.len(), 200);
        assert!(env.meta.truncated_logs);
        assert_eq!(env.logs[0].message, "entry 0");
        assert_eq!(env.logs[199].message, "entry 199");
    }

    #[tokio::test]
    async fn test_circular_references_become_markers() {
        let env = sandbox()
            .execute("const a = { name: 'a' }; a.self = a; return a;")
            .await;
        assert!(env.ok);
        assert_eq!(env.result["name"], json!("a"));
        assert_eq!(env.result["self"], json!("[Circular]"));
    }

    #[tokio::test]
    async fn test_oversized_result_is_replaced_by_truncation_wrapper() {
        let mut limits = LimitsConfig::default();
        limits.max_result_chars = 50;
        let env = sandbox_with(limits).execute("return 'x'.repeat(500);").await;
        assert!(env.ok);
        assert!(env.meta.truncated_result);
        assert_eq!(env.result["truncated"], json!(true));
        assert_eq!(env.result["originalSize"], json!(502));
        assert_eq!(env.result["preview"].as_str().unwrap().chars().count(), 50);
    }

    #[tokio::test]
    async fn test_unserializable_result_degrades_to_marker() {
        let env = sandbox()
            .execute("return { get toJSON() { throw new Error('nope'); } };")
            .await;
        assert!(env.ok);
        assert_eq!(env.result["_unserializable"], json!(true));
        assert!(env.result["preview"].is_string());
    }

    #[tokio::test]
    async fn test_unresolved_promise_times_out() {
        let env = sandbox_with(short_limits(250))
            .execute("await new Promise(() => {});")
            .await;
        assert!(!env.ok);
        let error = env.error.unwrap();
        assert_eq!(error.code, codes::TIMEOUT);
        assert!(error.message.contains("250ms"));
        assert!(env.meta.duration_ms >= 250);
        assert!(env.meta.duration_ms < 2_500);
    }

    #[tokio::test]
    async fn test_busy_loop_is_interrupted_at_the_deadline() {
        let env = sandbox_with(short_limits(300))
            .execute("while (true) {}")
            .await;
        assert!(!env.ok);
        assert_eq!(env.error.unwrap().code, codes::TIMEOUT);
    }

    #[tokio::test]
    async fn test_timer_fires_after_its_delay() {
        let env = sandbox()
            .execute(
                "let fired = false;\n\
                 await new Promise((resolve) => setTimeout(() => { fired = true; resolve(); }, 20));\n\
                 return fired;",
            )
            .await;
        assert!(env.ok, "unexpected failure: {:?}", env.error);
        assert_eq!(env.result, json!(true));
        assert!(env.meta.duration_ms >= 20);
    }

    #[tokio::test]
    async fn test_clear_timeout_prevents_firing() {
        let env = sandbox()
            .execute(
                "let fired = false;\n\
                 const id = setTimeout(() => { fired = true; }, 10);\n\
                 clearTimeout(id);\n\
                 await new Promise(r => setTimeout(r, 60));\n\
                 return fired;",
            )
            .await;
        assert!(env.ok);
        assert_eq!(env.result, json!(false));
    }

    #[tokio::test]
    async fn test_timer_cap_rejects_registration() {
        let mut limits = LimitsConfig::default();
        limits.max_timers = 3;
        let env = sandbox_with(limits)
            .execute("for (let i = 0; i < 4; i++) setTimeout(() => {}, 5); return 'no';")
            .await;
        assert!(!env.ok);
        assert_eq!(env.error.unwrap().code, codes::TIMER_LIMIT);
    }

    #[tokio::test]
    async fn test_timer_cap_error_is_catchable_in_script() {
        let mut limits = LimitsConfig::default();
        limits.max_timers = 1;
        let env = sandbox_with(limits)
            .execute(
                "setTimeout(() => {}, 5);\n\
                 try { setTimeout(() => {}, 5); } catch (e) { return e.code; }\n\
                 return 'no error';",
            )
            .await;
        assert!(env.ok);
        assert_eq!(env.result, json!("TIMER_LIMIT"));
    }

    #[tokio::test]
    async fn test_non_callable_timer_handler_is_rejected() {
        let env = sandbox().execute("setTimeout(42, 1);").await;
        assert!(!env.ok);
        assert_eq!(env.error.unwrap().code, codes::INVALID_TIMER_HANDLER);
    }

    #[tokio::test]
    async fn test_timer_callback_error_becomes_the_failure() {
        let env = sandbox()
            .execute(
                "setTimeout(() => { throw new Error('late'); }, 10);\n\
                 await new Promise(r => setTimeout(r, 200));\n\
                 return 'unreached';",
            )
            .await;
        assert!(!env.ok);
        let error = env.error.unwrap();
        assert_eq!(error.code, codes::ASYNC_CALLBACK_ERROR);
        assert_eq!(error.message, "late");
        assert!(env
            .logs
            .iter()
            .any(|entry| entry.message.contains("Timer callback error: late")));
    }

    #[tokio::test]
    async fn test_capability_call_round_trip() {
        let env = sandbox()
            .execute("return await echo.say({ msg: 'hi', n: 2 });")
            .await;
        assert!(env.ok, "unexpected failure: {:?}", env.error);
        assert_eq!(env.result, json!({"msg": "hi", "n": 2}));
    }

    #[tokio::test]
    async fn test_capability_error_is_catchable_with_code_and_details() {
        let env = sandbox()
            .execute(
                "try { await echo.fail(); } catch (e) {\n\
                   return { code: e.code, message: e.message, details: e.details };\n\
                 }",
            )
            .await;
        assert!(env.ok);
        assert_eq!(env.result["code"], json!("ECHO_FAIL"));
        assert_eq!(env.result["message"], json!("deliberate failure"));
        assert_eq!(env.result["details"], json!({"hint": "requested"}));
    }

    #[tokio::test]
    async fn test_uncaught_capability_error_keeps_its_code() {
        let env = sandbox().execute("await echo.fail();").await;
        assert!(!env.ok);
        let error = env.error.unwrap();
        assert_eq!(error.code, "ECHO_FAIL");
        assert_eq!(error.details, Some(json!({"hint": "requested"})));
    }

    #[tokio::test]
    async fn test_unknown_namespace_is_a_plain_reference_error() {
        let env = sandbox().execute("await ghost.walk();").await;
        assert!(!env.ok);
        assert_eq!(env.error.unwrap().code, codes::EXECUTION_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_method_reports_its_registry_code() {
        let env = sandbox()
            .execute("return await __fx_call('echo', 'nope').catch(e => e.code);")
            .await;
        assert!(env.ok);
        assert_eq!(env.result, json!("UNKNOWN_METHOD"));
    }

    #[tokio::test]
    async fn test_sequential_capability_calls_share_state() {
        let env = sandbox()
            .execute(
                "await kv.set({ key: 'answer', value: 42 });\n\
                 return await kv.get({ key: 'answer' });",
            )
            .await;
        assert!(env.ok, "unexpected failure: {:?}", env.error);
        assert_eq!(env.result, json!(42));
    }

    #[tokio::test]
    async fn test_clock_sleep_suspends_the_script() {
        let env = sandbox()
            .execute("await clock.sleep({ ms: 30 }); return 'rested';")
            .await;
        assert!(env.ok);
        assert_eq!(env.result, json!("rested"));
        assert!(env.meta.duration_ms >= 30);
    }

    #[tokio::test]
    async fn test_help_lists_namespaces_and_methods() {
        let env = sandbox()
            .execute("return help().map(e => e.namespace);")
            .await;
        assert!(env.ok);
        assert_eq!(env.result, json!(["clock", "echo", "kv"]));

        let env = sandbox()
            .execute("return [help('echo').methods.map(m => m.name), help('nope')];")
            .await;
        assert!(env.ok);
        assert_eq!(env.result, json!([["say", "fail"], null]));
    }

    #[tokio::test]
    async fn test_invocations_are_isolated() {
        let sandbox = sandbox();
        let env = sandbox.execute("globalThis.leak = 42; return 'set';").await;
        assert!(env.ok);
        let env = sandbox.execute("return typeof globalThis.leak;").await;
        assert!(env.ok);
        assert_eq!(env.result, json!("undefined"));
    }

    #[tokio::test]
    async fn test_same_script_yields_identical_results() {
        let sandbox = sandbox();
        let code = "return [1, 2, 3].map(x => x * 2).join('-');";
        let first = sandbox.execute(code).await;
        let second = sandbox.execute(code).await;
        assert!(first.ok && second.ok);
        assert_eq!(first.result, second.result);
        assert_eq!(first.result, json!("2-4-6"));
    }

    #[tokio::test]
    async fn test_logs_survive_a_failure() {
        let env = sandbox()
            .execute("console.log('before'); throw new Error('after');")
            .await;
        assert!(!env.ok);
        assert_eq!(env.logs.len(), 1);
        assert_eq!(env.logs[0].message, "before");
    }

    #[tokio::test]
    async fn test_envelope_serializes_to_the_wire_shape() {
        let env = sandbox().execute("console.info('hi'); return 1;").await;
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["ok"], json!(true));
        assert_eq!(value["result"], json!(1));
        assert_eq!(value["logs"][0]["level"], json!("info"));
        assert!(value["error"].is_null());
        assert!(value["meta"]["durationMs"].is_u64());
        assert_eq!(value["meta"]["timeoutMs"], json!(30_000));
    }
}
