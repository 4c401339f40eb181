//! Per-invocation drive loop: evaluate the wrapped script, pump jobs,
//! execute capability calls, fire due timers, and race everything against
//! the wall-clock deadline.
//!
//! The deadline is enforced by abandonment, not preemption: when it passes,
//! the loop stops cooperating with the script and returns a TIMEOUT
//! envelope, leaving any in-flight script work to be dropped with the
//! context. The only hard stop is the QuickJS interrupt handler, which
//! halts a synchronous busy loop that would otherwise never yield.

use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::{AsyncContext, AsyncRuntime};

use crate::capability::CapabilityRegistry;
use crate::config::LimitsConfig;
use crate::engine::bindings::{self, HostcallRequest, InvocationState, Settled};
use crate::engine::encode::decode_result;
use crate::engine::envelope::{
    codes, ExecutionEnvelope, ExecutionFailure, ExecutionMeta, LogLevel,
};
use crate::engine::failure;
use crate::engine::output::OutputCollector;

/// How one invocation ended, before envelope assembly.
enum Outcome {
    Success(Option<String>),
    Failure(ExecutionFailure),
    TimedOut,
}

/// Runs one script to an envelope. Never panics on script behavior; every
/// path, including setup failures, ends in an envelope.
pub(crate) async fn run(
    registry: Arc<CapabilityRegistry>,
    limits: LimitsConfig,
    code: String,
) -> ExecutionEnvelope {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(limits.timeout_ms);

    let state = InvocationState::new(&limits);
    let outcome = drive(&registry, &limits, &code, deadline, &state).await;

    // Teardown runs on every exit path, before the envelope is built.
    let reclaimed = state.governor.borrow_mut().cancel_all();
    if reclaimed > 0 {
        tracing::debug!(reclaimed, "cancelled remaining timers during teardown");
    }
    let (logs, truncated_logs) = state
        .collector
        .replace(OutputCollector::new(0, 0, 0))
        .finish();
    let duration_ms = started.elapsed().as_millis() as u64;

    let mut meta = ExecutionMeta {
        timeout_ms: limits.timeout_ms,
        duration_ms,
        truncated_result: false,
        truncated_logs,
        result_was_undefined: false,
    };

    match outcome {
        Outcome::Success(payload) => {
            let decoded = decode_result(payload, limits.max_result_chars);
            meta.truncated_result = decoded.truncated;
            meta.result_was_undefined = decoded.was_undefined;
            ExecutionEnvelope::success(decoded.value, logs, meta)
        }
        Outcome::Failure(error) => ExecutionEnvelope::failure(error, logs, meta),
        Outcome::TimedOut => ExecutionEnvelope::failure(
            ExecutionFailure::new(
                codes::TIMEOUT,
                format!("Execution timed out after {}ms", limits.timeout_ms),
            ),
            logs,
            meta,
        ),
    }
}

async fn drive(
    registry: &CapabilityRegistry,
    limits: &LimitsConfig,
    code: &str,
    deadline: Instant,
    state: &Rc<InvocationState>,
) -> Outcome {
    let runtime = match AsyncRuntime::new() {
        Ok(runtime) => runtime,
        Err(err) => return setup_failure("Failed to initialise the JavaScript runtime", err),
    };
    if let Some(bytes) = limits.memory_limit_bytes {
        runtime.set_memory_limit(bytes).await;
    }
    if let Some(bytes) = limits.max_stack_bytes {
        runtime.set_max_stack_size(bytes).await;
    }

    // The interrupt handler is polled during synchronous execution; it is
    // what stops `while (true) {}` once the budget is gone.
    let hard_deadline = deadline;
    runtime
        .set_interrupt_handler(Some(Box::new(move || Instant::now() >= hard_deadline)))
        .await;

    let context = match AsyncContext::full(&runtime).await {
        Ok(context) => context,
        Err(err) => return setup_failure("Failed to create the execution context", err),
    };

    let catalogue = registry.describe().to_string();
    let installed = {
        let state = Rc::clone(state);
        context
            .with(move |ctx| bindings::install(&ctx, &state, &catalogue))
            .await
    };
    if let Err(err) = installed {
        return setup_failure("Failed to install the execution context bindings", err);
    }

    // The wrapper turns top-level statements (including `return` and
    // `await`) into one async function whose settlement reaches the host.
    let wrapped = format!("__fx_run(async () => {{\n{code}\n}});\n");
    let eval_error = context
        .with(move |ctx| match ctx.eval::<(), _>(wrapped) {
            Ok(()) => None,
            Err(err) => Some(bindings::encode_thrown(&ctx, err)),
        })
        .await;
    if let Some(payload) = eval_error {
        // A synchronous throw before any settlement: either a syntax /
        // top-level error, or the interrupt handler cutting a busy loop.
        if Instant::now() >= deadline {
            return Outcome::TimedOut;
        }
        return Outcome::Failure(failure::normalize(payload, codes::EXECUTION_ERROR));
    }

    loop {
        drain_jobs(&runtime, state).await;

        if let Some(outcome) = take_settled(state) {
            return outcome;
        }
        if Instant::now() >= deadline {
            return Outcome::TimedOut;
        }

        // Capability calls run one at a time, in enqueue order; the script
        // is a single logical flow even when it fans out Promises.
        let requests: Vec<HostcallRequest> = state.hostcalls.borrow_mut().drain(..).collect();
        if !requests.is_empty() {
            for request in requests {
                let HostcallRequest {
                    call_id,
                    namespace,
                    method,
                    params,
                } = request;
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Outcome::TimedOut;
                };
                let invoked =
                    tokio::time::timeout(remaining, registry.invoke(&namespace, &method, params))
                        .await;
                let result = match invoked {
                    Ok(result) => result,
                    // Budget ran out inside the capability; the call itself
                    // is abandoned along with the script.
                    Err(_) => return Outcome::TimedOut,
                };
                let delivered = context
                    .with(move |ctx| bindings::deliver_completion(&ctx, call_id, &result))
                    .await;
                if let Err(err) = delivered {
                    tracing::warn!(call_id, "failed to deliver capability completion: {err}");
                }
            }
            continue;
        }

        let now = Instant::now();
        let due = state.governor.borrow_mut().pop_due(now);
        if !due.is_empty() {
            for id in due {
                if state.is_settled() {
                    // The race is over; remaining due timers die at teardown.
                    break;
                }
                let fired = context
                    .with(move |ctx| bindings::fire_timer(&ctx, id))
                    .await;
                if let Err(payload) = fired {
                    let error = failure::normalize(payload, codes::ASYNC_CALLBACK_ERROR);
                    state.collector.borrow_mut().push(
                        LogLevel::Error,
                        &format!("Timer callback error: {}", error.message),
                    );
                    return Outcome::Failure(error);
                }
                // Microtasks run between macrotasks, so a callback that
                // settles the script wins before the next timer fires.
                drain_jobs(&runtime, state).await;
            }
            continue;
        }

        // Idle: nothing can run until the next timer or the deadline.
        let wake = match state.governor.borrow_mut().next_deadline() {
            Some(timer_deadline) => timer_deadline.min(deadline),
            None => deadline,
        };
        tokio::time::sleep_until(tokio::time::Instant::from_std(wake)).await;
        if Instant::now() >= deadline {
            return Outcome::TimedOut;
        }
    }
}

/// Runs queued jobs (Promise reactions) until none are pending. A job that
/// fails is recorded in the script's own log stream and skipped; the main
/// flow's rejection still arrives through the run wrapper.
async fn drain_jobs(runtime: &AsyncRuntime, state: &Rc<InvocationState>) {
    loop {
        match runtime.execute_pending_job().await {
            Ok(true) => continue,
            Ok(false) => return,
            Err(err) => {
                tracing::warn!("unhandled job error: {err}");
                state
                    .collector
                    .borrow_mut()
                    .push(LogLevel::Error, &format!("Unhandled error in async job: {err}"));
            }
        }
    }
}

fn take_settled(state: &Rc<InvocationState>) -> Option<Outcome> {
    match state.outcome.borrow_mut().take() {
        Some(Settled::Success(payload)) => Some(Outcome::Success(payload)),
        Some(Settled::Failure(payload)) => Some(Outcome::Failure(failure::from_encoded(
            payload,
            codes::EXECUTION_ERROR,
        ))),
        None => None,
    }
}

fn setup_failure(context: &str, err: impl std::fmt::Display) -> Outcome {
    tracing::error!("{context}: {err}");
    Outcome::Failure(ExecutionFailure::new(
        codes::EXECUTION_ERROR,
        format!("{context}: {err}"),
    ))
}
