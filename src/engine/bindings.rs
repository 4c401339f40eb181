//! Execution context bindings — the native functions and JS bridge
//! installed into each invocation's fresh QuickJS context.
//!
//! Two-layer design: Rust native functions (`__fx_*_native`) stay
//! synchronous and return plain ids or strings, and a JS bridge wraps them
//! into Promises, the `console` global, `setTimeout`/`clearTimeout`, one
//! object per capability namespace, and `help()`. Keeping Promises on the
//! JS side avoids returning engine values from Rust closures, and keeps the
//! callback maps inside the scope they belong to.
//!
//! Nothing else is bound: no module loader, no filesystem, no host access
//! beyond the capability surface.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rquickjs::function::{Func, Opt};
use rquickjs::{Coerced, Ctx, FromJs, Function, Object, Value};

use crate::capability::CapabilityError;
use crate::config::LimitsConfig;
use crate::engine::encode::{js_to_json, json_to_js};
use crate::engine::envelope::{codes, LogLevel};
use crate::engine::output::OutputCollector;
use crate::engine::timers::TimerGovernor;

/// One queued capability call, waiting for the drive loop to execute it.
pub(crate) struct HostcallRequest {
    pub call_id: u32,
    pub namespace: String,
    pub method: String,
    pub params: serde_json::Value,
}

/// How the wrapped script settled. Payloads are produced by the bridge's
/// encoders: a safely serialized result (absent for `undefined`), or an
/// encoded error object.
pub(crate) enum Settled {
    Success(Option<String>),
    Failure(Option<String>),
}

/// Per-invocation state shared between the native bindings and the drive
/// loop. Lives on the worker thread only.
pub(crate) struct InvocationState {
    pub collector: RefCell<OutputCollector>,
    pub governor: RefCell<TimerGovernor>,
    pub hostcalls: RefCell<VecDeque<HostcallRequest>>,
    pub outcome: RefCell<Option<Settled>>,
    next_call_id: Cell<u32>,
}

impl InvocationState {
    pub fn new(limits: &LimitsConfig) -> Rc<Self> {
        Rc::new(Self {
            collector: RefCell::new(OutputCollector::new(
                limits.max_log_entries,
                limits.max_log_entry_chars,
                limits.max_log_total_chars,
            )),
            governor: RefCell::new(TimerGovernor::new(limits.max_timers)),
            hostcalls: RefCell::new(VecDeque::new()),
            outcome: RefCell::new(None),
            next_call_id: Cell::new(1),
        })
    }

    fn next_call_id(&self) -> u32 {
        let id = self.next_call_id.get();
        self.next_call_id.set(id + 1);
        id
    }

    /// First settlement wins; later ones are ignored.
    pub fn settle(&self, settled: Settled) {
        let mut outcome = self.outcome.borrow_mut();
        if outcome.is_none() {
            *outcome = Some(settled);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

/// Installs the native functions and evaluates the JS bridge.
/// `catalogue` is the registry's JSON description, used to build the
/// namespace objects and serve `help()`.
pub(crate) fn install(
    ctx: &Ctx<'_>,
    state: &Rc<InvocationState>,
    catalogue: &str,
) -> rquickjs::Result<()> {
    let global = ctx.globals();

    global.set(
        "__fx_console_native",
        Func::from({
            let state = Rc::clone(state);
            move |level: String, message: String| -> rquickjs::Result<()> {
                tracing::debug!(target: "sandbox.console", %level, "{message}");
                state
                    .collector
                    .borrow_mut()
                    .push(LogLevel::from_console(&level), &message);
                Ok(())
            }
        }),
    )?;

    global.set(
        "__fx_enqueue_native",
        Func::from({
            let state = Rc::clone(state);
            move |_ctx: Ctx<'_>,
                  namespace: String,
                  method: String,
                  params: Value<'_>|
                  -> rquickjs::Result<u32> {
                let params = js_to_json(&params)?;
                let call_id = state.next_call_id();
                state.hostcalls.borrow_mut().push_back(HostcallRequest {
                    call_id,
                    namespace,
                    method,
                    params,
                });
                Ok(call_id)
            }
        }),
    )?;

    global.set(
        "__fx_settle_native",
        Func::from({
            let state = Rc::clone(state);
            move |ok: bool, payload: Opt<String>| -> rquickjs::Result<()> {
                let settled = if ok {
                    Settled::Success(payload.0)
                } else {
                    Settled::Failure(payload.0)
                };
                state.settle(settled);
                Ok(())
            }
        }),
    )?;

    global.set(
        "__fx_timer_register_native",
        Func::from({
            let state = Rc::clone(state);
            move |ctx: Ctx<'_>, delay_ms: f64| -> rquickjs::Result<u32> {
                let delay = Duration::from_millis(delay_ms.max(0.0) as u64);
                match state.governor.borrow_mut().register(delay, Instant::now()) {
                    Ok(id) => Ok(id),
                    Err(limit) => Err(throw_coded(
                        &ctx,
                        codes::TIMER_LIMIT,
                        &format!(
                            "Timer limit of {} concurrent timers exceeded",
                            limit.max_timers
                        ),
                    )),
                }
            }
        }),
    )?;

    global.set(
        "__fx_timer_cancel_native",
        Func::from({
            let state = Rc::clone(state);
            move |id: u32| -> rquickjs::Result<()> {
                state.governor.borrow_mut().cancel(id);
                Ok(())
            }
        }),
    )?;

    global.set(
        "__fx_catalogue_native",
        Func::from({
            let catalogue = catalogue.to_string();
            move || -> rquickjs::Result<String> { Ok(catalogue.clone()) }
        }),
    )?;

    ctx.eval::<(), _>(BRIDGE_JS)
}

/// Throws a JS error value carrying an explicit `code`, so the failure
/// normalizer passes it through unchanged.
fn throw_coded(ctx: &Ctx<'_>, code: &str, message: &str) -> rquickjs::Error {
    let built: rquickjs::Result<rquickjs::Error> = (|| {
        let obj = Object::new(ctx.clone())?;
        obj.set("code", code)?;
        obj.set("message", message)?;
        Ok(ctx.throw(obj.into_value()))
    })();
    built.unwrap_or_else(|err| err)
}

/// Resolves or rejects the pending Promise for one capability call.
pub(crate) fn deliver_completion(
    ctx: &Ctx<'_>,
    call_id: u32,
    outcome: &Result<serde_json::Value, CapabilityError>,
) -> rquickjs::Result<()> {
    let complete: Function = ctx.globals().get("__fx_complete")?;
    let obj = Object::new(ctx.clone())?;
    match outcome {
        Ok(value) => {
            obj.set("ok", true)?;
            obj.set("value", json_to_js(ctx, value)?)?;
        }
        Err(err) => {
            obj.set("ok", false)?;
            obj.set("message", err.message.as_str())?;
            if let Some(code) = &err.code {
                obj.set("code", code.as_str())?;
            }
            if let Some(details) = &err.details {
                obj.set("details", json_to_js(ctx, details)?)?;
            }
        }
    }
    complete.call::<_, ()>((call_id, obj))
}

/// Fires one due timer's callback. An exception thrown inside the callback
/// never escapes: it comes back as the encoded error object.
pub(crate) fn fire_timer(ctx: &Ctx<'_>, id: u32) -> Result<(), serde_json::Value> {
    let run = || -> rquickjs::Result<()> {
        let fire: Function = ctx.globals().get("__fx_fire_timer")?;
        fire.call::<_, ()>((id,))
    };
    run().map_err(|err| encode_thrown(ctx, err))
}

/// Encodes a pending exception (or plain engine error) as the failure
/// normalizer's `{code?, message, stack?, details?}` object.
pub(crate) fn encode_thrown(ctx: &Ctx<'_>, err: rquickjs::Error) -> serde_json::Value {
    if matches!(err, rquickjs::Error::Exception) {
        let caught = ctx.catch();
        let encoded = ctx
            .globals()
            .get::<_, Function>("__fx_encode_error")
            .and_then(|encode| encode.call::<_, Value>((caught.clone(),)))
            .and_then(|value| js_to_json(&value));
        if let Ok(json) = encoded {
            return json;
        }
        let message = Coerced::<String>::from_js(ctx, caught)
            .map(|c| c.0)
            .unwrap_or_else(|_| "Unknown error".to_string());
        return serde_json::json!({ "message": message });
    }
    serde_json::json!({ "message": err.to_string() })
}

/// The JS half of the bridge. Evaluated once per context, after the native
/// functions are in place.
const BRIDGE_JS: &str = r#"
"use strict";

// ── Safe serialization ─────────────────────────────────────────

// Repeated object references become a circular marker; non-JSON-native
// values become tagged placeholders instead of failing the call.
globalThis.__fx_safe_stringify = (value) => {
    const seen = new WeakSet();
    return JSON.stringify(value, (key, v) => {
        if (typeof v === 'bigint') return '[BigInt ' + v.toString() + ']';
        if (typeof v === 'function') return '[Function' + (v.name ? ': ' + v.name : '') + ']';
        if (typeof v === 'symbol') return v.toString();
        if (typeof v === 'object' && v !== null) {
            if (seen.has(v)) return '[Circular]';
            seen.add(v);
        }
        return v;
    });
};

globalThis.__fx_format_value = (v) => {
    if (typeof v === 'string') return v;
    if (v === undefined) return 'undefined';
    try {
        const s = __fx_safe_stringify(v);
        return s === undefined ? String(v) : s;
    } catch (_) {
        try { return String(v); } catch (_e) { return '[unprintable]'; }
    }
};

globalThis.__fx_encode_result = (v) => {
    try {
        const s = __fx_safe_stringify(v);
        return s === undefined ? 'null' : s;
    } catch (e) {
        let preview;
        try { preview = String(v); } catch (_) { preview = Object.prototype.toString.call(v); }
        return JSON.stringify({ _unserializable: true, preview: String(preview).slice(0, 500) });
    }
};

globalThis.__fx_encode_error = (err) => {
    if (err === null || err === undefined) return { message: 'Unknown error' };
    if (typeof err !== 'object') return { message: __fx_format_value(err) };
    const out = { message: err.message !== undefined ? String(err.message) : __fx_format_value(err) };
    if (err.code !== undefined) out.code = String(err.code);
    if (err.stack !== undefined) out.stack = String(err.stack);
    if (err.details !== undefined) {
        try { out.details = JSON.parse(__fx_safe_stringify(err.details)); } catch (_) {}
    }
    return out;
};

// ── Console ────────────────────────────────────────────────────

const __fx_console = (level) => (...args) => {
    __fx_console_native(level, args.map(__fx_format_value).join(' '));
};

globalThis.console = {
    log: __fx_console('log'),
    info: __fx_console('info'),
    warn: __fx_console('warn'),
    error: __fx_console('error'),
    debug: __fx_console('debug'),
    trace: __fx_console('trace'),
    assert: (cond, ...args) => {
        if (!cond) {
            const rest = args.length ? ': ' + args.map(__fx_format_value).join(' ') : '';
            __fx_console_native('error', 'Assertion failed' + rest);
        }
    },
};

// ── Capability calls ───────────────────────────────────────────

// call_id -> [resolve, reject]
const __fx_pending = new Map();

globalThis.__fx_call = (namespace, method, params) => new Promise((resolve, reject) => {
    let id;
    try {
        id = __fx_enqueue_native(namespace, method, params === undefined ? null : params);
    } catch (e) {
        reject(e);
        return;
    }
    __fx_pending.set(id, [resolve, reject]);
});

globalThis.__fx_complete = (id, outcome) => {
    const entry = __fx_pending.get(id);
    if (!entry) return;
    __fx_pending.delete(id);
    if (outcome.ok) {
        entry[0](outcome.value);
        return;
    }
    const err = new Error(outcome.message);
    if (outcome.code !== undefined) err.code = outcome.code;
    if (outcome.details !== undefined) err.details = outcome.details;
    entry[1](err);
};

// ── Timers ─────────────────────────────────────────────────────

// timer_id -> callback; handles are owned by the Rust governor
const __fx_timer_callbacks = new Map();

globalThis.setTimeout = (handler, delay) => {
    if (typeof handler !== 'function') {
        const err = new Error('setTimeout requires a callable handler');
        err.code = 'INVALID_TIMER_HANDLER';
        throw err;
    }
    const id = __fx_timer_register_native(Number(delay) || 0);
    __fx_timer_callbacks.set(id, handler);
    return id;
};

globalThis.clearTimeout = (id) => {
    if (!__fx_timer_callbacks.delete(id)) return;
    __fx_timer_cancel_native(id);
};

globalThis.__fx_fire_timer = (id) => {
    const handler = __fx_timer_callbacks.get(id);
    __fx_timer_callbacks.delete(id);
    if (handler) handler();
};

// ── Capability namespaces + help() ─────────────────────────────

{
    const catalogue = JSON.parse(__fx_catalogue_native());
    for (const entry of catalogue) {
        const ns = {};
        for (const m of entry.methods) {
            ns[m.name] = (params) => __fx_call(entry.namespace, m.name, params);
        }
        globalThis[entry.namespace] = ns;
    }
}

globalThis.help = (namespace) => {
    const catalogue = JSON.parse(__fx_catalogue_native());
    if (namespace === undefined || namespace === null) return catalogue;
    return catalogue.find((entry) => entry.namespace === namespace) ?? null;
};

// ── Run wrapper ────────────────────────────────────────────────

// Settles exactly once. An undefined completion value is reported without
// a payload so the host can tell "no return" from "returned null".
globalThis.__fx_run = (fn) => {
    Promise.resolve().then(fn).then(
        (v) => {
            if (v === undefined) {
                __fx_settle_native(true);
            } else {
                __fx_settle_native(true, __fx_encode_result(v));
            }
        },
        (e) => {
            let encoded;
            try { encoded = JSON.stringify(__fx_encode_error(e)); }
            catch (_) { encoded = '{"message":"Unknown error"}'; }
            __fx_settle_native(false, encoded);
        }
    );
};
"#;
