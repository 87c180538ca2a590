//! QuickJS backend on `rquickjs`.
//!
//! - One `Runtime` + full `Context` per instance
//! - Host natives and the shared prelude installed at construction
//! - Promises kept alive as `Persistent` handles until reconciled
//! - Microtasks drained through `Runtime::execute_pending_job`
//!
//! `undefined` converts to [`ScriptValue::Null`].

use crate::channels::{self, ChannelCallback};
use crate::config::RuntimeOptions;
use crate::engine::ScriptEngine;
use crate::error::{Error, Result};
use crate::evaluation::{EvaluationResult, PromiseHandle};
use crate::event_loop::{self, LoopBackend, PromiseProgress};
use crate::instances::{self, InstanceId, InstanceState, SharedClock};
use crate::platform::EngineKind;
use crate::prelude;
use crate::value::{MAX_CONVERSION_DEPTH, ScriptValue, walkable_length};
use async_trait::async_trait;
use rquickjs::convert::Coerced;
use rquickjs::function::Func;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Persistent, Promise, Runtime, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Engine handles. Field order is drop order: promise handles must be
/// released before the runtime that owns them.
struct Live {
    promises: HashMap<u64, Persistent<Promise<'static>>>,
    context: Context,
    runtime: Runtime,
}

pub struct QuickJsEngine {
    state: Arc<InstanceState>,
    live: Option<Live>,
    next_promise: u64,
}

impl QuickJsEngine {
    pub fn new(options: &RuntimeOptions, clock: SharedClock) -> Result<Self> {
        let limits = options.limits()?;
        let runtime = Runtime::new().map_err(map_js_error)?;
        if let Some(bytes) = limits.memory_limit {
            runtime.set_memory_limit(bytes);
        }
        if let Some(bytes) = limits.max_stack_size {
            runtime.set_max_stack_size(bytes);
        }
        if let Some(bytes) = limits.gc_threshold {
            runtime.set_gc_threshold(bytes);
        }
        let context = Context::full(&runtime).map_err(map_js_error)?;

        let state = InstanceState::new(EngineKind::QuickJs, clock);
        install_natives(&context, state.id())?;
        instances::register(&state);

        Ok(Self {
            state,
            live: Some(Live {
                promises: HashMap::new(),
                context,
                runtime,
            }),
            next_promise: 1,
        })
    }

    fn live(&mut self) -> Result<&mut Live> {
        let id = self.state.id();
        self.live.as_mut().ok_or(Error::Disposed(id))
    }
}

fn install_natives(context: &Context, id: InstanceId) -> Result<()> {
    context
        .with(|ctx| -> rquickjs::Result<()> {
            let global = ctx.globals();
            global.set(
                prelude::NATIVE_DISPATCH,
                Func::from(move |channel: String, argument: Option<String>| -> String {
                    channels::dispatch_from_script(id, &channel, argument)
                }),
            )?;
            global.set(
                prelude::NATIVE_SCHEDULE,
                Func::from(move |delay: f64| -> f64 {
                    instances::lookup(id).map_or(-1.0, |state| {
                        prelude::timer_id_to_js(state.scheduler().set_timeout(prelude::whole_number(delay)))
                    })
                }),
            )?;
            global.set(
                prelude::NATIVE_CANCEL,
                Func::from(move |timer_id: f64| {
                    if let Some(state) = instances::lookup(id) {
                        state.scheduler().clear_timeout(prelude::whole_number(timer_id));
                    }
                }),
            )?;
            global.set(
                prelude::NATIVE_LOG,
                Func::from(move |level: String, message: String| {
                    prelude::forward_console(id, &level, &message);
                }),
            )?;
            ctx.eval::<(), _>(prelude::PRELUDE)
        })
        .map_err(map_js_error)
}

/// Turn a failed evaluation into an error result carrying message and stack.
fn caught_result<'js>(ctx: &Ctx<'js>, err: CaughtError<'js>) -> EvaluationResult {
    match err {
        CaughtError::Exception(exception) => {
            let name = exception
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .unwrap_or_else(|| "Error".to_string());
            let message = exception.message().unwrap_or_default();
            let text = if message.is_empty() {
                name
            } else {
                format!("{name}: {message}")
            };
            EvaluationResult::error(text, exception.stack().filter(|s| !s.is_empty()))
        }
        CaughtError::Value(value) => EvaluationResult::error(describe(ctx, &value), None),
        CaughtError::Error(err) => EvaluationResult::error(format!("QuickJS: {err}"), None),
    }
}

/// The engine's own string coercion of `value`; total.
fn describe<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    if value.is_symbol() {
        return "Symbol()".to_string();
    }
    match value.get::<Coerced<String>>() {
        Ok(Coerced(text)) => text,
        Err(_) => {
            // Clear the exception a throwing toString left behind.
            let _ = ctx.catch();
            format!("[{}]", value.type_name())
        }
    }
}

/// Walk a QuickJS value into the host model. Never fails: anything that
/// cannot be walked becomes `Opaque`.
fn to_script_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>, depth: usize) -> ScriptValue {
    if value.is_undefined() || value.is_null() {
        return ScriptValue::Null;
    }
    if let Some(flag) = value.as_bool() {
        return ScriptValue::Bool(flag);
    }
    if let Some(int) = value.as_int() {
        return ScriptValue::Int(i64::from(int));
    }
    if let Some(float) = value.as_float() {
        return ScriptValue::from_f64(float);
    }
    if let Some(string) = value.as_string() {
        return match string.to_string() {
            Ok(text) => ScriptValue::Str(text),
            Err(_) => ScriptValue::opaque("string", describe(ctx, value)),
        };
    }
    if value.is_symbol() {
        return ScriptValue::opaque("symbol", describe(ctx, value));
    }
    if value.is_promise() {
        return ScriptValue::opaque("promise", describe(ctx, value));
    }
    if value.is_function() {
        return ScriptValue::opaque("function", describe(ctx, value));
    }
    if depth >= MAX_CONVERSION_DEPTH {
        return ScriptValue::opaque("object", describe(ctx, value));
    }
    if let Some(object) = value.as_object().filter(|_| value.is_array()) {
        return walk_array(ctx, object, depth).unwrap_or_else(|| {
            // A throwing getter leaves its exception pending.
            let _ = ctx.catch();
            ScriptValue::opaque("array", describe(ctx, value))
        });
    }
    if let Some(object) = value.as_object() {
        let mut entries = Vec::new();
        for entry in object.props::<String, Value>() {
            match entry {
                Ok((key, item)) => entries.push((key, to_script_value(ctx, &item, depth + 1))),
                Err(_) => return ScriptValue::opaque("object", describe(ctx, value)),
            }
        }
        return ScriptValue::map_from(entries);
    }
    ScriptValue::opaque(value.type_name(), describe(ctx, value))
}

/// Reads `length` as a plain property: it is script controlled and may be
/// anything up to 2^32 - 1.
fn walk_array<'js>(ctx: &Ctx<'js>, object: &rquickjs::Object<'js>, depth: usize) -> Option<ScriptValue> {
    let Coerced(length) = object.get::<_, Coerced<f64>>("length").ok()?;
    let length = walkable_length(length)?;
    let mut items = Vec::new();
    for index in 0..length {
        let item = object.get::<_, Value>(index).ok()?;
        items.push(to_script_value(ctx, &item, depth + 1));
    }
    Some(ScriptValue::List(items))
}

fn value_result<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> EvaluationResult {
    EvaluationResult::value(to_script_value(ctx, value, 0), describe(ctx, value))
}

fn map_js_error(err: rquickjs::Error) -> Error {
    Error::engine(format!("QuickJS: {err}"))
}

impl LoopBackend for QuickJsEngine {
    fn state(&self) -> &Arc<InstanceState> {
        &self.state
    }

    fn run_microtasks(&mut self) -> Result<usize> {
        let id = self.state.id();
        let live = self.live()?;
        let mut ran = 0;
        loop {
            match live.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(_) => {
                    ran += 1;
                    let message = live.context.with(|ctx| {
                        let thrown = ctx.catch();
                        describe(&ctx, &thrown)
                    });
                    tracing::warn!(
                        event = "event_loop.job.failed",
                        instance = %id,
                        error = %message,
                        "Microtask threw; skipping"
                    );
                }
            }
        }
        Ok(ran)
    }

    fn eval_glue(&mut self, code: &str) -> Result<()> {
        let live = self.live()?;
        live.context.with(|ctx| match ctx.eval::<(), _>(code).catch(&ctx) {
            Ok(()) => Ok(()),
            Err(err) => {
                let failed = caught_result(&ctx, err);
                Err(Error::evaluation(
                    failed.string_representation(),
                    failed.stack().map(str::to_string),
                ))
            }
        })
    }

    fn promise_progress(&mut self, handle: PromiseHandle) -> Result<PromiseProgress> {
        let live = self.live()?;
        let saved = live
            .promises
            .get(&handle.value())
            .cloned()
            .ok_or_else(|| Error::engine(format!("unknown {handle}")))?;
        live.context.with(|ctx| {
            let promise = saved.restore(&ctx).map_err(map_js_error)?;
            Ok(match promise.result::<Value>() {
                None => PromiseProgress::Pending,
                Some(Ok(value)) => PromiseProgress::Settled(value_result(&ctx, &value)),
                Some(Err(err)) => {
                    PromiseProgress::Settled(caught_result(&ctx, CaughtError::from_error(&ctx, err)))
                }
            })
        })
    }

    fn forget_promise(&mut self, handle: PromiseHandle) {
        if let Some(live) = self.live.as_mut() {
            live.promises.remove(&handle.value());
        }
    }
}

#[async_trait(?Send)]
impl ScriptEngine for QuickJsEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::QuickJs
    }

    fn instance_id(&self) -> InstanceId {
        self.state.id()
    }

    fn evaluate(&mut self, code: &str) -> Result<EvaluationResult> {
        let id = self.state.id();
        let handle = PromiseHandle(self.next_promise);
        let live = self.live()?;
        tracing::debug!(event = "engine.eval", instance = %id, bytes = code.len(), "Evaluating");

        let (result, saved) = live.context.with(|ctx| match ctx.eval::<Value, _>(code).catch(&ctx) {
            Ok(value) => match value.as_promise() {
                Some(promise) => (
                    EvaluationResult::pending(handle, describe(&ctx, &value)),
                    Some(Persistent::save(&ctx, promise.clone())),
                ),
                None => (value_result(&ctx, &value), None),
            },
            Err(err) => (caught_result(&ctx, err), None),
        });
        if let Some(saved) = saved {
            live.promises.insert(handle.value(), saved);
            self.next_promise += 1;
        }
        if result.is_error() {
            tracing::debug!(
                event = "engine.eval.error",
                instance = %id,
                error = %result.string_representation(),
                "Script raised"
            );
        }
        Ok(result)
    }

    async fn resolve_promise(&mut self, result: EvaluationResult) -> Result<EvaluationResult> {
        let Some(handle) = result.promise() else {
            return Ok(result);
        };
        if self.live.is_none() {
            return Err(Error::Disposed(self.state.id()));
        }
        event_loop::reconcile(self, handle, result).await
    }

    fn release_promise(&mut self, handle: PromiseHandle) {
        self.forget_promise(handle);
    }

    fn retained_promises(&self) -> usize {
        self.live.as_ref().map_or(0, |live| live.promises.len())
    }

    fn register_channel(&mut self, name: &str, callback: ChannelCallback) -> bool {
        if self.live.is_none() || !channels::register(&self.state, name, callback) {
            return false;
        }
        if let Err(err) = self.eval_glue(&prelude::install_channel(name)) {
            tracing::warn!(
                event = "channel.register.proxy_failed",
                instance = %self.state.id(),
                channel = name,
                error = %err,
                "Channel registered without a hostChannels proxy"
            );
        }
        true
    }

    fn drain_pending_jobs(&mut self) -> Result<usize> {
        event_loop::drain(self)
    }

    fn set_inspectable(&mut self, enabled: bool) {
        // QuickJS has no inspector; the flag is recorded for callers only.
        self.state.set_inspectable(enabled);
    }

    fn dispose(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        instances::retire(&self.state);
        let pending_promises = live.promises.len();
        drop(live);
        tracing::info!(
            event = "engine.dispose",
            instance = %self.state.id(),
            kind = "quickjs",
            pending_promises,
            "Engine instance disposed"
        );
    }

    fn is_disposed(&self) -> bool {
        self.live.is_none()
    }
}

impl Drop for QuickJsEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
