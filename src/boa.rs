//! Boa backend on `boa_engine`.
//!
//! Boa owns its microtask queue and runs it through `Context::run_jobs`,
//! which reports no count, so only host macrotasks are counted by
//! `drain_pending_jobs`.
//!
//! `undefined` converts to the string marker `"undefined"`.

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
use boa_engine::builtins::promise::PromiseState;
use boa_engine::object::builtins::JsPromise;
use boa_engine::{
    Context, JsArgs, JsError, JsObject, JsResult, JsString, JsValue, NativeFunction, Source,
    js_string,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Marker `undefined` converts to.
pub const UNDEFINED_MARKER: &str = "undefined";

struct Live {
    promises: HashMap<u64, JsPromise>,
    /// `Object.keys` captured before user code can replace it.
    object_keys: JsObject,
    context: Context,
}

pub struct BoaEngine {
    state: Arc<InstanceState>,
    live: Option<Live>,
    next_promise: u64,
}

impl BoaEngine {
    pub fn new(options: &RuntimeOptions, clock: SharedClock) -> Result<Self> {
        // Limits are QuickJS-only; still reject malformed values here.
        options.limits()?;
        let mut context = Context::default();
        let state = InstanceState::new(EngineKind::Boa, clock);

        install_natives(&mut context, state.id()).map_err(|err| map_js_error(&err))?;
        context
            .eval(Source::from_bytes(prelude::PRELUDE))
            .map_err(|err| map_js_error(&err))?;
        let keys = context
            .eval(Source::from_bytes("Object.keys"))
            .map_err(|err| map_js_error(&err))?;
        let Some(object_keys) = keys.as_callable() else {
            return Err(Error::engine("Boa: Object.keys is not callable"));
        };
        let object_keys = object_keys.clone();
        instances::register(&state);

        Ok(Self {
            state,
            live: Some(Live {
                promises: HashMap::new(),
                object_keys,
                context,
            }),
            next_promise: 1,
        })
    }

    fn live(&mut self) -> Result<&mut Live> {
        let id = self.state.id();
        self.live.as_mut().ok_or(Error::Disposed(id))
    }
}

fn arg_string(args: &[JsValue], index: usize, ctx: &mut Context) -> JsResult<Option<String>> {
    let value = args.get_or_undefined(index);
    if value.is_null_or_undefined() {
        return Ok(None);
    }
    Ok(Some(value.to_string(ctx)?.to_std_string_escaped()))
}

fn install_natives(context: &mut Context, id: InstanceId) -> JsResult<()> {
    context.register_global_builtin_callable(
        JsString::from(prelude::NATIVE_DISPATCH),
        2,
        NativeFunction::from_copy_closure(move |_this, args, ctx| {
            let channel = arg_string(args, 0, ctx)?.unwrap_or_default();
            let argument = arg_string(args, 1, ctx)?;
            let envelope = channels::dispatch_from_script(id, &channel, argument);
            Ok(JsValue::from(JsString::from(envelope.as_str())))
        }),
    )?;
    context.register_global_builtin_callable(
        JsString::from(prelude::NATIVE_SCHEDULE),
        1,
        NativeFunction::from_copy_closure(move |_this, args, ctx| {
            let delay = prelude::whole_number(args.get_or_undefined(0).to_number(ctx)?);
            let timer_id = instances::lookup(id)
                .map_or(-1.0, |state| prelude::timer_id_to_js(state.scheduler().set_timeout(delay)));
            Ok(JsValue::from(timer_id))
        }),
    )?;
    context.register_global_builtin_callable(
        JsString::from(prelude::NATIVE_CANCEL),
        1,
        NativeFunction::from_copy_closure(move |_this, args, ctx| {
            let timer_id = prelude::whole_number(args.get_or_undefined(0).to_number(ctx)?);
            if let Some(state) = instances::lookup(id) {
                state.scheduler().clear_timeout(timer_id);
            }
            Ok(JsValue::undefined())
        }),
    )?;
    context.register_global_builtin_callable(
        JsString::from(prelude::NATIVE_LOG),
        2,
        NativeFunction::from_copy_closure(move |_this, args, ctx| {
            let level = arg_string(args, 0, ctx)?.unwrap_or_default();
            let message = arg_string(args, 1, ctx)?.unwrap_or_default();
            prelude::forward_console(id, &level, &message);
            Ok(JsValue::undefined())
        }),
    )?;
    Ok(())
}

fn map_js_error(err: &JsError) -> Error {
    Error::engine(format!("Boa: {err}"))
}

fn describe(value: &JsValue, ctx: &mut Context) -> String {
    if value.is_symbol() {
        return "Symbol()".to_string();
    }
    value
        .to_string(ctx)
        .map(|text| text.to_std_string_escaped())
        .unwrap_or_else(|_| format!("[{}]", value.type_of()))
}

fn property_string(object: &JsObject, key: &str, ctx: &mut Context) -> Option<String> {
    let value = object.get(JsString::from(key), ctx).ok()?;
    if value.is_undefined() {
        return None;
    }
    value.to_string(ctx).ok().map(|text| text.to_std_string_escaped())
}

fn error_result(err: &JsError, ctx: &mut Context) -> EvaluationResult {
    let thrown = err.to_opaque(ctx);
    let Some(object) = thrown.as_object() else {
        return EvaluationResult::error(describe(&thrown, ctx), None);
    };
    let name = property_string(&object, "name", ctx).unwrap_or_else(|| "Error".to_string());
    let message = property_string(&object, "message", ctx).unwrap_or_default();
    let stack = property_string(&object, "stack", ctx).filter(|stack| !stack.is_empty());
    let text = if message.is_empty() {
        name
    } else {
        format!("{name}: {message}")
    };
    EvaluationResult::error(text, stack)
}

/// The script-controlled `length` of `object`, or `None` when it is too
/// large to walk.
fn array_length(object: &JsObject, ctx: &mut Context) -> JsResult<Option<u32>> {
    let length = object.get(js_string!("length"), ctx)?.to_number(ctx)?;
    Ok(walkable_length(length))
}

/// Walk a Boa value into the host model. Never fails: anything that cannot be
/// walked becomes `Opaque`.
fn to_script_value(value: &JsValue, keys: &JsObject, ctx: &mut Context, depth: usize) -> ScriptValue {
    if value.is_null() {
        return ScriptValue::Null;
    }
    if value.is_undefined() {
        return ScriptValue::from(UNDEFINED_MARKER);
    }
    if let Some(flag) = value.as_boolean() {
        return ScriptValue::Bool(flag);
    }
    if let Some(number) = value.as_number() {
        return ScriptValue::from_f64(number);
    }
    if let Some(text) = value.as_string() {
        return ScriptValue::Str(text.to_std_string_escaped());
    }
    let Some(object) = value.as_object() else {
        return ScriptValue::opaque(value.type_of().to_string(), describe(value, ctx));
    };
    if object.is_callable() {
        return ScriptValue::opaque("function", describe(value, ctx));
    }
    if JsPromise::from_object(object.clone()).is_ok() {
        return ScriptValue::opaque("promise", describe(value, ctx));
    }
    if depth >= MAX_CONVERSION_DEPTH {
        return ScriptValue::opaque("object", describe(value, ctx));
    }
    if object.is_array() {
        return match walk_array(&object, keys, ctx, depth) {
            Ok(Some(list)) => list,
            Ok(None) | Err(_) => ScriptValue::opaque("array", describe(value, ctx)),
        };
    }
    walk_object(&object, keys, ctx, depth).unwrap_or_else(|_| ScriptValue::opaque("object", describe(value, ctx)))
}

fn walk_array(
    array: &JsObject,
    keys: &JsObject,
    ctx: &mut Context,
    depth: usize,
) -> JsResult<Option<ScriptValue>> {
    let Some(length) = array_length(array, ctx)? else {
        return Ok(None);
    };
    let mut items = Vec::new();
    for index in 0..length {
        let item = array.get(index, ctx)?;
        items.push(to_script_value(&item, keys, ctx, depth + 1));
    }
    Ok(Some(ScriptValue::List(items)))
}

fn walk_object(object: &JsObject, keys: &JsObject, ctx: &mut Context, depth: usize) -> JsResult<ScriptValue> {
    let names = keys.call(&JsValue::undefined(), &[JsValue::from(object.clone())], ctx)?;
    let Some(names) = names.as_object() else {
        return Ok(ScriptValue::Map(Vec::new()));
    };
    let count = u32::try_from(names.get(js_string!("length"), ctx)?.to_length(ctx)?).unwrap_or(u32::MAX);
    let mut entries = Vec::new();
    for index in 0..count {
        let key = names.get(index, ctx)?.to_string(ctx)?;
        let item = object.get(key.clone(), ctx)?;
        entries.push((
            key.to_std_string_escaped(),
            to_script_value(&item, keys, ctx, depth + 1),
        ));
    }
    Ok(ScriptValue::map_from(entries))
}

fn value_result(value: &JsValue, keys: &JsObject, ctx: &mut Context) -> EvaluationResult {
    let raw = to_script_value(value, keys, ctx, 0);
    EvaluationResult::value(raw, describe(value, ctx))
}

impl LoopBackend for BoaEngine {
    fn state(&self) -> &Arc<InstanceState> {
        &self.state
    }

    fn run_microtasks(&mut self) -> Result<usize> {
        let id = self.state.id();
        let live = self.live()?;
        if let Err(err) = live.context.run_jobs() {
            tracing::warn!(
                event = "event_loop.job.failed",
                instance = %id,
                error = %err,
                "Microtask threw; skipping"
            );
        }
        Ok(0)
    }

    fn eval_glue(&mut self, code: &str) -> Result<()> {
        let live = self.live()?;
        match live.context.eval(Source::from_bytes(code)) {
            Ok(_) => Ok(()),
            Err(err) => {
                let failed = error_result(&err, &mut live.context);
                Err(Error::evaluation(
                    failed.string_representation(),
                    failed.stack().map(str::to_string),
                ))
            }
        }
    }

    fn promise_progress(&mut self, handle: PromiseHandle) -> Result<PromiseProgress> {
        let live = self.live()?;
        let promise = live
            .promises
            .get(&handle.value())
            .ok_or_else(|| Error::engine(format!("unknown {handle}")))?;
        Ok(match promise.state() {
            PromiseState::Pending => PromiseProgress::Pending,
            PromiseState::Fulfilled(value) => {
                PromiseProgress::Settled(value_result(&value, &live.object_keys, &mut live.context))
            }
            PromiseState::Rejected(reason) => PromiseProgress::Settled(error_result(
                &JsError::from_opaque(reason),
                &mut live.context,
            )),
        })
    }

    fn forget_promise(&mut self, handle: PromiseHandle) {
        if let Some(live) = self.live.as_mut() {
            live.promises.remove(&handle.value());
        }
    }
}

#[async_trait(?Send)]
impl ScriptEngine for BoaEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Boa
    }

    fn instance_id(&self) -> InstanceId {
        self.state.id()
    }

    fn evaluate(&mut self, code: &str) -> Result<EvaluationResult> {
        let id = self.state.id();
        let handle = PromiseHandle(self.next_promise);
        let live = self.live()?;
        tracing::debug!(event = "engine.eval", instance = %id, bytes = code.len(), "Evaluating");

        let value = match live.context.eval(Source::from_bytes(code)) {
            Ok(value) => value,
            Err(err) => {
                let result = error_result(&err, &mut live.context);
                tracing::debug!(
                    event = "engine.eval.error",
                    instance = %id,
                    error = %result.string_representation(),
                    "Script raised"
                );
                return Ok(result);
            }
        };

        let promise = value
            .as_object()
            .and_then(|object| JsPromise::from_object(object.clone()).ok());
        if let Some(promise) = promise {
            let description = describe(&value, &mut live.context);
            live.promises.insert(handle.value(), promise);
            self.next_promise += 1;
            return Ok(EvaluationResult::pending(handle, description));
        }
        Ok(value_result(&value, &live.object_keys, &mut live.context))
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
            kind = "boa",
            pending_promises,
            "Engine instance disposed"
        );
    }

    fn is_disposed(&self) -> bool {
        self.live.is_none()
    }
}

impl Drop for BoaEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
