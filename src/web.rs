//! Host browser backend for `wasm32` builds.
//!
//! Code runs through the page's global indirect `eval`, so `var` and function
//! declarations persist between calls while top-level `let`/`const` stay
//! local to one call. The page has a single global object, so only one
//! browser instance may be live at a time; `sendMessage` and `hostChannels`
//! belong to it and are removed on dispose. The browser drives its own event
//! loop: channel proxies always return a Promise, and `drain_pending_jobs` is
//! a no-op.

use crate::channels::{self, ChannelCallback};
use crate::engine::ScriptEngine;
use crate::error::{Error, Result};
use crate::evaluation::{EvaluationResult, PromiseHandle};
use crate::instances::{self, InstanceId, InstanceState};
use crate::platform::EngineKind;
use crate::scheduler::WallClock;
use crate::value::{MAX_CONVERSION_DEPTH, ScriptValue, walkable_length};
use async_trait::async_trait;
use js_sys::{Array, Function, JsString, Object, Promise, Reflect};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{JsFuture, future_to_promise};

const SEND_MESSAGE: &str = "sendMessage";
const HOST_CHANNELS: &str = "hostChannels";

thread_local! {
    /// The instance owning the page globals.
    static OWNER: Cell<Option<InstanceId>> = const { Cell::new(None) };
}

type Proxy = Closure<dyn FnMut(JsValue, JsValue) -> Promise>;
type ChannelProxy = Closure<dyn FnMut(JsValue) -> Promise>;

/// The closures back functions installed on the page; dropping them
/// invalidates those functions.
struct Live {
    promises: HashMap<u64, Promise>,
    _send_message: Proxy,
    proxies: Vec<ChannelProxy>,
}

pub struct BrowserEngine {
    state: Arc<InstanceState>,
    live: Option<Live>,
    next_promise: u64,
}

impl BrowserEngine {
    /// Fails with [`Error::EngineUnavailable`] while another browser
    /// instance is live.
    pub fn new() -> Result<Self> {
        if let Some(owner) = OWNER.get() {
            return Err(Error::unavailable(
                EngineKind::Browser,
                format!("{owner} still owns the page globals; dispose it first"),
            ));
        }
        let state = InstanceState::new(EngineKind::Browser, Arc::new(WallClock));
        let id = state.id();
        let send_message: Proxy = Closure::new(move |channel: JsValue, argument: JsValue| {
            let channel = channel.as_string().unwrap_or_default();
            send(id, channel, argument)
        });
        let global = js_sys::global();
        set(&global, SEND_MESSAGE, send_message.as_ref())?;
        set(&global, HOST_CHANNELS, &Object::new())?;
        OWNER.set(Some(id));
        instances::register(&state);
        Ok(Self {
            state,
            live: Some(Live {
                promises: HashMap::new(),
                _send_message: send_message,
                proxies: Vec::new(),
            }),
            next_promise: 1,
        })
    }

    fn live(&mut self) -> Result<&mut Live> {
        let id = self.state.id();
        self.live.as_mut().ok_or(Error::Disposed(id))
    }
}

fn set(target: &JsValue, key: &str, value: &JsValue) -> Result<()> {
    Reflect::set(target, &JsValue::from_str(key), value)
        .map(|_| ())
        .map_err(|err| Error::engine(format!("browser: cannot set `{key}`: {}", describe(&err))))
}

fn send(id: InstanceId, channel: String, argument: JsValue) -> Promise {
    future_to_promise(async move {
        let argument = if argument.is_undefined() {
            None
        } else {
            Some(String::from(js_sys::JSON::stringify(&argument)?))
        };
        match channels::dispatch(id, &channel, argument).await {
            Ok(Some(json)) => js_sys::JSON::parse(&json),
            Ok(None) => Ok(JsValue::UNDEFINED),
            Err(err) => Err(js_sys::Error::new(&err.to_string()).into()),
        }
    })
}

/// `String(value)`, falling back to the type tag if coercion throws.
fn describe(value: &JsValue) -> String {
    if let Some(text) = value.as_string() {
        return text;
    }
    Reflect::get(&js_sys::global(), &JsValue::from_str("String"))
        .ok()
        .and_then(|string| string.dyn_into::<Function>().ok())
        .and_then(|string| string.call1(&JsValue::NULL, value).ok())
        .and_then(|text| text.as_string())
        .unwrap_or_else(|| format!("[{}]", String::from(value.js_typeof().unchecked_into::<JsString>())))
}

fn to_script_value(value: &JsValue, depth: usize) -> ScriptValue {
    if value.is_null() || value.is_undefined() {
        return ScriptValue::Null;
    }
    if let Some(flag) = value.as_bool() {
        return ScriptValue::Bool(flag);
    }
    if let Some(number) = value.as_f64() {
        return ScriptValue::from_f64(number);
    }
    if let Some(text) = value.as_string() {
        return ScriptValue::Str(text);
    }
    if value.is_symbol() {
        return ScriptValue::opaque("symbol", "Symbol()");
    }
    if value.is_function() {
        return ScriptValue::opaque("function", describe(value));
    }
    if value.is_instance_of::<Promise>() {
        return ScriptValue::opaque("promise", describe(value));
    }
    if !value.is_object() {
        return ScriptValue::opaque(
            String::from(value.js_typeof().unchecked_into::<JsString>()),
            describe(value),
        );
    }
    if depth >= MAX_CONVERSION_DEPTH {
        return ScriptValue::opaque("object", describe(value));
    }
    if Array::is_array(value) {
        let array: &Array = value.unchecked_ref();
        let Some(length) = walkable_length(f64::from(array.length())) else {
            return ScriptValue::opaque("array", describe(value));
        };
        return ScriptValue::List(
            (0..length)
                .map(|index| to_script_value(&array.get(index), depth + 1))
                .collect(),
        );
    }
    let object: &Object = value.unchecked_ref();
    let mut entries = Vec::new();
    for key in Object::keys(object).iter() {
        let Some(name) = key.as_string() else { continue };
        match Reflect::get(value, &key) {
            Ok(item) => entries.push((name, to_script_value(&item, depth + 1))),
            Err(_) => return ScriptValue::opaque("object", describe(value)),
        }
    }
    ScriptValue::map_from(entries)
}

fn error_result(thrown: &JsValue) -> EvaluationResult {
    if let Some(error) = thrown.dyn_ref::<js_sys::Error>() {
        let name = String::from(error.name());
        let message = String::from(error.message());
        let stack = Reflect::get(thrown, &JsValue::from_str("stack"))
            .ok()
            .and_then(|stack| stack.as_string());
        let text = if message.is_empty() {
            name
        } else {
            format!("{name}: {message}")
        };
        return EvaluationResult::error(text, stack);
    }
    EvaluationResult::error(describe(thrown), None)
}

#[async_trait(?Send)]
impl ScriptEngine for BrowserEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Browser
    }

    fn instance_id(&self) -> InstanceId {
        self.state.id()
    }

    fn evaluate(&mut self, code: &str) -> Result<EvaluationResult> {
        let handle = PromiseHandle(self.next_promise);
        let live = self.live()?;
        let value = match js_sys::eval(code) {
            Ok(value) => value,
            Err(thrown) => return Ok(error_result(&thrown)),
        };
        if let Some(promise) = value.dyn_ref::<Promise>() {
            live.promises.insert(handle.value(), promise.clone());
            self.next_promise += 1;
            return Ok(EvaluationResult::pending(handle, describe(&value)));
        }
        Ok(EvaluationResult::value(to_script_value(&value, 0), describe(&value)))
    }

    async fn resolve_promise(&mut self, result: EvaluationResult) -> Result<EvaluationResult> {
        let Some(handle) = result.promise() else {
            return Ok(result);
        };
        let Some(promise) = self.live()?.promises.remove(&handle.value()) else {
            return Ok(result);
        };
        Ok(match JsFuture::from(promise).await {
            Ok(value) => EvaluationResult::value(to_script_value(&value, 0), describe(&value)),
            Err(reason) => error_result(&reason),
        })
    }

    fn release_promise(&mut self, handle: PromiseHandle) {
        if let Some(live) = self.live.as_mut() {
            live.promises.remove(&handle.value());
        }
    }

    fn retained_promises(&self) -> usize {
        self.live.as_ref().map_or(0, |live| live.promises.len())
    }

    fn register_channel(&mut self, name: &str, callback: ChannelCallback) -> bool {
        let id = self.state.id();
        if self.live.is_none() || !channels::register(&self.state, name, callback) {
            return false;
        }
        let channel = name.to_string();
        let proxy: ChannelProxy = Closure::new(move |argument: JsValue| send(id, channel.clone(), argument));
        let installed = Reflect::get(&js_sys::global(), &JsValue::from_str(HOST_CHANNELS))
            .and_then(|channels| Reflect::set(&channels, &JsValue::from_str(name), proxy.as_ref()));
        if installed.is_err() {
            tracing::warn!(
                event = "channel.register.proxy_failed",
                instance = %id,
                channel = name,
                "Channel registered without a hostChannels proxy"
            );
        }
        if let Some(live) = self.live.as_mut() {
            live.proxies.push(proxy);
        }
        true
    }

    fn drain_pending_jobs(&mut self) -> Result<usize> {
        if self.live.is_none() {
            return Err(Error::Disposed(self.state.id()));
        }
        Ok(0)
    }

    fn set_inspectable(&mut self, enabled: bool) {
        // Browser devtools are always available.
        self.state.set_inspectable(enabled);
    }

    fn dispose(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        instances::retire(&self.state);
        let global = js_sys::global();
        for key in [SEND_MESSAGE, HOST_CHANNELS] {
            // Only fails for non-configurable properties, which these are not.
            let _ = Reflect::delete_property(&global, &JsValue::from_str(key));
        }
        OWNER.set(None);
        drop(live);
        tracing::info!(
            event = "engine.dispose",
            instance = %self.state.id(),
            kind = "browser",
            "Engine instance disposed"
        );
    }

    fn is_disposed(&self) -> bool {
        self.live.is_none()
    }
}

impl Drop for BrowserEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
    use super::*;
    use crate::channels::sync_channel_fn;
    use wasm_bindgen_test::{wasm_bindgen_test, wasm_bindgen_test_configure};

    wasm_bindgen_test_configure!(run_in_browser);

    fn global_has(key: &str) -> bool {
        Reflect::has(&js_sys::global(), &JsValue::from_str(key)).unwrap_or(false)
    }

    #[wasm_bindgen_test]
    fn evaluates_in_the_page_scope() {
        let mut engine = BrowserEngine::new().unwrap();
        let result = engine.evaluate("var browserCounter = 40; browserCounter + 2").unwrap();
        assert_eq!(result.convert::<i64>(), Some(42));
        let result = engine.evaluate("[1, 'two', null]").unwrap();
        assert_eq!(
            result.into_raw_value(),
            ScriptValue::List(vec![ScriptValue::Int(1), ScriptValue::from("two"), ScriptValue::Null])
        );
        engine.dispose();
    }

    #[wasm_bindgen_test]
    fn oversized_array_length_is_opaque() {
        let mut engine = BrowserEngine::new().unwrap();
        let result = engine.evaluate("const a = []; a.length = 2 ** 32 - 1; a").unwrap();
        assert!(matches!(
            result.into_raw_value(),
            ScriptValue::Opaque { kind, .. } if kind == "array"
        ));
        engine.dispose();
    }

    #[wasm_bindgen_test]
    async fn resolves_returned_promises() {
        let mut engine = BrowserEngine::new().unwrap();
        let result = engine.evaluate("Promise.resolve(6 * 7)").unwrap();
        assert!(result.is_promise_like());
        assert_eq!(engine.retained_promises(), 1);
        let settled = engine.resolve_promise(result).await.unwrap();
        assert_eq!(settled.convert::<i64>(), Some(42));
        assert_eq!(engine.retained_promises(), 0);
        engine.dispose();
    }

    #[wasm_bindgen_test]
    fn release_promise_forgets_the_handle() {
        let mut engine = BrowserEngine::new().unwrap();
        let result = engine.evaluate("new Promise(() => {})").unwrap();
        let handle = result.promise().unwrap();
        engine.release_promise(handle);
        assert_eq!(engine.retained_promises(), 0);
        engine.dispose();
    }

    #[wasm_bindgen_test]
    async fn channel_proxy_routes_to_the_callback() {
        let mut engine = BrowserEngine::new().unwrap();
        assert!(engine.register_channel(
            "double",
            sync_channel_fn(|argument| {
                let n: i64 = serde_json::from_str(argument.as_deref().unwrap_or("0"))?;
                Ok(Some((n * 2).to_string()))
            })
        ));
        let result = engine.evaluate("hostChannels.double(21)").unwrap();
        let settled = engine.resolve_promise(result).await.unwrap();
        assert_eq!(settled.convert::<i64>(), Some(42));
        let result = engine.evaluate("sendMessage('double', 5)").unwrap();
        let settled = engine.resolve_promise(result).await.unwrap();
        assert_eq!(settled.convert::<i64>(), Some(10));
        engine.dispose();
    }

    #[wasm_bindgen_test]
    fn second_live_instance_is_refused_until_dispose() {
        let mut first = BrowserEngine::new().unwrap();
        assert!(global_has(SEND_MESSAGE));
        assert!(global_has(HOST_CHANNELS));
        assert!(matches!(
            BrowserEngine::new(),
            Err(Error::EngineUnavailable {
                kind: EngineKind::Browser,
                ..
            })
        ));
        first.dispose();
        assert!(!global_has(SEND_MESSAGE));
        assert!(!global_has(HOST_CHANNELS));
        let mut second = BrowserEngine::new().unwrap();
        let leftover = second.evaluate("typeof hostChannels.double").unwrap();
        assert_eq!(leftover.convert::<String>(), Some("undefined".to_string()));
        second.dispose();
    }
}
