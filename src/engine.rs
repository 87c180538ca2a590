//! The engine contract and the closed set of backends behind it.

use crate::channels::ChannelCallback;
use crate::config::RuntimeOptions;
use crate::error::{Error, Result};
use crate::evaluation::{EvaluationResult, PromiseHandle};
use crate::instances::{InstanceId, SharedClock};
use crate::platform::EngineKind;
use crate::scheduler::WallClock;
use crate::value::FromScriptValue;
use async_trait::async_trait;
use std::sync::Arc;

#[cfg(all(feature = "boa", not(target_arch = "wasm32")))]
use crate::boa::BoaEngine;
#[cfg(all(feature = "quickjs", not(target_arch = "wasm32")))]
use crate::quickjs::QuickJsEngine;
#[cfg(target_arch = "wasm32")]
use crate::web::BrowserEngine;

#[cfg(not(any(feature = "quickjs", feature = "boa", target_arch = "wasm32")))]
compile_error!("enable at least one engine backend: the `quickjs` or `boa` feature");

/// Contract every script engine backend satisfies.
///
/// Instances are single-writer: every operation takes `&mut self`, so calls
/// on one instance are serialized by the borrow checker and observe global
/// scope mutations in submission order.
#[async_trait(?Send)]
pub trait ScriptEngine {
    fn kind(&self) -> EngineKind;

    fn instance_id(&self) -> InstanceId;

    /// Run `code` in the instance's persistent global scope.
    ///
    /// Script throws and syntax errors come back as error results. Only
    /// host-side failures, such as use after dispose, are `Err`.
    fn evaluate(&mut self, code: &str) -> Result<EvaluationResult>;

    /// Evaluate and drive any resulting promise to completion.
    async fn evaluate_async(&mut self, code: &str) -> Result<EvaluationResult> {
        let result = self.evaluate(code)?;
        self.resolve_promise(result).await
    }

    /// Settle a promise-like result produced by this instance. Other results
    /// are returned unchanged; a promise that cannot make progress comes back
    /// still pending with an opaque value.
    async fn resolve_promise(&mut self, result: EvaluationResult) -> Result<EvaluationResult>;

    /// Drop the instance's reference to an unsettled promise. Unknown handles
    /// are ignored.
    fn release_promise(&mut self, handle: PromiseHandle);

    /// Promises held for later reconciliation.
    fn retained_promises(&self) -> usize;

    /// Returns false, leaving the existing callback installed, when `name` is
    /// already registered or the instance is disposed.
    fn register_channel(&mut self, name: &str, callback: ChannelCallback) -> bool;

    /// Run every job that is ready now; returns how many ran.
    fn drain_pending_jobs(&mut self) -> Result<usize>;

    fn set_inspectable(&mut self, enabled: bool);

    /// Release the engine. Idempotent.
    fn dispose(&mut self);

    fn is_disposed(&self) -> bool;

    fn convert_value<T: FromScriptValue>(&self, result: &EvaluationResult) -> Option<T>
    where
        Self: Sized,
    {
        result.convert()
    }
}

/// One engine instance of whichever kind the build and selector allow.
pub enum Engine {
    #[cfg(all(feature = "quickjs", not(target_arch = "wasm32")))]
    QuickJs(QuickJsEngine),
    #[cfg(all(feature = "boa", not(target_arch = "wasm32")))]
    Boa(BoaEngine),
    #[cfg(target_arch = "wasm32")]
    Browser(BrowserEngine),
}

macro_rules! with_backend {
    ($engine:expr, $backend:ident => $body:expr) => {
        match $engine {
            #[cfg(all(feature = "quickjs", not(target_arch = "wasm32")))]
            Engine::QuickJs($backend) => $body,
            #[cfg(all(feature = "boa", not(target_arch = "wasm32")))]
            Engine::Boa($backend) => $body,
            #[cfg(target_arch = "wasm32")]
            Engine::Browser($backend) => $body,
        }
    };
}

impl Engine {
    /// Construct an engine of `kind` driven by the wall clock.
    pub fn create(kind: EngineKind, options: &RuntimeOptions) -> Result<Self> {
        Self::create_with_clock(kind, options, Arc::new(WallClock))
    }

    /// Construct an engine of `kind` whose timers follow `clock`.
    pub fn create_with_clock(
        kind: EngineKind,
        options: &RuntimeOptions,
        clock: SharedClock,
    ) -> Result<Self> {
        let engine = match kind {
            EngineKind::QuickJs => create_quickjs(options, clock),
            EngineKind::Boa => create_boa(options, clock),
            EngineKind::Browser => create_browser(options, clock),
        }?;
        tracing::info!(
            event = "engine.create",
            kind = %kind,
            instance = %engine.instance_id(),
            "Engine instance created"
        );
        Ok(engine)
    }
}

#[cfg(all(feature = "quickjs", not(target_arch = "wasm32")))]
fn create_quickjs(options: &RuntimeOptions, clock: SharedClock) -> Result<Engine> {
    QuickJsEngine::new(options, clock).map(Engine::QuickJs)
}

#[cfg(not(all(feature = "quickjs", not(target_arch = "wasm32"))))]
fn create_quickjs(_options: &RuntimeOptions, _clock: SharedClock) -> Result<Engine> {
    Err(Error::unavailable(
        EngineKind::QuickJs,
        "not compiled in (requires the `quickjs` feature on a native target)",
    ))
}

#[cfg(all(feature = "boa", not(target_arch = "wasm32")))]
fn create_boa(options: &RuntimeOptions, clock: SharedClock) -> Result<Engine> {
    BoaEngine::new(options, clock).map(Engine::Boa)
}

#[cfg(not(all(feature = "boa", not(target_arch = "wasm32"))))]
fn create_boa(_options: &RuntimeOptions, _clock: SharedClock) -> Result<Engine> {
    Err(Error::unavailable(
        EngineKind::Boa,
        "not compiled in (requires the `boa` feature on a native target)",
    ))
}

#[cfg(target_arch = "wasm32")]
fn create_browser(_options: &RuntimeOptions, _clock: SharedClock) -> Result<Engine> {
    BrowserEngine::new().map(Engine::Browser)
}

#[cfg(not(target_arch = "wasm32"))]
fn create_browser(_options: &RuntimeOptions, _clock: SharedClock) -> Result<Engine> {
    Err(Error::unavailable(
        EngineKind::Browser,
        "only available when targeting wasm32",
    ))
}

#[async_trait(?Send)]
impl ScriptEngine for Engine {
    fn kind(&self) -> EngineKind {
        with_backend!(self, engine => engine.kind())
    }

    fn instance_id(&self) -> InstanceId {
        with_backend!(self, engine => engine.instance_id())
    }

    fn evaluate(&mut self, code: &str) -> Result<EvaluationResult> {
        with_backend!(self, engine => engine.evaluate(code))
    }

    async fn evaluate_async(&mut self, code: &str) -> Result<EvaluationResult> {
        with_backend!(self, engine => engine.evaluate_async(code).await)
    }

    async fn resolve_promise(&mut self, result: EvaluationResult) -> Result<EvaluationResult> {
        with_backend!(self, engine => engine.resolve_promise(result).await)
    }

    fn release_promise(&mut self, handle: PromiseHandle) {
        with_backend!(self, engine => engine.release_promise(handle));
    }

    fn retained_promises(&self) -> usize {
        with_backend!(self, engine => engine.retained_promises())
    }

    fn register_channel(&mut self, name: &str, callback: ChannelCallback) -> bool {
        with_backend!(self, engine => engine.register_channel(name, callback))
    }

    fn drain_pending_jobs(&mut self) -> Result<usize> {
        with_backend!(self, engine => engine.drain_pending_jobs())
    }

    fn set_inspectable(&mut self, enabled: bool) {
        with_backend!(self, engine => engine.set_inspectable(enabled));
    }

    fn dispose(&mut self) {
        with_backend!(self, engine => engine.dispose());
    }

    fn is_disposed(&self) -> bool {
        with_backend!(self, engine => engine.is_disposed())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("kind", &self.kind())
            .field("instance", &self.instance_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
