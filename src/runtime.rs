//! The host-facing entry point.
//!
//! A [`ScriptRuntime`] owns exactly one engine instance, chosen once by
//! [`select_engine`] for the platform it was compiled for.

use crate::channels::ChannelCallback;
use crate::config::RuntimeOptions;
use crate::engine::{Engine, ScriptEngine};
use crate::error::Result;
use crate::evaluation::EvaluationResult;
use crate::instances::{InstanceId, SharedClock};
use crate::platform::{EngineKind, Platform, select_engine};
use crate::scheduler::WallClock;
use crate::value::{FromScriptValue, ScriptValue};
use std::sync::Arc;

#[derive(Debug)]
pub struct ScriptRuntime {
    engine: Engine,
    options: RuntimeOptions,
}

impl ScriptRuntime {
    /// Create a runtime on the engine selected for the current platform.
    ///
    /// Fails with [`Error::EngineUnavailable`](crate::Error::EngineUnavailable)
    /// when that engine was not compiled in.
    pub fn new(options: RuntimeOptions) -> Result<Self> {
        Self::with_clock(options, Arc::new(WallClock))
    }

    /// Like [`ScriptRuntime::new`] with timers driven by `clock`.
    pub fn with_clock(options: RuntimeOptions, clock: SharedClock) -> Result<Self> {
        let kind = select_engine(Platform::current(), options.alternate_engine_on_android);
        Self::with_engine_kind(options, kind, clock)
    }

    /// Bypass platform selection and run on `kind`.
    pub fn with_engine_kind(options: RuntimeOptions, kind: EngineKind, clock: SharedClock) -> Result<Self> {
        tracing::debug!(
            event = "runtime.select",
            platform = %Platform::current(),
            alternate = options.alternate_engine_on_android,
            kind = %kind,
            "Engine selected"
        );
        let engine = Engine::create_with_clock(kind, &options, clock)?;
        Ok(Self { engine, options })
    }

    /// Evaluate `code` and return its value, settling a promise result first.
    ///
    /// Script throws, syntax errors and rejections all fail with
    /// [`Error::Evaluation`](crate::Error::Evaluation).
    ///
    /// A promise nothing can settle comes back as an opaque value, and the
    /// instance stops tracking it.
    pub async fn evaluate(&mut self, code: &str) -> Result<ScriptValue> {
        let result = self.evaluate_result(code).await?;
        if let Some(handle) = result.promise() {
            self.engine.release_promise(handle);
        }
        result.into_result()
    }

    /// Evaluate and convert the value to `T`; `None` on shape mismatch.
    pub async fn evaluate_as<T: FromScriptValue>(&mut self, code: &str) -> Result<Option<T>> {
        Ok(self.evaluate(code).await?.convert())
    }

    /// Evaluate, keeping the full [`EvaluationResult`]. A promise that stalls
    /// stays tracked so [`ScriptEngine::resolve_promise`] can be retried after
    /// the host makes progress.
    pub async fn evaluate_result(&mut self, code: &str) -> Result<EvaluationResult> {
        let result = self.engine.evaluate(code)?;
        if result.is_promise_like() {
            return self.engine.resolve_promise(result).await;
        }
        Ok(result)
    }

    pub fn register_channel(&mut self, name: &str, callback: ChannelCallback) -> bool {
        self.engine.register_channel(name, callback)
    }

    pub fn drain_pending_jobs(&mut self) -> Result<usize> {
        self.engine.drain_pending_jobs()
    }

    pub fn set_inspectable(&mut self, enabled: bool) {
        self.engine.set_inspectable(enabled);
    }

    /// Release the engine. Idempotent; evaluating afterwards fails with
    /// [`Error::Disposed`](crate::Error::Disposed).
    pub fn dispose(&mut self) {
        self.engine.dispose();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.engine.is_disposed()
    }

    #[must_use]
    pub fn engine_kind(&self) -> EngineKind {
        self.engine.kind()
    }

    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.engine.instance_id()
    }

    #[must_use]
    pub const fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Direct access to the engine for lower-level operations.
    pub const fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::scheduler::DeterministicClock;
    use futures::executor::block_on;

    fn runtime() -> ScriptRuntime {
        ScriptRuntime::with_clock(RuntimeOptions::default(), Arc::new(DeterministicClock::new(0)))
            .unwrap()
    }

    #[test]
    fn selects_the_platform_default() {
        let runtime = runtime();
        assert_eq!(runtime.engine_kind(), select_engine(Platform::current(), false));
    }

    #[test]
    fn evaluate_unwraps_promises() {
        let mut runtime = runtime();
        assert_eq!(block_on(runtime.evaluate("Promise.resolve(42)")).unwrap(), ScriptValue::Int(42));
        assert_eq!(block_on(runtime.evaluate_as::<i64>("20 + 22")).unwrap(), Some(42));
    }

    #[test]
    fn rejections_match_throws() {
        let mut runtime = runtime();
        let rejected = block_on(runtime.evaluate("Promise.reject(new Error('same'))")).unwrap_err();
        let thrown = block_on(runtime.evaluate("throw new Error('same')")).unwrap_err();
        match (rejected, thrown) {
            (Error::Evaluation { message: a, .. }, Error::Evaluation { message: b, .. }) => {
                assert_eq!(a, b);
            }
            other => unreachable!("expected two evaluation errors, got {other:?}"),
        }
    }

    #[test]
    fn stalled_promise_is_released_by_evaluate_only() {
        let mut runtime = runtime();
        let value = block_on(runtime.evaluate("new Promise(() => {})")).unwrap();
        assert!(value.is_opaque());
        assert_eq!(runtime.engine_mut().retained_promises(), 0);

        let pending = block_on(runtime.evaluate_result("new Promise(() => {})")).unwrap();
        assert!(pending.is_promise_like());
        assert_eq!(runtime.engine_mut().retained_promises(), 1);
    }

    #[test]
    fn disposed_runtime_rejects_evaluation() {
        let mut runtime = runtime();
        let id = runtime.instance_id();
        runtime.dispose();
        runtime.dispose();
        assert!(runtime.is_disposed());
        assert!(matches!(block_on(runtime.evaluate("1")), Err(Error::Disposed(found)) if found == id));
    }
}
