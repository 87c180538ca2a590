//! Shared helpers for the integration tests.
//!
//! Every test that exercises script behavior runs it on each engine compiled
//! into this build, with a deterministic clock so timer-driven promises
//! settle without sleeping.

#![allow(dead_code)]

use futures::executor::block_on;
use jsbridge::{DeterministicClock, EngineKind, RuntimeOptions, ScriptRuntime, ScriptValue};
use std::sync::Arc;

/// Engine kinds this build can construct natively.
pub fn engine_kinds() -> Vec<EngineKind> {
    EngineKind::available()
        .into_iter()
        .filter(|kind| *kind != EngineKind::Browser)
        .collect()
}

pub fn runtime_on(kind: EngineKind) -> ScriptRuntime {
    runtime_with_clock(kind, Arc::new(DeterministicClock::new(0)))
}

pub fn runtime_with_clock(kind: EngineKind, clock: Arc<DeterministicClock>) -> ScriptRuntime {
    ScriptRuntime::with_engine_kind(RuntimeOptions::default(), kind, clock)
        .unwrap_or_else(|err| panic!("create {kind} runtime: {err}"))
}

/// Evaluate and unwrap, naming the engine on failure.
pub fn eval(runtime: &mut ScriptRuntime, code: &str) -> ScriptValue {
    let kind = runtime.engine_kind();
    block_on(runtime.evaluate(code)).unwrap_or_else(|err| panic!("[{kind}] `{code}` failed: {err}"))
}

/// Run `check` once per available engine on a fresh runtime, disposing it
/// afterwards.
pub fn on_each_engine(mut check: impl FnMut(&mut ScriptRuntime)) {
    for kind in engine_kinds() {
        let mut runtime = runtime_on(kind);
        check(&mut runtime);
        runtime.dispose();
    }
}
