//! Evaluate JavaScript on whichever engine suits the platform and get native
//! structured values back.
//!
//! - [`ScriptRuntime`]: construct, evaluate, dispose
//! - [`ScriptValue`]: the value model crossing the script boundary
//! - [`ScriptEngine`]/[`Engine`]: the engine contract and its backends
//!   (QuickJS, Boa, host browser)
//! - [`channels`]: named host callbacks callable from script
//!
//! ```no_run
//! use futures::executor::block_on;
//! use jsbridge::{RuntimeOptions, ScriptRuntime, ScriptValue};
//!
//! let mut runtime = ScriptRuntime::new(RuntimeOptions::default())?;
//! block_on(runtime.evaluate("const x = 10;"))?;
//! assert_eq!(block_on(runtime.evaluate("x * 2"))?, ScriptValue::Int(20));
//! runtime.dispose();
//! # Ok::<(), jsbridge::Error>(())
//! ```

#![forbid(unsafe_code)]

pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod event_loop;
pub mod instances;
pub mod platform;
mod prelude;
pub mod runtime;
pub mod scheduler;
pub mod value;

#[cfg(all(feature = "boa", not(target_arch = "wasm32")))]
pub mod boa;
#[cfg(all(feature = "quickjs", not(target_arch = "wasm32")))]
pub mod quickjs;
#[cfg(target_arch = "wasm32")]
pub mod web;

pub use channels::{ChannelCallback, ChannelReply, channel_fn, sync_channel_fn};
pub use config::{EngineLimits, RuntimeOptions};
pub use engine::{Engine, ScriptEngine};
pub use error::{Error, Result};
pub use evaluation::{EvaluationResult, PromiseHandle};
pub use instances::InstanceId;
pub use platform::{EngineKind, Platform, select_engine};
pub use runtime::ScriptRuntime;
pub use scheduler::{Clock, DeterministicClock, WallClock};
pub use value::{FromScriptValue, OpaqueValue, ScriptValue};
