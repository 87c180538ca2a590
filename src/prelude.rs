//! Script-side glue installed into every QuickJS and Boa context.
//!
//! The prelude expects four native functions on the global object (installed
//! by the backend before the prelude runs) and defines `sendMessage`,
//! `hostChannels`, `setTimeout`, `clearTimeout`, `console`, and the hidden
//! `__jsbridge` object the host drives through [`settle_call`] and
//! [`fire_timer`].

use crate::scheduler::ChannelOutcome;

pub const NATIVE_DISPATCH: &str = "__jsbridge_native_dispatch";
pub const NATIVE_SCHEDULE: &str = "__jsbridge_native_schedule";
pub const NATIVE_CANCEL: &str = "__jsbridge_native_cancel";
pub const NATIVE_LOG: &str = "__jsbridge_native_log";

pub const PRELUDE: &str = r#"
(function (global) {
  "use strict";
  const nativeDispatch = global.__jsbridge_native_dispatch;
  const nativeSchedule = global.__jsbridge_native_schedule;
  const nativeCancel = global.__jsbridge_native_cancel;
  const nativeLog = global.__jsbridge_native_log;
  const pending = new Map();
  const timers = new Map();
  const channels = {};

  function decode(text) {
    return text === null || text === undefined ? undefined : JSON.parse(text);
  }

  function sendMessage(channel, arg) {
    const encoded = arg === undefined ? null : JSON.stringify(arg);
    const reply = JSON.parse(nativeDispatch(String(channel), encoded === undefined ? null : encoded));
    if (reply.status === "ready") {
      return decode(reply.result);
    }
    if (reply.status === "pending") {
      return new Promise((resolve, reject) => {
        pending.set(reply.callId, { resolve, reject });
      });
    }
    throw new Error(reply.message);
  }

  function settle(callId, ok, payload) {
    const entry = pending.get(callId);
    if (entry === undefined) {
      return false;
    }
    pending.delete(callId);
    if (ok) {
      entry.resolve(decode(payload));
    } else {
      entry.reject(new Error(payload));
    }
    return true;
  }

  function fire(timerId) {
    const callback = timers.get(timerId);
    if (callback === undefined) {
      return false;
    }
    timers.delete(timerId);
    callback();
    return true;
  }

  function install(name) {
    channels[name] = (arg) => sendMessage(name, arg);
  }

  function render(args) {
    return args
      .map((arg) => {
        if (typeof arg === "string") {
          return arg;
        }
        try {
          const json = JSON.stringify(arg);
          return json === undefined ? String(arg) : json;
        } catch (_err) {
          return String(arg);
        }
      })
      .join(" ");
  }

  global.setTimeout = function (callback, delay, ...args) {
    if (typeof callback !== "function") {
      throw new TypeError("setTimeout expects a function");
    }
    const id = nativeSchedule(Math.max(0, Number(delay) || 0));
    timers.set(id, () => callback(...args));
    return id;
  };

  global.clearTimeout = function (id) {
    if (timers.delete(id)) {
      nativeCancel(id);
    }
  };

  global.console = {
    log: (...args) => nativeLog("log", render(args)),
    info: (...args) => nativeLog("info", render(args)),
    warn: (...args) => nativeLog("warn", render(args)),
    error: (...args) => nativeLog("error", render(args)),
    debug: (...args) => nativeLog("debug", render(args)),
  };

  global.sendMessage = sendMessage;
  global.hostChannels = channels;
  Object.defineProperty(global, "__jsbridge", {
    value: Object.freeze({ settle, fire, install }),
    enumerable: false,
  });
})(globalThis);
"#;

fn json_string_literal(text: &str) -> String {
    serde_json::Value::from(text).to_string()
}

/// Script that installs the `hostChannels[name]` proxy.
#[must_use]
pub fn install_channel(name: &str) -> String {
    format!("globalThis.__jsbridge.install({});", json_string_literal(name))
}

/// Script that settles the promise of a parked channel call.
#[must_use]
pub fn settle_call(call_id: u64, outcome: &ChannelOutcome) -> String {
    let (ok, payload) = match outcome {
        ChannelOutcome::Success(Some(json)) => (true, json_string_literal(json)),
        ChannelOutcome::Success(None) => (true, "null".to_string()),
        ChannelOutcome::Error { message } => (false, json_string_literal(message)),
    };
    format!("globalThis.__jsbridge.settle({call_id}, {ok}, {payload});")
}

/// Script that runs the callback of a fired timer.
#[must_use]
pub fn fire_timer(timer_id: u64) -> String {
    format!("globalThis.__jsbridge.fire({timer_id});")
}

/// Clamp a script number to a whole, non-negative count.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn whole_number(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

/// Timer ids handed to script; exact well below 2^53.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn timer_id_to_js(timer_id: u64) -> f64 {
    timer_id as f64
}

/// Route a `console.*` call into `tracing`.
pub fn forward_console(instance: crate::instances::InstanceId, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: "jsbridge::console", instance = %instance, "{message}"),
        "warn" => tracing::warn!(target: "jsbridge::console", instance = %instance, "{message}"),
        "debug" => tracing::debug!(target: "jsbridge::console", instance = %instance, "{message}"),
        _ => tracing::info!(target: "jsbridge::console", instance = %instance, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prelude_reads_the_native_functions_it_documents() {
        for name in [NATIVE_DISPATCH, NATIVE_SCHEDULE, NATIVE_CANCEL, NATIVE_LOG] {
            assert!(PRELUDE.contains(&format!("global.{name}")), "{name} missing");
        }
    }

    #[test]
    fn settle_snippets_quote_payloads() {
        assert_eq!(
            settle_call(3, &ChannelOutcome::Success(Some("{\"a\":1}".to_string()))),
            r#"globalThis.__jsbridge.settle(3, true, "{\"a\":1}");"#
        );
        assert_eq!(
            settle_call(4, &ChannelOutcome::Success(None)),
            "globalThis.__jsbridge.settle(4, true, null);"
        );
        assert_eq!(
            settle_call(
                5,
                &ChannelOutcome::Error {
                    message: "it \"failed\"".to_string()
                }
            ),
            r#"globalThis.__jsbridge.settle(5, false, "it \"failed\"");"#
        );
    }

    #[test]
    fn install_and_fire_snippets() {
        assert_eq!(
            install_channel("log\"ger"),
            r#"globalThis.__jsbridge.install("log\"ger");"#
        );
        assert_eq!(fire_timer(9), "globalThis.__jsbridge.fire(9);");
    }

    #[test]
    fn script_numbers_clamp_to_counts() {
        assert_eq!(whole_number(12.9), 12);
        assert_eq!(whole_number(-3.0), 0);
        assert_eq!(whole_number(f64::NAN), 0);
        assert_eq!(whole_number(f64::INFINITY), 0);
        assert!((timer_id_to_js(7) - 7.0).abs() < f64::EPSILON);
    }
}
