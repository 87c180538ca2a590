//! The outcome of a single evaluation.

use crate::error::Error;
use crate::value::{FromScriptValue, ScriptValue};
use std::fmt;

/// Handle to a promise an engine is still holding on behalf of a result.
///
/// Only meaningful to the engine instance that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseHandle(pub(crate) u64);

impl PromiseHandle {
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PromiseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise:{}", self.0)
    }
}

/// Immutable record of one `evaluate` call.
///
/// When `is_error` is set, `string_representation` holds the error message
/// and `stack` the engine's stack trace, if it produced one.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    string_representation: String,
    raw_value: ScriptValue,
    is_error: bool,
    stack: Option<String>,
    promise: Option<PromiseHandle>,
}

impl EvaluationResult {
    #[must_use]
    pub const fn value(raw_value: ScriptValue, string_representation: String) -> Self {
        Self {
            string_representation,
            raw_value,
            is_error: false,
            stack: None,
            promise: None,
        }
    }

    #[must_use]
    pub const fn error(message: String, stack: Option<String>) -> Self {
        Self {
            string_representation: message,
            raw_value: ScriptValue::Null,
            is_error: true,
            stack,
            promise: None,
        }
    }

    /// A promise the engine has not settled yet.
    #[must_use]
    pub fn pending(handle: PromiseHandle, string_representation: String) -> Self {
        Self {
            raw_value: ScriptValue::opaque("promise", string_representation.clone()),
            string_representation,
            is_error: false,
            stack: None,
            promise: Some(handle),
        }
    }

    #[must_use]
    pub fn string_representation(&self) -> &str {
        &self.string_representation
    }

    #[must_use]
    pub const fn raw_value(&self) -> &ScriptValue {
        &self.raw_value
    }

    #[must_use]
    pub fn into_raw_value(self) -> ScriptValue {
        self.raw_value
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_error
    }

    #[must_use]
    pub const fn is_promise_like(&self) -> bool {
        self.promise.is_some()
    }

    #[must_use]
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    #[must_use]
    pub const fn promise(&self) -> Option<PromiseHandle> {
        self.promise
    }

    /// Typed extraction of the raw value; `None` for errors or shape mismatch.
    #[must_use]
    pub fn convert<T: FromScriptValue>(&self) -> Option<T> {
        if self.is_error {
            return None;
        }
        self.raw_value.convert()
    }

    /// Split into the converted value or a script evaluation error.
    pub fn into_result(self) -> Result<ScriptValue, Error> {
        if self.is_error {
            Err(Error::Evaluation {
                message: self.string_representation,
                stack: self.stack,
            })
        } else {
            Ok(self.raw_value)
        }
    }
}

impl fmt::Display for EvaluationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string_representation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_results_convert() {
        let result = EvaluationResult::value(ScriptValue::Int(3), "3".to_string());
        assert!(!result.is_error());
        assert!(!result.is_promise_like());
        assert_eq!(result.convert::<i64>(), Some(3));
        assert_eq!(result.to_string(), "3");
        assert_eq!(result.into_result().unwrap(), ScriptValue::Int(3));
    }

    #[test]
    fn error_results_surface_as_evaluation_errors() {
        let result = EvaluationResult::error(
            "Error: Test error".to_string(),
            Some("at <eval>:1".to_string()),
        );
        assert!(result.is_error());
        assert_eq!(result.convert::<ScriptValue>(), None);
        assert_eq!(result.stack(), Some("at <eval>:1"));

        match result.into_result() {
            Err(Error::Evaluation { message, stack }) => {
                assert_eq!(message, "Error: Test error");
                assert_eq!(stack.as_deref(), Some("at <eval>:1"));
            }
            other => unreachable!("expected evaluation error, got {other:?}"),
        }
    }

    #[test]
    fn pending_results_are_promise_like_and_opaque() {
        let result = EvaluationResult::pending(PromiseHandle(4), "[object Promise]".to_string());
        assert!(result.is_promise_like());
        assert_eq!(result.promise(), Some(PromiseHandle(4)));
        assert!(result.raw_value().is_opaque());
        assert_eq!(PromiseHandle(4).to_string(), "promise:4");
    }
}
