//! Runtime construction options.
//!
//! Options come from code, a JSON/JSON5 document, and the environment, in
//! increasing precedence.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Environment toggle for [`RuntimeOptions::alternate_engine_on_android`].
pub const ALTERNATE_ENGINE_ENV: &str = "JSBRIDGE_ALTERNATE_ENGINE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeOptions {
    /// Use the alternate engine on Android. Ignored on every other platform.
    pub alternate_engine_on_android: bool,
    /// Engine-specific extras, see [`EngineLimits`].
    pub extra: Map<String, Value>,
}

impl RuntimeOptions {
    #[must_use]
    pub fn with_alternate_engine(mut self, enabled: bool) -> Self {
        self.alternate_engine_on_android = enabled;
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Parse options from JSON or JSON5 text.
    pub fn from_json5_str(text: &str) -> Result<Self> {
        json5::from_str(text).map_err(|err| Error::config(format!("options: {err}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json5_str(&text)
            .map_err(|err| Error::config(format!("{}: {err}", path.display())))
    }

    /// Apply overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`. Unparseable values are ignored.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ALTERNATE_ENGINE_ENV) {
            match parse_toggle(&raw) {
                Some(enabled) => self.alternate_engine_on_android = enabled,
                None => tracing::warn!(
                    event = "config.env.ignored",
                    key = ALTERNATE_ENGINE_ENV,
                    value = %raw,
                    "Ignoring unrecognized toggle value"
                ),
            }
        }
        self
    }

    pub fn limits(&self) -> Result<EngineLimits> {
        EngineLimits::from_extra(&self.extra)
    }
}

fn parse_toggle(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Resource limits read from `extra`. Applied by QuickJS, ignored elsewhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineLimits {
    /// `memoryLimit`, in bytes.
    pub memory_limit: Option<usize>,
    /// `stackSize`, in bytes.
    pub max_stack_size: Option<usize>,
    /// `gcThreshold`, in bytes.
    pub gc_threshold: Option<usize>,
}

impl EngineLimits {
    pub fn from_extra(extra: &Map<String, Value>) -> Result<Self> {
        Ok(Self {
            memory_limit: byte_size(extra, "memoryLimit")?,
            max_stack_size: byte_size(extra, "stackSize")?,
            gc_threshold: byte_size(extra, "gcThreshold")?,
        })
    }
}

fn byte_size(extra: &Map<String, Value>, key: &str) -> Result<Option<usize>> {
    let Some(value) = extra.get(key) else {
        return Ok(None);
    };
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| Error::config(format!("`{key}` must be a non-negative integer, got {value}")))
}
