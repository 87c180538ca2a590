//! Platform detection and engine selection policy.
//!
//! Selection is a pure mapping from `(Platform, flag)` to an [`EngineKind`].
//! No engine code lives here; whether the chosen backend was actually
//! compiled into this build is checked by [`EngineKind::is_available`].

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Web,
    Android,
    Ios,
    MacOs,
    Windows,
    Linux,
    /// Any other target (BSDs, illumos, ...). Treated like a desktop.
    Other,
}

impl Platform {
    /// The platform this crate was compiled for.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_arch = "wasm32") {
            Self::Web
        } else if cfg!(target_os = "android") {
            Self::Android
        } else if cfg!(target_os = "ios") {
            Self::Ios
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Other
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Android => "android",
            Self::Ios => "ios",
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete script backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Compact portable bytecode interpreter (QuickJS).
    #[serde(rename = "quickjs")]
    QuickJs,
    /// Full-conformance engine (Boa).
    Boa,
    /// The script engine of the browser hosting a wasm build.
    Browser,
}

impl EngineKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QuickJs => "quickjs",
            Self::Boa => "boa",
            Self::Browser => "browser",
        }
    }

    /// Whether this build contains the backend for `self`.
    #[must_use]
    pub const fn is_available(self) -> bool {
        match self {
            Self::QuickJs => cfg!(all(feature = "quickjs", not(target_arch = "wasm32"))),
            Self::Boa => cfg!(all(feature = "boa", not(target_arch = "wasm32"))),
            Self::Browser => cfg!(target_arch = "wasm32"),
        }
    }

    /// Every backend compiled into this build, in a stable order.
    #[must_use]
    pub fn available() -> Vec<Self> {
        [Self::QuickJs, Self::Boa, Self::Browser]
            .into_iter()
            .filter(|kind| kind.is_available())
            .collect()
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Choose the engine for `platform`.
///
/// `force_alternate_on_android` is the only override and only has an effect
/// on Android, where it swaps QuickJS for Boa.
#[must_use]
pub const fn select_engine(platform: Platform, force_alternate_on_android: bool) -> EngineKind {
    match platform {
        Platform::Web => EngineKind::Browser,
        Platform::Android if force_alternate_on_android => EngineKind::Boa,
        Platform::Android | Platform::Windows | Platform::Linux | Platform::Other => {
            EngineKind::QuickJs
        }
        Platform::MacOs | Platform::Ios => EngineKind::Boa,
    }
}
