//! Error types shared by every engine backend and the runtime facade.

use crate::instances::InstanceId;
use crate::platform::EngineKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Script threw, failed to parse, or a promise it produced was rejected.
    #[error("script evaluation failed: {message}")]
    Evaluation {
        message: String,
        stack: Option<String>,
    },

    /// A channel message could not be routed to a live instance or channel,
    /// or the channel callback itself failed.
    #[error("channel dispatch failed: {0}")]
    ChannelDispatch(String),

    #[error("{kind} engine is unavailable: {reason}")]
    EngineUnavailable { kind: EngineKind, reason: String },

    #[error("engine instance {0} has been disposed")]
    Disposed(InstanceId),

    /// The native engine failed outside of script evaluation.
    #[error("engine error: {0}")]
    Engine(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn evaluation(message: impl Into<String>, stack: Option<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
            stack,
        }
    }

    pub fn channel_dispatch(message: impl Into<String>) -> Self {
        Self::ChannelDispatch(message.into())
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn unavailable(kind: EngineKind, reason: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            kind,
            reason: reason.into(),
        }
    }

    /// True for errors that originate in script code rather than the host.
    #[must_use]
    pub const fn is_script_error(&self) -> bool {
        matches!(self, Self::Evaluation { .. })
    }
}
