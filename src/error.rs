//! Error types for flow-client.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all Flow client operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The backend process could not be started or never opened its endpoint.
    #[error("Launch error: {0}")]
    Launch(String),

    /// I/O failure on the transport channel.
    #[error("Channel error: {0}")]
    Channel(#[from] std::io::Error),

    /// A call exceeded its deadline.
    #[error("Call {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The backend rejected a well-formed request.
    #[error("API error: {0}")]
    Api(String),

    /// An onboarding operation was invoked for an identifier that already has
    /// a live session.
    #[error("Session already active: {0}")]
    SessionAlreadyActive(String),

    /// The channel closed underneath the session.
    #[error("Connection lost")]
    ConnectionLost,

    /// The session was terminated while the operation was pending.
    #[error("Session terminated")]
    Terminated,

    /// No session is registered under the given identifier.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Caller supplied an argument the backend would never accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (invalid frame, wrong flags, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl FlowError {
    /// Whether retrying the same operation on the same session may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Timeout { .. } | FlowError::BackpressureTimeout)
    }

    /// Whether the error means the session is gone for good.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, FlowError::ConnectionLost | FlowError::Terminated)
    }
}

/// Why a session stopped accepting work.
///
/// Stored by the engine and the notification queue so every later caller sees
/// the same reason as the ones that were woken up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Channel EOF or unrecoverable read/write failure.
    ConnectionLost,
    /// Explicit `terminate`.
    Terminated,
}

impl From<Disconnect> for FlowError {
    fn from(reason: Disconnect) -> Self {
        match reason {
            Disconnect::ConnectionLost => FlowError::ConnectionLost,
            Disconnect::Terminated => FlowError::Terminated,
        }
    }
}

/// Result type alias using FlowError.
pub type Result<T> = std::result::Result<T, FlowError>;
