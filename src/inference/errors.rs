//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility — these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

use super::types::ModelProvider;

/// Errors that can occur while dispatching or streaming an inference request.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// Stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// Failed to parse a tool call from the model's response.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError { raw_response: String, reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The request cannot be served with the given model configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// The provider does not run in this process.
    #[error("provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable {
        provider: ModelProvider,
        reason: String,
    },

    /// No live session with this id (never started, or already finished).
    #[error("session not found: '{session_id}'")]
    SessionNotFound { session_id: String },

    /// The session was cancelled before the backend finished.
    #[error("inference cancelled by user")]
    Cancelled,
}

impl InferenceError {
    /// Whether this error reports a user-initiated cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, InferenceError::Cancelled)
    }

    /// Whether a cancel signal raced against natural completion.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, InferenceError::SessionNotFound { .. })
    }

    /// Map a `reqwest` send failure onto the transport variants.
    pub(crate) fn from_transport(endpoint: &str, err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout {
                duration_secs: timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }
}
