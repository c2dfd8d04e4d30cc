//! Agent Core error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;
use crate::inference::types::{AiMode, ToolExecution, ToolExecutionStatus};

/// Errors from the persisted preference store.
#[derive(Debug, Error)]
pub enum PreferenceError {
    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// A stored value could not be interpreted.
    #[error("invalid value for preference '{key}': '{value}'")]
    InvalidValue { key: String, value: String },
}

impl From<rusqlite::Error> for PreferenceError {
    fn from(e: rusqlite::Error) -> Self {
        PreferenceError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

/// Session-level failures of the assistant.
#[derive(Debug, Error)]
pub enum AssistantError {
    /// The catalog has models but none could be selected for this mode.
    #[error("no model selected for {mode} mode")]
    ModelNotSelected { mode: AiMode },

    /// Dispatch failed before any text arrived.
    #[error("backend unavailable: {source}")]
    BackendUnavailable { source: InferenceError },

    /// Dispatch failed after partial content arrived.
    #[error("stream interrupted: {source}")]
    StreamInterrupted { source: InferenceError },

    /// The user cancelled. Never rendered.
    #[error("cancelled by user")]
    CancelledByUser,

    /// A single tool failed. Recorded on its ToolExecution, never fatal.
    #[error("tool '{tool_name}' failed: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    /// Nothing at all can be resolved (empty catalog).
    #[error("no provider or model can be resolved for {mode} mode")]
    ConfigurationInvalid { mode: AiMode },

    /// A send was attempted while another session is in flight.
    #[error("session '{session_id}' is still in flight")]
    SessionBusy { session_id: String },

    /// The requested model id is not in the catalog.
    #[error("model '{model_id}' is not in the catalog")]
    UnknownModel { model_id: String },

    #[error("preference store error: {0}")]
    Preference(#[from] PreferenceError),
}

impl AssistantError {
    /// Classify a backend failure by whether any chunk had arrived.
    pub fn from_dispatch(err: InferenceError, received_content: bool) -> Self {
        if err.is_cancellation() {
            AssistantError::CancelledByUser
        } else if received_content {
            AssistantError::StreamInterrupted { source: err }
        } else {
            AssistantError::BackendUnavailable { source: err }
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, AssistantError::CancelledByUser)
    }

    /// The failure recorded on a tool execution, if it failed.
    pub fn from_tool(record: &ToolExecution) -> Option<Self> {
        (record.status == ToolExecutionStatus::Error).then(|| AssistantError::ToolExecutionFailed {
            tool_name: record.tool_name.clone(),
            reason: record.error.clone().unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Human-readable text for the terminal error message in the conversation.
    pub fn user_summary(&self) -> String {
        match self {
            AssistantError::ModelNotSelected { mode } => format!(
                "No model is selected for {mode} mode. Choose a model in the assistant settings and try again."
            ),
            AssistantError::BackendUnavailable { source } => match source {
                InferenceError::ConnectionFailed { endpoint, .. } => format!(
                    "Could not connect to the model server at {endpoint}. Make sure it is running and try again."
                ),
                InferenceError::Timeout { duration_secs } => {
                    format!("The model server did not respond within {duration_secs} seconds.")
                }
                InferenceError::HttpError { status, .. } => format!(
                    "The model server returned an error (HTTP {status}). Check that the model is installed."
                ),
                InferenceError::ProviderUnavailable { provider, .. } => {
                    format!("The {provider} provider cannot serve requests here.")
                }
                InferenceError::InvalidConfiguration { reason } => {
                    format!("The selected model is misconfigured: {reason}")
                }
                other => format!("The AI backend failed: {other}"),
            },
            AssistantError::StreamInterrupted { source } => {
                format!("The response was interrupted: {source}")
            }
            AssistantError::CancelledByUser => "Cancelled.".to_string(),
            AssistantError::ToolExecutionFailed { tool_name, reason } => {
                format!("Tool {tool_name} failed: {reason}")
            }
            AssistantError::ConfigurationInvalid { .. } => {
                "No AI models are available. Install or configure a model provider first.".to_string()
            }
            AssistantError::SessionBusy { .. } => {
                "Still working on the previous message.".to_string()
            }
            AssistantError::UnknownModel { model_id } => {
                format!("The model '{model_id}' is not available.")
            }
            AssistantError::Preference(e) => format!("Could not read assistant settings: {e}"),
        }
    }
}
