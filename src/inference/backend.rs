//! The contract between the orchestrator and an inference backend.
//!
//! A dispatch returns a finite, non-restartable stream of events for exactly
//! one session. Text chunks and tool notifications arrive in emission order;
//! `Completed` carries the authoritative final text. A stream that ends
//! without `Completed` is treated by consumers as a completion with an empty
//! payload.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::InferenceError;
use super::types::{InferenceRequest, InferenceResponse, ToolDefinition, ToolExecutionEvent};

/// One item of a dispatched inference stream.
#[derive(Debug, Clone)]
pub enum InferenceEvent {
    /// A UTF-8 text fragment, in arrival order.
    Chunk(String),
    /// A tool started or finished (agent mode only).
    ToolExecution(ToolExecutionEvent),
    /// The backend finished; `message.content` overwrites the streamed text.
    Completed(InferenceResponse),
}

pub type InferenceStream = BoxStream<'static, Result<InferenceEvent, InferenceError>>;

/// A language-model backend serving one provider family or several.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Plain streaming dispatch (QA mode).
    async fn run_inference(&self, request: InferenceRequest)
        -> Result<InferenceStream, InferenceError>;

    /// Tool-augmented dispatch (agent mode). Emits `ToolExecution` events
    /// interleaved with text chunks.
    async fn run_inference_with_tools(
        &self,
        request: InferenceRequest,
    ) -> Result<InferenceStream, InferenceError>;

    /// Best-effort cancel. Fails with `SessionNotFound` when the session is
    /// unknown or already finished.
    async fn cancel_inference(&self, session_id: &str) -> Result<(), InferenceError>;
}

/// External tool-execution engine used by the agent loop.
///
/// Tool failures are returned as `Err(message)` and reported back to the
/// model; they never abort the session.
#[async_trait]
pub trait ToolEngine: Send + Sync {
    /// Tools offered to the model.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Execute one tool call.
    async fn execute(
        &self,
        name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, String>;
}
