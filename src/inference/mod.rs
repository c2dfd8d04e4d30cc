//! Inference — everything on the backend side of a dispatched request.
//!
//! - `types`: messages, model catalog entries, request/response envelopes
//! - `backend`: the `InferenceBackend` contract and the `ToolEngine` seam
//! - `providers`: HTTP backend for Ollama and OpenAI-compatible servers
//! - `streaming`: SSE and NDJSON stream parsing
//! - `tool_call_parser`: tool-call extraction and markup stripping
//! - `config`: static `assistant.yaml` loading
//!
//! Every provider speaks the same request/response contract, so switching
//! from a local Ollama model to a remote endpoint is a catalog change, not a
//! code change.

pub mod backend;
pub mod config;
pub mod errors;
pub mod providers;
pub mod streaming;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use backend::{InferenceBackend, InferenceEvent, InferenceStream, ToolEngine};
pub use config::StaticConfig;
pub use errors::InferenceError;
pub use providers::HttpBackend;
pub use tool_call_parser::strip_markup;
pub use types::{
    AiMode, ChatMessage, FileSystemContext, InferenceRequest, InferenceResponse, MessageRole,
    ModelConfig, ModelParameters, ModelProvider, ToolDefinition, ToolExecution,
    ToolExecutionEvent, ToolExecutionStatus,
};
