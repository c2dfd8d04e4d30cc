//! Shared types for the inference contract.
//!
//! These are the shapes exchanged between the orchestrator and whichever
//! backend serves a request: conversation messages, model descriptors,
//! request/response envelopes and tool-execution notifications.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ─── Providers & Modes ──────────────────────────────────────────────────────

/// Backend family serving a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    /// Local embedded engine running inside the desktop process.
    Candle,
    /// Local Ollama daemon.
    Ollama,
    /// Any remote or local server speaking the OpenAI Chat Completions API.
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
    /// llama.cpp `llama-server` (OpenAI-compatible wire format).
    #[serde(rename = "llamacpp")]
    LlamaCpp,
    Mlx,
    /// Runs in the webview, never in this process.
    #[serde(rename = "transformerjs")]
    TransformerJs,
}

impl ModelProvider {
    /// All providers, in a stable order.
    pub const ALL: [ModelProvider; 6] = [
        ModelProvider::Candle,
        ModelProvider::Ollama,
        ModelProvider::OpenAiCompatible,
        ModelProvider::LlamaCpp,
        ModelProvider::Mlx,
        ModelProvider::TransformerJs,
    ];

    /// Stable tag used in persisted keys and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelProvider::Candle => "candle",
            ModelProvider::Ollama => "ollama",
            ModelProvider::OpenAiCompatible => "openai-compatible",
            ModelProvider::LlamaCpp => "llamacpp",
            ModelProvider::Mlx => "mlx",
            ModelProvider::TransformerJs => "transformerjs",
        }
    }

    /// Parse a provider tag. Accepts the serialized form only.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == tag)
    }

    /// Whether requests to this provider go over HTTP and need an endpoint.
    pub fn is_network_backed(&self) -> bool {
        matches!(
            self,
            ModelProvider::Ollama | ModelProvider::OpenAiCompatible | ModelProvider::LlamaCpp
        )
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Conversational behavior profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiMode {
    /// Answer questions about the current file-system context.
    Qa,
    /// May invoke tools to act on the file system.
    Agent,
}

impl AiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiMode::Qa => "qa",
            AiMode::Agent => "agent",
        }
    }
}

impl fmt::Display for AiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

// ─── Messages ───────────────────────────────────────────────────────────────

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Lifecycle of a single tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolExecutionStatus {
    Executing,
    Success,
    Error,
}

impl ToolExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ToolExecutionStatus::Executing)
    }
}

/// A tool invocation recorded on an assistant message.
///
/// Created in `Executing`; moves to `Success` or `Error` exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub tool_name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    pub status: ToolExecutionStatus,
}

/// Chat message as held by the conversation and sent to backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_executions: Option<Vec<ToolExecution>>,
}

impl ChatMessage {
    /// Build a fresh message with a random id and the current timestamp.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            context_paths: None,
            is_streaming: None,
            error: None,
            tool_executions: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming == Some(true)
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

// ─── Model Catalog ──────────────────────────────────────────────────────────

/// Sampling parameters for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 2048,
            stream: true,
            stop_sequences: None,
            context_window: None,
        }
    }
}

/// A model entry from the external catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub provider: ModelProvider,
    /// Backend-specific identifier (e.g. `llama3.2:3b`).
    pub model_id: String,
    pub parameters: ModelParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub is_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub recommended_for: Vec<AiMode>,
}

impl ModelConfig {
    /// Whether `key` names this model, either by catalog id or backend id.
    pub fn matches_key(&self, key: &str) -> bool {
        self.id == key || self.model_id == key
    }
}

// ─── File-System Context ────────────────────────────────────────────────────

/// File-system context supplied by the file browser, passed through as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSystemContext {
    pub current_path: String,
    pub selected_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible_files: Option<Vec<VisibleFile>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_data: Option<ScanSummary>,
}

/// A single entry visible in the current directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleFile {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
}

/// Summary of the last directory scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub total_files: u64,
    pub total_size: u64,
    pub largest_files: Vec<FileInfo>,
    pub file_types: HashMap<String, u64>,
    pub scanned_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
}

// ─── Request / Response ─────────────────────────────────────────────────────

/// A dispatched inference request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub session_id: String,
    pub model_config: ModelConfig,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_context: Option<FileSystemContext>,
    pub mode: AiMode,
}

/// Final response object; `message.content` is the authoritative text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub message: ChatMessage,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Notification from the tool-execution engine.
///
/// An event with no `result`, `error` or `execution_time_ms` marks a tool
/// that just started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl ToolExecutionEvent {
    /// Status implied by this event.
    pub fn status(&self) -> ToolExecutionStatus {
        if self.error.is_some() {
            ToolExecutionStatus::Error
        } else if self.result.is_some() || self.execution_time_ms.is_some() {
            ToolExecutionStatus::Success
        } else {
            ToolExecutionStatus::Executing
        }
    }
}

// ─── Tool Calls ─────────────────────────────────────────────────────────────

/// A tool invocation requested by the model, normalized from any wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Arguments as a JSON object; non-object arguments become an empty map.
    pub fn argument_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.arguments.as_object().cloned().unwrap_or_default()
    }
}

/// A tool the model may call, in OpenAI function-schema shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// Health and catalog of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider: ModelProvider,
    pub is_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub available_models: Vec<ModelConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
