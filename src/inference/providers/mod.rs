//! HTTP inference backend.
//!
//! Serves network-backed providers (Ollama, OpenAI-compatible servers,
//! llama.cpp) behind the [`InferenceBackend`] contract. Each dispatch
//! registers a cancellation token under its session id and runs in its own
//! task, pushing events into a channel the caller consumes as a stream.

pub mod ollama;
pub mod openai_compatible;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use tokio_util::sync::CancellationToken;

use super::backend::{InferenceBackend, InferenceEvent, InferenceStream, ToolEngine};
use super::config::SamplingDefaults;
use super::errors::InferenceError;
use super::streaming::StreamChunk;
use super::tool_call_parser::parse_text_tool_calls;
use super::types::{
    ChatMessage, FileSystemContext, InferenceRequest, InferenceResponse, MessageRole,
    ModelConfig, ModelProvider, ProviderStatus, TokenUsage, ToolCall, ToolDefinition,
    ToolExecutionEvent,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for non-streaming calls.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Total request timeout for streaming calls.
///
/// Local models can take a long time to process a large context before
/// the first token arrives.
pub(crate) const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Maximum model turns in one agent session.
pub const MAX_TOOL_ROUNDS: usize = 10;

/// Visible files listed in the injected context message.
const MAX_CONTEXT_FILES: usize = 50;

pub(crate) type ChunkStream = BoxStream<'static, Result<StreamChunk, InferenceError>>;

// ─── Wire Messages ───────────────────────────────────────────────────────────

/// Provider-neutral message used while composing requests.
///
/// Besides plain chat roles this carries the assistant tool calls and tool
/// results the agent loop feeds back to the model.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WireMessage {
    pub role: WireRole,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireRole {
    System,
    User,
    Assistant,
    Tool,
}

impl WireRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireRole::System => "system",
            WireRole::User => "user",
            WireRole::Assistant => "assistant",
            WireRole::Tool => "tool",
        }
    }
}

impl WireMessage {
    fn text(role: WireRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    fn assistant_tool_calls(content: String, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: WireRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    fn tool_result(call_id: String, content: String) -> Self {
        Self {
            role: WireRole::Tool,
            content,
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id),
        }
    }
}

/// Convert conversation messages, injecting file-system context as a system
/// message when the request has context and no system message of its own.
pub(crate) fn build_wire_messages(request: &InferenceRequest) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(request.messages.len() + 1);

    let has_system_message = request
        .messages
        .iter()
        .any(|m| m.role == MessageRole::System);
    if !has_system_message {
        if let Some(context) = request.fs_context.as_ref().and_then(format_fs_context) {
            out.push(WireMessage::text(
                WireRole::System,
                format!(
                    "Context Information:\n{context}\nUse this context to answer the user's questions about their files."
                ),
            ));
        }
    }

    out.extend(request.messages.iter().map(|m: &ChatMessage| {
        let role = match m.role {
            MessageRole::User => WireRole::User,
            MessageRole::Assistant => WireRole::Assistant,
            MessageRole::System => WireRole::System,
        };
        WireMessage::text(role, m.content.clone())
    }));

    out
}

/// Render the file-browser context as plain text.
pub(crate) fn format_fs_context(ctx: &FileSystemContext) -> Option<String> {
    let mut text = String::new();
    if !ctx.current_path.is_empty() {
        text.push_str(&format!("Current Directory: {}\n", ctx.current_path));
    }

    if !ctx.selected_paths.is_empty() {
        text.push_str("Selected Items:\n");
        for path in &ctx.selected_paths {
            text.push_str(&format!("- {path}\n"));
        }
    }

    if let Some(visible) = ctx.visible_files.as_ref().filter(|v| !v.is_empty()) {
        text.push_str("\nVisible Files in Current Directory:\n");
        for file in visible.iter().take(MAX_CONTEXT_FILES) {
            let kind = match (file.is_dir, file.file_count) {
                (true, Some(count)) => format!("Folder, {count} items"),
                (true, None) => "Folder".to_string(),
                (false, _) => format!("File, {}", format_size(file.size)),
            };
            text.push_str(&format!("- {} ({kind})\n", file.name));
        }
        if visible.len() > MAX_CONTEXT_FILES {
            text.push_str(&format!("...and {} more\n", visible.len() - MAX_CONTEXT_FILES));
        }
    }

    (!text.is_empty()).then_some(text)
}

/// Human-readable byte size (`512 B`, `1.50 KB`, `2.00 GB`).
pub(crate) fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}

/// OpenAI function-tool schema (also accepted by Ollama).
pub(crate) fn tool_schema(def: &ToolDefinition) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters,
        }
    })
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Shared HTTP clients (cheap to clone).
#[derive(Clone)]
pub(crate) struct Transport {
    /// Non-streaming requests (30s timeout).
    pub http: HttpClient,
    /// Streaming requests (180s timeout).
    pub http_stream: HttpClient,
}

impl Transport {
    fn new() -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self { http, http_stream })
    }

    /// Open one model turn against the configured provider.
    async fn open_turn(
        &self,
        config: &ModelConfig,
        messages: &[WireMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChunkStream, InferenceError> {
        match config.provider {
            ModelProvider::Ollama => ollama::chat_stream(self, config, messages, tools).await,
            ModelProvider::OpenAiCompatible | ModelProvider::LlamaCpp => {
                openai_compatible::chat_stream(self, config, messages, tools).await
            }
            other => Err(unavailable(other)),
        }
    }
}

fn unavailable(provider: ModelProvider) -> InferenceError {
    InferenceError::ProviderUnavailable {
        provider,
        reason: "not served over HTTP by this backend".into(),
    }
}

/// POST a JSON body and fail on non-2xx responses.
pub(crate) async fn post_json<T: serde::Serialize + ?Sized>(
    client: &HttpClient,
    url: &str,
    body: &T,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Response, InferenceError> {
    let mut builder = client.post(url).json(body);
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        builder = builder.bearer_auth(key);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| InferenceError::from_transport(url, e, timeout.as_secs()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(InferenceError::HttpError {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

// ─── Session Registry ────────────────────────────────────────────────────────

type SessionRegistry = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Removes a session from the registry when its task ends, however it ends.
struct SessionGuard {
    registry: SessionRegistry,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

// ─── HttpBackend ─────────────────────────────────────────────────────────────

/// Inference backend for HTTP-served providers.
pub struct HttpBackend {
    transport: Transport,
    sessions: SessionRegistry,
    tools: Option<Arc<dyn ToolEngine>>,
}

impl HttpBackend {
    pub fn new() -> Result<Self, InferenceError> {
        Ok(Self {
            transport: Transport::new()?,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            tools: None,
        })
    }

    /// Attach the tool engine used by agent-mode sessions.
    pub fn with_tool_engine(mut self, engine: Arc<dyn ToolEngine>) -> Self {
        self.tools = Some(engine);
        self
    }

    /// Number of sessions currently in flight.
    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Models installed in an Ollama daemon.
    pub async fn list_ollama_models(
        &self,
        endpoint: Option<&str>,
        sampling: &SamplingDefaults,
    ) -> Result<Vec<ModelConfig>, InferenceError> {
        ollama::list_models(&self.transport.http, endpoint, sampling).await
    }

    /// Probe one provider. Providers not served over HTTP report unavailable.
    pub async fn provider_status(
        &self,
        provider: ModelProvider,
        endpoint: Option<&str>,
        api_key: Option<&str>,
        sampling: &SamplingDefaults,
    ) -> ProviderStatus {
        match (provider, endpoint) {
            (ModelProvider::Ollama, _) => ollama::status(&self.transport.http, endpoint, sampling).await,
            (ModelProvider::OpenAiCompatible | ModelProvider::LlamaCpp, Some(endpoint)) => {
                openai_compatible::status(&self.transport.http, provider, endpoint, api_key).await
            }
            (ModelProvider::OpenAiCompatible | ModelProvider::LlamaCpp, None) => ProviderStatus {
                provider,
                is_available: false,
                version: None,
                available_models: vec![],
                error: Some("no endpoint configured".into()),
            },
            (other, _) => ProviderStatus {
                provider: other,
                is_available: false,
                version: None,
                available_models: vec![],
                error: Some(unavailable(other).to_string()),
            },
        }
    }

    fn register_session(&self, session_id: &str) -> (CancellationToken, SessionGuard) {
        let token = CancellationToken::new();
        let previous = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), token.clone());
        if previous.is_some() {
            tracing::warn!(session_id, "session id registered twice, replacing");
        }
        let guard = SessionGuard {
            registry: Arc::clone(&self.sessions),
            session_id: session_id.to_string(),
        };
        (token, guard)
    }

    fn dispatch(
        &self,
        request: InferenceRequest,
        tools: Option<Arc<dyn ToolEngine>>,
    ) -> Result<InferenceStream, InferenceError> {
        let config = &request.model_config;
        if !config.provider.is_network_backed() {
            return Err(unavailable(config.provider));
        }

        tracing::info!(
            session_id = %request.session_id,
            provider = %config.provider,
            model = %config.model_id,
            mode = %request.mode,
            message_count = request.messages.len(),
            has_tools = tools.is_some(),
            "dispatching inference"
        );

        let (token, guard) = self.register_session(&request.session_id);
        let (tx, rx) = mpsc::unbounded();
        let task = SessionTask {
            messages: build_wire_messages(&request),
            config: request.model_config,
            session_id: request.session_id,
            transport: self.transport.clone(),
            tools,
        };

        tokio::spawn(async move {
            let _guard = guard;
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(InferenceError::Cancelled),
                r = task.run(&tx) => r,
            };
            match &result {
                Ok(_) => tracing::info!(session_id = %task.session_id, "inference session completed"),
                Err(InferenceError::Cancelled) => {
                    tracing::info!(session_id = %task.session_id, "inference session cancelled")
                }
                Err(e) => {
                    tracing::warn!(session_id = %task.session_id, error = %e, "inference session failed")
                }
            }
            // The receiver may already be gone; nothing left to notify then.
            let _ = tx.unbounded_send(result.map(InferenceEvent::Completed));
        });

        Ok(rx.boxed())
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn run_inference(
        &self,
        request: InferenceRequest,
    ) -> Result<InferenceStream, InferenceError> {
        self.dispatch(request, None)
    }

    async fn run_inference_with_tools(
        &self,
        request: InferenceRequest,
    ) -> Result<InferenceStream, InferenceError> {
        if self.tools.is_none() {
            tracing::warn!(
                session_id = %request.session_id,
                "no tool engine attached, serving agent request without tools"
            );
        }
        self.dispatch(request, self.tools.clone())
    }

    async fn cancel_inference(&self, session_id: &str) -> Result<(), InferenceError> {
        let token = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);

        match token {
            Some(token) => {
                token.cancel();
                tracing::info!(session_id, "inference cancel requested");
                Ok(())
            }
            None => Err(InferenceError::SessionNotFound {
                session_id: session_id.to_string(),
            }),
        }
    }
}

// ─── Session Task ────────────────────────────────────────────────────────────

type EventSender = mpsc::UnboundedSender<Result<InferenceEvent, InferenceError>>;

struct SessionTask {
    session_id: String,
    config: ModelConfig,
    messages: Vec<WireMessage>,
    transport: Transport,
    tools: Option<Arc<dyn ToolEngine>>,
}

/// What one model turn produced.
#[derive(Default)]
struct TurnOutcome {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<TokenUsage>,
}

impl SessionTask {
    /// Run the session to its final response.
    ///
    /// Without a tool engine this is a single turn. With one, the model may
    /// request tools; results are fed back until it answers with plain text
    /// or the round limit is reached.
    async fn run(&self, tx: &EventSender) -> Result<InferenceResponse, InferenceError> {
        let started = Instant::now();
        let definitions = self.tools.as_ref().map(|t| t.definitions());
        let mut messages = self.messages.clone();
        let mut usage: Option<TokenUsage> = None;

        for round in 0..MAX_TOOL_ROUNDS {
            let turn = self
                .transport
                .open_turn(&self.config, &messages, definitions.as_deref())
                .await?;
            let outcome = collect_turn(turn, tx).await?;
            usage = merge_usage(usage, outcome.usage);

            let Some(engine) = self.tools.as_ref() else {
                return Ok(self.response(outcome.text, usage, started));
            };

            let calls = if outcome.tool_calls.is_empty() {
                parse_text_tool_calls(&outcome.text).unwrap_or_else(|e| {
                    tracing::warn!(session_id = %self.session_id, error = %e, "ignoring malformed tool call markup");
                    Vec::new()
                })
            } else {
                outcome.tool_calls
            };

            if calls.is_empty() {
                return Ok(self.response(outcome.text, usage, started));
            }

            tracing::info!(
                session_id = %self.session_id,
                round,
                tool_count = calls.len(),
                "model requested tools"
            );

            messages.push(WireMessage::assistant_tool_calls(outcome.text, calls.clone()));
            for call in calls {
                let content = self.execute_tool(engine.as_ref(), &call, tx).await?;
                messages.push(WireMessage::tool_result(call.id, content));
            }
        }

        tracing::warn!(
            session_id = %self.session_id,
            max_rounds = MAX_TOOL_ROUNDS,
            "tool round limit reached, finishing with streamed text"
        );
        Ok(self.response(String::new(), usage, started))
    }

    /// Announce a tool, run it and report the outcome. Returns the text fed
    /// back to the model.
    async fn execute_tool(
        &self,
        engine: &dyn ToolEngine,
        call: &ToolCall,
        tx: &EventSender,
    ) -> Result<String, InferenceError> {
        let arguments = call.argument_map();
        send_event(
            tx,
            InferenceEvent::ToolExecution(ToolExecutionEvent {
                call_id: Some(call.id.clone()),
                tool_name: call.name.clone(),
                arguments: arguments.clone(),
                result: None,
                error: None,
                execution_time_ms: None,
            }),
        )?;

        let started = Instant::now();
        let outcome = engine.execute(&call.name, &arguments).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let (result, error, feedback) = match outcome {
            Ok(output) => (Some(output.clone()), None, output),
            Err(message) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    tool = %call.name,
                    error = %message,
                    "tool execution failed"
                );
                let feedback = format!("Error: {message}");
                (None, Some(message), feedback)
            }
        };

        send_event(
            tx,
            InferenceEvent::ToolExecution(ToolExecutionEvent {
                call_id: Some(call.id.clone()),
                tool_name: call.name.clone(),
                arguments,
                result,
                error,
                execution_time_ms: Some(elapsed),
            }),
        )?;
        Ok(feedback)
    }

    fn response(
        &self,
        text: String,
        usage: Option<TokenUsage>,
        started: Instant,
    ) -> InferenceResponse {
        InferenceResponse {
            message: ChatMessage::assistant(text),
            is_complete: true,
            usage,
            inference_time_ms: Some(started.elapsed().as_millis() as u64),
        }
    }
}

/// Drain one turn, forwarding text as it arrives.
async fn collect_turn(
    mut turn: ChunkStream,
    tx: &EventSender,
) -> Result<TurnOutcome, InferenceError> {
    let mut outcome = TurnOutcome::default();

    while let Some(chunk) = turn.next().await {
        let chunk = chunk?;
        if let Some(token) = chunk.token {
            outcome.text.push_str(&token);
            send_event(tx, InferenceEvent::Chunk(token))?;
        }
        if let Some(calls) = chunk.tool_calls {
            outcome.tool_calls.extend(calls);
        }
        if chunk.usage.is_some() {
            outcome.usage = chunk.usage;
        }
    }

    Ok(outcome)
}

/// A closed receiver means nobody is listening: stop the session.
fn send_event(tx: &EventSender, event: InferenceEvent) -> Result<(), InferenceError> {
    tx.unbounded_send(Ok(event))
        .map_err(|_| InferenceError::Cancelled)
}

fn merge_usage(total: Option<TokenUsage>, turn: Option<TokenUsage>) -> Option<TokenUsage> {
    match (total, turn) {
        (Some(a), Some(b)) => Some(TokenUsage {
            prompt_tokens: a.prompt_tokens + b.prompt_tokens,
            completion_tokens: a.completion_tokens + b.completion_tokens,
            total_tokens: a.total_tokens + b.total_tokens,
        }),
        (a, b) => a.or(b),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::{AiMode, ModelParameters, VisibleFile};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn model(provider: ModelProvider) -> ModelConfig {
        ModelConfig {
            id: "m".into(),
            name: "m".into(),
            provider,
            model_id: "m".into(),
            parameters: ModelParameters::default(),
            endpoint: None,
            api_key: None,
            is_available: true,
            size_bytes: None,
            recommended_for: vec![],
        }
    }

    fn request(messages: Vec<ChatMessage>, fs_context: Option<FileSystemContext>) -> InferenceRequest {
        InferenceRequest {
            session_id: "s-1".into(),
            model_config: model(ModelProvider::Ollama),
            messages,
            fs_context,
            mode: AiMode::Qa,
        }
    }

    fn visible(name: &str, size: u64, is_dir: bool) -> VisibleFile {
        VisibleFile {
            name: name.into(),
            path: format!("/home/{name}"),
            size,
            is_dir,
            file_count: None,
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_format_fs_context_lists_files() {
        let mut dir = visible("photos", 0, true);
        dir.file_count = Some(12);
        let ctx = FileSystemContext {
            current_path: "/home".into(),
            selected_paths: vec!["/home/a.txt".into()],
            visible_files: Some(vec![visible("a.txt", 2048, false), dir]),
            scan_data: None,
        };
        let text = format_fs_context(&ctx).unwrap();
        assert!(text.starts_with("Current Directory: /home\n"));
        assert!(text.contains("Selected Items:\n- /home/a.txt\n"));
        assert!(text.contains("- a.txt (File, 2.00 KB)\n"));
        assert!(text.contains("- photos (Folder, 12 items)\n"));
    }

    #[test]
    fn test_format_fs_context_caps_visible_files() {
        let files: Vec<VisibleFile> = (0..57).map(|i| visible(&format!("f{i}"), 1, false)).collect();
        let ctx = FileSystemContext {
            current_path: "/data".into(),
            selected_paths: vec![],
            visible_files: Some(files),
            scan_data: None,
        };
        let text = format_fs_context(&ctx).unwrap();
        assert!(text.contains("- f49 (File, 1 B)"));
        assert!(!text.contains("- f50 "));
        assert!(text.ends_with("...and 7 more\n"));
    }

    #[test]
    fn test_format_fs_context_empty() {
        assert!(format_fs_context(&FileSystemContext::default()).is_none());
    }

    #[test]
    fn test_build_wire_messages_injects_context() {
        let ctx = FileSystemContext {
            current_path: "/home".into(),
            ..FileSystemContext::default()
        };
        let wire = build_wire_messages(&request(vec![ChatMessage::user("what is here?")], Some(ctx)));
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, WireRole::System);
        assert!(wire[0].content.starts_with("Context Information:\nCurrent Directory: /home"));
        assert_eq!(wire[1].role, WireRole::User);
    }

    #[test]
    fn test_build_wire_messages_keeps_existing_system_message() {
        let ctx = FileSystemContext {
            current_path: "/home".into(),
            ..FileSystemContext::default()
        };
        let messages = vec![
            ChatMessage::new(MessageRole::System, "be brief"),
            ChatMessage::user("hi"),
        ];
        let wire = build_wire_messages(&request(messages, Some(ctx)));
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].content, "be brief");
    }

    #[test]
    fn test_merge_usage() {
        let a = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
        };
        assert_eq!(merge_usage(None, Some(a)), Some(a));
        assert_eq!(merge_usage(Some(a), Some(a)).unwrap().total_tokens, 24);
        assert_eq!(merge_usage(None, None), None);
    }

    #[tokio::test]
    async fn test_cancel_unknown_session_is_not_found() {
        let backend = HttpBackend::new().unwrap();
        let err = backend.cancel_inference("nope").await.unwrap_err();
        assert!(err.is_session_not_found());
    }

    #[tokio::test]
    async fn test_cancel_registered_session_fires_token_once() {
        let backend = HttpBackend::new().unwrap();
        let (token, _guard) = backend.register_session("s-42");
        assert_eq!(backend.active_sessions(), 1);

        backend.cancel_inference("s-42").await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(backend.active_sessions(), 0);

        let again = backend.cancel_inference("s-42").await.unwrap_err();
        assert!(again.is_session_not_found());
    }

    #[tokio::test]
    async fn test_session_guard_unregisters_on_drop() {
        let backend = HttpBackend::new().unwrap();
        let (_token, guard) = backend.register_session("s-7");
        drop(guard);
        assert_eq!(backend.active_sessions(), 0);
        assert!(backend.cancel_inference("s-7").await.is_err());
    }

    #[tokio::test]
    async fn test_embedded_provider_rejected() {
        let backend = HttpBackend::new().unwrap();
        let mut req = request(vec![ChatMessage::user("hi")], None);
        req.model_config = model(ModelProvider::Candle);
        let err = backend.run_inference(req).await.err().unwrap();
        assert!(matches!(
            err,
            InferenceError::ProviderUnavailable {
                provider: ModelProvider::Candle,
                ..
            }
        ));
        assert_eq!(backend.active_sessions(), 0);
    }

    // ── Local Ollama server ─────────────────────────────────────────────

    #[derive(Clone)]
    enum Reply {
        /// Whole NDJSON body, then close.
        Full(String),
        /// First NDJSON line, then hold the connection open.
        Stall(String),
    }

    struct FakeOllama {
        endpoint: String,
        requests: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl FakeOllama {
        fn request(&self, index: usize) -> serde_json::Value {
            self.requests.lock().unwrap()[index].clone()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    /// Serve one reply per connection; the last reply repeats.
    async fn fake_ollama(replies: Vec<Reply>) -> FakeOllama {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind local test server");
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            let mut served = 0usize;
            while let Ok((mut socket, _)) = listener.accept().await {
                let reply = replies[served.min(replies.len() - 1)].clone();
                served += 1;
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let body = read_request_body(&mut socket).await;
                    seen.lock().unwrap().push(body);
                    match reply {
                        Reply::Full(body) => {
                            let response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                                body.len()
                            );
                            let _ = socket.write_all(response.as_bytes()).await;
                        }
                        Reply::Stall(first) => {
                            let head = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n{first}"
                            );
                            let _ = socket.write_all(head.as_bytes()).await;
                            let _ = socket.flush().await;
                            std::future::pending::<()>().await;
                        }
                    }
                });
            }
        });

        FakeOllama { endpoint, requests }
    }

    async fn read_request_body(socket: &mut TcpStream) -> serde_json::Value {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.expect("read request");
            if n == 0 {
                return serde_json::Value::Null;
            }
            data.extend_from_slice(&buf[..n]);

            let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let start = end + 4;
            if data.len() >= start + length {
                return serde_json::from_slice(&data[start..start + length]).unwrap();
            }
        }
    }

    fn ndjson(lines: &[serde_json::Value]) -> String {
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    fn done_line(prompt: u32, eval: u32) -> serde_json::Value {
        json!({
            "message": { "role": "assistant", "content": "" },
            "done": true,
            "prompt_eval_count": prompt,
            "eval_count": eval
        })
    }

    fn native_tool_turn() -> Reply {
        Reply::Full(ndjson(&[
            json!({
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{ "function": { "name": "list_dir", "arguments": { "path": "/tmp" } } }]
                },
                "done": false
            }),
            done_line(1, 1),
        ]))
    }

    fn text_turn(text: &str) -> Reply {
        Reply::Full(ndjson(&[
            json!({ "message": { "role": "assistant", "content": text }, "done": false }),
            done_line(2, 1),
        ]))
    }

    #[derive(Default)]
    struct StubTools {
        calls: Mutex<Vec<(String, serde_json::Map<String, serde_json::Value>)>>,
    }

    #[async_trait]
    impl ToolEngine for StubTools {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition {
                name: "list_dir".into(),
                description: "List a directory".into(),
                parameters: json!({
                    "type": "object",
                    "properties": { "path": { "type": "string" } }
                }),
            }]
        }

        async fn execute(
            &self,
            name: &str,
            arguments: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<String, String> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));
            Ok("a.txt".into())
        }
    }

    fn backend_with_tools() -> (HttpBackend, Arc<StubTools>) {
        let tools = Arc::new(StubTools::default());
        let backend = HttpBackend::new()
            .unwrap()
            .with_tool_engine(tools.clone() as Arc<dyn ToolEngine>);
        (backend, tools)
    }

    fn agent_request(endpoint: &str) -> InferenceRequest {
        let mut req = request(vec![ChatMessage::user("what is in /tmp?")], None);
        req.model_config.endpoint = Some(endpoint.to_string());
        req.mode = AiMode::Agent;
        req
    }

    async fn drain(stream: InferenceStream) -> Vec<Result<InferenceEvent, InferenceError>> {
        tokio::time::timeout(Duration::from_secs(20), stream.collect::<Vec<_>>())
            .await
            .expect("stream finished")
    }

    fn tool_events(events: &[Result<InferenceEvent, InferenceError>]) -> Vec<&ToolExecutionEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                Ok(InferenceEvent::ToolExecution(t)) => Some(t),
                _ => None,
            })
            .collect()
    }

    fn completed_response(events: &[Result<InferenceEvent, InferenceError>]) -> &InferenceResponse {
        match events.last() {
            Some(Ok(InferenceEvent::Completed(response))) => response,
            other => panic!("stream did not end with Completed: {other:?}"),
        }
    }

    async fn next(stream: &mut InferenceStream) -> Option<Result<InferenceEvent, InferenceError>> {
        tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("event arrived")
    }

    // ── Agent loop ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_agent_loop_feeds_tool_results_back() {
        let server = fake_ollama(vec![native_tool_turn(), text_turn("Found a.txt")]).await;
        let (backend, tools) = backend_with_tools();

        let stream = backend
            .run_inference_with_tools(agent_request(&server.endpoint))
            .await
            .unwrap();
        let events = drain(stream).await;

        assert_eq!(events.len(), 4, "start, finish, chunk, completed");
        let started = tool_events(&events)[0];
        let finished = tool_events(&events)[1];
        assert_eq!(started.tool_name, "list_dir");
        assert_eq!(started.arguments["path"], "/tmp");
        assert!(started.result.is_none() && started.execution_time_ms.is_none());
        assert_eq!(finished.call_id, started.call_id);
        assert_eq!(finished.result.as_deref(), Some("a.txt"));
        assert!(finished.execution_time_ms.is_some());
        assert!(matches!(&events[2], Ok(InferenceEvent::Chunk(t)) if t == "Found a.txt"));

        let response = completed_response(&events);
        assert_eq!(response.message.content, "Found a.txt");
        assert_eq!(
            response.usage,
            Some(TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            })
        );

        assert_eq!(tools.calls.lock().unwrap().len(), 1);
        assert_eq!(server.request_count(), 2);
        assert_eq!(server.request(0)["tools"][0]["function"]["name"], "list_dir");
        let follow_up = server.request(1);
        assert_eq!(follow_up["messages"][1]["tool_calls"][0]["function"]["name"], "list_dir");
        assert_eq!(follow_up["messages"][2], json!({ "role": "tool", "content": "a.txt" }));
    }

    #[tokio::test]
    async fn test_agent_loop_parses_tool_markup_in_text() {
        let markup = r#"<tool_call>{"name": "list_dir", "arguments": {"path": "/tmp"}}</tool_call>"#;
        let server = fake_ollama(vec![text_turn(markup), text_turn("Found a.txt")]).await;
        let (backend, tools) = backend_with_tools();

        let stream = backend
            .run_inference_with_tools(agent_request(&server.endpoint))
            .await
            .unwrap();
        let events = drain(stream).await;

        assert!(matches!(&events[0], Ok(InferenceEvent::Chunk(t)) if t.contains("<tool_call>")));
        assert_eq!(tool_events(&events).len(), 2);
        assert_eq!(completed_response(&events).message.content, "Found a.txt");

        let calls = tools.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "list_dir");
        assert_eq!(calls[0].1["path"], "/tmp");
        assert_eq!(server.request_count(), 2);
    }

    #[tokio::test]
    async fn test_agent_loop_stops_at_round_limit() {
        let server = fake_ollama(vec![native_tool_turn()]).await;
        let (backend, tools) = backend_with_tools();

        let stream = backend
            .run_inference_with_tools(agent_request(&server.endpoint))
            .await
            .unwrap();
        let events = drain(stream).await;

        assert_eq!(server.request_count(), MAX_TOOL_ROUNDS);
        assert_eq!(tools.calls.lock().unwrap().len(), MAX_TOOL_ROUNDS);
        assert_eq!(tool_events(&events).len(), 2 * MAX_TOOL_ROUNDS);
        assert_eq!(completed_response(&events).message.content, "");
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_ends_with_cancelled() {
        let first = ndjson(&[json!({ "message": { "role": "assistant", "content": "Hel" }, "done": false })]);
        let server = fake_ollama(vec![Reply::Stall(first)]).await;
        let backend = HttpBackend::new().unwrap();

        let mut req = request(vec![ChatMessage::user("hi")], None);
        req.model_config.endpoint = Some(server.endpoint.clone());
        let mut stream = backend.run_inference(req).await.unwrap();

        let chunk = next(&mut stream).await;
        assert!(matches!(chunk, Some(Ok(InferenceEvent::Chunk(t))) if t == "Hel"));
        assert_eq!(backend.active_sessions(), 1);

        backend.cancel_inference("s-1").await.unwrap();
        assert_eq!(backend.active_sessions(), 0);

        let ended = next(&mut stream).await;
        assert!(matches!(ended, Some(Err(InferenceError::Cancelled))));
        assert!(next(&mut stream).await.is_none());

        let again = backend.cancel_inference("s-1").await.unwrap_err();
        assert!(again.is_session_not_found());
    }
}
