//! OpenAI-compatible provider (vLLM, LM Studio, LocalAI, llama.cpp's
//! `llama-server`, hosted APIs).

use futures::stream::{self, StreamExt};
use reqwest::Client as HttpClient;
use serde::Serialize;

use super::{
    post_json, tool_schema, ChunkStream, Transport, WireMessage, WireRole, REQUEST_TIMEOUT,
    STREAM_REQUEST_TIMEOUT,
};
use crate::inference::errors::InferenceError;
use crate::inference::streaming::{parse_non_streaming_response, parse_sse_stream};
use crate::inference::types::{ModelConfig, ModelProvider, ProviderStatus, ToolDefinition};

/// Separator placed between merged system prompts and the user's text.
const SYSTEM_MERGE_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

/// Build `{endpoint}/v1/{path}`, without doubling an existing `/v1`.
pub fn api_url(endpoint: &str, path: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.ends_with("/v1") || base.contains("/v1/") {
        format!("{base}/{path}")
    } else {
        format!("{base}/v1/{path}")
    }
}

/// Convert to OpenAI chat messages.
///
/// System messages are merged into the first user message so roles strictly
/// alternate, which `llama-server` chat templates require.
fn to_openai_messages(messages: &[WireMessage]) -> Vec<serde_json::Value> {
    let system_prompts: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == WireRole::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut pending_system = (!system_prompts.is_empty()).then(|| system_prompts.join("\n\n"));

    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            WireRole::System => {}
            WireRole::User => {
                let content = match pending_system.take() {
                    Some(system) => format!("{system}{SYSTEM_MERGE_SEPARATOR}{}", m.content),
                    None => m.content.clone(),
                };
                out.push(serde_json::json!({ "role": "user", "content": content }));
            }
            WireRole::Assistant if !m.tool_calls.is_empty() => {
                let calls: Vec<serde_json::Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                out.push(serde_json::json!({
                    "role": "assistant",
                    "content": m.content,
                    "tool_calls": calls,
                }));
            }
            WireRole::Assistant => {
                out.push(serde_json::json!({ "role": "assistant", "content": m.content }));
            }
            WireRole::Tool => {
                out.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id,
                    "content": m.content,
                }));
            }
        }
    }

    // No user message to carry the system prompt: send it on its own.
    if let Some(system) = pending_system {
        out.insert(0, serde_json::json!({ "role": "user", "content": system }));
    }

    out
}

/// Open one chat turn.
pub(crate) async fn chat_stream(
    transport: &Transport,
    config: &ModelConfig,
    messages: &[WireMessage],
    tools: Option<&[ToolDefinition]>,
) -> Result<ChunkStream, InferenceError> {
    let endpoint = config
        .endpoint
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| InferenceError::InvalidConfiguration {
            reason: format!("no endpoint configured for {} model '{}'", config.provider, config.id),
        })?;

    let url = api_url(endpoint, "chat/completions");
    let params = &config.parameters;
    let tools: Option<Vec<serde_json::Value>> = tools
        .filter(|t| !t.is_empty())
        .map(|t| t.iter().map(tool_schema).collect());
    let body = OpenAiChatRequest {
        model: &config.model_id,
        messages: to_openai_messages(messages),
        temperature: params.temperature,
        top_p: params.top_p,
        max_tokens: params.max_tokens,
        stream: params.stream,
        stop: params.stop_sequences.as_deref(),
        tool_choice: tools.as_ref().map(|_| "auto"),
        tools,
    };

    // Log the request metadata (not the body, and never the API key)
    tracing::info!(
        url = %url,
        provider = %config.provider,
        model = %body.model,
        message_count = body.messages.len(),
        tool_count = body.tools.as_ref().map(Vec::len).unwrap_or(0),
        stream = body.stream,
        "=== LLM REQUEST ==="
    );

    let api_key = config.api_key.as_deref();

    if !params.stream {
        let response = post_json(&transport.http, &url, &body, api_key, REQUEST_TIMEOUT).await?;
        let text = response
            .text()
            .await
            .map_err(|e| InferenceError::StreamError {
                reason: format!("failed to read response body: {e}"),
            })?;
        let chunk = parse_non_streaming_response(&text)?;
        return Ok(stream::once(async move { Ok(chunk) }).boxed());
    }

    let response =
        post_json(&transport.http_stream, &url, &body, api_key, STREAM_REQUEST_TIMEOUT).await?;
    Ok(parse_sse_stream(response.bytes_stream()).boxed())
}

/// Probe an OpenAI-compatible endpoint via `GET /v1/models`.
///
/// Models are configured by hand for these servers, so the catalog stays
/// empty.
pub async fn status(
    client: &HttpClient,
    provider: ModelProvider,
    endpoint: &str,
    api_key: Option<&str>,
) -> ProviderStatus {
    let url = api_url(endpoint, "models");
    let mut request = client.get(&url);
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        request = request.bearer_auth(key);
    }

    let is_available = match request.send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            tracing::info!(url = %url, error = %e, "OpenAI-compatible endpoint unreachable");
            false
        }
    };

    ProviderStatus {
        provider,
        is_available,
        version: None,
        available_models: vec![],
        error: (!is_available).then(|| format!("Cannot connect to endpoint: {endpoint}")),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
