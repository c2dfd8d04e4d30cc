//! Ollama provider: `/api/chat` with newline-delimited JSON streaming, plus
//! model discovery through `/api/tags`.

use futures::stream::{self, StreamExt};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};

use super::{
    post_json, tool_schema, ChunkStream, Transport, WireMessage, REQUEST_TIMEOUT,
    STREAM_REQUEST_TIMEOUT,
};
use crate::inference::config::{SamplingDefaults, DEFAULT_OLLAMA_ENDPOINT};
use crate::inference::errors::InferenceError;
use crate::inference::streaming::{ndjson_lines, StreamChunk};
use crate::inference::types::{
    AiMode, ModelConfig, ModelProvider, ProviderStatus, TokenUsage, ToolCall, ToolDefinition,
};

/// Context window assumed for discovered models.
const DEFAULT_CONTEXT_WINDOW: u32 = 4096;

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions<'a> {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaMessageDelta>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OllamaMessageDelta {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OllamaListResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct OllamaVersion {
    version: String,
}

// ─── Chat ────────────────────────────────────────────────────────────────────

fn endpoint_of(config: &ModelConfig) -> &str {
    config
        .endpoint
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .unwrap_or(DEFAULT_OLLAMA_ENDPOINT)
}

fn api_url(endpoint: &str, path: &str) -> String {
    format!("{}/api/{path}", endpoint.trim_end_matches('/'))
}

fn to_ollama_messages(messages: &[WireMessage]) -> Vec<OllamaMessage<'_>> {
    messages
        .iter()
        .map(|m| OllamaMessage {
            role: m.role.as_str(),
            content: &m.content,
            tool_calls: m
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "function": { "name": tc.name, "arguments": tc.arguments }
                    })
                })
                .collect(),
        })
        .collect()
}

/// Open one chat turn.
pub(crate) async fn chat_stream(
    transport: &Transport,
    config: &ModelConfig,
    messages: &[WireMessage],
    tools: Option<&[ToolDefinition]>,
) -> Result<ChunkStream, InferenceError> {
    let url = api_url(endpoint_of(config), "chat");
    let params = &config.parameters;
    let body = OllamaChatRequest {
        model: &config.model_id,
        messages: to_ollama_messages(messages),
        stream: params.stream,
        options: OllamaOptions {
            temperature: params.temperature,
            top_p: params.top_p,
            num_predict: params.max_tokens,
            stop: params.stop_sequences.as_deref(),
            num_ctx: params.context_window,
        },
        tools: tools
            .filter(|t| !t.is_empty())
            .map(|t| t.iter().map(tool_schema).collect()),
    };

    tracing::info!(
        url = %url,
        model = %body.model,
        message_count = body.messages.len(),
        tool_count = body.tools.as_ref().map(Vec::len).unwrap_or(0),
        stream = body.stream,
        "=== OLLAMA REQUEST ==="
    );

    if !params.stream {
        let response = post_json(&transport.http, &url, &body, None, REQUEST_TIMEOUT).await?;
        let text = response
            .text()
            .await
            .map_err(|e| InferenceError::StreamError {
                reason: format!("failed to read response body: {e}"),
            })?;
        let chunk = parse_chat_line(&text)?;
        return Ok(stream::iter(chunk.map(Ok)).boxed());
    }

    let response =
        post_json(&transport.http_stream, &url, &body, None, STREAM_REQUEST_TIMEOUT).await?;

    Ok(ndjson_lines(response.bytes_stream())
        .filter_map(|line| async move {
            match line {
                Ok(line) => parse_chat_line(&line).transpose(),
                Err(e) => Some(Err(e)),
            }
        })
        .boxed())
}

/// Parse one NDJSON line. Lines that are not chat chunks are skipped.
fn parse_chat_line(line: &str) -> Result<Option<StreamChunk>, InferenceError> {
    let chunk: OllamaChatChunk = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "skipping unparseable Ollama line");
            return Ok(None);
        }
    };

    if let Some(error) = chunk.error {
        return Err(InferenceError::StreamError { reason: error });
    }

    let message = chunk.message.unwrap_or_default();
    let tool_calls: Vec<ToolCall> = message
        .tool_calls
        .into_iter()
        .map(|tc| ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4()),
            name: tc.function.name,
            arguments: if tc.function.arguments.is_null() {
                serde_json::Value::Object(serde_json::Map::new())
            } else {
                tc.function.arguments
            },
        })
        .collect();

    let usage = match (chunk.prompt_eval_count, chunk.eval_count) {
        (Some(prompt), Some(eval)) if chunk.done => Some(TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: eval,
            total_tokens: prompt + eval,
        }),
        _ => None,
    };

    let finish_reason = if !tool_calls.is_empty() {
        Some("tool_calls".to_string())
    } else if chunk.done {
        Some("stop".to_string())
    } else {
        None
    };

    Ok(Some(StreamChunk {
        token: (!message.content.is_empty()).then_some(message.content),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        finish_reason,
        usage,
    }))
}

// ─── Discovery ───────────────────────────────────────────────────────────────

/// Modes a model suits, judged from size hints in its name.
fn recommended_modes(name: &str) -> Vec<AiMode> {
    if name.contains("3b") || name.contains("small") {
        vec![AiMode::Qa]
    } else if name.contains("7b") {
        vec![AiMode::Qa, AiMode::Agent]
    } else {
        vec![AiMode::Agent, AiMode::Qa]
    }
}

fn to_model_config(model: OllamaModel, endpoint: &str, sampling: &SamplingDefaults) -> ModelConfig {
    ModelConfig {
        id: format!("ollama-{}", model.name.replace(':', "-")),
        name: model.name.clone(),
        provider: ModelProvider::Ollama,
        recommended_for: recommended_modes(&model.name),
        model_id: model.name,
        parameters: sampling.to_parameters(Some(DEFAULT_CONTEXT_WINDOW)),
        endpoint: Some(endpoint.to_string()),
        api_key: None,
        is_available: true,
        size_bytes: Some(model.size),
    }
}

/// List models installed in the Ollama daemon.
pub async fn list_models(
    client: &HttpClient,
    endpoint: Option<&str>,
    sampling: &SamplingDefaults,
) -> Result<Vec<ModelConfig>, InferenceError> {
    let endpoint = endpoint.unwrap_or(DEFAULT_OLLAMA_ENDPOINT);
    let url = api_url(endpoint, "tags");

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| InferenceError::from_transport(&url, e, REQUEST_TIMEOUT.as_secs()))?;
    if !response.status().is_success() {
        return Err(InferenceError::HttpError {
            status: response.status().as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }

    let list: OllamaListResponse =
        response
            .json()
            .await
            .map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse Ollama model list: {e}"),
            })?;

    let models: Vec<ModelConfig> = list
        .models
        .into_iter()
        .map(|m| to_model_config(m, endpoint, sampling))
        .collect();

    tracing::info!(endpoint, count = models.len(), "discovered Ollama models");
    Ok(models)
}

/// Probe the daemon and collect its catalog.
pub async fn status(
    client: &HttpClient,
    endpoint: Option<&str>,
    sampling: &SamplingDefaults,
) -> ProviderStatus {
    let base = endpoint.unwrap_or(DEFAULT_OLLAMA_ENDPOINT);

    let version = match client.get(api_url(base, "version")).send().await {
        Ok(resp) if resp.status().is_success() => {
            resp.json::<OllamaVersion>().await.ok().map(|v| v.version)
        }
        _ => None,
    };

    match list_models(client, Some(base), sampling).await {
        Ok(available_models) => ProviderStatus {
            provider: ModelProvider::Ollama,
            is_available: true,
            version,
            available_models,
            error: None,
        },
        Err(e) => {
            tracing::info!(endpoint = base, error = %e, "Ollama unavailable");
            ProviderStatus {
                provider: ModelProvider::Ollama,
                is_available: false,
                version,
                available_models: vec![],
                error: Some(format!("Ollama is not running or not reachable: {e}")),
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
