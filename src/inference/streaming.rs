//! Streaming response parsers.
//!
//! OpenAI-compatible servers stream Server-Sent Events (`data: …\n\n`);
//! Ollama streams newline-delimited JSON. Both parsers take any byte stream
//! so they can run over a `reqwest::Response::bytes_stream()` or a canned
//! sequence in tests. Bytes are buffered raw and only decoded at event
//! boundaries, so a multi-byte character split across network reads
//! survives intact.

use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::errors::InferenceError;
use super::tool_call_parser::parse_native_json_tool_call;
use super::types::{TokenUsage, ToolCall};

/// One parsed increment of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub token: Option<String>,
    /// Complete tool calls, emitted once all their deltas have arrived.
    pub tool_calls: Option<Vec<ToolCall>>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: Option<u32>,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// ─── SSE Parser ──────────────────────────────────────────────────────────────

/// Parse an SSE byte stream into `StreamChunk`s.
///
/// 1. Splits the body into SSE events
/// 2. Parses each `data:` payload as a chat-completion chunk
/// 3. Accumulates tool call fragments across deltas
/// 4. Emits finished tool calls on `finish_reason: tool_calls`, `[DONE]`,
///    or end of body, whichever comes first
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<StreamChunk, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(
        (byte_stream, SseState::default(), Vec::<u8>::new(), false),
        |(mut byte_stream, mut state, mut buffer, mut ended)| async move {
            loop {
                if let Some((event_end, sep_len)) = find_event_boundary(&buffer) {
                    let event = String::from_utf8_lossy(&buffer[..event_end]).into_owned();
                    buffer.drain(..event_end + sep_len);

                    match state.process_event(&event) {
                        Ok(Some(chunk)) => {
                            return Some((Ok(chunk), (byte_stream, state, buffer, ended)))
                        }
                        Ok(None) => continue, // [DONE] or keep-alive
                        Err(e) => return Some((Err(e), (byte_stream, state, buffer, ended))),
                    }
                }

                if ended {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        ended = true;
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, state, buffer, ended),
                        ));
                    }
                    None => {
                        ended = true;
                        // Flush a trailing event without a blank line, then
                        // whatever tool calls never saw a finish reason.
                        let tail = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        let result = if tail.is_empty() {
                            state.finalize()
                        } else {
                            state.process_event(&tail).and_then(|chunk| match chunk {
                                Some(c) => Ok(Some(c)),
                                None => state.finalize(),
                            })
                        };
                        match result {
                            Ok(Some(chunk)) => {
                                return Some((Ok(chunk), (byte_stream, state, buffer, ended)))
                            }
                            Ok(None) => return None,
                            Err(e) => return Some((Err(e), (byte_stream, state, buffer, ended))),
                        }
                    }
                }
            }
        },
    )
}

/// Position and length of the first SSE event separator.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((b, 4)),
        (Some(a), _) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

/// Mutable state for accumulating tool call fragments across SSE events.
#[derive(Default)]
struct SseState {
    /// In-progress tool calls: `(index, id, name, arguments_buffer)`.
    pending_tool_calls: Vec<(u32, Option<String>, String, String)>,
}

impl SseState {
    /// Process a single SSE event (may contain multiple `data:` lines).
    fn process_event(&mut self, event: &str) -> Result<Option<StreamChunk>, InferenceError> {
        let mut data_content = String::new();

        for line in event.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let data = data.trim();
                if data == "[DONE]" {
                    return self.finalize();
                }
                data_content.push_str(data);
            }
            // Comments and `event:` lines carry nothing we use
        }

        if data_content.is_empty() {
            return Ok(None);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e}"),
            })?;

        self.process_chunk(chunk)
    }

    fn process_chunk(
        &mut self,
        chunk: ChatCompletionChunk,
    ) -> Result<Option<StreamChunk>, InferenceError> {
        let usage = chunk.usage.map(TokenUsage::from);

        let Some(choice) = chunk.choices.into_iter().next() else {
            // Some servers send usage in a trailing chunk with no choices
            return Ok(usage.map(|u| StreamChunk {
                usage: Some(u),
                ..StreamChunk::default()
            }));
        };

        let mut result = StreamChunk {
            token: choice.delta.content.filter(|c| !c.is_empty()),
            tool_calls: None,
            finish_reason: choice.finish_reason,
            usage,
        };

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let index = tc.index.unwrap_or(0);
            let (name_part, args_part) = match tc.function {
                Some(f) => (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()),
                None => (String::new(), String::new()),
            };

            match self
                .pending_tool_calls
                .iter_mut()
                .find(|(idx, _, _, _)| *idx == index)
            {
                Some((_, id, name, args)) => {
                    name.push_str(&name_part);
                    args.push_str(&args_part);
                    if tc.id.is_some() {
                        *id = tc.id;
                    }
                }
                None => self
                    .pending_tool_calls
                    .push((index, tc.id, name_part, args_part)),
            }
        }

        if result.finish_reason.as_deref() == Some("tool_calls") {
            let calls = self.finalize_native_tool_calls()?;
            if !calls.is_empty() {
                result.tool_calls = Some(calls);
            }
        }

        if result.token.is_none()
            && result.tool_calls.is_none()
            && result.finish_reason.is_none()
            && result.usage.is_none()
        {
            return Ok(None);
        }
        Ok(Some(result))
    }

    fn finalize_native_tool_calls(&mut self) -> Result<Vec<ToolCall>, InferenceError> {
        let pending = std::mem::take(&mut self.pending_tool_calls);
        pending
            .into_iter()
            .map(|(_index, id, name, args)| parse_native_json_tool_call(id.as_deref(), &name, &args))
            .collect()
    }

    /// Emit any tool calls still pending when the stream finishes.
    fn finalize(&mut self) -> Result<Option<StreamChunk>, InferenceError> {
        if self.pending_tool_calls.is_empty() {
            return Ok(None);
        }
        let calls = self.finalize_native_tool_calls()?;
        Ok(Some(StreamChunk {
            tool_calls: Some(calls),
            finish_reason: Some("tool_calls".into()),
            ..StreamChunk::default()
        }))
    }
}

// ─── NDJSON Lines ────────────────────────────────────────────────────────────

/// Split a byte stream into non-empty lines (newline-delimited JSON bodies).
pub fn ndjson_lines<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<String, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, mut ended)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line = String::from_utf8_lossy(&buffer[..pos]).trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    return Some((Ok(line), (byte_stream, buffer, ended)));
                }

                if ended {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        ended = true;
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer, ended),
                        ));
                    }
                    None => {
                        ended = true;
                        let tail = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if tail.is_empty() {
                            return None;
                        }
                        return Some((Ok(tail), (byte_stream, buffer, ended)));
                    }
                }
            }
        },
    )
}

// ─── Non-streaming ───────────────────────────────────────────────────────────

/// Parse a non-streaming chat-completion body into a single chunk.
pub fn parse_non_streaming_response(body: &str) -> Result<StreamChunk, InferenceError> {
    #[derive(Deserialize)]
    struct NonStreamResponse {
        choices: Vec<NonStreamChoice>,
        #[serde(default)]
        usage: Option<WireUsage>,
    }

    #[derive(Deserialize)]
    struct NonStreamChoice {
        message: NonStreamMessage,
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct NonStreamMessage {
        content: Option<String>,
        tool_calls: Option<Vec<NonStreamToolCall>>,
    }

    #[derive(Deserialize)]
    struct NonStreamToolCall {
        id: Option<String>,
        function: NonStreamFunction,
    }

    #[derive(Deserialize)]
    struct NonStreamFunction {
        name: String,
        #[serde(default)]
        arguments: String,
    }

    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse non-streaming response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::StreamError {
            reason: "empty choices array".into(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            parse_native_json_tool_call(tc.id.as_deref(), &tc.function.name, &tc.function.arguments)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let finish_reason = if tool_calls.is_empty() {
        choice.finish_reason
    } else {
        Some("tool_calls".into())
    };

    Ok(StreamChunk {
        token: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        finish_reason,
        usage: resp.usage.map(TokenUsage::from),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
