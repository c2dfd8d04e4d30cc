//! Tool call parsing and markup stripping.
//!
//! Models announce tool calls in one of three shapes:
//!
//! 1. **native** — OpenAI-style `tool_calls` deltas with JSON-encoded
//!    arguments (handled by the stream parser, finalized here).
//!
//! 2. **tagged** — Hermes/Qwen-style JSON wrapped in tags:
//!    ```text
//!    <tool_call>{"name": "read_file", "arguments": {"path": "/tmp/a"}}</tool_call>
//!    ```
//!
//! 3. **bracket** — LFM-style special tokens around a call expression:
//!    ```text
//!    <|tool_call_start|>[read_file(path="/tmp/a")]<|tool_call_end|>
//!    ```
//!
//! Whatever the model emitted, the markup must not reach the user:
//! [`strip_markup`] removes it from finalized text.

use uuid::Uuid;

use super::errors::InferenceError;
use super::types::ToolCall;

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";
const TOKEN_START: &str = "<|tool_call_start|>";
const TOKEN_END: &str = "<|tool_call_end|>";

/// Tag pairs removed by [`strip_markup`], in removal order. The flag marks
/// blocks that are dropped to end of text when the closing tag never came.
const MARKUP_BLOCKS: &[(&str, &str, bool)] = &[
    (TOOL_CALL_OPEN, TOOL_CALL_CLOSE, false),
    ("<tool_response>", "</tool_response>", false),
    ("<function_calls>", "</function_calls>", false),
    (TOKEN_START, TOKEN_END, true),
];

fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

// ─── Native JSON Parsing ─────────────────────────────────────────────────────

/// Parse a tool call from accumulated streaming deltas.
///
/// `name` and `arguments_json` are the concatenated values from all chunks
/// for a single tool call index. Empty arguments mean "no arguments".
pub fn parse_native_json_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, InferenceError> {
    if name.is_empty() {
        return Err(InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: "empty tool name".into(),
        });
    }

    let arguments = if arguments_json.trim().is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(arguments_json).map_err(|e| InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: format!("invalid JSON arguments: {e}"),
        })?
    };

    Ok(ToolCall {
        id: id.map(String::from).unwrap_or_else(new_call_id),
        name: name.to_string(),
        arguments,
    })
}

// ─── Text Formats ────────────────────────────────────────────────────────────

/// Extract tool calls embedded in the text of a finished turn.
///
/// Tries the tagged format first, then bracket special tokens. Returns an
/// empty list when the text carries no markup.
pub fn parse_text_tool_calls(text: &str) -> Result<Vec<ToolCall>, InferenceError> {
    let calls = parse_tagged_tool_calls(text)?;
    if !calls.is_empty() {
        return Ok(calls);
    }
    parse_bracket_special_tokens(text)
}

/// Parse `<tool_call>{json}</tool_call>` blocks.
pub fn parse_tagged_tool_calls(text: &str) -> Result<Vec<ToolCall>, InferenceError> {
    #[derive(serde::Deserialize)]
    struct TaggedCall {
        name: String,
        #[serde(default, alias = "parameters")]
        arguments: Option<serde_json::Value>,
    }

    let mut calls = Vec::new();
    for block in tagged_blocks(text, TOOL_CALL_OPEN, TOOL_CALL_CLOSE) {
        let parsed: TaggedCall =
            serde_json::from_str(block).map_err(|e| InferenceError::ToolCallParseError {
                raw_response: block.to_string(),
                reason: format!("invalid tagged tool call: {e}"),
            })?;

        // Some models double-encode the arguments as a JSON string.
        let arguments = match parsed.arguments {
            Some(serde_json::Value::String(s)) => serde_json::from_str(&s)
                .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new())),
            Some(v) => v,
            None => serde_json::Value::Object(serde_json::Map::new()),
        };

        calls.push(ToolCall {
            id: new_call_id(),
            name: parsed.name,
            arguments,
        });
    }
    Ok(calls)
}

/// Parse `<|tool_call_start|>[name(args)]<|tool_call_end|>` blocks.
pub fn parse_bracket_special_tokens(text: &str) -> Result<Vec<ToolCall>, InferenceError> {
    let mut calls = Vec::new();

    for block in tagged_blocks(text, TOKEN_START, TOKEN_END) {
        // Strip optional outer brackets
        let inner = if block.starts_with('[') && block.ends_with(']') {
            &block[1..block.len() - 1]
        } else {
            block
        };

        if inner.is_empty() {
            continue;
        }

        if let Some(call) = parse_bracket_expression(inner) {
            calls.push(call);
        }
    }

    Ok(calls)
}

/// Trimmed contents of every complete `open…close` block.
fn tagged_blocks<'a>(text: &'a str, open: &str, close: &str) -> Vec<&'a str> {
    let mut blocks = Vec::new();
    let mut search_from = 0;

    while let Some(start_offset) = text[search_from..].find(open) {
        let abs_start = search_from + start_offset + open.len();
        match text[abs_start..].find(close) {
            Some(end_offset) => {
                blocks.push(text[abs_start..abs_start + end_offset].trim());
                search_from = abs_start + end_offset + close.len();
            }
            None => break,
        }
    }

    blocks
}

/// Parse a single bracket expression like `tool(key="value", key2=123)`.
fn parse_bracket_expression(expr: &str) -> Option<ToolCall> {
    let (tool_name, arguments) = match expr.find('(') {
        Some(paren_idx) => {
            let args_str = if expr.ends_with(')') {
                &expr[paren_idx + 1..expr.len() - 1]
            } else {
                &expr[paren_idx + 1..]
            };
            (expr[..paren_idx].trim(), parse_bracket_args(args_str))
        }
        None => (
            expr.trim(),
            serde_json::Value::Object(serde_json::Map::new()),
        ),
    };

    if tool_name.is_empty() {
        return None;
    }

    Some(ToolCall {
        id: new_call_id(),
        name: tool_name.to_string(),
        arguments,
    })
}

/// Parse Python-style kwargs like `key="value", key2=123` into a JSON object.
fn parse_bracket_args(raw: &str) -> serde_json::Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }

    // Some models emit a JSON object inside the parens
    if raw.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(raw) {
            return v;
        }
    }

    let mut map = serde_json::Map::new();
    let mut remaining = raw;

    while !remaining.is_empty() {
        remaining = remaining.trim_start_matches([',', ' ']).trim();
        if remaining.is_empty() {
            break;
        }

        let Some(eq_idx) = remaining.find('=') else {
            break;
        };

        let key = remaining[..eq_idx].trim().trim_matches('"').trim_matches('\'');
        let (value, rest) = parse_bracket_value(&remaining[eq_idx + 1..]);
        map.insert(key.to_string(), value);
        remaining = rest;
    }

    serde_json::Value::Object(map)
}

/// Parse a single kwarg value. Returns `(value, remaining_str)`.
fn parse_bracket_value(input: &str) -> (serde_json::Value, &str) {
    let input = input.trim();

    if input.starts_with('"') || input.starts_with('\'') {
        let quote = input.as_bytes()[0] as char;
        let mut end = 1;
        let mut escaped = false;
        for ch in input[1..].chars() {
            if escaped {
                escaped = false;
                end += ch.len_utf8();
                continue;
            }
            if ch == '\\' {
                escaped = true;
                end += 1;
                continue;
            }
            if ch == quote {
                return (
                    serde_json::Value::String(input[1..end].to_string()),
                    &input[end + 1..],
                );
            }
            end += ch.len_utf8();
        }
        // Unterminated string — take everything
        return (serde_json::Value::String(input[1..].to_string()), "");
    }

    let end_idx = input.find(',').unwrap_or(input.len());
    let val_str = input[..end_idx].trim().trim_end_matches(')');
    let rest = &input[end_idx..];

    if let Ok(n) = val_str.parse::<i64>() {
        return (serde_json::Value::Number(n.into()), rest);
    }
    if let Ok(n) = val_str.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return (serde_json::Value::Number(num), rest);
        }
    }

    match val_str.to_lowercase().as_str() {
        "true" => (serde_json::Value::Bool(true), rest),
        "false" => (serde_json::Value::Bool(false), rest),
        "none" | "null" => (serde_json::Value::Null, rest),
        _ => (serde_json::Value::String(val_str.to_string()), rest),
    }
}

// ─── Markup Stripping ────────────────────────────────────────────────────────

/// Remove tool-invocation markup from finalized assistant text.
///
/// Text without any markup tag is returned as is. If stripping would leave
/// nothing of a non-empty input, the input is returned unchanged: a parsing
/// miss must never erase visible content.
pub fn strip_markup(text: &str) -> String {
    let has_markup = MARKUP_BLOCKS
        .iter()
        .any(|(open, close, _)| text.contains(open) || text.contains(close));
    if !has_markup {
        return text.to_string();
    }

    let mut cleaned = text.to_string();
    for (open, close, to_end) in MARKUP_BLOCKS {
        cleaned = remove_blocks(&cleaned, open, close, *to_end);
    }
    for (open, close, _) in MARKUP_BLOCKS {
        cleaned = cleaned.replace(open, "").replace(close, "");
    }

    let cleaned = collapse_blank_runs(&cleaned).trim().to_string();

    if cleaned.is_empty() {
        tracing::debug!(len = text.len(), "markup stripping emptied text, keeping original");
        return text.to_string();
    }
    cleaned
}

/// Remove every `open…close` block. Unterminated blocks are left for the
/// stray-tag pass unless `to_end` is set, in which case they run to the end.
fn remove_blocks(text: &str, open: &str, close: &str, to_end: bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(open) {
        let after_open = &rest[start + open.len()..];
        match after_open.find(close) {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &after_open[end + close.len()..];
            }
            None if to_end => {
                out.push_str(&rest[..start]);
                rest = "";
            }
            None => break,
        }
    }

    out.push_str(rest);
    out
}

/// Collapse runs of three or more newlines down to one blank line.
fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0;
    for ch in text.chars() {
        if ch == '\n' {
            run += 1;
            if run > 2 {
                continue;
            }
        } else {
            run = 0;
        }
        out.push(ch);
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────
