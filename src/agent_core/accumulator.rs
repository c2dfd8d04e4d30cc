//! Streaming accumulator — folds one session's text deltas into a message.
//!
//! Streamed text is a progressive preview. The backend's final payload is
//! authoritative and overwrites whatever was accumulated, unless it is empty,
//! in which case the accumulated buffer is kept.

use crate::inference::tool_call_parser::strip_markup;

/// Running state of one session's response text.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    buffer: String,
    chunks: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the text to display.
    ///
    /// The first non-empty fragment starts the buffer, so the placeholder's
    /// provisional text is replaced rather than appended to.
    pub fn push_chunk(&mut self, chunk: &str) -> &str {
        if !chunk.is_empty() {
            self.buffer.push_str(chunk);
            self.chunks += 1;
        }
        &self.buffer
    }

    /// Whether any text has arrived for this session.
    pub fn has_content(&self) -> bool {
        self.chunks > 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Pick the final text and clean tool markup out of it.
    pub fn finalize(self, authoritative: &str) -> String {
        let text = if authoritative.is_empty() {
            if !self.buffer.is_empty() {
                tracing::debug!(
                    chunks = self.chunks,
                    "empty final payload, keeping streamed text"
                );
            }
            self.buffer
        } else {
            authoritative.to_string()
        };
        strip_markup(&text)
    }
}
