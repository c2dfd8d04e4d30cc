//! Conversation — the ordered message list of one assistant pane.
//!
//! Responsibilities:
//! - Sanitize history before a send (drop leftovers of interrupted attempts)
//! - Own the streaming placeholder and its tool-execution records
//! - Commit, remove or replace the placeholder when a session ends
//!
//! Only the orchestrator mutates a conversation. Outside of an in-flight
//! session, user and assistant messages alternate and at most one message
//! carries the streaming flag.

use crate::inference::types::{
    AiMode, ChatMessage, MessageRole, ModelProvider, ToolExecution, ToolExecutionEvent,
    ToolExecutionStatus,
};

/// Provisional text of the placeholder until the first chunk arrives.
pub const PLACEHOLDER_TEXT: &str = "Working…";

/// Error recorded on a tool that was still executing when its message committed.
pub const UNFINISHED_TOOL_ERROR: &str = "tool did not finish";

#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    mode: AiMode,
    selected_model_id: Option<String>,
    active_provider: Option<ModelProvider>,
}

impl Conversation {
    pub fn new(mode: AiMode) -> Self {
        Self::from_messages(mode, Vec::new())
    }

    /// Restore a conversation from previously saved messages.
    pub fn from_messages(mode: AiMode, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            mode,
            selected_model_id: None,
            active_provider: None,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn mode(&self) -> AiMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: AiMode) {
        self.mode = mode;
    }

    pub fn selected_model_id(&self) -> Option<&str> {
        self.selected_model_id.as_deref()
    }

    pub fn active_provider(&self) -> Option<ModelProvider> {
        self.active_provider
    }

    pub fn set_selection(&mut self, model_id: Option<String>, provider: Option<ModelProvider>) {
        self.selected_model_id = model_id;
        self.active_provider = provider;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    // ─── Sanitation ─────────────────────────────────────────────────────

    /// Drop the remains of an interrupted or failed attempt from the tail.
    ///
    /// - a trailing streaming message is dropped; the user message it was
    ///   answering stays
    /// - a trailing assistant error is dropped together with the user
    ///   message it answered
    /// - an unanswered trailing user message is dropped
    ///
    /// Returns the number of messages removed.
    pub fn sanitize(&mut self) -> usize {
        let before = self.messages.len();

        if self.messages.last().is_some_and(ChatMessage::is_streaming) {
            self.messages.pop();
        } else {
            if self
                .messages
                .last()
                .is_some_and(|m| m.role == MessageRole::Assistant && m.has_error())
            {
                self.messages.pop();
            }
            if self.messages.last().is_some_and(|m| m.role == MessageRole::User) {
                self.messages.pop();
            }
        }

        let removed = before - self.messages.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.messages.len(), "sanitized conversation tail");
        }
        removed
    }

    // ─── Appending ──────────────────────────────────────────────────────

    pub fn push_user(&mut self, text: &str, context_paths: Option<Vec<String>>) -> &ChatMessage {
        let mut message = ChatMessage::user(text);
        message.context_paths = context_paths.filter(|p| !p.is_empty());
        self.push(message)
    }

    /// Append the streaming placeholder.
    pub fn push_placeholder(&mut self, placeholder: ChatMessage) -> &ChatMessage {
        self.push(placeholder)
    }

    /// Append a terminal assistant message describing a failure.
    pub fn push_error(&mut self, summary: &str) -> &ChatMessage {
        let mut message = ChatMessage::assistant(summary);
        message.error = Some(summary.to_string());
        self.push(message)
    }

    fn push(&mut self, message: ChatMessage) -> &ChatMessage {
        let index = self.messages.len();
        self.messages.push(message);
        &self.messages[index]
    }

    // ─── Placeholder ────────────────────────────────────────────────────

    fn streaming_mut(&mut self, message_id: &str) -> Option<&mut ChatMessage> {
        self.messages
            .iter_mut()
            .find(|m| m.id == message_id && m.is_streaming())
    }

    /// Replace the placeholder's visible text.
    pub fn set_streaming_text(&mut self, message_id: &str, text: &str) -> Option<&ChatMessage> {
        let message = self.streaming_mut(message_id)?;
        message.content = text.to_string();
        Some(message)
    }

    /// Record a tool start or finish on the placeholder.
    ///
    /// A finish event updates the matching `Executing` record: by call id
    /// when the event carries one, otherwise the most recent executing record
    /// with the same tool name and arguments. Terminal records are never
    /// reopened.
    pub fn apply_tool_event(
        &mut self,
        message_id: &str,
        event: &ToolExecutionEvent,
    ) -> Option<&ChatMessage> {
        let message = self.streaming_mut(message_id)?;
        let records = message.tool_executions.get_or_insert_with(Vec::new);
        let status = event.status();

        let existing = match &event.call_id {
            Some(call_id) => records
                .iter()
                .rposition(|r| r.call_id.as_deref() == Some(call_id.as_str())),
            None => records.iter().rposition(|r| {
                r.status == ToolExecutionStatus::Executing
                    && r.tool_name == event.tool_name
                    && r.arguments == event.arguments
            }),
        };

        match (existing, status) {
            (Some(i), _) if records[i].status.is_terminal() => {
                tracing::debug!(tool = %event.tool_name, "ignoring event for finished tool execution");
            }
            (Some(_), ToolExecutionStatus::Executing) => {
                tracing::debug!(tool = %event.tool_name, "duplicate tool start");
            }
            (Some(i), _) => {
                let record = &mut records[i];
                record.result = event.result.clone();
                record.error = event.error.clone();
                record.execution_time_ms = event.execution_time_ms;
                record.status = status;
            }
            (None, _) => records.push(ToolExecution {
                call_id: event.call_id.clone(),
                tool_name: event.tool_name.clone(),
                arguments: event.arguments.clone(),
                result: event.result.clone(),
                error: event.error.clone(),
                execution_time_ms: event.execution_time_ms,
                status,
            }),
        }

        Some(message)
    }

    /// Commit the placeholder with its final text and clear the streaming flag.
    ///
    /// Tools that never reported a finish are closed as errors, since the
    /// committed message is immutable.
    pub fn commit_streaming(&mut self, message_id: &str, text: String) -> Option<&ChatMessage> {
        let message = self.streaming_mut(message_id)?;
        for record in message.tool_executions.iter_mut().flatten() {
            if record.status == ToolExecutionStatus::Executing {
                tracing::warn!(tool = %record.tool_name, "tool still running at commit");
                record.status = ToolExecutionStatus::Error;
                record.error = Some(UNFINISHED_TOOL_ERROR.to_string());
            }
        }
        message.content = text;
        message.is_streaming = None;
        Some(message)
    }

    pub fn remove_message(&mut self, message_id: &str) -> Option<ChatMessage> {
        let index = self.messages.iter().position(|m| m.id == message_id)?;
        Some(self.messages.remove(index))
    }

    // ─── Invariants ─────────────────────────────────────────────────────

    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_streaming()).count()
    }

    /// Whether user and assistant messages strictly alternate.
    pub fn is_alternating(&self) -> bool {
        let roles: Vec<MessageRole> = self
            .messages
            .iter()
            .map(|m| m.role)
            .filter(|r| *r != MessageRole::System)
            .collect();
        roles.windows(2).all(|w| w[0] != w[1])
    }
}

/// A fresh placeholder message.
pub fn placeholder_message() -> ChatMessage {
    let mut message = ChatMessage::assistant(PLACEHOLDER_TEXT);
    message.is_streaming = Some(true);
    message
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn streaming(text: &str) -> ChatMessage {
        let mut m = ChatMessage::assistant(text);
        m.is_streaming = Some(true);
        m
    }

    fn errored(text: &str) -> ChatMessage {
        let mut m = ChatMessage::assistant(text);
        m.error = Some(text.into());
        m
    }

    fn contents(c: &Conversation) -> Vec<&str> {
        c.messages().iter().map(|m| m.content.as_str()).collect()
    }

    fn event(call_id: Option<&str>, tool: &str) -> ToolExecutionEvent {
        ToolExecutionEvent {
            call_id: call_id.map(String::from),
            tool_name: tool.into(),
            arguments: json!({"path": "/tmp"}).as_object().cloned().unwrap_or_default(),
            result: None,
            error: None,
            execution_time_ms: None,
        }
    }

    #[test]
    fn test_sanitize_drops_streaming_keeps_user() {
        let mut c = Conversation::from_messages(
            AiMode::Qa,
            vec![ChatMessage::user("a"), streaming("b")],
        );
        assert_eq!(c.sanitize(), 1);
        assert_eq!(contents(&c), vec!["a"]);
    }

    #[test]
    fn test_sanitize_drops_orphaned_user() {
        let mut c = Conversation::from_messages(
            AiMode::Qa,
            vec![
                ChatMessage::user("q"),
                ChatMessage::assistant("r"),
                ChatMessage::user("a"),
            ],
        );
        assert_eq!(c.sanitize(), 1);
        assert_eq!(contents(&c), vec!["q", "r"]);
    }

    #[test]
    fn test_sanitize_drops_error_and_its_question() {
        let mut c = Conversation::from_messages(
            AiMode::Qa,
            vec![
                ChatMessage::user("q"),
                ChatMessage::assistant("r"),
                ChatMessage::user("a"),
                errored("Could not connect"),
            ],
        );
        assert_eq!(c.sanitize(), 2);
        assert_eq!(contents(&c), vec!["q", "r"]);
        assert!(c.is_alternating());
    }

    #[test]
    fn test_sanitize_leaves_clean_history() {
        let mut c = Conversation::from_messages(
            AiMode::Qa,
            vec![ChatMessage::user("q"), ChatMessage::assistant("r")],
        );
        assert_eq!(c.sanitize(), 0);
        assert_eq!(Conversation::new(AiMode::Agent).sanitize(), 0);
    }

    #[test]
    fn test_placeholder_lifecycle() {
        let mut c = Conversation::new(AiMode::Qa);
        c.push_user("hi", Some(vec![]));
        assert!(c.messages()[0].context_paths.is_none());

        let placeholder = placeholder_message();
        let id = placeholder.id.clone();
        c.push_placeholder(placeholder);
        assert_eq!(c.streaming_count(), 1);

        c.set_streaming_text(&id, "Hel").unwrap();
        let committed = c.commit_streaming(&id, "Hello".into()).unwrap();
        assert_eq!(committed.content, "Hello");
        assert!(!committed.is_streaming());

        // Committed messages are immutable through the placeholder paths
        assert!(c.set_streaming_text(&id, "again").is_none());
        assert_eq!(c.streaming_count(), 0);
        assert!(c.is_alternating());
    }

    #[test]
    fn test_tool_events_correlate_by_call_id() {
        let mut c = Conversation::new(AiMode::Agent);
        let placeholder = placeholder_message();
        let id = placeholder.id.clone();
        c.push_placeholder(placeholder);

        c.apply_tool_event(&id, &event(Some("call_1"), "list_dir"));
        c.apply_tool_event(&id, &event(Some("call_2"), "list_dir"));

        let mut done = event(Some("call_1"), "list_dir");
        done.result = Some("a.txt".into());
        done.execution_time_ms = Some(12);
        let msg = c.apply_tool_event(&id, &done).unwrap();

        let records = msg.tool_executions.as_ref().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, ToolExecutionStatus::Success);
        assert_eq!(records[0].execution_time_ms, Some(12));
        assert_eq!(records[1].status, ToolExecutionStatus::Executing);
    }

    #[test]
    fn test_tool_events_without_call_id_match_latest_executing() {
        let mut c = Conversation::new(AiMode::Agent);
        let placeholder = placeholder_message();
        let id = placeholder.id.clone();
        c.push_placeholder(placeholder);

        c.apply_tool_event(&id, &event(None, "read_file"));
        let mut failed = event(None, "read_file");
        failed.error = Some("permission denied".into());
        c.apply_tool_event(&id, &failed);

        // A late finish must not reopen the failed record
        let mut late = event(None, "read_file");
        late.result = Some("contents".into());
        let msg = c.apply_tool_event(&id, &late).unwrap();

        let records = msg.tool_executions.as_ref().unwrap();
        assert_eq!(records[0].status, ToolExecutionStatus::Error);
        assert_eq!(records[0].error.as_deref(), Some("permission denied"));
        // No executing record to match, so the late finish is recorded on its own
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_terminal_record_never_reopened() {
        let mut c = Conversation::new(AiMode::Agent);
        let placeholder = placeholder_message();
        let id = placeholder.id.clone();
        c.push_placeholder(placeholder);

        let mut done = event(Some("call_1"), "list_dir");
        done.result = Some("ok".into());
        c.apply_tool_event(&id, &done);
        let msg = c.apply_tool_event(&id, &event(Some("call_1"), "list_dir")).unwrap();

        let records = msg.tool_executions.as_ref().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ToolExecutionStatus::Success);
    }

    #[test]
    fn test_commit_closes_unfinished_tools() {
        let mut c = Conversation::new(AiMode::Agent);
        let placeholder = placeholder_message();
        let id = placeholder.id.clone();
        c.push_placeholder(placeholder);

        c.apply_tool_event(&id, &event(Some("call_1"), "list_dir"));
        let msg = c.commit_streaming(&id, "done".into()).unwrap();

        let records = msg.tool_executions.as_ref().unwrap();
        assert_eq!(records[0].status, ToolExecutionStatus::Error);
        assert_eq!(records[0].error.as_deref(), Some(UNFINISHED_TOOL_ERROR));
        assert!(!msg.is_streaming());
    }

    #[test]
    fn test_push_error_sets_error_field() {
        let mut c = Conversation::new(AiMode::Qa);
        c.push_user("q", None);
        let msg = c.push_error("The model server did not respond.");
        assert!(msg.has_error());
        assert_eq!(msg.role, MessageRole::Assistant);
        assert!(c.is_alternating());
    }

    #[test]
    fn test_is_alternating_detects_consecutive_roles() {
        let c = Conversation::from_messages(
            AiMode::Qa,
            vec![ChatMessage::user("a"), ChatMessage::user("b")],
        );
        assert!(!c.is_alternating());
    }
}
