//! Session orchestrator.
//!
//! Turns a user message into one dispatched inference session:
//! 1. **Sanitize** the conversation and append the user message
//! 2. **Mint** a session and insert a streaming placeholder
//! 3. **Dispatch** through the plain path (QA) or the tool path (Agent)
//! 4. **Accumulate** chunks and tool events into the placeholder
//! 5. **Finalize** with the authoritative text, or roll back on cancel/error
//!
//! Every conversation mutation goes through the orchestrator's state lock,
//! which is never held across an await. Only one session is in flight at a
//! time; a second `send` is rejected with `SessionBusy`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;

use super::accumulator::StreamAccumulator;
use super::cancellation::{signal_backend, ActiveSession, CancellationController};
use super::conversation::{placeholder_message, Conversation};
use super::errors::AssistantError;
use super::preferences::{
    resolve, PreferenceRecord, PreferenceStore, Resolution, Selection, UnresolvedReason,
};
use crate::inference::backend::{InferenceBackend, InferenceEvent, InferenceStream};
use crate::inference::config::StaticConfig;
use crate::inference::errors::InferenceError;
use crate::inference::types::{
    AiMode, ChatMessage, FileSystemContext, InferenceRequest, InferenceResponse, ModelConfig,
    ModelProvider, ToolExecutionEvent, ToolExecutionStatus,
};

/// Buffered events per subscriber before slow receivers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ─── Phases & Events ────────────────────────────────────────────────────────

/// Where the orchestrator is in the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Sending,
    Streaming,
    ToolExecuting,
    Finalizing,
    Cancelled,
    Errored,
}

impl SessionPhase {
    /// `Idle → Sending → Streaming ⇄ ToolExecuting → Finalizing → Idle`, with
    /// `Cancelled`/`Errored` exits from the three in-flight phases.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Idle, Sending)
                | (Sending, Streaming)
                | (Streaming, ToolExecuting)
                | (ToolExecuting, Streaming)
                | (Streaming, Finalizing)
                | (Finalizing, Idle)
                | (Sending | Streaming | ToolExecuting, Cancelled | Errored)
                | (Cancelled | Errored, Idle)
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            SessionPhase::Sending
                | SessionPhase::Streaming
                | SessionPhase::ToolExecuting
                | SessionPhase::Finalizing
        )
    }
}

/// Observable changes, for whatever renders the conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseChanged {
        session_id: Option<String>,
        from: SessionPhase,
        to: SessionPhase,
    },
    /// The streaming placeholder changed (text or tool records).
    MessageUpdated {
        session_id: String,
        message: ChatMessage,
    },
    MessageRemoved {
        message_id: String,
    },
    /// A message became part of the permanent record.
    MessageCommitted {
        message: ChatMessage,
    },
    SelectionChanged {
        mode: AiMode,
        model_id: Option<String>,
        provider: Option<ModelProvider>,
    },
}

// ─── State ──────────────────────────────────────────────────────────────────

struct SessionState {
    conversation: Conversation,
    phase: SessionPhase,
    sessions: CancellationController,
    models: Vec<ModelConfig>,
    resolution: Resolution,
}

/// How the event loop of one session ended.
enum Outcome {
    /// `None` when the stream ended without a final payload.
    Completed(Option<InferenceResponse>),
    Failed(InferenceError),
    Cancelled,
}

/// Drives inference sessions for one conversation.
pub struct Orchestrator {
    backend: Arc<dyn InferenceBackend>,
    store: Arc<dyn PreferenceStore>,
    config: StaticConfig,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Orchestrator {
    /// Create an orchestrator and resolve the initial selection for `mode`.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        store: Arc<dyn PreferenceStore>,
        config: StaticConfig,
        models: Vec<ModelConfig>,
        mode: AiMode,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let resolution = resolve(mode, &models, store.as_ref(), &config);
        let mut conversation = Conversation::new(mode);
        if let Some(selection) = resolution.selection() {
            conversation.set_selection(Some(selection.model.id.clone()), Some(selection.provider));
        }

        Self {
            backend,
            store,
            config,
            state: Mutex::new(SessionState {
                conversation,
                phase: SessionPhase::Idle,
                sessions: CancellationController::new(),
                models,
                resolution,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // ─── Queries ────────────────────────────────────────────────────────

    /// Copy of the conversation's messages.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.lock().conversation.messages().to_vec()
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    pub fn is_loading(&self) -> bool {
        let state = self.lock();
        state.phase.is_in_flight() || state.sessions.active().is_some()
    }

    pub fn mode(&self) -> AiMode {
        self.lock().conversation.mode()
    }

    pub fn resolution(&self) -> Resolution {
        self.lock().resolution.clone()
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.lock().sessions.active().map(|s| s.id.clone())
    }

    pub fn available_models(&self) -> Vec<ModelConfig> {
        self.lock().models.clone()
    }

    // ─── Phase Machine ──────────────────────────────────────────────────

    fn transition(&self, state: &mut SessionState, session_id: Option<&str>, to: SessionPhase) {
        let from = state.phase;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            tracing::warn!(?from, ?to, session_id, "ignoring illegal session phase transition");
            return;
        }
        state.phase = to;
        self.emit(SessionEvent::PhaseChanged {
            session_id: session_id.map(String::from),
            from,
            to,
        });
    }

    fn enter_streaming(&self, state: &mut SessionState, session_id: &str) {
        if matches!(state.phase, SessionPhase::Sending | SessionPhase::ToolExecuting) {
            self.transition(state, Some(session_id), SessionPhase::Streaming);
        }
    }

    // ─── Selection ──────────────────────────────────────────────────────

    fn re_resolve(&self, state: &mut SessionState) {
        let mode = state.conversation.mode();
        state.resolution = resolve(mode, &state.models, self.store.as_ref(), &self.config);

        let (model_id, provider) = match state.resolution.selection() {
            Some(sel) => (Some(sel.model.id.clone()), Some(sel.provider)),
            None => (None, None),
        };
        state.conversation.set_selection(model_id.clone(), provider);
        tracing::info!(mode = %mode, model = ?model_id, provider = ?provider, "model selection resolved");
        self.emit(SessionEvent::SelectionChanged {
            mode,
            model_id,
            provider,
        });
    }

    /// Switch mode and re-resolve its provider and model. History is kept.
    pub fn change_mode(&self, mode: AiMode) -> Resolution {
        let mut state = self.lock();
        state.conversation.set_mode(mode);
        self.re_resolve(&mut state);
        state.resolution.clone()
    }

    /// Pin a catalog model for the current mode and persist it.
    pub fn select_model(&self, model_id: &str) -> Result<Selection, AssistantError> {
        let mut state = self.lock();
        let mode = state.conversation.mode();
        let model = state
            .models
            .iter()
            .find(|m| m.matches_key(model_id))
            .cloned()
            .ok_or_else(|| AssistantError::UnknownModel {
                model_id: model_id.to_string(),
            })?;

        let mut record = PreferenceRecord::load(self.store.as_ref(), mode);
        record.provider = Some(model.provider);
        record.model_id = Some(model.id.clone());
        record.save(self.store.as_ref(), mode)?;

        self.re_resolve(&mut state);
        state
            .resolution
            .selection()
            .cloned()
            .ok_or(AssistantError::ModelNotSelected { mode })
    }

    /// Persist (or clear, with `None`) a custom endpoint for `provider` in
    /// the current mode.
    pub fn set_provider_endpoint(
        &self,
        provider: ModelProvider,
        endpoint: Option<&str>,
    ) -> Result<Resolution, AssistantError> {
        let mut state = self.lock();
        let mode = state.conversation.mode();

        let mut record = PreferenceRecord::load(self.store.as_ref(), mode);
        match endpoint.map(str::trim).filter(|e| !e.is_empty()) {
            Some(url) => {
                record.endpoints.insert(provider, url.to_string());
            }
            None => {
                record.endpoints.remove(&provider);
            }
        }
        record.save(self.store.as_ref(), mode)?;

        self.re_resolve(&mut state);
        Ok(state.resolution.clone())
    }

    /// Replace the model catalog. Re-resolves when the selected model is no
    /// longer listed or nothing was resolved before.
    pub fn set_available_models(&self, models: Vec<ModelConfig>) -> Resolution {
        let mut state = self.lock();
        let still_listed = state
            .resolution
            .selection()
            .is_some_and(|sel| models.iter().any(|m| m.id == sel.model.id));
        state.models = models;
        if !still_listed {
            self.re_resolve(&mut state);
        }
        state.resolution.clone()
    }

    // ─── History ────────────────────────────────────────────────────────

    /// Replace the conversation with previously saved messages.
    pub fn restore_history(&self, messages: Vec<ChatMessage>) -> Result<(), AssistantError> {
        let mut state = self.lock();
        if let Some(active) = state.sessions.active() {
            return Err(AssistantError::SessionBusy {
                session_id: active.id.clone(),
            });
        }
        let mode = state.conversation.mode();
        let (model_id, provider) = (
            state.conversation.selected_model_id().map(String::from),
            state.conversation.active_provider(),
        );
        state.conversation = Conversation::from_messages(mode, messages);
        state.conversation.set_selection(model_id, provider);
        Ok(())
    }

    /// Empty the conversation. Refused while a session is in flight.
    pub fn clear_conversation(&self) -> Result<(), AssistantError> {
        let mut state = self.lock();
        if let Some(active) = state.sessions.active() {
            return Err(AssistantError::SessionBusy {
                session_id: active.id.clone(),
            });
        }
        state.conversation.clear();
        Ok(())
    }

    // ─── Send ───────────────────────────────────────────────────────────

    /// Send a user message and drive the session to its end.
    ///
    /// Returns the committed assistant message. Failures return the error
    /// after a terminal error message has been appended; cancellation
    /// returns `CancelledByUser` and leaves no assistant message behind.
    /// `SessionBusy`, `ModelNotSelected` and `ConfigurationInvalid` are
    /// returned before the conversation is touched.
    pub async fn send(
        &self,
        text: &str,
        fs_context: Option<FileSystemContext>,
    ) -> Result<ChatMessage, AssistantError> {
        let (session, request) = self.begin_session(text, fs_context)?;
        let mode = request.mode;

        let (accumulator, outcome) = self.drive(&session, request).await;
        self.finish(&session, mode, accumulator, outcome)
    }

    fn begin_session(
        &self,
        text: &str,
        fs_context: Option<FileSystemContext>,
    ) -> Result<(ActiveSession, InferenceRequest), AssistantError> {
        let mut state = self.lock();

        if let Some(active) = state.sessions.active() {
            return Err(AssistantError::SessionBusy {
                session_id: active.id.clone(),
            });
        }

        let mode = state.conversation.mode();
        let selection = match &state.resolution {
            Resolution::Resolved(selection) => selection,
            Resolution::Unresolved(UnresolvedReason::EmptyCatalog) => {
                return Err(AssistantError::ConfigurationInvalid { mode })
            }
            Resolution::Unresolved(UnresolvedReason::NoCandidate) => {
                return Err(AssistantError::ModelNotSelected { mode })
            }
        };

        let mut model = selection.effective_model();
        if model.api_key.is_none() {
            model.api_key = self.config.api_key_for(model.provider).map(String::from);
        }

        state.conversation.sanitize();
        let context_paths = fs_context.as_ref().map(|c| c.selected_paths.clone());
        let user = state.conversation.push_user(text, context_paths).clone();
        let messages = state.conversation.messages().to_vec();

        let placeholder = placeholder_message();
        let session = state.sessions.begin(&model, &placeholder.id)?;
        let placeholder = state.conversation.push_placeholder(placeholder).clone();

        self.emit(SessionEvent::MessageCommitted { message: user });
        self.emit(SessionEvent::MessageUpdated {
            session_id: session.id.clone(),
            message: placeholder,
        });
        self.transition(&mut state, Some(&session.id), SessionPhase::Sending);

        tracing::info!(
            session_id = %session.id,
            mode = %mode,
            provider = %model.provider,
            model = %model.id,
            history = messages.len(),
            "dispatching inference session"
        );

        let request = InferenceRequest {
            session_id: session.id.clone(),
            model_config: model,
            messages,
            fs_context,
            mode,
        };
        Ok((session, request))
    }

    async fn dispatch(&self, request: InferenceRequest) -> Result<InferenceStream, InferenceError> {
        match request.mode {
            AiMode::Agent => self.backend.run_inference_with_tools(request).await,
            AiMode::Qa => self.backend.run_inference(request).await,
        }
    }

    /// Consume the session's event stream until it ends or is cancelled.
    async fn drive(
        &self,
        session: &ActiveSession,
        request: InferenceRequest,
    ) -> (StreamAccumulator, Outcome) {
        let mut accumulator = StreamAccumulator::new();
        let token = session.token.clone();

        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return (accumulator, Outcome::Cancelled),
            dispatched = self.dispatch(request) => match dispatched {
                Ok(stream) => stream,
                Err(e) => return (accumulator, Outcome::Failed(e)),
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return (accumulator, Outcome::Cancelled),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(InferenceEvent::Chunk(text))) => {
                    if !self.apply_chunk(session, &mut accumulator, &text) {
                        return (accumulator, Outcome::Cancelled);
                    }
                }
                Some(Ok(InferenceEvent::ToolExecution(event))) => {
                    if !self.apply_tool_event(session, &event) {
                        return (accumulator, Outcome::Cancelled);
                    }
                }
                Some(Ok(InferenceEvent::Completed(response))) => {
                    return (accumulator, Outcome::Completed(Some(response)))
                }
                Some(Err(e)) => return (accumulator, Outcome::Failed(e)),
                None => return (accumulator, Outcome::Completed(None)),
            }
        }
    }

    /// Returns false once the session is no longer active.
    fn apply_chunk(
        &self,
        session: &ActiveSession,
        accumulator: &mut StreamAccumulator,
        chunk: &str,
    ) -> bool {
        let mut state = self.lock();
        if !state.sessions.is_active(&session.id) {
            return false;
        }
        if chunk.is_empty() {
            return true;
        }

        let text = accumulator.push_chunk(chunk);
        self.enter_streaming(&mut state, &session.id);
        if let Some(message) = state
            .conversation
            .set_streaming_text(&session.placeholder_id, text)
            .cloned()
        {
            self.emit(SessionEvent::MessageUpdated {
                session_id: session.id.clone(),
                message,
            });
        }
        true
    }

    /// Returns false once the session is no longer active.
    fn apply_tool_event(&self, session: &ActiveSession, event: &ToolExecutionEvent) -> bool {
        let mut state = self.lock();
        if !state.sessions.is_active(&session.id) {
            return false;
        }

        tracing::debug!(
            session_id = %session.id,
            tool = %event.tool_name,
            status = ?event.status(),
            "tool execution event"
        );

        let Some(message) = state
            .conversation
            .apply_tool_event(&session.placeholder_id, event)
            .cloned()
        else {
            return true;
        };

        if let Some(reason) = &event.error {
            let failure = AssistantError::ToolExecutionFailed {
                tool_name: event.tool_name.clone(),
                reason: reason.clone(),
            };
            tracing::warn!(session_id = %session.id, error = %failure, "tool failed, session continues");
        }

        let still_running = message
            .tool_executions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|t| t.status == ToolExecutionStatus::Executing);

        self.enter_streaming(&mut state, &session.id);
        if still_running {
            self.transition(&mut state, Some(&session.id), SessionPhase::ToolExecuting);
        }

        self.emit(SessionEvent::MessageUpdated {
            session_id: session.id.clone(),
            message,
        });
        true
    }

    fn finish(
        &self,
        session: &ActiveSession,
        mode: AiMode,
        accumulator: StreamAccumulator,
        outcome: Outcome,
    ) -> Result<ChatMessage, AssistantError> {
        let mut state = self.lock();

        // A cancel already retired the session and cleaned up.
        if !state.sessions.is_active(&session.id) {
            return Err(AssistantError::CancelledByUser);
        }

        let error = match outcome {
            Outcome::Completed(response) => {
                return self.commit(&mut state, session, mode, accumulator, response)
            }
            Outcome::Cancelled => AssistantError::CancelledByUser,
            Outcome::Failed(e) => AssistantError::from_dispatch(e, accumulator.has_content()),
        };

        if let Some(removed) = state.conversation.remove_message(&session.placeholder_id) {
            self.emit(SessionEvent::MessageRemoved {
                message_id: removed.id,
            });
        }

        if error.is_cancellation() {
            tracing::info!(session_id = %session.id, "session cancelled by backend");
            self.transition(&mut state, Some(&session.id), SessionPhase::Cancelled);
        } else {
            tracing::warn!(
                session_id = %session.id,
                mode = %mode,
                chunks = accumulator.chunk_count(),
                error = %error,
                "inference session failed"
            );
            let message = state.conversation.push_error(&error.user_summary()).clone();
            self.emit(SessionEvent::MessageCommitted { message });
            self.transition(&mut state, Some(&session.id), SessionPhase::Errored);
        }

        state.sessions.retire(&session.id);
        self.transition(&mut state, Some(&session.id), SessionPhase::Idle);
        Err(error)
    }

    fn commit(
        &self,
        state: &mut SessionState,
        session: &ActiveSession,
        mode: AiMode,
        accumulator: StreamAccumulator,
        response: Option<InferenceResponse>,
    ) -> Result<ChatMessage, AssistantError> {
        self.enter_streaming(state, &session.id);
        self.transition(state, Some(&session.id), SessionPhase::Finalizing);

        let chunks = accumulator.chunk_count();
        let authoritative = response
            .as_ref()
            .map(|r| r.message.content.as_str())
            .unwrap_or_default();
        let text = accumulator.finalize(authoritative);

        let committed = state
            .conversation
            .commit_streaming(&session.placeholder_id, text)
            .cloned();
        state.sessions.retire(&session.id);
        self.transition(state, Some(&session.id), SessionPhase::Idle);

        let Some(message) = committed else {
            tracing::warn!(session_id = %session.id, "placeholder vanished before commit");
            return Err(AssistantError::CancelledByUser);
        };

        if !state.conversation.is_alternating() {
            tracing::debug!(session_id = %session.id, "conversation roles no longer alternate");
        }

        tracing::info!(
            session_id = %session.id,
            mode = %mode,
            chunks,
            chars = message.content.len(),
            tools = message.tool_executions.as_ref().map(Vec::len).unwrap_or(0),
            total_tokens = response.as_ref().and_then(|r| r.usage).map(|u| u.total_tokens),
            elapsed_ms = session.started_at.elapsed().as_millis() as u64,
            "inference session completed"
        );
        self.emit(SessionEvent::MessageCommitted {
            message: message.clone(),
        });
        Ok(message)
    }

    // ─── Cancel ─────────────────────────────────────────────────────────

    /// Cancel the active session, if any.
    ///
    /// Local state is cleaned up before the backend is signalled, so the
    /// orchestrator is idle as soon as this returns, whatever the backend
    /// answers. Returns false when nothing was in flight.
    pub async fn cancel(&self) -> bool {
        let session = {
            let mut state = self.lock();
            let Some(session) = state.sessions.take_for_cancel() else {
                tracing::debug!("cancel requested with no active session");
                return false;
            };

            if let Some(removed) = state.conversation.remove_message(&session.placeholder_id) {
                self.emit(SessionEvent::MessageRemoved {
                    message_id: removed.id,
                });
            }
            self.transition(&mut state, Some(&session.id), SessionPhase::Cancelled);
            self.transition(&mut state, Some(&session.id), SessionPhase::Idle);
            session
        };

        tracing::info!(
            session_id = %session.id,
            elapsed_ms = session.started_at.elapsed().as_millis() as u64,
            "session cancelled"
        );
        signal_backend(self.backend.as_ref(), &session.id).await;
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
