//! Cancellation controller.
//!
//! Tracks the single active session and pairs it with a local
//! [`CancellationToken`]. Cancelling is advisory toward the backend: the
//! local token fires and the caller cleans up immediately, while the backend
//! signal is best effort. A backend that reports the session as unknown has
//! simply finished first.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::errors::AssistantError;
use crate::inference::backend::InferenceBackend;
use crate::inference::types::{ModelConfig, ModelProvider};

/// One in-flight request, from mint to retirement.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub id: String,
    pub model_id: String,
    pub provider: ModelProvider,
    /// Id of the streaming placeholder message.
    pub placeholder_id: String,
    pub token: CancellationToken,
    pub started_at: Instant,
}

/// Holds at most one active session.
#[derive(Debug, Default)]
pub struct CancellationController {
    active: Option<ActiveSession>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a session id and make it the active session.
    ///
    /// Fails with `SessionBusy` while another session is still active.
    pub fn begin(
        &mut self,
        model: &ModelConfig,
        placeholder_id: &str,
    ) -> Result<ActiveSession, AssistantError> {
        if let Some(active) = &self.active {
            return Err(AssistantError::SessionBusy {
                session_id: active.id.clone(),
            });
        }

        let session = ActiveSession {
            id: format!("session-{}", Uuid::new_v4()),
            model_id: model.id.clone(),
            provider: model.provider,
            placeholder_id: placeholder_id.to_string(),
            token: CancellationToken::new(),
            started_at: Instant::now(),
        };
        self.active = Some(session.clone());
        Ok(session)
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.as_ref().is_some_and(|s| s.id == session_id)
    }

    /// Retire `session_id` if it is still the active session.
    pub fn retire(&mut self, session_id: &str) -> Option<ActiveSession> {
        if self.is_active(session_id) {
            self.active.take()
        } else {
            None
        }
    }

    /// Retire the active session for cancellation and fire its local token.
    pub fn take_for_cancel(&mut self) -> Option<ActiveSession> {
        let session = self.active.take()?;
        session.token.cancel();
        Some(session)
    }
}

/// Ask the backend to stop `session_id`. Never fails.
pub async fn signal_backend(backend: &dyn InferenceBackend, session_id: &str) {
    match backend.cancel_inference(session_id).await {
        Ok(()) => {
            tracing::info!(session_id, "backend acknowledged cancel");
        }
        Err(e) if e.is_session_not_found() => {
            tracing::debug!(session_id, "cancel raced completion, session already finished");
        }
        Err(e) => {
            tracing::warn!(session_id, error = %e, "backend cancel failed, local state already cleared");
        }
    }
}
