//! Agent Core — session orchestration for the assistant pane.
//!
//! Submodules:
//! - `orchestrator`: Send / cancel / mode switching over one conversation
//! - `conversation`: Message list, sanitation, placeholder bookkeeping
//! - `accumulator`: Folds streamed text into the placeholder
//! - `cancellation`: Single active session and its cancel token
//! - `preferences`: Persisted selections and provider/model/endpoint resolution
//! - `errors`: Session-level error taxonomy

pub mod accumulator;
pub mod cancellation;
pub mod conversation;
pub mod errors;
pub mod orchestrator;
pub mod preferences;

// Re-exports for convenience
pub use conversation::Conversation;
pub use errors::{AssistantError, PreferenceError};
pub use orchestrator::{Orchestrator, SessionEvent, SessionPhase};
pub use preferences::{
    resolve, Endpoint, InMemoryPreferenceStore, PreferenceRecord, PreferenceStore, Resolution,
    Selection, SqlitePreferenceStore, UnresolvedReason,
};
