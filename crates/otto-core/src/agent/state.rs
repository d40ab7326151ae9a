//! Shared conversation state
//!
//! One `SharedState` per conversation, behind a tokio mutex. The main
//! loop holds the lock across its own mutations; detached hook-driven
//! tool executions take it briefly to append display entries. The API
//! message list and the display history always move together.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::agent::history::{ChatEntry, EntryKind, RephraseState};
use crate::agent::tokens::TokenAccounting;
use crate::ai::types::ChatMessage;
use crate::session::SessionState;

pub type Shared = Arc<Mutex<SharedState>>;

pub struct SharedState {
    /// Messages sent to the backend, ordering-invariant maintained.
    pub messages: Vec<ChatMessage>,
    /// Display history shown to the user.
    pub history: Vec<ChatEntry>,
    pub session: SessionState,
    pub tokens: TokenAccounting,
    /// System notices produced mid-round; flushed only after the
    /// round's last tool result so tool_calls stay adjacent to their
    /// results.
    pub pending_system: Vec<String>,
    /// Assistant prefill requested by a hook, consumed next request.
    pub prefill: Option<String>,
    pub rephrase: Option<RephraseState>,
}

impl SharedState {
    pub fn new(session: SessionState) -> Self {
        let tokens = TokenAccounting::for_backend(&session.backend);
        Self {
            messages: Vec::new(),
            history: Vec::new(),
            session,
            tokens,
            pending_system: Vec::new(),
            prefill: None,
            rephrase: None,
        }
    }

    pub fn shared(session: SessionState) -> Shared {
        Arc::new(Mutex::new(Self::new(session)))
    }

    /// Append a system message to both lists immediately. Only safe
    /// between rounds; mid-round notices go through `pending_system`.
    pub fn push_system_now(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.messages.push(ChatMessage::system(text.clone()));
        self.history.push(ChatEntry::new(EntryKind::System, text));
    }

    /// Flush deferred notices after a round's tool results.
    pub fn flush_pending_system(&mut self) {
        let pending = std::mem::take(&mut self.pending_system);
        for text in pending {
            self.push_system_now(text);
        }
    }

    /// Truncate both lists in lock-step and reseed the system prompt.
    pub fn clear_context(&mut self, system_prompt: &str) {
        self.messages.clear();
        self.history.clear();
        self.messages.push(ChatMessage::system(system_prompt));
        self.history
            .push(ChatEntry::new(EntryKind::System, "Initializing fresh context"));
        self.tokens.note_cleared();
        self.rephrase = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SharedState {
        SharedState::new(SessionState::new(
            "openai",
            "gpt-4o",
            "https://api.openai.com/v1",
            "OPENAI_API_KEY",
        ))
    }

    #[test]
    fn pending_system_flushes_in_order() {
        let mut state = state();
        state.pending_system.push("first".to_string());
        state.pending_system.push("second".to_string());
        state.flush_pending_system();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].content.as_deref(), Some("first"));
        assert!(state.pending_system.is_empty());
    }

    #[test]
    fn clear_context_truncates_both_lists() {
        let mut state = state();
        state.messages.push(ChatMessage::user("hello"));
        state.history.push(ChatEntry::new(EntryKind::User, "hello"));
        state.clear_context("you are otto");
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.messages[0].content.as_deref(), Some("you are otto"));
    }
}
