//! Canonical event protocol for the agent loop.
//!
//! `LoopEvent` is everything the engine emits. Front-ends (the CLI, a
//! server) consume these and map them to their own presentation.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    // ── Streaming ──────────────────────────────────────────────────────
    /// Visible text delta from the model.
    TextDelta { delta: String },

    /// Completed assistant text for the turn.
    AssistantMessage { content: String },

    // ── Tool lifecycle ─────────────────────────────────────────────────
    ToolCallStart { id: String, name: String, arguments: Value },
    ToolExecuting { id: String, name: String },
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },

    // ── Conversation state ─────────────────────────────────────────────
    /// System notice appended to the conversation (warnings, hook
    /// messages, cache-clear notices).
    SystemNotice { message: String },

    /// Backend and/or model changed after a validated switch.
    BackendChanged { backend: String, model: String },
    ModelChanged { model: String },

    /// Context cache was cleared (token window exhausted or explicit).
    CacheCleared,

    // ── Turn lifecycle ─────────────────────────────────────────────────
    TurnComplete { round: usize, has_more: bool },
    RoundLimitReached { limit: usize },
    Cancelled,
    Error { error: String },
    Finished,
}
