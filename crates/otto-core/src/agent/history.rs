//! Display-oriented conversation history
//!
//! `ChatEntry` is the UI superset of the API message list. A tool-call
//! entry is mutated in place into a tool-result entry as execution
//! completes; entries are never deleted except by compaction, which
//! truncates the display history in lock-step with the API list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    System,
}

/// Outcome attached to a tool entry once execution finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultInfo {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub kind: EntryKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultInfo>,
}

impl ChatEntry {
    pub fn new(kind: EntryKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_id: None,
            tool_name: None,
            tool_result: None,
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: impl Into<String>) -> Self {
        let mut entry = Self::new(EntryKind::ToolCall, args);
        entry.tool_call_id = Some(id.into());
        entry.tool_name = Some(name.into());
        entry
    }

    /// In-place mutation from tool_call to tool_result.
    pub fn complete_tool(&mut self, result: ToolResultInfo) {
        self.kind = EntryKind::ToolResult;
        self.tool_result = Some(result);
    }
}

/// Which turn a rephrase request is redoing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RephraseState {
    pub original_assistant_index: usize,
    pub rephrase_request_index: usize,
    pub new_response_index: Option<usize>,
    pub message_kind: EntryKind,
}
