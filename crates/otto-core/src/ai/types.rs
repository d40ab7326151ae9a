//! Wire types for backend communication
//!
//! These are NOT domain types - they follow the OpenAI-compatible
//! chat/completions shape every supported backend speaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Function payload of a tool call. Arguments arrive as raw text and stay
/// raw until the sanitizer has looked at them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Unit sent to/from the backend.
///
/// Invariant: an assistant message with N tool_calls must be followed,
/// before any non-tool message, by exactly N tool messages whose
/// `tool_call_id`s are a permutation of the tool_calls' ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(output.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn content_text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Ids of tool calls in `messages` that have no matching tool result yet.
///
/// A process crash or interruption can leave an assistant tool_calls message
/// trailing; callers synthesize results for these ids before the next request.
pub fn unresolved_tool_call_ids(messages: &[ChatMessage]) -> Vec<String> {
    let mut pending: Vec<String> = Vec::new();
    for message in messages {
        match message.role {
            Role::Assistant => {
                pending = message
                    .tool_calls
                    .iter()
                    .map(|c| c.id.clone())
                    .collect();
            }
            Role::Tool => {
                if let Some(id) = &message.tool_call_id {
                    pending.retain(|p| p != id);
                }
            }
            _ => pending.clear(),
        }
    }
    pending
}

/// Tool parameter schema in the shape backends expect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

fn object_type() -> String {
    "object".to_string()
}

/// Tool definition exposed to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
}

/// One completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: usize,
    #[serde(default)]
    pub completion_tokens: usize,
    #[serde(default)]
    pub total_tokens: usize,
}

/// Non-streaming chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Events on a streaming response channel.
///
/// `Delta` carries the raw `choices[0].delta` object; the stream
/// accumulator folds these into one complete assistant message.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(Value),
    Usage(Usage),
    Done,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_roundtrips_with_call_id() {
        let msg = ChatMessage::tool_result("call_1", "ok");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
        let back: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unresolved_ids_found_for_interrupted_round() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tools(
                None,
                vec![ToolCall::new("a", "read", "{}"), ToolCall::new("b", "grep", "{}")],
            ),
            ChatMessage::tool_result("a", "done"),
        ];
        assert_eq!(unresolved_tool_call_ids(&messages), vec!["b".to_string()]);
    }

    #[test]
    fn unresolved_ids_empty_after_full_round() {
        let messages = vec![
            ChatMessage::assistant_with_tools(None, vec![ToolCall::new("a", "read", "{}")]),
            ChatMessage::tool_result("a", "done"),
            ChatMessage::assistant("all set"),
        ];
        assert!(unresolved_tool_call_ids(&messages).is_empty());
    }
}
