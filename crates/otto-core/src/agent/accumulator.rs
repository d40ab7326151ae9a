//! Streaming-response accumulator
//!
//! Folds incremental delta chunks into one complete assistant message.
//! Also scrubs `<think>` spans that leak across chunk boundaries and
//! recognizes the XML tool-call dialect some backends embed in plain
//! content instead of structured tool_calls.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::ai::types::{ChatMessage, Role, ToolCall};

/// Keys that identify a value rather than accumulate as text.
const REPLACE_KEYS: [&str; 3] = ["id", "type", "name"];

static XML_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<([A-Za-z_][\w.-]*):function_call\s+name="([^"]+)"\s*>(.*?)</[A-Za-z_][\w.-]*:function_call>"#,
    )
    .expect("xml call regex")
});

static XML_PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<parameter\s+name="([^"]+)"\s*>(.*?)</parameter>"#).expect("xml param regex")
});

/// Merge one streaming delta chunk onto accumulated state.
///
/// Order-sensitive: later chunks are merged onto, never alongside,
/// earlier state. Null deltas are ignored so a backend emitting
/// `tool_calls: null` cannot erase list state already built up.
pub fn merge_delta(acc: &mut Value, delta: &Value) {
    let Some(delta_obj) = delta.as_object() else {
        return;
    };
    if !acc.is_object() {
        *acc = json!({});
    }
    let acc_obj = acc.as_object_mut().expect("accumulator is an object");

    for (key, incoming) in delta_obj {
        if incoming.is_null() {
            continue;
        }
        match acc_obj.get_mut(key) {
            None => {
                acc_obj.insert(key.clone(), strip_index(incoming));
            }
            Some(existing) => merge_value(key, existing, incoming),
        }
    }
}

fn merge_value(key: &str, existing: &mut Value, incoming: &Value) {
    match (existing, incoming) {
        (Value::String(current), Value::String(delta)) => {
            if REPLACE_KEYS.contains(&key) {
                *current = delta.clone();
            } else {
                current.push_str(delta);
            }
        }
        (Value::Array(current), Value::Array(delta)) => {
            for (position, element) in delta.iter().enumerate() {
                if element.is_null() {
                    continue;
                }
                if position < current.len() {
                    let mut slot = std::mem::take(&mut current[position]);
                    if slot.is_object() && element.is_object() {
                        merge_delta(&mut slot, element);
                    } else {
                        slot = strip_index(element);
                    }
                    current[position] = slot;
                } else {
                    current.push(strip_index(element));
                }
            }
        }
        (existing @ Value::Object(_), Value::Object(_)) => {
            merge_delta(existing, incoming);
        }
        (existing, incoming) => {
            *existing = strip_index(incoming);
        }
    }
}

/// Copy a value, dropping the stray per-element `index` bookkeeping field
/// backends attach to streamed array elements.
fn strip_index(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if k == "index" {
                    continue;
                }
                out.insert(k.clone(), strip_index(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_index).collect()),
        other => other.clone(),
    }
}

/// Accumulates one streamed assistant turn.
pub struct StreamAccumulator {
    message: Value,
    inside_think: bool,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            message: json!({ "role": "assistant" }),
            inside_think: false,
        }
    }

    /// Fold one delta chunk into the accumulated message. Text content is
    /// passed through the think filter before merging.
    pub fn push_delta(&mut self, delta: &Value) {
        let mut delta = delta.clone();
        if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
            let filtered = self.filter_think(content);
            if filtered.is_empty() && self.message.get("content").is_none() {
                if let Some(obj) = delta.as_object_mut() {
                    obj.remove("content");
                }
            } else {
                delta["content"] = Value::String(filtered);
            }
        }
        merge_delta(&mut self.message, &delta);
    }

    /// Visible text accumulated so far (think spans already removed).
    pub fn visible_text(&self) -> &str {
        self.message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
    }

    /// Drop `<think>...</think>` spans, tracking state across chunks.
    fn filter_think(&mut self, chunk: &str) -> String {
        let mut out = String::new();
        let mut rest = chunk;
        loop {
            if self.inside_think {
                match rest.find("</think>") {
                    Some(pos) => {
                        self.inside_think = false;
                        rest = &rest[pos + "</think>".len()..];
                    }
                    None => return out,
                }
            } else {
                match rest.find("<think>") {
                    Some(pos) => {
                        out.push_str(&rest[..pos]);
                        self.inside_think = true;
                        rest = &rest[pos + "<think>".len()..];
                    }
                    None => {
                        out.push_str(rest);
                        return out;
                    }
                }
            }
        }
    }

    /// Finish the turn: extract XML-embedded tool calls and produce the
    /// completed assistant message.
    pub fn finish(self) -> ChatMessage {
        let mut message: ChatMessage = match serde_json::from_value(self.message) {
            Ok(message) => message,
            Err(e) => {
                warn!("accumulated message failed to deserialize: {}", e);
                ChatMessage::assistant("")
            }
        };
        message.role = Role::Assistant;

        if let Some(content) = message.content.take() {
            let (remainder, mut extracted) = extract_xml_tool_calls(&content);
            message.tool_calls.append(&mut extracted);
            message.content = if remainder.trim().is_empty() {
                None
            } else {
                Some(remainder)
            };
        }
        message
    }
}

/// Pull `<ns:function_call name="...">...</ns:function_call>` blocks out of
/// content, returning the stripped remainder and synthetic tool calls.
pub fn extract_xml_tool_calls(content: &str) -> (String, Vec<ToolCall>) {
    if !content.contains(":function_call") {
        return (content.to_string(), Vec::new());
    }

    let mut calls = Vec::new();
    let mut remainder = String::with_capacity(content.len());
    let mut cursor = 0;

    for captures in XML_CALL_RE.captures_iter(content) {
        let whole = captures.get(0).expect("match 0");
        remainder.push_str(&content[cursor..whole.start()]);
        cursor = whole.end();

        let name = &captures[2];
        let body = &captures[3];
        let mut args = Map::new();
        for param in XML_PARAM_RE.captures_iter(body) {
            let key = param[1].to_string();
            let raw = param[2].trim();
            let value = serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.to_string()));
            args.insert(key, value);
        }

        let id = format!("xmlcall_{}", uuid::Uuid::new_v4().simple());
        let arguments = Value::Object(args).to_string();
        calls.push(ToolCall::new(id, name, arguments));
    }
    remainder.push_str(&content[cursor..]);
    (remainder, calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexed_tool_call_deltas_fold_into_one_call() {
        let mut acc = StreamAccumulator::new();
        acc.push_delta(&json!({ "tool_calls": [{ "index": 0, "id": "c1" }] }));
        acc.push_delta(&json!({ "tool_calls": [{ "index": 0, "function": { "name": "f" } }] }));
        acc.push_delta(&json!({ "tool_calls": [{ "index": 0, "function": { "arguments": "{}" } }] }));

        let message = acc.finish();
        assert_eq!(message.tool_calls.len(), 1);
        let call = &message.tool_calls[0];
        assert_eq!(call.id, "c1");
        assert_eq!(call.function.name, "f");
        assert_eq!(call.function.arguments, "{}");
    }

    #[test]
    fn null_delta_does_not_erase_list_state() {
        let mut acc = json!({ "tool_calls": [{ "id": "c1" }] });
        merge_delta(&mut acc, &json!({ "tool_calls": null }));
        assert_eq!(acc["tool_calls"][0]["id"], "c1");
    }

    #[test]
    fn strings_concatenate_but_identity_keys_replace() {
        let mut acc = json!({ "content": "Hel", "id": "a" });
        merge_delta(&mut acc, &json!({ "content": "lo", "id": "b" }));
        assert_eq!(acc["content"], "Hello");
        assert_eq!(acc["id"], "b");
    }

    #[test]
    fn arguments_accumulate_across_chunks() {
        let mut acc = StreamAccumulator::new();
        acc.push_delta(&json!({ "tool_calls": [{ "index": 0, "id": "c", "function": { "name": "edit", "arguments": "{\"pa" } }] }));
        acc.push_delta(&json!({ "tool_calls": [{ "index": 0, "function": { "arguments": "th\":\"x\"}" } }] }));
        let message = acc.finish();
        assert_eq!(message.tool_calls[0].function.arguments, "{\"path\":\"x\"}");
    }

    #[test]
    fn think_span_within_one_chunk_is_dropped() {
        let mut acc = StreamAccumulator::new();
        acc.push_delta(&json!({ "content": "before <think>secret</think>after" }));
        assert_eq!(acc.visible_text(), "before after");
    }

    #[test]
    fn think_span_across_chunks_is_dropped() {
        let mut acc = StreamAccumulator::new();
        acc.push_delta(&json!({ "content": "keep <think>hidden" }));
        acc.push_delta(&json!({ "content": "still hidden" }));
        acc.push_delta(&json!({ "content": "tail</think> visible" }));
        assert_eq!(acc.visible_text(), "keep  visible");
    }

    #[test]
    fn xml_tool_call_extracted_and_stripped() {
        let content = r#"<tools:function_call name="read_file"><parameter name="path">/tmp/a</parameter><parameter name="limit">5</parameter></tools:function_call>"#;
        let (remainder, calls) = extract_xml_tool_calls(content);
        assert!(remainder.trim().is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "read_file");
        let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["path"], "/tmp/a");
        assert_eq!(args["limit"], 5);
        assert!(calls[0].id.starts_with("xmlcall_"));
    }

    #[test]
    fn xml_tool_call_leaves_null_content_when_nothing_remains() {
        let mut acc = StreamAccumulator::new();
        acc.push_delta(&json!({
            "content": r#"<ns:function_call name="f"><parameter name="a">1</parameter></ns:function_call>"#
        }));
        let message = acc.finish();
        assert!(message.content.is_none());
        assert_eq!(message.tool_calls.len(), 1);
    }

    #[test]
    fn xml_extraction_preserves_surrounding_text() {
        let content = r#"Running it now. <ns:function_call name="f"><parameter name="a">1</parameter></ns:function_call> Done."#;
        let (remainder, calls) = extract_xml_tool_calls(content);
        assert_eq!(remainder, "Running it now.  Done.");
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn object_values_merge_structurally() {
        let mut acc = json!({ "function": { "name": "f", "arguments": "{\"a\"" } });
        merge_delta(&mut acc, &json!({ "function": { "arguments": ":1}" } }));
        assert_eq!(acc["function"]["arguments"], "{\"a\":1}");
        assert_eq!(acc["function"]["name"], "f");
    }

    #[test]
    fn index_field_is_stripped_on_first_assignment() {
        let mut acc = json!({});
        merge_delta(&mut acc, &json!({ "tool_calls": [{ "index": 0, "id": "c1" }] }));
        assert!(acc["tool_calls"][0].get("index").is_none());
    }
}
