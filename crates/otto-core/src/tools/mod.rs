//! Tool registry
//!
//! An explicit static map from tool name to handler, maintained
//! alongside each tool's schema. Concrete tool business logic lives
//! outside this crate; the engine only needs execution and schemas.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::ai::types::ToolSchema;

/// Cap on tool output fed back to the model.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 30_000;

/// Result of one tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Optional alternate rendering for the display history.
    pub display_output: Option<String>,
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            display_output: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(message.into()),
            display_output: None,
        }
    }

    /// Text handed back to the model as the tool result.
    pub fn result_text(&self) -> String {
        if self.success {
            self.output.clone().unwrap_or_default()
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("unknown error"))
        }
    }
}

/// One registered tool: a handler plus its declared schema.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value) -> ToolOutcome;
}

/// Explicit name → handler registry.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name.clone();
        self.tools.insert(name, tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn schema(&self, name: &str) -> Option<ToolSchema> {
        self.tools.get(name).map(|t| t.schema())
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, name: &str, args: Value) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::error(format!("Unknown tool: {name}"));
        };
        info!(tool = name, "executing tool");
        tool.execute(args).await
    }
}

/// Truncate tool output at a clean line break, with a marker.
pub fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_TOOL_OUTPUT_CHARS {
        return output.to_string();
    }

    let mut boundary = MAX_TOOL_OUTPUT_CHARS.min(output.len());
    while boundary > 0 && !output.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let truncated = &output[..boundary];
    let break_point = truncated.rfind('\n').unwrap_or(boundary);
    let clean = &output[..break_point];
    format!(
        "{}\n\n[... OUTPUT TRUNCATED: {} chars -> {} chars ...]",
        clean,
        output.len(),
        clean.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::ToolParameters;

    pub(crate) struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "echo".to_string(),
                description: "Echo back the given text".to_string(),
                parameters: ToolParameters {
                    schema_type: "object".to_string(),
                    properties: serde_json::json!({"text": {"type": "string"}})
                        .as_object()
                        .cloned()
                        .unwrap(),
                    required: vec!["text".to_string()],
                },
            }
        }

        async fn execute(&self, args: Value) -> ToolOutcome {
            match args.get("text").and_then(|t| t.as_str()) {
                Some(text) => ToolOutcome::success(text),
                None => ToolOutcome::error("missing text"),
            }
        }
    }

    #[tokio::test]
    async fn registry_executes_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let outcome = registry
            .execute("echo", serde_json::json!({"text": "hi"}))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.result_text(), "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_outcome() {
        let registry = ToolRegistry::new();
        let outcome = registry.execute("nope", serde_json::json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.result_text().contains("Unknown tool"));
    }

    #[test]
    fn truncation_appends_marker() {
        let long = "line\n".repeat(10_000);
        let truncated = truncate_output(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("OUTPUT TRUNCATED"));
    }

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(truncate_output("hello"), "hello");
    }
}
