//! MCP collaborator contract
//!
//! Multi-server tool discovery lives outside the core. The engine only
//! needs listing, invocation, and the cache-invalidation discipline:
//! after every successful MCP tool call, that server's tool cache is
//! invalidated so the next listing lazily refreshes.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::ai::types::ToolSchema;
use crate::tools::ToolOutcome;

/// Name prefix marking a tool as MCP-hosted: `mcp:{server}:{tool}`.
pub const MCP_TOOL_PREFIX: &str = "mcp:";

#[async_trait]
pub trait McpManager: Send + Sync {
    async fn get_tools(&self) -> Result<Vec<ToolSchema>>;
    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolOutcome>;
    async fn invalidate_cache(&self, server_name: &str);
}

/// Server component of a prefixed MCP tool name, if it is one.
pub fn mcp_server_for_tool(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(MCP_TOOL_PREFIX)?;
    let (server, tool) = rest.split_once(':')?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_parses_from_prefixed_tool() {
        assert_eq!(mcp_server_for_tool("mcp:github:list_issues"), Some("github"));
        assert_eq!(mcp_server_for_tool("edit"), None);
        assert_eq!(mcp_server_for_tool("mcp::broken"), None);
    }
}
