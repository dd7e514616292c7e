//! Remote tools exposed as [`Capability`] objects.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use toolweave_core::ToolSource;
use toolweave_tools::{Capability, ToolContext, ToolError};
use tracing::debug;

use crate::client::McpClient;
use crate::protocol::RemoteTool;

/// Prefix of server-qualified tool names.
pub const MCP_TOOL_PREFIX: &str = "mcp__";

/// A remote tool bound to the client that serves it.
///
/// The capability name is the tool's own name. The server-qualified form
/// `mcp__<server>__<tool>` is kept for disambiguation in logs and listings.
pub struct McpToolWrapper {
    qualified_name: String,
    server_name: String,
    tool: RemoteTool,
    description: String,
    client: Arc<McpClient>,
}

impl McpToolWrapper {
    pub fn new(tool: RemoteTool, client: Arc<McpClient>) -> Self {
        let server_name = client.name().to_string();
        let qualified_name = format!("{}{}__{}", MCP_TOOL_PREFIX, server_name, tool.name);
        let description = tool
            .description
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| format!("Tool {} from server {}", tool.name, server_name));

        Self {
            qualified_name,
            server_name,
            tool,
            description,
            client,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// `mcp__<server>__<tool>`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Split a qualified name into `(server, tool)`.
    pub fn parse_tool_name(qualified: &str) -> Option<(String, String)> {
        let rest = qualified.strip_prefix(MCP_TOOL_PREFIX)?;
        let (server, tool) = rest.split_once("__")?;
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        Some((server.to_string(), tool.to_string()))
    }
}

fn parse_arguments(arguments: &str) -> Result<Value, ToolError> {
    if arguments.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value = serde_json::from_str(arguments)
        .map_err(|e| ToolError::invalid_args(format!("arguments are not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(ToolError::invalid_args("arguments must be a JSON object"));
    }
    Ok(value)
}

#[async_trait]
impl Capability for McpToolWrapper {
    fn name(&self) -> &str {
        &self.tool.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameter_schema(&self) -> Value {
        self.tool.input_schema.clone()
    }

    fn source(&self) -> ToolSource {
        ToolSource::Remote(self.server_name.clone())
    }

    async fn execute(&self, ctx: &ToolContext, arguments: &str) -> Result<String, ToolError> {
        let args = parse_arguments(arguments)?;
        debug!(tool = %self.qualified_name, "Executing remote tool");

        let call = self.client.call_tool(&self.tool.name, &args, &ctx.cancel);
        let result = match ctx.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ToolError::Timeout(limit.as_secs()))?,
            None => call.await,
        }
        .map_err(|e| ToolError::Remote(anyhow::Error::new(e)))?;

        let text = result.text();
        if result.is_error {
            return Err(ToolError::ExecutionFailed(text));
        }
        Ok(text)
    }
}
