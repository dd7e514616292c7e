//! Tool definitions and tool-call requests.

use serde::{Deserialize, Serialize};

/// Where a tool comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    /// Registered in-process
    Local,
    /// Provided by a named remote protocol server
    Remote(String),
}

/// Schema-level description of a tool, as offered to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique within one run)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
    /// Origin of the tool
    pub source: ToolSource,
}

impl ToolDefinition {
    /// Create a new local tool definition with an empty object schema.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
            source: ToolSource::Local,
        }
    }

    /// Set the parameters schema.
    pub fn with_parameters(mut self, schema: serde_json::Value) -> Self {
        self.parameters = schema;
        self
    }

    /// Set the source.
    pub fn with_source(mut self, source: ToolSource) -> Self {
        self.source = source;
        self
    }
}

/// A request from the model to call a tool.
///
/// `arguments` is the JSON object exactly as the model produced it, kept as
/// text so that fragments can be concatenated while streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this tool call
    pub id: String,
    /// Tool name
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

impl ToolCall {
    /// Create a new tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the arguments as a JSON value, treating empty text as `{}`.
    pub fn arguments_value(&self) -> serde_json::Result<serde_json::Value> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_builder() {
        let def = ToolDefinition::new("search", "Search the web")
            .with_parameters(serde_json::json!({"type": "object"}))
            .with_source(ToolSource::Remote("brave".into()));
        assert_eq!(def.name, "search");
        assert_eq!(def.source, ToolSource::Remote("brave".into()));
    }

    #[test]
    fn test_arguments_value() {
        let call = ToolCall::new("1", "echo", r#"{"message":"hi"}"#);
        assert_eq!(call.arguments_value().unwrap()["message"], "hi");

        let empty = ToolCall::new("2", "noop", "");
        assert_eq!(empty.arguments_value().unwrap(), serde_json::json!({}));

        let broken = ToolCall::new("3", "bad", "{\"a\":");
        assert!(broken.arguments_value().is_err());
    }
}
