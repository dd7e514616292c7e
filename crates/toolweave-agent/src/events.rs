//! Events emitted on an orchestration stream.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use toolweave_core::ToolCall;
use toolweave_mcp::{McpError, McpErrorKind};
use toolweave_providers::FinishReason;

/// What happened.
#[derive(Debug, Clone)]
pub enum StreamEventKind {
    /// The run started
    MessageStart,
    /// A fragment of answer text
    ContentDelta(String),
    /// A fragment of model-internal reasoning
    Thinking(String),
    /// The model requested a tool call; arguments are complete
    ToolUse(ToolCall),
    /// A tool call finished, successfully or not
    ToolResult {
        call: ToolCall,
        result: String,
        is_error: bool,
    },
    /// A model turn finished without requesting tools
    ContentComplete(Option<FinishReason>),
    /// The run finished; nothing follows
    MessageStop,
    /// The run failed; nothing follows
    Error(EventError),
}

/// A single event on the output channel.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub timestamp: DateTime<Utc>,
    /// Free-form annotations such as `iteration` or `final_call`
    pub metadata: HashMap<String, Value>,
}

impl StreamEvent {
    pub fn new(kind: StreamEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Text carried by a `ContentDelta`.
    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            StreamEventKind::ContentDelta(text) => Some(text),
            _ => None,
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            StreamEventKind::MessageStop | StreamEventKind::Error(_)
        )
    }
}

/// A classified failure that ended a stream.
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
    pub kind: McpErrorKind,
    pub retryable: bool,
    error: McpError,
}

impl EventError {
    /// The classified error this event was built from.
    pub fn mcp_error(&self) -> &McpError {
        &self.error
    }

    pub fn server_name(&self) -> &str {
        self.error.server_name()
    }

    /// One-line actionable message for end users.
    pub fn user_friendly_message(&self) -> String {
        self.error.user_friendly_message()
    }
}

impl From<&McpError> for EventError {
    fn from(err: &McpError) -> Self {
        let message = err
            .cause()
            .map(|cause| format!("{:#}", cause))
            .unwrap_or_else(|| err.to_string());
        Self {
            message,
            kind: err.kind(),
            retryable: err.is_retryable(),
            error: err.clone(),
        }
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for EventError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
