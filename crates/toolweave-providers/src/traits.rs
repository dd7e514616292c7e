//! Backend trait definitions.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use toolweave_core::{Message, ToolDefinition};

/// Request for a streamed completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model to use (empty means the backend default)
    pub model: String,
    /// Transcript so far
    pub messages: Vec<Message>,
    /// System prompt
    pub system: Option<String>,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Temperature
    pub temperature: f32,
    /// Capabilities offered to the model; empty means tools are disabled
    pub tools: Vec<ToolDefinition>,
}

impl CompletionRequest {
    /// Create a request over a transcript with default sampling settings.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: String::new(),
            messages,
            system: None,
            max_tokens: 4096,
            temperature: 0.7,
            tools: Vec::new(),
        }
    }

    /// Offer capabilities to the model.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Reason a backend turn finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Normal completion
    Stop,
    /// Hit max tokens limit
    MaxTokens,
    /// Tool use requested
    ToolUse,
    /// Content was filtered
    ContentFilter,
}

impl FinishReason {
    /// Map a wire-level finish reason string.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "length" | "max_tokens" => FinishReason::MaxTokens,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolUse,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }

    /// Wire-level name, used in event metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::MaxTokens => "length",
            FinishReason::ToolUse => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Input tokens used
    pub input_tokens: u32,
    /// Output tokens generated
    pub output_tokens: u32,
}

/// One streamed delta from a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Content delta
    pub delta: Option<String>,
    /// Model-internal reasoning delta
    pub thinking: Option<String>,
    /// Tool call fragment
    pub tool_call_delta: Option<ToolCallDelta>,
    /// Set on the chunk that ends the turn
    pub finish_reason: Option<FinishReason>,
    /// Usage (only in final chunk)
    pub usage: Option<Usage>,
}

impl StreamChunk {
    /// A text delta.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            ..Default::default()
        }
    }

    /// A reasoning delta.
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            thinking: Some(text.into()),
            ..Default::default()
        }
    }

    /// A tool call fragment.
    pub fn tool_call(delta: ToolCallDelta) -> Self {
        Self {
            tool_call_delta: Some(delta),
            ..Default::default()
        }
    }

    /// The terminal chunk of a turn.
    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Default::default()
        }
    }

    /// Whether this chunk ends the turn.
    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Fragment of a streamed tool call.
///
/// Fragments of the same call share `index`; `id` and `name` usually arrive on
/// the first fragment and `arguments` is split across the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call within the turn
    pub index: usize,
    /// Tool call ID
    pub id: Option<String>,
    /// Tool name
    pub name: Option<String>,
    /// Arguments delta (JSON string fragment)
    pub arguments: Option<String>,
}

impl ToolCallDelta {
    /// First fragment of a call, naming it.
    pub fn start(index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            arguments: None,
        }
    }

    /// A continuation fragment carrying argument text.
    pub fn arguments(index: usize, fragment: impl Into<String>) -> Self {
        Self {
            index,
            id: None,
            name: None,
            arguments: Some(fragment.into()),
        }
    }
}

/// A stream of deltas for one backend turn.
pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// A language model backend able to stream a turn with optional tool calling.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend identifier.
    fn id(&self) -> &str;

    /// Model used when a request leaves `model` empty.
    fn default_model(&self) -> &str;

    /// Check if the backend is configured and ready.
    fn is_configured(&self) -> bool;

    /// Open a delta stream for one turn.
    async fn stream_with_tools(&self, request: CompletionRequest) -> anyhow::Result<ChunkStream>;
}
