//! Streaming backend for OpenAI-compatible chat completion APIs.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use toolweave_core::error::BackendError;
use toolweave_core::{Message, Role, ToolDefinition};

use crate::sse::SseParser;
use crate::traits::{
    Backend, ChunkStream, CompletionRequest, FinishReason, StreamChunk, ToolCallDelta, Usage,
};

/// Default OpenAI API base URL.
const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// Backend for any server speaking the OpenAI chat completions protocol.
pub struct OpenAiCompatibleBackend {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenAiCompatibleBackend {
    /// Create a new backend against the public OpenAI endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_API_URL.to_string(),
            default_model: "gpt-4o-mini".to_string(),
        }
    }

    /// Build from configuration.
    pub fn from_config(config: &toolweave_core::config::BackendConfig) -> Self {
        Self::new(config.resolve_api_key().unwrap_or_default())
            .with_base_url(&config.base_url)
            .with_default_model(&config.model)
    }

    /// Set a custom base URL (for OpenRouter, vLLM, Ollama, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the default model.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn format_messages(&self, request: &CompletionRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system {
            messages.push(ChatMessage::plain("system", system.clone()));
        }
        messages.extend(request.messages.iter().map(convert_message));
        messages
    }

    fn build_request(&self, request: &CompletionRequest) -> ChatRequest {
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model.clone()
        };

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(convert_tool).collect())
        };

        ChatRequest {
            model,
            messages: self.format_messages(request),
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
            tools,
            stream: true,
        }
    }
}

fn convert_message(message: &Message) -> ChatMessage {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    };

    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|tc| ChatToolCall {
                    id: tc.id.clone(),
                    tool_type: "function".to_string(),
                    function: ChatFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect(),
        )
    };

    // Assistant turns that only carry tool calls send a null content.
    let content = if message.content.is_empty() && tool_calls.is_some() {
        None
    } else {
        Some(message.content.clone())
    };

    ChatMessage {
        role: role.to_string(),
        content,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn convert_tool(tool: &ToolDefinition) -> ChatTool {
    ChatTool {
        tool_type: "function".to_string(),
        function: ChatFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        },
    }
}

/// Parse one SSE data payload into zero or more chunks.
///
/// A single payload can carry text, several tool call fragments and a finish
/// reason at once; they are returned in that order.
fn parse_stream_event(data: &str) -> anyhow::Result<Vec<StreamChunk>> {
    let event: ChatStreamEvent = serde_json::from_str(data)?;
    let mut chunks = Vec::new();

    let Some(choice) = event.choices.into_iter().next() else {
        if let Some(usage) = event.usage {
            chunks.push(StreamChunk {
                usage: Some(usage.into()),
                ..Default::default()
            });
        }
        return Ok(chunks);
    };

    if let Some(delta) = choice.delta {
        if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
            chunks.push(StreamChunk::thinking(reasoning));
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            chunks.push(StreamChunk::text(content));
        }
        for tc in delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };
            chunks.push(StreamChunk::tool_call(ToolCallDelta {
                index: tc.index,
                id: tc.id,
                name,
                arguments,
            }));
        }
    }

    if let Some(reason) = choice.finish_reason {
        chunks.push(StreamChunk {
            finish_reason: Some(FinishReason::from_wire(&reason)),
            usage: event.usage.map(Into::into),
            ..Default::default()
        });
    }

    Ok(chunks)
}

#[async_trait]
impl Backend for OpenAiCompatibleBackend {
    fn id(&self) -> &str {
        "openai-compatible"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() || !self.base_url.starts_with(OPENAI_API_URL)
    }

    #[instrument(skip(self, request), fields(model = %request.model, tools = request.tools.len()))]
    async fn stream_with_tools(&self, request: CompletionRequest) -> anyhow::Result<ChunkStream> {
        let api_request = self.build_request(&request);
        debug!(url = %self.base_url, "Sending streaming chat completion request");

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&api_request);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = req.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "Chat completion request failed");
            return Err(BackendError::ApiError {
                backend: self.id().to_string(),
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_lowercase(),
                message,
            }
            .into());
        }

        let state = (
            response.bytes_stream(),
            SseParser::new(),
            VecDeque::<StreamChunk>::new(),
            false,
        );

        let parsed = stream::unfold(state, |(mut bytes, mut parser, mut queue, mut done)| async move {
            loop {
                if let Some(chunk) = queue.pop_front() {
                    return Some((Ok(chunk), (bytes, parser, queue, done)));
                }
                if done {
                    return None;
                }

                let events = match bytes.next().await {
                    Some(Ok(data)) => parser.feed(&data),
                    Some(Err(e)) => {
                        done = true;
                        let err = BackendError::StreamError {
                            backend: "openai-compatible".to_string(),
                            message: e.to_string(),
                        };
                        return Some((Err(err.into()), (bytes, parser, queue, done)));
                    }
                    None => {
                        done = true;
                        parser.finish().into_iter().collect()
                    }
                };

                for event in events {
                    if event.is_done() {
                        done = true;
                        break;
                    }
                    match parse_stream_event(&event.data) {
                        Ok(chunks) => queue.extend(chunks),
                        Err(e) => warn!("Skipping unparseable stream event: {}", e),
                    }
                }
            }
        });

        Ok(Box::pin(parsed))
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ChatFunction,
}

#[derive(Debug, Serialize)]
struct ChatFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Serialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatStreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolweave_core::ToolCall;

    #[test]
    fn test_custom_base_url_is_trimmed() {
        let backend =
            OpenAiCompatibleBackend::new("key").with_base_url("http://localhost:11434/v1/");
        assert_eq!(backend.base_url(), "http://localhost:11434/v1");
        assert!(backend.is_configured());
        assert!(!OpenAiCompatibleBackend::new("").is_configured());
    }

    #[test]
    fn test_request_without_tools_omits_field() {
        let backend = OpenAiCompatibleBackend::new("key");
        let request = CompletionRequest::new(vec![Message::user("hi")]).with_system("be brief");
        let body = serde_json::to_value(backend.build_request(&request)).unwrap();

        assert!(body.get("tools").is_none());
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_tool_turns_are_mapped() {
        let backend = OpenAiCompatibleBackend::new("key");
        let request = CompletionRequest::new(vec![
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "add", "{\"a\":1}")]),
            Message::tool_result("c1", "1"),
        ])
        .with_tools(vec![ToolDefinition::new("add", "Add numbers")]);
        let body = serde_json::to_value(backend.build_request(&request)).unwrap();

        let assistant = &body["messages"][0];
        assert!(assistant["content"].is_null());
        assert_eq!(assistant["tool_calls"][0]["function"]["arguments"], "{\"a\":1}");
        assert_eq!(body["messages"][1]["role"], "tool");
        assert_eq!(body["messages"][1]["tool_call_id"], "c1");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "add");
    }

    #[test]
    fn test_parse_text_delta() {
        let chunks =
            parse_stream_event(r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#)
                .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delta.as_deref(), Some("Hel"));
    }

    #[test]
    fn test_parse_parallel_tool_fragments_and_finish() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[
            {"index":0,"id":"a","function":{"name":"echo","arguments":"{\"m\""}},
            {"index":1,"id":"b","function":{"name":"add","arguments":""}}
        ]},"finish_reason":"tool_calls"}]}"#;
        let chunks = parse_stream_event(data).unwrap();
        assert_eq!(chunks.len(), 3);

        let second = chunks[1].tool_call_delta.as_ref().unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.name.as_deref(), Some("add"));
        assert_eq!(chunks[2].finish_reason, Some(FinishReason::ToolUse));
    }

    #[test]
    fn test_parse_reasoning_and_usage_only_events() {
        let chunks =
            parse_stream_event(r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#).unwrap();
        assert_eq!(chunks[0].thinking.as_deref(), Some("hmm"));

        let chunks =
            parse_stream_event(r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#)
                .unwrap();
        assert_eq!(chunks[0].usage.as_ref().unwrap().output_tokens, 4);
    }
}
