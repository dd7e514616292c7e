//! Scripted backend for tests and offline demos.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use crate::traits::{
    Backend, ChunkStream, CompletionRequest, FinishReason, StreamChunk, ToolCallDelta,
};

/// How a scripted turn ends after its chunks are delivered.
#[derive(Debug, Clone)]
pub enum ScriptEnd {
    /// The stream ends normally
    Complete,
    /// The stream yields this error
    Error(String),
    /// The stream never yields again
    Hang,
}

/// One scripted backend turn.
#[derive(Debug, Clone)]
pub struct Script {
    /// Error returned when opening the stream, before any chunk
    pub open_error: Option<String>,
    /// Chunks delivered in order
    pub chunks: Vec<StreamChunk>,
    /// What happens after the last chunk
    pub end: ScriptEnd,
}

impl Script {
    /// A turn that streams the given chunks and completes.
    pub fn chunks(chunks: Vec<StreamChunk>) -> Self {
        Self {
            open_error: None,
            chunks,
            end: ScriptEnd::Complete,
        }
    }

    /// A plain text turn, split on whitespace boundaries into deltas.
    pub fn text(text: &str) -> Self {
        let mut chunks: Vec<StreamChunk> = text
            .split_inclusive(' ')
            .map(StreamChunk::text)
            .collect();
        chunks.push(StreamChunk::finish(FinishReason::Stop));
        Self::chunks(chunks)
    }

    /// A turn requesting one tool call, with arguments streamed in two pieces.
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        Self::tool_calls(&[(id, name, arguments)])
    }

    /// A turn requesting several tool calls in order.
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Self {
        let mut chunks = Vec::new();
        for (index, (id, name, arguments)) in calls.iter().enumerate() {
            chunks.push(StreamChunk::tool_call(ToolCallDelta::start(index, *id, *name)));
            let split = arguments.len() / 2;
            let split = (split..=arguments.len())
                .find(|i| arguments.is_char_boundary(*i))
                .unwrap_or(arguments.len());
            let (head, tail) = arguments.split_at(split);
            for piece in [head, tail] {
                if !piece.is_empty() {
                    chunks.push(StreamChunk::tool_call(ToolCallDelta::arguments(index, piece)));
                }
            }
        }
        chunks.push(StreamChunk::finish(FinishReason::ToolUse));
        Self::chunks(chunks)
    }

    /// A turn that fails to open.
    pub fn open_error(message: impl Into<String>) -> Self {
        Self {
            open_error: Some(message.into()),
            chunks: Vec::new(),
            end: ScriptEnd::Complete,
        }
    }

    /// Prepend text chunks to this turn.
    pub fn with_leading_text(mut self, text: &str) -> Self {
        self.chunks.insert(0, StreamChunk::text(text));
        self
    }

    /// Change how the turn ends.
    pub fn ending(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }
}

/// A backend replaying scripted turns, recording every request it receives.
pub struct ScriptedBackend {
    scripts: Mutex<Vec<Script>>,
    fallback: Option<Script>,
    requests: Mutex<Vec<CompletionRequest>>,
    call_count: AtomicUsize,
}

impl ScriptedBackend {
    /// Create a backend replaying `scripts` in order.
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Replay `script` for every call once the queue is exhausted.
    pub fn with_fallback(mut self, script: Script) -> Self {
        self.fallback = Some(script);
        self
    }

    /// Number of streams opened.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn id(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn stream_with_tools(&self, request: CompletionRequest) -> anyhow::Result<ChunkStream> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);

        let script = {
            let mut scripts = self.scripts.lock();
            if scripts.is_empty() {
                self.fallback.clone()
            } else {
                Some(scripts.remove(0))
            }
        };
        let Some(script) = script else {
            anyhow::bail!("scripted backend: no more turns available");
        };

        if let Some(message) = script.open_error {
            anyhow::bail!(message);
        }

        let head = stream::iter(script.chunks.into_iter().map(Ok));
        let tail: ChunkStream = match script.end {
            ScriptEnd::Complete => Box::pin(stream::empty()),
            ScriptEnd::Error(message) => {
                Box::pin(stream::once(async move { Err(anyhow::anyhow!(message)) }))
            }
            ScriptEnd::Hang => Box::pin(stream::pending()),
        };
        Ok(Box::pin(head.chain(tail)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_replays_scripts_in_order() {
        let backend = ScriptedBackend::new(vec![Script::text("hello there"), Script::text("bye")]);

        let first: Vec<_> = backend
            .stream_with_tools(CompletionRequest::new(vec![]))
            .await
            .unwrap()
            .collect()
            .await;
        let text: String = first
            .iter()
            .filter_map(|c| c.as_ref().ok().and_then(|c| c.delta.clone()))
            .collect();
        assert_eq!(text, "hello there");

        backend
            .stream_with_tools(CompletionRequest::new(vec![]))
            .await
            .unwrap();
        assert!(backend
            .stream_with_tools(CompletionRequest::new(vec![]))
            .await
            .is_err());
        assert_eq!(backend.call_count(), 3);
        assert_eq!(backend.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_tool_call_script_splits_arguments() {
        let script = Script::tool_call("c1", "echo", r#"{"message":"hi"}"#);
        let fragments: String = script
            .chunks
            .iter()
            .filter_map(|c| c.tool_call_delta.as_ref())
            .filter_map(|d| d.arguments.clone())
            .collect();
        assert_eq!(fragments, r#"{"message":"hi"}"#);
        assert_eq!(
            script.chunks.last().and_then(|c| c.finish_reason),
            Some(FinishReason::ToolUse)
        );
    }

    #[tokio::test]
    async fn test_fallback_repeats() {
        let backend = ScriptedBackend::new(vec![]).with_fallback(Script::text("again"));
        for _ in 0..3 {
            assert!(backend
                .stream_with_tools(CompletionRequest::new(vec![]))
                .await
                .is_ok());
        }
        assert_eq!(backend.call_count(), 3);
    }
}
