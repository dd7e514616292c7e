//! The orchestrator: one backend, its capabilities and a memory.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//! ├── Backend (streams model turns)
//! ├── CapabilityRegistry (in-process tools)
//! ├── CapabilitySource* (remote tool servers, snapshot per run)
//! ├── Memory (seeds the transcript, receives the answer)
//! └── ResultCache (cacheable tool results)
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use toolweave_core::{Config, Message, ResultCache};
use toolweave_providers::Backend;
use toolweave_tools::{CapabilityRegistry, CapabilitySet, CapabilitySource};

use crate::events::{EventError, StreamEvent, StreamEventKind};
use crate::memory::{BufferMemory, Memory};
use crate::stream::{stream_transcript, StreamOptions};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while running the orchestrator.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Memory could not be read or written.
    #[error("Memory error: {0}")]
    Memory(#[source] anyhow::Error),

    /// The stream ended with an error event.
    #[error("Stream failed: {0}")]
    Stream(#[source] EventError),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type for orchestrator operations.
pub type AgentResult<T> = Result<T, AgentError>;

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs prompts through the streaming tool-call loop.
///
/// Each [`Orchestrator::run`] owns its own transcript; concurrent runs share
/// only the backend, the capability sources and the cache.
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    registry: CapabilityRegistry,
    sources: Vec<Arc<dyn CapabilitySource>>,
    memory: Arc<dyn Memory>,
    cache: Arc<ResultCache>,
    options: StreamOptions,
}

impl Orchestrator {
    /// An orchestrator with no tools, an empty buffer memory and no cache.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            registry: CapabilityRegistry::new(),
            sources: Vec::new(),
            memory: Arc::new(BufferMemory::new()),
            cache: Arc::new(ResultCache::disabled()),
            options: StreamOptions::default(),
        }
    }

    /// Options and cache taken from configuration.
    pub fn from_config(backend: Arc<dyn Backend>, config: &Config) -> Self {
        Self::new(backend)
            .with_options(StreamOptions::from_config(config))
            .with_cache(Arc::new(ResultCache::from_config(&config.cache)))
    }

    pub fn with_registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add a remote capability source.
    pub fn with_source(mut self, source: Arc<dyn CapabilitySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = Arc<dyn CapabilitySource>>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    /// Snapshot local and remote capabilities for one run.
    pub async fn capabilities(&self, cancel: &CancellationToken) -> CapabilitySet {
        CapabilitySet::snapshot(self.registry.clone(), &self.sources, cancel).await
    }

    /// Start a run.
    ///
    /// The transcript is seeded from memory. Memory is only written when the
    /// stream ends with `MessageStop`: the prompt and the streamed answer are
    /// appended together before `MessageStop` is forwarded. Failed and
    /// cancelled runs leave memory untouched.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        prompt: impl Into<String>,
    ) -> AgentResult<mpsc::Receiver<StreamEvent>> {
        let mut transcript = self.memory.get_messages().await.map_err(AgentError::Memory)?;
        let user = Message::user(prompt);
        transcript.push(user.clone());

        let capabilities = Arc::new(self.capabilities(&cancel).await);
        info!(
            backend = self.backend.id(),
            capabilities = capabilities.len(),
            history = transcript.len() - 1,
            "Starting run"
        );

        let mut inner = stream_transcript(
            cancel.clone(),
            transcript,
            capabilities,
            self.backend.clone(),
            self.options.clone(),
            self.cache.clone(),
        );

        let (tx, rx) = mpsc::channel(self.options.buffer_size.max(1));
        let memory = self.memory.clone();
        tokio::spawn(async move {
            let mut answer = String::new();
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    event = inner.recv() => event,
                };
                let Some(event) = event else { break };
                match &event.kind {
                    StreamEventKind::ContentDelta(text) => answer.push_str(text),
                    StreamEventKind::MessageStop => {
                        record_exchange(memory.as_ref(), user.clone(), &answer).await;
                    }
                    _ => {}
                }
                if tx.send(event).await.is_err() {
                    debug!("Run receiver dropped");
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Run a prompt and return the full streamed answer.
    pub async fn run_to_completion(
        &self,
        cancel: CancellationToken,
        prompt: impl Into<String>,
    ) -> AgentResult<String> {
        let mut rx = self.run(cancel.clone(), prompt).await?;
        let mut answer = String::new();
        while let Some(event) = rx.recv().await {
            match event.kind {
                StreamEventKind::ContentDelta(text) => answer.push_str(&text),
                StreamEventKind::Error(err) => return Err(AgentError::Stream(err)),
                StreamEventKind::MessageStop => return Ok(answer),
                _ => {}
            }
        }
        if cancel.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(answer)
        }
    }
}

/// Append a finished prompt/answer pair to memory.
async fn record_exchange(memory: &dyn Memory, user: Message, answer: &str) {
    if let Err(e) = memory.add_message(user).await {
        warn!(error = %e, "Failed to record prompt in memory");
        return;
    }
    if answer.is_empty() {
        return;
    }
    if let Err(e) = memory.add_message(Message::assistant(answer)).await {
        warn!(error = %e, "Failed to record answer in memory");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.backend.id())
            .field("capabilities", &self.registry.len())
            .field("sources", &self.sources.len())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use toolweave_core::Role;
    use toolweave_mcp::McpErrorKind;
    use toolweave_providers::{Script, ScriptEnd, ScriptedBackend};
    use toolweave_tools::{Capability, FnCapability, ToolError};

    // ========================================================================
    // Mock Source
    // ========================================================================

    struct MockSource {
        name: String,
        fail: bool,
    }

    #[async_trait]
    impl CapabilitySource for MockSource {
        fn source_name(&self) -> &str {
            &self.name
        }

        async fn capabilities(
            &self,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<Vec<Arc<dyn Capability>>> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            let weather: Arc<dyn Capability> = Arc::new(FnCapability::new(
                "weather",
                "Current weather",
                |_| Ok("sunny".to_string()),
            ));
            Ok(vec![weather])
        }
    }

    fn backend(scripts: Vec<Script>) -> Arc<ScriptedBackend> {
        Arc::new(ScriptedBackend::new(scripts))
    }

    #[tokio::test]
    async fn test_run_records_prompt_and_answer() {
        let memory = Arc::new(BufferMemory::new());
        let orchestrator = Orchestrator::new(backend(vec![Script::text("hello")]))
            .with_memory(memory.clone());

        let answer = orchestrator
            .run_to_completion(CancellationToken::new(), "hi")
            .await
            .unwrap();
        assert_eq!(answer, "hello");

        let messages = memory.get_messages().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "hello");
    }

    #[tokio::test]
    async fn test_run_seeds_transcript_from_memory() {
        let memory = Arc::new(BufferMemory::new());
        memory.add_message(Message::user("earlier")).await.unwrap();
        memory.add_message(Message::assistant("reply")).await.unwrap();

        let scripted = backend(vec![Script::text("ok")]);
        let orchestrator = Orchestrator::new(scripted.clone()).with_memory(memory);
        orchestrator
            .run_to_completion(CancellationToken::new(), "now")
            .await
            .unwrap();

        let sent: Vec<_> = scripted.requests()[0]
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(sent, vec!["earlier", "reply", "now"]);
    }

    #[tokio::test]
    async fn test_remote_sources_are_snapshot() {
        let scripted = backend(vec![
            Script::tool_call("c1", "weather", "{}"),
            Script::text("It is sunny."),
        ]);
        let orchestrator = Orchestrator::new(scripted.clone())
            .with_source(Arc::new(MockSource {
                name: "good".into(),
                fail: false,
            }))
            .with_source(Arc::new(MockSource {
                name: "down".into(),
                fail: true,
            }));

        let mut rx = orchestrator.run(CancellationToken::new(), "weather?").await.unwrap();
        let mut results = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEventKind::ToolResult { result, .. } = event.kind {
                results.push(result);
            }
        }

        assert_eq!(results, vec!["sunny"]);
        assert_eq!(scripted.requests()[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn test_local_tools_win_over_remote() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(FnCapability::new("weather", "Local weather", |_| {
            Ok("rainy".to_string())
        })));
        let orchestrator = Orchestrator::new(backend(vec![]))
            .with_registry(registry)
            .with_source(Arc::new(MockSource {
                name: "good".into(),
                fail: false,
            }));

        let set = orchestrator.capabilities(&CancellationToken::new()).await;
        assert_eq!(set.len(), 1);
        let weather = set.resolve("weather").unwrap();
        assert_eq!(weather.description(), "Local weather");
    }

    #[tokio::test]
    async fn test_stream_error_surfaces() {
        let memory = Arc::new(BufferMemory::new());
        let orchestrator = Orchestrator::new(backend(vec![Script::open_error("request timed out")]))
            .with_memory(memory.clone());

        let err = orchestrator
            .run_to_completion(CancellationToken::new(), "hi")
            .await
            .unwrap_err();
        match err {
            AgentError::Stream(e) => assert_eq!(e.kind, McpErrorKind::Timeout),
            other => panic!("unexpected error: {other}"),
        }
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_leaves_no_dangling_prompt() {
        let memory = Arc::new(BufferMemory::new());
        let orchestrator = Orchestrator::new(backend(vec![
            Script::open_error("connection refused"),
            Script::text("second answer"),
        ]))
        .with_memory(memory.clone());

        assert!(orchestrator
            .run_to_completion(CancellationToken::new(), "first")
            .await
            .is_err());
        orchestrator
            .run_to_completion(CancellationToken::new(), "second")
            .await
            .unwrap();

        let roles: Vec<_> = memory
            .get_messages()
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect();
        assert_eq!(
            roles,
            vec![
                (Role::User, "second".to_string()),
                (Role::Assistant, "second answer".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let orchestrator =
            Orchestrator::new(backend(vec![Script::text("slow").ending(ScriptEnd::Hang)]));
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { orchestrator.run_to_completion(cancel, "hi").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run should stop")
            .unwrap();
        assert!(matches!(result, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn test_tool_errors_do_not_fail_run() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(FnCapability::new("broken", "Fails", |_| {
            Err(ToolError::execution("disk full"))
        })));
        let orchestrator = Orchestrator::new(backend(vec![
            Script::tool_call("c1", "broken", "{}"),
            Script::text("Sorry, that failed."),
        ]))
        .with_registry(registry);

        let answer = orchestrator
            .run_to_completion(CancellationToken::new(), "do it")
            .await
            .unwrap();
        assert_eq!(answer, "Sorry, that failed.");
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.orchestrator.max_iterations = 5;
        let orchestrator = Orchestrator::from_config(backend(vec![]), &config);
        assert_eq!(orchestrator.options().max_iterations, 5);
    }
}
