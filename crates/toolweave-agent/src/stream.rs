//! The streaming tool-call loop.
//!
//! One run drives `generate → detect tool calls → execute → regenerate` on a
//! dedicated task and pushes [`StreamEvent`]s into a bounded channel:
//!
//! ```text
//! MessageStart
//! ├── iteration 1..=max_iterations
//! │   ├── ContentDelta* / Thinking*
//! │   ├── ToolUse*            (as each call's fragments complete)
//! │   └── ToolResult*         (one per ToolUse, in call order)
//! ├── final call without tools (only if every iteration requested tools)
//! ├── ContentComplete
//! └── MessageStop | Error
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use toolweave_core::{Config, Message, ResultCache, ToolCall, ToolDefinition};
use toolweave_mcp::classify_error;
use toolweave_providers::{Backend, CompletionRequest, FinishReason, ToolCallDelta};
use toolweave_tools::{Capability, CapabilitySet, ToolContext, ToolError};

use crate::events::{EventError, StreamEvent, StreamEventKind};

/// Iterations used when options ask for zero.
pub const DEFAULT_MAX_ITERATIONS: usize = 2;

/// User turn appended before the final no-tool call.
pub const FINAL_CALL_INSTRUCTION: &str = "Please provide your final response based on the information available. Do not request any additional tools.";

const STREAM_OPERATION: &str = "Stream";

/// Options for one run.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Tool-calling iterations before the final no-tool call
    pub max_iterations: usize,
    /// Capacity of the output channel
    pub buffer_size: usize,
    /// Forward prose from tool-calling turns live instead of buffering it
    pub include_intermediate_messages: bool,
    /// Model name; empty uses the backend default
    pub model: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Upper bound for a single capability execution
    pub tool_timeout: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            buffer_size: 100,
            include_intermediate_messages: false,
            model: String::new(),
            system: None,
            max_tokens: 4096,
            temperature: 0.7,
            tool_timeout: None,
        }
    }
}

impl StreamOptions {
    /// Options from the `backend` and `orchestrator` config sections.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.orchestrator.max_iterations,
            buffer_size: config.orchestrator.buffer_size,
            include_intermediate_messages: config.orchestrator.include_intermediate_messages,
            model: config.backend.model.clone(),
            system: config.orchestrator.system_prompt.clone(),
            max_tokens: config.backend.max_tokens,
            temperature: config.backend.temperature,
            tool_timeout: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_intermediate_messages(mut self, include: bool) -> Self {
        self.include_intermediate_messages = include;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    fn iterations(&self) -> usize {
        if self.max_iterations == 0 {
            DEFAULT_MAX_ITERATIONS
        } else {
            self.max_iterations
        }
    }
}

/// Stream a single prompt without a result cache.
///
/// Must be called from within a tokio runtime.
pub fn stream(
    cancel: CancellationToken,
    prompt: impl Into<String>,
    capabilities: Arc<CapabilitySet>,
    backend: Arc<dyn Backend>,
    options: StreamOptions,
) -> mpsc::Receiver<StreamEvent> {
    stream_transcript(
        cancel,
        vec![Message::user(prompt)],
        capabilities,
        backend,
        options,
        Arc::new(ResultCache::disabled()),
    )
}

/// Stream a run seeded with an existing transcript.
///
/// The channel closes exactly once: after `MessageStop`, after an `Error`, or
/// without a final event once `cancel` fires.
pub fn stream_transcript(
    cancel: CancellationToken,
    transcript: Vec<Message>,
    capabilities: Arc<CapabilitySet>,
    backend: Arc<dyn Backend>,
    options: StreamOptions,
    cache: Arc<ResultCache>,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
    let run = StreamLoop {
        tx,
        cancel,
        backend,
        capabilities,
        options,
        cache,
        transcript,
        intermediate: Vec::new(),
    };
    tokio::spawn(run.run());
    rx
}

// ============================================================================
// Tool call assembly
// ============================================================================

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Reassembles streamed tool-call fragments keyed by call index.
///
/// A call is frozen when a fragment for a new index arrives or the turn
/// finishes. Frozen calls never change again.
#[derive(Debug)]
struct ToolCallBuilder {
    iteration: usize,
    open: BTreeMap<usize, PartialToolCall>,
    frozen: BTreeSet<usize>,
    completed: Vec<ToolCall>,
}

impl ToolCallBuilder {
    fn new(iteration: usize) -> Self {
        Self {
            iteration,
            open: BTreeMap::new(),
            frozen: BTreeSet::new(),
            completed: Vec::new(),
        }
    }

    /// Apply a fragment, returning calls completed because a new one started.
    fn apply_delta(&mut self, delta: &ToolCallDelta) -> Vec<ToolCall> {
        if self.frozen.contains(&delta.index) {
            warn!(index = delta.index, "Ignoring fragment for completed tool call");
            return Vec::new();
        }

        let completed = if self.open.contains_key(&delta.index) {
            Vec::new()
        } else {
            self.freeze_all()
        };

        let call = self.open.entry(delta.index).or_default();
        if let Some(id) = delta.id.as_ref().filter(|id| !id.is_empty()) {
            call.id = Some(id.clone());
        }
        if let Some(name) = delta.name.as_ref().filter(|name| !name.is_empty()) {
            call.name = Some(name.clone());
        }
        if let Some(arguments) = &delta.arguments {
            call.arguments.push_str(arguments);
        }
        completed
    }

    /// Freeze every open call, in index order.
    fn freeze_all(&mut self) -> Vec<ToolCall> {
        let mut completed = Vec::new();
        for (index, partial) in std::mem::take(&mut self.open) {
            self.frozen.insert(index);
            let Some(name) = partial.name else {
                warn!(index, "Dropping tool call without a name");
                continue;
            };
            let id = partial
                .id
                .unwrap_or_else(|| format!("call_{}_{}", self.iteration, index));
            let arguments = if partial.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                partial.arguments
            };
            let call = ToolCall::new(id, name, arguments);
            self.completed.push(call.clone());
            completed.push(call);
        }
        completed
    }

    fn into_calls(self) -> Vec<ToolCall> {
        self.completed
    }
}

// ============================================================================
// Loop
// ============================================================================

/// The stream was closed, cancelled or failed; stop without further events.
struct Halted;

type Step<T> = Result<T, Halted>;

#[derive(Debug, Clone, Copy)]
enum Turn {
    Iteration(usize),
    Final,
}

impl Turn {
    fn annotate(self, event: StreamEvent) -> StreamEvent {
        match self {
            Turn::Iteration(iteration) => event.with_meta("iteration", iteration),
            Turn::Final => event.with_meta("final_call", true),
        }
    }
}

struct TurnOutcome {
    /// Text fragments in arrival order
    fragments: Vec<String>,
    calls: Vec<ToolCall>,
    finish_reason: Option<FinishReason>,
    /// Whether fragments were already forwarded
    streamed: bool,
}

impl TurnOutcome {
    fn has_text(&self) -> bool {
        self.fragments.iter().any(|f| !f.trim().is_empty())
    }
}

struct StreamLoop {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    backend: Arc<dyn Backend>,
    capabilities: Arc<CapabilitySet>,
    options: StreamOptions,
    cache: Arc<ResultCache>,
    transcript: Vec<Message>,
    /// Prose from tool-calling turns that was not forwarded
    intermediate: Vec<String>,
}

impl StreamLoop {
    async fn run(mut self) {
        if self.drive().await.is_err() {
            debug!("Stream halted early");
        }
    }

    async fn drive(&mut self) -> Step<()> {
        let tools = self.capabilities.definitions();
        let model = if self.options.model.is_empty() {
            self.backend.default_model().to_string()
        } else {
            self.options.model.clone()
        };
        self.emit(
            StreamEvent::new(StreamEventKind::MessageStart)
                .with_meta("model", model)
                .with_meta("tools", tools.len()),
        )
        .await?;

        let max_iterations = self.options.iterations();
        for iteration in 1..=max_iterations {
            debug!(
                iteration,
                max_iterations,
                messages = self.transcript.len(),
                "Starting iteration"
            );
            let turn = Turn::Iteration(iteration);
            let outcome = self.turn(turn, tools.clone()).await?;

            if outcome.calls.is_empty() {
                self.complete(turn, outcome).await?;
                return self.emit(StreamEvent::new(StreamEventKind::MessageStop)).await;
            }

            info!(count = outcome.calls.len(), iteration, "Processing tool calls");
            let text = outcome.fragments.concat();
            if !outcome.streamed {
                self.intermediate.extend(outcome.fragments);
            }
            self.transcript
                .push(Message::assistant_with_tool_calls(text, outcome.calls.clone()));

            for call in &outcome.calls {
                self.execute(call, iteration).await?;
            }
        }

        info!(max_iterations, "Maximum iterations reached, making final call without tools");
        self.transcript.push(Message::user(FINAL_CALL_INSTRUCTION));
        let outcome = self.turn(Turn::Final, Vec::new()).await?;
        self.complete(Turn::Final, outcome).await?;
        self.emit(StreamEvent::new(StreamEventKind::MessageStop)).await
    }

    /// Stream one backend turn, forwarding text and emitting `ToolUse` as
    /// calls complete.
    async fn turn(&mut self, turn: Turn, tools: Vec<ToolDefinition>) -> Step<TurnOutcome> {
        let mut request = CompletionRequest::new(self.transcript.clone()).with_tools(tools);
        request.model = self.options.model.clone();
        request.system = self.options.system.clone();
        request.max_tokens = self.options.max_tokens;
        request.temperature = self.options.temperature;

        let cancel = self.cancel.clone();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Halted),
            opened = self.backend.stream_with_tools(request) => opened,
        };
        let mut chunks = match opened {
            Ok(chunks) => chunks,
            Err(e) => return Err(self.fail(e).await),
        };

        let live = matches!(turn, Turn::Final) || self.options.include_intermediate_messages;
        let mut builder = ToolCallBuilder::new(match turn {
            Turn::Iteration(iteration) => iteration,
            Turn::Final => 0,
        });
        let mut fragments = Vec::new();
        let mut finish_reason = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Halted),
                next = chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Err(self.fail(e).await),
            };

            if let Some(thinking) = chunk.thinking.filter(|t| !t.is_empty()) {
                self.emit(turn.annotate(StreamEvent::new(StreamEventKind::Thinking(thinking))))
                    .await?;
            }

            if let Some(text) = chunk.delta.filter(|t| !t.is_empty()) {
                if live {
                    self.emit_content(turn, text.clone()).await?;
                }
                fragments.push(text);
            }

            if let Some(delta) = &chunk.tool_call_delta {
                if matches!(turn, Turn::Final) {
                    debug!("Ignoring tool call fragment in final call");
                } else {
                    for call in builder.apply_delta(delta) {
                        self.emit_tool_use(turn, call, None).await?;
                    }
                }
            }

            if let Some(reason) = chunk.finish_reason {
                finish_reason = Some(reason);
                for call in builder.freeze_all() {
                    self.emit_tool_use(turn, call, Some(reason)).await?;
                }
            }
        }

        for call in builder.freeze_all() {
            self.emit_tool_use(turn, call, None).await?;
        }

        Ok(TurnOutcome {
            fragments,
            calls: builder.into_calls(),
            finish_reason,
            streamed: live,
        })
    }

    /// Finish the terminal turn: flush buffered text, replay intermediate
    /// prose if the turn said nothing, then `ContentComplete`.
    async fn complete(&mut self, turn: Turn, outcome: TurnOutcome) -> Step<()> {
        let has_text = outcome.has_text();
        if !outcome.streamed {
            for fragment in outcome.fragments {
                self.emit_content(turn, fragment).await?;
            }
        }

        if !has_text && !self.intermediate.is_empty() {
            debug!(fragments = self.intermediate.len(), "Replaying intermediate content");
            for fragment in std::mem::take(&mut self.intermediate) {
                self.emit(
                    turn.annotate(StreamEvent::new(StreamEventKind::ContentDelta(fragment)))
                        .with_meta("choice_index", 0)
                        .with_meta("replayed", true),
                )
                .await?;
            }
        }

        let mut event = turn.annotate(StreamEvent::new(StreamEventKind::ContentComplete(
            outcome.finish_reason,
        )));
        if let Some(reason) = outcome.finish_reason {
            event = event.with_meta("finish_reason", reason.as_str());
        }
        self.emit(event).await
    }

    /// Run one tool call and append its result, success or error.
    async fn execute(&mut self, call: &ToolCall, iteration: usize) -> Step<()> {
        let (result, is_error) = match self.capabilities.resolve(&call.name) {
            None => {
                warn!(tool = %call.name, "Tool not found");
                (format!("Error: tool not found: {}", call.name), true)
            }
            Some(capability) => {
                let key = capability
                    .cacheable()
                    .then(|| ResultCache::key(&call.name, &call.arguments));
                let cached = key.as_deref().and_then(|key| self.cache.get(key));
                match cached {
                    Some(hit) => {
                        debug!(tool = %call.name, "Serving tool result from cache");
                        (hit, false)
                    }
                    None => {
                        let mut ctx = ToolContext::with_cancel(self.cancel.child_token());
                        if let Some(timeout) = self.options.tool_timeout {
                            ctx = ctx.with_timeout(timeout);
                        }
                        let cancel = self.cancel.clone();
                        let outcome = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(Halted),
                            outcome = run_capability(&ctx, capability.as_ref(), &call.arguments) => outcome,
                        };
                        match outcome {
                            Ok(output) => {
                                if let Some(key) = key {
                                    self.cache.insert(key, output.clone());
                                }
                                (output, false)
                            }
                            Err(e) => {
                                warn!(tool = %call.name, error = %e, "Tool execution error");
                                (format!("Error executing tool: {}", e), true)
                            }
                        }
                    }
                }
            }
        };

        debug!(
            tool = %call.name,
            tool_call_id = %call.id,
            result_length = result.len(),
            "Adding tool result to transcript"
        );
        self.transcript
            .push(Message::tool_result(call.id.clone(), result.clone()));
        self.emit(
            StreamEvent::new(StreamEventKind::ToolResult {
                call: call.clone(),
                result,
                is_error,
            })
            .with_meta("iteration", iteration),
        )
        .await
    }

    async fn emit_content(&self, turn: Turn, text: String) -> Step<()> {
        self.emit(
            turn.annotate(StreamEvent::new(StreamEventKind::ContentDelta(text)))
                .with_meta("choice_index", 0),
        )
        .await
    }

    async fn emit_tool_use(
        &self,
        turn: Turn,
        call: ToolCall,
        finish_reason: Option<FinishReason>,
    ) -> Step<()> {
        debug!(tool = %call.name, tool_call_id = %call.id, "Tool call complete");
        let mut event = turn.annotate(StreamEvent::new(StreamEventKind::ToolUse(call)));
        if let Some(reason) = finish_reason {
            event = event.with_meta("finish_reason", reason.as_str());
        }
        self.emit(event).await
    }

    /// Send one event, giving up if the run is cancelled or the receiver left.
    async fn emit(&self, event: StreamEvent) -> Step<()> {
        if self.cancel.is_cancelled() {
            return Err(Halted);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halted),
            sent = self.tx.send(event) => sent.map_err(|_| Halted),
        }
    }

    /// Classify a backend failure and emit it as the final event.
    async fn fail(&self, err: anyhow::Error) -> Halted {
        let classified = classify_error(err, STREAM_OPERATION, self.backend.id(), "backend");
        error!(
            backend = self.backend.id(),
            kind = %classified.kind(),
            error = %classified,
            "Backend stream failed"
        );
        let event = StreamEvent::new(StreamEventKind::Error(EventError::from(&classified)));
        // The run is over either way.
        let _ = self.emit(event).await;
        Halted
    }
}

async fn run_capability(
    ctx: &ToolContext,
    capability: &dyn Capability,
    arguments: &str,
) -> Result<String, ToolError> {
    match ctx.timeout {
        Some(timeout) => tokio::time::timeout(timeout, capability.execute(ctx, arguments))
            .await
            .map_err(|_| ToolError::Timeout(timeout.as_secs()))?,
        None => capability.execute(ctx, arguments).await,
    }
}
