//! # toolweave-agent
//!
//! Streaming tool-call orchestration for toolweave.
//!
//! This crate provides:
//! - The ordered [`StreamEvent`] stream handed to callers
//! - The generate → execute tools → regenerate loop ([`stream`])
//! - The [`Memory`] interface and an in-process buffer
//! - The [`Orchestrator`], which ties a backend, capabilities and memory together

pub mod agent;
pub mod events;
pub mod memory;
pub mod stream;

pub use agent::{AgentError, AgentResult, Orchestrator};
pub use events::{EventError, StreamEvent, StreamEventKind};
pub use memory::{BufferMemory, Memory};
pub use stream::{stream, stream_transcript, StreamOptions, FINAL_CALL_INSTRUCTION};
