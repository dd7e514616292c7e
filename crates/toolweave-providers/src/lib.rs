//! # toolweave-providers
//!
//! Language model backends for toolweave.
//!
//! This crate provides:
//! - The [`Backend`] trait: one streamed turn with optional tool calling
//! - An OpenAI-compatible streaming backend
//! - A scripted backend for tests and offline runs

pub mod mock;
pub mod openai;
pub mod sse;
pub mod traits;

pub use mock::{Script, ScriptEnd, ScriptedBackend};
pub use openai::OpenAiCompatibleBackend;
pub use traits::{
    Backend, ChunkStream, CompletionRequest, FinishReason, StreamChunk, ToolCallDelta, Usage,
};
