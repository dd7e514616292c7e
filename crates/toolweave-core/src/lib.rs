//! # toolweave-core
//!
//! Core types shared by every toolweave crate.
//!
//! This crate provides:
//! - Transcript messages exchanged with a backend
//! - Tool definitions and tool-call requests
//! - The layered configuration system
//! - An injectable TTL cache for capability results
//! - Common error types

pub mod cache;
pub mod config;
pub mod error;
pub mod message;
pub mod tool;

pub use cache::ResultCache;
pub use config::Config;
pub use error::{Error, Result};
pub use message::{Message, Role};
pub use tool::{ToolCall, ToolDefinition, ToolSource};
