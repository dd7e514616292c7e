//! # toolweave-mcp
//!
//! Client side of the Model Context Protocol: remote tool servers reached over
//! a subprocess or HTTP.
//!
//! This crate provides:
//! - JSON-RPC framing and the protocol messages
//! - stdio and HTTP transports
//! - A lazily connecting client with single-flight reconnects
//! - Error classification and capped exponential retry
//! - A fluent builder, a preset table and a config file format
//! - Adapters exposing remote tools as capabilities

pub mod builder;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod presets;
pub mod protocol;
pub mod retry;
pub mod tools;
pub mod transport;

pub use builder::{parse_server_url, BuildOutput, LazyServerDescriptor, McpBuilder, ServerKind};
pub use client::{ClientState, McpClient, McpConnection};
pub use config::{McpConfiguration, McpGlobalConfig, McpServerConfig};
pub use discovery::{McpServerManager, ServerSource};
pub use error::{
    classify_error, format_user_friendly_error, ClientError, McpError, McpErrorKind,
    TransportError,
};
pub use presets::{get_preset, list_presets, preset_info, PresetError};
pub use retry::{with_retry, RetryPolicy};
pub use tools::McpToolWrapper;
