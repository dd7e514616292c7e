//! # toolweave-tools
//!
//! Capabilities: named, schema-typed units of work a model may invoke.
//!
//! ## Architecture
//!
//! Capabilities implement the [`Capability`] trait. In-process capabilities
//! are registered with a [`CapabilityRegistry`]; remote ones are produced by a
//! [`CapabilitySource`] snapshot. A [`CapabilitySet`] merges both into the
//! name-keyed lookup table used for one orchestration run.
//!
//! ## Example
//!
//! ```ignore
//! use toolweave_tools::{CapabilityRegistry, FnCapability, ToolContext};
//! use std::sync::Arc;
//!
//! let mut registry = CapabilityRegistry::new();
//! registry.register(Arc::new(FnCapability::new("upper", "Uppercase text", |args| {
//!     Ok(args.to_uppercase())
//! })));
//!
//! let out = registry.get("upper").unwrap().execute(&ToolContext::new(), "\"hi\"").await?;
//! ```

use thiserror::Error;

pub mod registry;

pub use registry::{
    Capability, CapabilityRegistry, CapabilitySet, CapabilitySource, FnCapability, ToolContext,
};

/// Errors that can occur during capability execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Capability was not found.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// Invalid arguments provided to the capability.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation timed out.
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Execution was cancelled.
    #[error("execution cancelled")]
    Cancelled,

    /// The capability ran and reported failure.
    #[error("{0}")]
    ExecutionFailed(String),

    /// Failure from a remote capability provider.
    #[error("{0}")]
    Remote(#[source] anyhow::Error),
}

impl ToolError {
    /// Create an invalid arguments error.
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    /// Create an execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }
}
