//! CLI command implementations.

pub mod config;
pub mod mcp;
pub mod run;
pub mod servers;
