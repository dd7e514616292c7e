//! Configuration system for toolweave.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Error;

/// Main configuration struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Language model backend
    pub backend: BackendConfig,
    /// Orchestration loop settings
    pub orchestrator: OrchestratorConfig,
    /// Remote protocol server settings
    pub mcp: McpSettings,
    /// Capability result cache
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,
    /// API key (can be set directly or via environment)
    pub api_key: Option<String>,
    /// Environment variable name for API key
    pub api_key_env: String,
    /// Model identifier
    pub model: String,
    /// Maximum tokens per response
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

impl BackendConfig {
    /// Resolve the API key from either direct value or environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            return Some(key.clone());
        }
        std::env::var(&self.api_key_env).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tool-calling iterations before the final no-tool call
    pub max_iterations: usize,
    /// Capacity of the output event channel
    pub buffer_size: usize,
    /// Forward prose from tool-calling turns live
    pub include_intermediate_messages: bool,
    /// Optional system prompt prepended to every run
    pub system_prompt: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            buffer_size: 100,
            include_intermediate_messages: false,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Server configuration file (TOML or JSON)
    pub config_file: Option<PathBuf>,
    /// Presets to enable by name
    pub presets: Vec<String>,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Connect eagerly and verify servers before use
    pub health_check: bool,
    /// Reconnection policy
    pub retry: RetrySettings,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            config_file: None,
            presets: Vec::new(),
            timeout_secs: 30,
            health_check: true,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Randomize each delay within [0, delay]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable caching of cacheable capability results
    pub enabled: bool,
    /// Entry lifetime in seconds
    pub ttl_secs: u64,
    /// Maximum number of entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 256,
        }
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "orchestrator.max_iterations")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Build the layered figment: defaults, user file, project file, environment.
    ///
    /// Environment variables use a double underscore between levels, e.g.
    /// `TOOLWEAVE_MCP__TIMEOUT_SECS=10`.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            .merge(Toml::file(".toolweave/config.toml"))
            .merge(Env::prefixed("TOOLWEAVE_").split("__"))
    }

    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// Load configuration from a single explicit file on top of the defaults.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.into()))
            .extract()
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self, Error> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        let result = config.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!(field = %warning.field, "Config warning: {}", warning.message);
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.backend.model.is_empty() {
            result.add_error("backend.model", "Model name cannot be empty");
        }

        if !self.backend.base_url.starts_with("http://")
            && !self.backend.base_url.starts_with("https://")
        {
            result.add_error(
                "backend.base_url",
                "base_url must start with http:// or https://",
            );
        }

        if self.backend.max_tokens == 0 {
            result.add_error("backend.max_tokens", "max_tokens must be greater than 0");
        }

        if !(0.0..=2.0).contains(&self.backend.temperature) {
            result.add_warning("backend.temperature", "temperature is outside 0.0..=2.0");
        }

        if self.backend.api_key.as_ref().is_some_and(|k| k.is_empty()) {
            result.add_warning("backend.api_key", "API key is empty string");
        }

        if self.orchestrator.max_iterations == 0 {
            result.add_error(
                "orchestrator.max_iterations",
                "max_iterations must be greater than 0",
            );
        }

        if self.orchestrator.buffer_size == 0 {
            result.add_error("orchestrator.buffer_size", "buffer_size must be greater than 0");
        }

        if self.mcp.timeout_secs == 0 {
            result.add_error("mcp.timeout_secs", "timeout_secs must be greater than 0");
        }

        if self.mcp.retry.max_attempts == 0 {
            result.add_error("mcp.retry.max_attempts", "max_attempts must be at least 1");
        } else if self.mcp.retry.max_attempts > 10 {
            result.add_warning(
                "mcp.retry.max_attempts",
                "max_attempts above 10 can stall a run for minutes",
            );
        }

        if self.mcp.retry.multiplier < 1.0 {
            result.add_error("mcp.retry.multiplier", "multiplier must be at least 1.0");
        }

        if self.mcp.retry.initial_delay_ms > self.mcp.retry.max_delay_ms {
            result.add_warning(
                "mcp.retry.initial_delay_ms",
                "initial_delay_ms exceeds max_delay_ms and will be capped",
            );
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            result.add_warning("cache.max_entries", "cache is enabled but can hold no entries");
        }

        result
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("toolweave"))
            .unwrap_or_else(|| PathBuf::from("~/.config/toolweave"))
    }
}
