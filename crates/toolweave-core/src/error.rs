//! Error types shared across toolweave crates.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for toolweave.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend error with structured details
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// Tool execution error
    #[error("Tool error: {0}")]
    Tool(String),

    /// Remote protocol error
    #[error("MCP error: {0}")]
    Mcp(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation was cancelled
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/toolweave/config.toml"),
            Error::Backend(e) => e.recovery_suggestion(),
            Error::Mcp(_) => Some("Run 'toolweave mcp tools' to check server connectivity"),
            Error::Validation(_) => Some("Run 'toolweave config validate' for details"),
            _ => None,
        }
    }
}

/// Backend-specific errors with detailed context.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Backend not configured
    #[error("Backend '{backend}' is not configured")]
    NotConfigured {
        backend: String,
        env_var: Option<String>,
    },

    /// API request failed. The status is rendered with its canonical reason so
    /// that downstream classification can match on it.
    #[error("API request to {backend} failed: {status} {reason} - {message}")]
    ApiError {
        backend: String,
        status: u16,
        reason: String,
        message: String,
    },

    /// Streaming error
    #[error("Streaming error from {backend}: {message}")]
    StreamError { backend: String, message: String },
}

impl BackendError {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            BackendError::NotConfigured {
                env_var: Some(_), ..
            } => Some("Set the API key environment variable"),
            BackendError::NotConfigured { .. } => {
                Some("Configure the backend in ~/.config/toolweave/config.toml")
            }
            BackendError::ApiError { status: 401 | 403, .. } => {
                Some("Check that your API key is valid and not expired")
            }
            BackendError::ApiError { status: 429, .. } => {
                Some("You've hit rate limits. Wait a moment and try again")
            }
            BackendError::ApiError {
                status: 500..=599, ..
            } => Some("The API service is having issues. Try again later"),
            _ => None,
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = BackendError::ApiError {
            backend: "openai".into(),
            status: 401,
            reason: "Unauthorized".into(),
            message: "bad key".into(),
        };
        let text = err.to_string();
        assert!(text.contains("401 Unauthorized"));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_format_with_suggestion() {
        let err = Error::Config("missing model".into());
        let text = format_error_with_suggestion(&err);
        assert!(text.contains("missing model"));
        assert!(text.contains("Suggestion:"));

        assert_eq!(format_error_with_suggestion(&Error::Cancelled), "Cancelled");
    }
}
