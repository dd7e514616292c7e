//! Error types for the remote protocol layer.
//!
//! Low-level failures are typed ([`TransportError`], [`ClientError`]). Anything
//! surfaced to a caller is classified into an [`McpError`], which carries an
//! [`McpErrorKind`] and a retryable flag derived from it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;

/// Operation name for connection establishment.
pub const OP_CONNECT: &str = "Connect";
/// Operation name for the initialize handshake.
pub const OP_INITIALIZE: &str = "Initialize";
/// Operation name for tool discovery.
pub const OP_LIST_TOOLS: &str = "ListTools";
/// Operation name for tool invocation.
pub const OP_CALL_TOOL: &str = "CallTool";
/// Operation name for generic server operations.
pub const OP_SERVER: &str = "ServerOperation";

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to spawn the child process.
    #[error("failed to spawn process '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write to the transport.
    #[error("write error: {0}")]
    WriteError(std::io::Error),

    /// Failed to read from the transport.
    #[error("read error: {0}")]
    ReadError(std::io::Error),

    /// The peer closed the stream.
    #[error("connection closed: server process exited")]
    ConnectionClosed,

    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// HTTP request could not be completed.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP endpoint answered with a non-success status.
    #[error("http status {status} {reason}: {body}")]
    HttpStatus {
        status: u16,
        reason: String,
        body: String,
    },

    /// Failed to terminate the process.
    #[error("failed to terminate process: {0}")]
    TerminateFailed(std::io::Error),
}

/// Errors produced by a protocol connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or unexpected protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tool not found on server.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The initialize handshake failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Server returned a JSON-RPC error response.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i32, message: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection is not in the correct state.
    #[error("invalid connection state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The client was closed.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an initialization failed error.
    pub fn init_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Create a server error from a JSON-RPC error.
    pub fn server_error(code: i32, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether the underlying connection can no longer be used.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Protocol(_))
    }
}

/// Category of a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McpErrorKind {
    Connection,
    Timeout,
    Authentication,
    ServerNotFound,
    ServerStartup,
    ServerCrash,
    ToolNotFound,
    ToolInvalidArgs,
    ToolExecution,
    Protocol,
    Serialization,
    Configuration,
    Validation,
    Unknown,
}

impl McpErrorKind {
    /// Stable code used in messages and logs.
    pub fn code(&self) -> &'static str {
        match self {
            McpErrorKind::Connection => "CONNECTION_ERROR",
            McpErrorKind::Timeout => "TIMEOUT_ERROR",
            McpErrorKind::Authentication => "AUTHENTICATION_ERROR",
            McpErrorKind::ServerNotFound => "SERVER_NOT_FOUND",
            McpErrorKind::ServerStartup => "SERVER_STARTUP_ERROR",
            McpErrorKind::ServerCrash => "SERVER_CRASH",
            McpErrorKind::ToolNotFound => "TOOL_NOT_FOUND",
            McpErrorKind::ToolInvalidArgs => "TOOL_INVALID_ARGS",
            McpErrorKind::ToolExecution => "TOOL_EXECUTION_ERROR",
            McpErrorKind::Protocol => "PROTOCOL_ERROR",
            McpErrorKind::Serialization => "SERIALIZATION_ERROR",
            McpErrorKind::Configuration => "CONFIGURATION_ERROR",
            McpErrorKind::Validation => "VALIDATION_ERROR",
            McpErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Retryability is a pure function of the kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            McpErrorKind::Connection
                | McpErrorKind::Timeout
                | McpErrorKind::ServerStartup
                | McpErrorKind::ServerCrash
        )
    }
}

impl fmt::Display for McpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified remote protocol failure.
///
/// Every field is fixed at construction except the metadata map, which sits
/// behind a lock so it can be extended while other tasks read it. Clones share
/// the same metadata.
#[derive(Clone)]
pub struct McpError {
    operation: String,
    server_name: String,
    server_type: String,
    kind: McpErrorKind,
    cause: Option<Arc<anyhow::Error>>,
    retryable: bool,
    metadata: Arc<RwLock<HashMap<String, String>>>,
}

impl McpError {
    /// Create a new error; retryability follows from `kind`.
    pub fn new(
        operation: impl Into<String>,
        server_name: impl Into<String>,
        server_type: impl Into<String>,
        kind: McpErrorKind,
        cause: Option<anyhow::Error>,
    ) -> Self {
        Self {
            operation: operation.into(),
            server_name: server_name.into(),
            server_type: server_type.into(),
            kind,
            cause: cause.map(Arc::new),
            retryable: kind.is_retryable(),
            metadata: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A connection failure.
    pub fn connection(
        server_name: impl Into<String>,
        server_type: impl Into<String>,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self::new(
            OP_CONNECT,
            server_name,
            server_type,
            McpErrorKind::Connection,
            Some(cause.into()),
        )
    }

    /// A timeout during `operation`.
    pub fn timeout(
        operation: impl Into<String>,
        server_name: impl Into<String>,
        server_type: impl Into<String>,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self::new(
            operation,
            server_name,
            server_type,
            McpErrorKind::Timeout,
            Some(cause.into()),
        )
    }

    /// A tool invocation failure, recording the tool name in metadata.
    pub fn tool(
        tool_name: &str,
        server_name: impl Into<String>,
        server_type: impl Into<String>,
        kind: McpErrorKind,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self::new(OP_CALL_TOOL, server_name, server_type, kind, Some(cause.into()))
            .with_metadata("tool_name", tool_name)
    }

    /// A server-level failure.
    pub fn server(
        server_name: impl Into<String>,
        server_type: impl Into<String>,
        kind: McpErrorKind,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self::new(OP_SERVER, server_name, server_type, kind, Some(cause.into()))
    }

    /// A configuration failure not tied to any server.
    pub fn configuration(operation: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self::new(
            operation,
            "",
            "",
            McpErrorKind::Configuration,
            Some(cause.into()),
        )
    }

    /// Add metadata and return self.
    pub fn with_metadata(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_metadata(key, value);
        self
    }

    /// Add metadata through a shared reference.
    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().insert(key.into(), value.into());
    }

    /// Read one metadata value.
    pub fn metadata(&self, key: &str) -> Option<String> {
        self.metadata.read().get(key).cloned()
    }

    /// Copy of all metadata.
    pub fn metadata_snapshot(&self) -> HashMap<String, String> {
        self.metadata.read().clone()
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_type(&self) -> &str {
        &self.server_type
    }

    pub fn kind(&self) -> McpErrorKind {
        self.kind
    }

    /// Whether a retry might succeed.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// The underlying error, if any.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    /// One-line actionable message for end users.
    pub fn user_friendly_message(&self) -> String {
        let cause = self
            .cause
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "<nil>".to_string());
        let server = &self.server_name;

        match self.kind {
            McpErrorKind::Connection if self.server_type == "stdio" => format!(
                "Could not start MCP server '{}'. Please check that the command is installed and accessible.",
                server
            ),
            McpErrorKind::Connection => format!(
                "Could not connect to MCP server '{}'. Please check the server URL and network connectivity.",
                server
            ),
            McpErrorKind::Timeout => format!(
                "MCP server '{}' took too long to respond. This might be a temporary issue - please try again.",
                server
            ),
            McpErrorKind::Authentication => format!(
                "Authentication failed for MCP server '{}'. Please check your credentials or API key.",
                server
            ),
            McpErrorKind::ServerNotFound => {
                "MCP server command not found. Please ensure the server is installed correctly."
                    .to_string()
            }
            McpErrorKind::ToolNotFound => match self.metadata("tool_name") {
                Some(tool) if !tool.is_empty() => format!(
                    "Tool '{}' is not available on MCP server '{}'. Try listing available tools first.",
                    tool, server
                ),
                _ => format!("Requested tool is not available on MCP server '{}'.", server),
            },
            McpErrorKind::ToolInvalidArgs => {
                "Invalid arguments provided to MCP tool. Please check the tool's parameter requirements."
                    .to_string()
            }
            McpErrorKind::Configuration => format!("MCP configuration error: {}", cause),
            _ => format!("MCP server '{}' error: {}", server, cause),
        }
    }
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(4);
        if self.server_name.is_empty() {
            parts.push("MCP operation".to_string());
        } else {
            parts.push(format!("MCP server '{}'", self.server_name));
        }
        if !self.operation.is_empty() {
            parts.push(format!("operation '{}'", self.operation));
        }
        parts.push("failed".to_string());
        if self.kind != McpErrorKind::Unknown {
            parts.push(format!("({})", self.kind));
        }

        write!(f, "{}", parts.join(" "))?;
        if let Some(ref cause) = self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl fmt::Debug for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpError")
            .field("operation", &self.operation)
            .field("server_name", &self.server_name)
            .field("server_type", &self.server_type)
            .field("kind", &self.kind)
            .field("retryable", &self.retryable)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .field("metadata", &*self.metadata.read())
            .finish()
    }
}

impl std::error::Error for McpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

impl From<McpError> for toolweave_core::Error {
    fn from(e: McpError) -> Self {
        toolweave_core::Error::Mcp(e.to_string())
    }
}

/// Classify a failure from a transport or client call.
///
/// An existing [`McpError`] anywhere in the chain is returned unchanged.
/// Typed transport and client errors map structurally; everything else is
/// matched on its lowercased message, first matching category winning.
pub fn classify_error(
    err: impl Into<anyhow::Error>,
    operation: &str,
    server_name: &str,
    server_type: &str,
) -> McpError {
    let err = err.into();
    let err = match err.downcast::<McpError>() {
        Ok(classified) => return classified,
        Err(err) => err,
    };
    if let Some(classified) = err.chain().find_map(|e| e.downcast_ref::<McpError>()) {
        return classified.clone();
    }

    let kind = structural_kind(&err, operation)
        .unwrap_or_else(|| keyword_kind(&format!("{:#}", err).to_lowercase(), operation));

    McpError::new(operation, server_name, server_type, kind, Some(err))
}

fn structural_kind(err: &anyhow::Error, operation: &str) -> Option<McpErrorKind> {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<TransportError>() {
            return transport_kind(e);
        }
        if let Some(e) = cause.downcast_ref::<ClientError>() {
            match e {
                ClientError::Transport(t) => return transport_kind(t),
                ClientError::Timeout(_) => return Some(McpErrorKind::Timeout),
                ClientError::ToolNotFound(_) => return Some(McpErrorKind::ToolNotFound),
                ClientError::Json(_) => return Some(McpErrorKind::Serialization),
                ClientError::Protocol(_) => return Some(McpErrorKind::Protocol),
                ClientError::ServerError { code: -32700, .. } => {
                    return Some(McpErrorKind::Serialization)
                }
                ClientError::ServerError { code: -32602, .. } => {
                    return Some(McpErrorKind::ToolInvalidArgs)
                }
                ClientError::ServerError { code: -32601, .. } if operation == OP_CALL_TOOL => {
                    return Some(McpErrorKind::ToolNotFound)
                }
                _ => return None,
            }
        }
    }
    None
}

fn transport_kind(err: &TransportError) -> Option<McpErrorKind> {
    match err {
        TransportError::SpawnFailed { source, .. }
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Some(McpErrorKind::ServerNotFound)
        }
        TransportError::SpawnFailed { .. } => Some(McpErrorKind::ServerStartup),
        TransportError::ConnectionClosed => Some(McpErrorKind::ServerCrash),
        TransportError::Http(e) if e.is_timeout() => Some(McpErrorKind::Timeout),
        TransportError::Http(e) if e.is_connect() => Some(McpErrorKind::Connection),
        TransportError::HttpStatus { status: 401 | 403, .. } => {
            Some(McpErrorKind::Authentication)
        }
        _ => None,
    }
}

const CATEGORIES: &[(&[&str], McpErrorKind)] = &[
    (
        &[
            "connection refused",
            "connection reset",
            "no route to host",
            "network unreachable",
        ],
        McpErrorKind::Connection,
    ),
    (
        &["timeout", "timed out", "deadline exceeded"],
        McpErrorKind::Timeout,
    ),
    (
        &["authentication", "unauthorized", "forbidden", "invalid token"],
        McpErrorKind::Authentication,
    ),
    (&["not found", "no such file"], McpErrorKind::ServerNotFound),
    (
        &["invalid argument", "invalid parameter", "bad request"],
        McpErrorKind::ToolInvalidArgs,
    ),
    (
        &["json", "unmarshal", "marshal", "parse"],
        McpErrorKind::Serialization,
    ),
    (
        &["protocol", "invalid response", "unexpected"],
        McpErrorKind::Protocol,
    ),
    (&["config", "validation"], McpErrorKind::Configuration),
    (
        &[
            "server crashed",
            "process exited",
            "broken pipe",
            "connection closed",
        ],
        McpErrorKind::ServerCrash,
    ),
];

fn keyword_kind(message: &str, operation: &str) -> McpErrorKind {
    for (keywords, kind) in CATEGORIES {
        if keywords.iter().any(|k| message.contains(k)) {
            if *kind == McpErrorKind::ServerNotFound && operation == OP_CALL_TOOL {
                return McpErrorKind::ToolNotFound;
            }
            return *kind;
        }
    }
    McpErrorKind::Unknown
}

/// One-line actionable message for any error.
///
/// Classified errors, including ones wrapped in context, get a
/// category-specific hint; anything else is shown as its plain message.
pub fn format_user_friendly_error(err: &anyhow::Error) -> String {
    match err.chain().find_map(|e| e.downcast_ref::<McpError>()) {
        Some(e) => e.user_friendly_message(),
        None => err.to_string(),
    }
}
