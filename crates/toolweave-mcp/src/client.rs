//! Protocol client.
//!
//! [`McpConnection`] speaks JSON-RPC over one live transport. [`McpClient`]
//! wraps a [`LazyServerDescriptor`] and only opens a connection on first use,
//! reconnecting after the transport fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::{LazyServerDescriptor, ServerKind};
use crate::error::{
    classify_error, ClientError, McpError, McpErrorKind, OP_CALL_TOOL, OP_CONNECT,
    OP_LIST_TOOLS,
};
use crate::protocol::{
    CallToolParams, CallToolResult, IncomingMessage, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, ListToolsResult, RemoteTool, RequestId,
    METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_LIST_TOOLS,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::{HttpTransport, StdioTransport, Transport};

/// A live JSON-RPC session over one transport.
///
/// Requests are serialized: the transport lock is held from send until the
/// matching response arrives.
pub struct McpConnection {
    name: String,
    transport: Mutex<Box<dyn Transport>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl McpConnection {
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            transport: Mutex::new(transport),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<R, ClientError> {
        let id = RequestId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
        let payload = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;

        let exchange = async {
            let mut transport = self.transport.lock().await;
            transport.send(&payload).await?;
            loop {
                let raw = transport.receive().await?;
                let message: IncomingMessage = serde_json::from_str(&raw).map_err(|e| {
                    ClientError::protocol(format!("unparseable message from server: {}", e))
                })?;
                if message.is_response_to(&id) {
                    return Ok::<_, ClientError>(message);
                }
                debug!(
                    server = %self.name,
                    method = ?message.method,
                    id = ?message.id,
                    "Skipping unrelated message"
                );
            }
        };

        let message = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, exchange) => {
                outcome.map_err(|_| ClientError::Timeout(self.timeout))??
            }
        };

        if let Some(error) = message.error {
            return Err(ClientError::server_error(error.code, error.message));
        }
        let result = message
            .result
            .ok_or_else(|| ClientError::protocol(format!("response to {} missing result", method)))?;
        Ok(serde_json::from_value(result)?)
    }

    async fn notify(&self, method: &str) -> Result<(), ClientError> {
        let payload = serde_json::to_string(&JsonRpcNotification::<Value>::new(method, None))?;
        let mut transport = self.transport.lock().await;
        transport.send(&payload).await?;
        Ok(())
    }

    /// Perform the initialize handshake.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<InitializeResult, ClientError> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result: InitializeResult = self
            .request(METHOD_INITIALIZE, Some(params), cancel)
            .await
            .map_err(|e| match e {
                ClientError::ServerError { message, .. } => ClientError::init_failed(message),
                other => other,
            })?;
        self.notify(METHOD_INITIALIZED).await?;

        info!(
            server = %self.name,
            server_name = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "Connection initialized"
        );
        Ok(result)
    }

    /// List every tool, following pagination cursors.
    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<RemoteTool>, ClientError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let page: ListToolsResult = self.request(METHOD_LIST_TOOLS, params, cancel).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        debug!(server = %self.name, tool_count = tools.len(), "Listed tools");
        Ok(tools)
    }

    /// Invoke a tool.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult, ClientError> {
        debug!(server = %self.name, tool = name, "Calling tool");
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        })?;
        self.request(METHOD_CALL_TOOL, Some(params), cancel).await
    }

    pub async fn close(&self) -> Result<(), ClientError> {
        let mut transport = self.transport.lock().await;
        transport.close().await?;
        Ok(())
    }
}

/// Lifecycle of a lazy client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unconnected,
    Connecting,
    Ready,
    /// The last attempt or the live transport failed; the next call reconnects.
    Failed,
    Closed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A client that connects on first use.
///
/// Only one connection attempt runs at a time; callers arriving while one is
/// in flight wait for its outcome. Safe to share behind an `Arc`.
pub struct McpClient {
    descriptor: LazyServerDescriptor,
    timeout: Duration,
    retry: RetryPolicy,
    state: parking_lot::RwLock<ClientState>,
    connection: Mutex<Option<Arc<McpConnection>>>,
    server_info: parking_lot::RwLock<Option<InitializeResult>>,
    connects: AtomicU64,
}

impl McpClient {
    pub fn new(descriptor: LazyServerDescriptor, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            descriptor,
            timeout,
            retry,
            state: parking_lot::RwLock::new(ClientState::Unconnected),
            connection: Mutex::new(None),
            server_info: parking_lot::RwLock::new(None),
            connects: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &LazyServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// Server details reported by the last successful handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().clone()
    }

    /// Number of connection attempts started so far.
    pub fn connect_attempts(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn server_type(&self) -> &'static str {
        self.descriptor.kind.as_str()
    }

    fn set_state(&self, state: ClientState) {
        let mut current = self.state.write();
        let previous = *current;
        if previous != state {
            debug!(server = %self.descriptor.name, from = %previous, to = %state, "Client state change");
            *current = state;
        }
    }

    async fn open_transport(&self) -> Result<Box<dyn Transport>, ClientError> {
        let d = &self.descriptor;
        let transport: Box<dyn Transport> = match d.kind {
            ServerKind::Stdio => Box::new(StdioTransport::spawn(&d.command, &d.args, &d.env).await?),
            ServerKind::Http => Box::new(HttpTransport::new(
                d.base_url.clone(),
                d.auth_token.clone(),
                self.timeout,
            )?),
        };
        Ok(transport)
    }

    /// One connection attempt, or the current live connection.
    async fn connection(&self, cancel: &CancellationToken) -> Result<Arc<McpConnection>, McpError> {
        let mut slot = self.connection.lock().await;

        if self.state() == ClientState::Closed {
            return Err(classify_error(ClientError::Closed, OP_CONNECT, self.name(), self.server_type()));
        }
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        self.set_state(ClientState::Connecting);
        self.connects.fetch_add(1, Ordering::SeqCst);
        info!(server = %self.descriptor.name, kind = self.server_type(), "Connecting to tool server");

        let attempt = async {
            let transport = self.open_transport().await?;
            let conn = Arc::new(McpConnection::new(
                self.descriptor.name.clone(),
                transport,
                self.timeout,
            ));
            match conn.initialize(cancel).await {
                Ok(info) => Ok((conn, info)),
                Err(e) => {
                    let _ = conn.close().await;
                    Err(e)
                }
            }
        };

        match attempt.await {
            Ok((conn, info)) => {
                *self.server_info.write() = Some(info);
                *slot = Some(conn.clone());
                self.set_state(ClientState::Ready);
                Ok(conn)
            }
            Err(e) => {
                self.set_state(ClientState::Failed);
                let err = classify_error(e, OP_CONNECT, self.name(), self.server_type());
                warn!(server = %self.descriptor.name, error = %err, "Connection attempt failed");
                Err(err)
            }
        }
    }

    /// Drop `conn` if it is still the live connection and the error means it
    /// can no longer be used.
    async fn on_call_error(&self, conn: &Arc<McpConnection>, err: &ClientError) {
        if !err.is_connection_lost() {
            return;
        }
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|live| Arc::ptr_eq(live, conn)) {
            *slot = None;
            if self.state() != ClientState::Closed {
                self.set_state(ClientState::Failed);
            }
            warn!(server = %self.descriptor.name, error = %err, "Connection lost");
            let _ = conn.close().await;
        }
    }

    /// Connect eagerly, retrying per the client's policy.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), McpError> {
        with_retry(&self.retry, cancel, OP_CONNECT, move || async move {
            self.connection(cancel).await.map(|_| ())
        })
        .await
    }

    /// Fetch the server's tools. Results are not cached.
    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<RemoteTool>, McpError> {
        with_retry(&self.retry, cancel, OP_LIST_TOOLS, move || async move {
            let conn = self.connection(cancel).await?;
            match conn.list_tools(cancel).await {
                Ok(tools) => Ok(tools),
                Err(e) => {
                    self.on_call_error(&conn, &e).await;
                    Err(classify_error(e, OP_LIST_TOOLS, self.name(), self.server_type()))
                }
            }
        })
        .await
    }

    /// Invoke `tool` with a JSON object of arguments.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult, McpError> {
        with_retry(&self.retry, cancel, OP_CALL_TOOL, move || async move {
            let conn = self.connection(cancel).await?;
            match conn.call_tool(tool, arguments.clone(), cancel).await {
                Ok(result) => Ok(result),
                Err(e) => {
                    self.on_call_error(&conn, &e).await;
                    let err = classify_error(e, OP_CALL_TOOL, self.name(), self.server_type());
                    err.add_metadata("tool_name", tool);
                    Err(err)
                }
            }
        })
        .await
    }

    /// Close the live connection, if any. Later calls fail.
    pub async fn close(&self) -> Result<(), McpError> {
        let mut slot = self.connection.lock().await;
        self.set_state(ClientState::Closed);
        if let Some(conn) = slot.take() {
            info!(server = %self.descriptor.name, "Closing tool server connection");
            conn.close().await.map_err(|e| {
                McpError::server(self.name(), self.server_type(), McpErrorKind::ServerCrash, e)
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.descriptor.name)
            .field("kind", &self.descriptor.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    use crate::error::TransportError;

    /// Transport that answers from a fixed script of raw lines.
    struct ScriptedTransport {
        replies: VecDeque<String>,
        sent: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, message: &str) -> Result<(), TransportError> {
            self.sent.lock().push(message.to_string());
            Ok(())
        }

        async fn receive(&mut self) -> Result<String, TransportError> {
            self.replies.pop_front().ok_or(TransportError::ConnectionClosed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn connection(replies: &[&str]) -> (McpConnection, Arc<parking_lot::Mutex<Vec<String>>>) {
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let transport = ScriptedTransport {
            replies: replies.iter().map(|s| s.to_string()).collect(),
            sent: sent.clone(),
        };
        (
            McpConnection::new("test", Box::new(transport), Duration::from_secs(5)),
            sent,
        )
    }

    #[tokio::test]
    async fn test_request_skips_notifications_and_stale_ids() {
        let (conn, sent) = connection(&[
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#,
            r#"{"jsonrpc":"2.0","id":99,"result":{"tools":[]}}"#,
            r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}"#,
        ]);

        let tools = conn.list_tools(&CancellationToken::new()).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert!(sent.lock()[0].contains("\"method\":\"tools/list\""));
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let (conn, sent) = connection(&[
            r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"a"}],"nextCursor":"p2"}}"#,
            r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"b"}]}}"#,
        ]);

        let tools = conn.list_tools(&CancellationToken::new()).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(sent.lock()[1].contains("\"cursor\":\"p2\""));
    }

    #[tokio::test]
    async fn test_server_error_response() {
        let (conn, _) = connection(&[
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Invalid params"}}"#,
        ]);

        let err = conn
            .call_tool("echo", serde_json::json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ServerError { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_garbled_output_is_protocol_error() {
        let (conn, _) = connection(&["this is not json"]);
        let err = conn.list_tools(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_initialize_sends_initialized_notification() {
        let (conn, sent) = connection(&[
            r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock"}}}"#,
        ]);

        let info = conn.initialize(&CancellationToken::new()).await.unwrap();
        assert_eq!(info.server_info.name, "mock");

        let sent = sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("notifications/initialized"));
        assert!(!sent[1].contains("\"id\""));
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let (conn, _) = connection(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = conn.list_tools(&cancel).await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }

    #[tokio::test]
    async fn test_lazy_client_starts_unconnected() {
        let descriptor = LazyServerDescriptor::stdio("never", "definitely-not-a-real-command-xyz", vec![]);
        let client = McpClient::new(
            descriptor,
            Duration::from_secs(1),
            RetryPolicy::new(1, Duration::from_millis(1)),
        );
        assert_eq!(client.state(), ClientState::Unconnected);
        assert_eq!(client.connect_attempts(), 0);

        let err = client.list_tools(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), McpErrorKind::ServerNotFound);
        assert_eq!(client.state(), ClientState::Failed);
        assert_eq!(client.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let descriptor = LazyServerDescriptor::stdio("s", "cat", vec![]);
        let client = McpClient::new(descriptor, Duration::from_secs(1), RetryPolicy::default());
        client.close().await.unwrap();
        assert_eq!(client.state(), ClientState::Closed);

        let err = client.list_tools(&CancellationToken::new()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(client.connect_attempts(), 0);
    }
}
