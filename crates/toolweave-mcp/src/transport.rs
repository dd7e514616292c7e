//! Byte-level transports to a tool server.
//!
//! [`StdioTransport`] spawns a child process and exchanges newline-delimited
//! JSON over its stdin/stdout. [`HttpTransport`] posts each message to an
//! endpoint and queues whatever the endpoint answers for the next `receive`.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Grace period between SIGTERM and SIGKILL when closing a child.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// A duplex message channel to a server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one JSON message.
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Receive the next JSON message.
    async fn receive(&mut self) -> Result<String, TransportError>;

    /// Release the underlying resources. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// Split `KEY=value` entries; entries without `=` set an empty value.
pub(crate) fn parse_env_entries(env: &[String]) -> Vec<(String, String)> {
    env.iter()
        .filter(|e| !e.is_empty())
        .map(|e| match e.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (e.clone(), String::new()),
        })
        .collect()
}

/// Subprocess transport speaking newline-delimited JSON.
pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Bytes of the line being read; survives a cancelled `receive`.
    line_buf: Vec<u8>,
    connected: bool,
}

impl StdioTransport {
    /// Spawn `command` with `args`, adding `KEY=value` entries from `env` to
    /// the inherited environment.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &[String],
    ) -> Result<Self, TransportError> {
        debug!(command = command, args = ?args, "Spawning tool server process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in parse_env_entries(env) {
            cmd.env(key, value);
        }

        let spawn_failed = |source: std::io::Error| TransportError::SpawnFailed {
            command: command.to_string(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_failed)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed(std::io::Error::other("failed to capture stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed(std::io::Error::other("failed to capture stdout")))?;

        debug!(pid = ?child.id(), "Tool server process spawned");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            line_buf: Vec::new(),
            connected: true,
        })
    }

    /// Process ID of the child, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        debug!(message = message, "-> server");

        let result = async {
            self.stdin.write_all(message.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await
        }
        .await;

        result.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                self.connected = false;
            }
            TransportError::WriteError(e)
        })
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        // `read_until` appends to `line_buf`, so a partial line read before a
        // timeout is kept for the next call.
        loop {
            let bytes_read = self
                .stdout
                .read_until(b'\n', &mut self.line_buf)
                .await
                .map_err(TransportError::ReadError)?;

            if bytes_read == 0 {
                self.connected = false;
                self.line_buf.clear();
                return Err(TransportError::ConnectionClosed);
            }
            if !self.line_buf.ends_with(b"\n") {
                continue;
            }

            let line = String::from_utf8(std::mem::take(&mut self.line_buf)).map_err(|e| {
                TransportError::ReadError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
            let message = line.trim();
            if message.is_empty() {
                continue;
            }

            debug!(message = message, "<- server");
            return Ok(message.to_string());
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected && self.child.id().is_none() {
            return Ok(());
        }
        self.connected = false;

        // Closing stdin lets well-behaved servers exit on EOF.
        let _ = self.stdin.shutdown().await;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        debug!(pid = pid, "Terminating tool server process");

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

            tokio::select! {
                _ = self.child.wait() => {
                    debug!(pid = pid, "Tool server exited");
                    return Ok(());
                }
                _ = tokio::time::sleep(TERMINATE_GRACE) => {
                    warn!(pid = pid, "Tool server did not exit after SIGTERM, killing");
                }
            }
        }

        self.child
            .kill()
            .await
            .map_err(TransportError::TerminateFailed)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// HTTP transport: one POST per message.
///
/// Each response body is queued and handed out by `receive`. Bodies framed as
/// server-sent events contribute one message per `data:` line.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    pending: VecDeque<String>,
    connected: bool,
}

impl HttpTransport {
    /// Create a transport for `url`; `timeout` bounds each request.
    pub fn new(
        url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            auth_token,
            pending: VecDeque::new(),
            connected: true,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn queue_body(&mut self, body: &str) {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return;
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            self.pending.push_back(trimmed.to_string());
            return;
        }
        for line in trimmed.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    self.pending.push_back(data.to_string());
                }
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        debug!(url = %self.url, message = message, "-> server");

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(message.to_string());
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                reason: status
                    .canonical_reason()
                    .unwrap_or("unknown")
                    .to_lowercase(),
                body,
            });
        }

        self.queue_body(&body);
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        match self.pending.pop_front() {
            Some(message) => {
                debug!(url = %self.url, message = %message, "<- server");
                Ok(message)
            }
            None => Err(TransportError::ReadError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "no pending http response",
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
