//! Fluent accumulation of server descriptors.
//!
//! Every `add_*` call either records a [`LazyServerDescriptor`] or records an
//! error message. Nothing fails until [`McpBuilder::build_lazy`] or
//! [`McpBuilder::build`], which report every accumulated problem at once.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::McpClient;
use crate::error::McpError;
use crate::presets;
use crate::retry::RetryPolicy;

/// How a server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stdio,
    Http,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerKind::Stdio => "stdio",
            ServerKind::Http => "http",
        }
    }
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(ServerKind::Stdio),
            "http" => Ok(ServerKind::Http),
            other => Err(format!("unknown server type: {}", other)),
        }
    }
}

/// Declarative description of a server. Holds no live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyServerDescriptor {
    pub name: String,
    pub kind: ServerKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// `KEY=value` entries added to the child environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl LazyServerDescriptor {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServerKind::Stdio,
            command: command.into(),
            args,
            env: Vec::new(),
            base_url: String::new(),
            auth_token: None,
        }
    }

    pub fn http(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServerKind::Http,
            command: String::new(),
            args: Vec::new(),
            env: Vec::new(),
            base_url: base_url.into(),
            auth_token: None,
        }
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Check the structural invariants of the descriptor.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("server name is required".to_string());
        }
        match self.kind {
            ServerKind::Stdio if self.command.is_empty() => Err(format!(
                "server {}: command is required for stdio type",
                self.name
            )),
            ServerKind::Http => Url::parse(&self.base_url)
                .map(|_| ())
                .map_err(|e| format!("server {}: invalid url {:?}: {}", self.name, self.base_url, e)),
            ServerKind::Stdio => Ok(()),
        }
    }
}

/// Parse a `stdio://` or `http(s)://` server URL.
///
/// `stdio://<name>/<command-path>?a=1&b` yields command `/<command-path>` and
/// args `["--a=1", "--b"]`. Without a host the first path segment is the name.
/// HTTP URLs are kept whole and named after `host[:port]`.
///
/// The command path and the derived flags are passed to the child as-is,
/// without shell escaping.
pub fn parse_server_url(raw: &str) -> Result<LazyServerDescriptor, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid server URL {:?}: {}", raw, e))?;

    match url.scheme() {
        "stdio" => {
            let host = url.host_str().filter(|h| !h.is_empty());
            let path = url.path();

            let (name, command) = match host {
                Some(host) => (host.to_string(), path.to_string()),
                None => {
                    let trimmed = path.trim_start_matches('/');
                    match trimmed.split_once('/') {
                        Some((name, rest)) if !name.is_empty() => {
                            (name.to_string(), format!("/{}", rest))
                        }
                        _ => (trimmed.to_string(), String::new()),
                    }
                }
            };

            if name.is_empty() || command.is_empty() || command == "/" {
                return Err(format!("invalid stdio URL format: {}", raw));
            }

            let args = url
                .query_pairs()
                .map(|(k, v)| {
                    if v.is_empty() {
                        format!("--{}", k)
                    } else {
                        format!("--{}={}", k, v)
                    }
                })
                .collect();

            Ok(LazyServerDescriptor::stdio(name, command, args))
        }
        "http" | "https" => {
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| format!("invalid http URL, missing host: {}", raw))?;
            let name = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            Ok(LazyServerDescriptor::http(name, raw))
        }
        other => Err(format!("unsupported URL scheme {:?} in {}", other, raw)),
    }
}

/// What [`McpBuilder::build`] produced.
#[derive(Debug, Default)]
pub struct BuildOutput {
    /// Clients connected and verified during the build.
    pub clients: Vec<Arc<McpClient>>,
    /// Descriptors left for lazy connection.
    pub descriptors: Vec<LazyServerDescriptor>,
}

/// Fluent accumulator of server descriptors.
#[derive(Debug, Clone)]
pub struct McpBuilder {
    descriptors: Vec<LazyServerDescriptor>,
    errors: Vec<String>,
    retry: RetryPolicy,
    timeout: Duration,
    health_check: bool,
}

impl Default for McpBuilder {
    fn default() -> Self {
        Self {
            descriptors: Vec::new(),
            errors: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            health_check: false,
        }
    }
}

impl McpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded with the `[mcp]` config section.
    pub fn from_settings(settings: &toolweave_core::config::McpSettings) -> Self {
        let mut builder = Self::new()
            .with_retry_policy(RetryPolicy::from_settings(&settings.retry))
            .with_timeout(Duration::from_secs(settings.timeout_secs))
            .with_health_check(settings.health_check);
        for preset in &settings.presets {
            builder = builder.add_preset(preset);
        }
        builder
    }

    pub fn with_retry(mut self, max_attempts: u32, initial_delay: Duration) -> Self {
        self.retry.max_attempts = max_attempts;
        self.retry.initial_delay = initial_delay;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect and list tools for every server during [`build`](Self::build)
    /// instead of on first use. Off by default.
    pub fn with_health_check(mut self, enabled: bool) -> Self {
        self.health_check = enabled;
        self
    }

    fn push(mut self, result: Result<LazyServerDescriptor, String>) -> Self {
        match result.and_then(|d| d.validate().map(|_| d)) {
            Ok(descriptor) => {
                debug!(server = %descriptor.name, kind = %descriptor.kind, "Added server");
                self.descriptors.push(descriptor);
            }
            Err(message) => {
                debug!(error = %message, "Recorded builder error");
                self.errors.push(message);
            }
        }
        self
    }

    pub fn add_stdio_server<I, S>(self, name: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args.into_iter().map(Into::into).collect();
        self.push(Ok(LazyServerDescriptor::stdio(name, command, args)))
    }

    pub fn add_http_server(self, name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let name = name.into();
        let base_url = base_url.into();
        let result = Url::parse(&base_url)
            .map(|_| LazyServerDescriptor::http(name.as_str(), base_url.as_str()))
            .map_err(|e| format!("server {}: invalid url {:?}: {}", name, base_url, e));
        self.push(result)
    }

    /// Add an HTTP server authenticated with `token`.
    ///
    /// The token is sent as a bearer credential and is also appended to the
    /// URL as a `token` query parameter for servers that only read it there.
    /// Query-embedded tokens end up in logs and proxies; prefer header-only
    /// auth where the server supports it.
    pub fn add_http_server_with_auth(
        self,
        name: impl Into<String>,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let base_url = base_url.into();
        let token = token.into();
        let result = Url::parse(&base_url)
            .map(|mut url| {
                url.query_pairs_mut().append_pair("token", &token);
                LazyServerDescriptor::http(name.as_str(), url.as_str()).with_auth_token(token.as_str())
            })
            .map_err(|e| format!("server {}: invalid url {:?}: {}", name, base_url, e));
        self.push(result)
    }

    /// Add a server from a `stdio://` or `http(s)://` URL.
    pub fn add_server(self, url: &str) -> Self {
        self.push(parse_server_url(url))
    }

    /// Add a named preset, checking its required environment variables.
    pub fn add_preset(self, name: &str) -> Self {
        self.push(presets::get_preset(name).map_err(|e| e.to_string()))
    }

    pub fn add_descriptor(self, descriptor: LazyServerDescriptor) -> Self {
        self.push(Ok(descriptor))
    }

    pub fn descriptors(&self) -> &[LazyServerDescriptor] {
        &self.descriptors
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn health_check(&self) -> bool {
        self.health_check
    }

    /// Create an unconnected client for `descriptor` with this builder's
    /// timeout and retry policy.
    pub fn client_for(&self, descriptor: LazyServerDescriptor) -> McpClient {
        McpClient::new(descriptor, self.timeout, self.retry.clone())
    }

    fn aggregate_error(&self) -> Option<McpError> {
        if self.errors.is_empty() {
            return None;
        }
        Some(McpError::configuration(
            "Build",
            anyhow::anyhow!("builder errors: {}", self.errors.join("; ")),
        ))
    }

    /// Return every descriptor in insertion order, or one aggregate error.
    pub fn build_lazy(self) -> Result<Vec<LazyServerDescriptor>, McpError> {
        if let Some(err) = self.aggregate_error() {
            return Err(err);
        }
        Ok(self.descriptors)
    }

    /// Build the server set.
    ///
    /// By default no connection is made and every descriptor is returned for
    /// lazy use. With health checking enabled, every server is connected and
    /// asked for its tools; if any fails, clients that did connect are closed
    /// and the classified error is returned.
    pub async fn build(self, cancel: &CancellationToken) -> Result<BuildOutput, McpError> {
        if let Some(err) = self.aggregate_error() {
            return Err(err);
        }

        if !self.health_check {
            return Ok(BuildOutput {
                clients: Vec::new(),
                descriptors: self.descriptors,
            });
        }

        let mut clients: Vec<Arc<McpClient>> = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            let client = Arc::new(self.client_for(descriptor.clone()));
            let checked = async {
                client.connect(cancel).await?;
                client.list_tools(cancel).await
            }
            .await;

            match checked {
                Ok(tools) => {
                    info!(server = %descriptor.name, tool_count = tools.len(), "Server healthy");
                    clients.push(client);
                }
                Err(err) => {
                    warn!(server = %descriptor.name, error = %err, "Health check failed, closing connected servers");
                    let _ = client.close().await;
                    for connected in &clients {
                        let _ = connected.close().await;
                    }
                    return Err(err);
                }
            }
        }

        Ok(BuildOutput {
            clients,
            descriptors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::McpErrorKind;

    #[test]
    fn test_builder_defaults() {
        let builder = McpBuilder::new();
        assert_eq!(builder.retry_policy(), &RetryPolicy::default());
        assert_eq!(builder.timeout(), Duration::from_secs(30));
        assert!(!builder.health_check());
        assert!(builder.descriptors().is_empty());
        assert!(builder.errors().is_empty());
    }

    #[test]
    fn test_with_retry_and_timeout() {
        let builder = McpBuilder::new()
            .with_retry(3, Duration::from_millis(100))
            .with_timeout(Duration::from_secs(5))
            .with_health_check(true);
        assert_eq!(builder.retry_policy().max_attempts, 3);
        assert_eq!(builder.retry_policy().initial_delay, Duration::from_millis(100));
        assert_eq!(builder.retry_policy().max_delay, Duration::from_secs(30));
        assert_eq!(builder.timeout(), Duration::from_secs(5));
        assert!(builder.health_check());
    }

    #[test]
    fn test_add_stdio_and_http() {
        let builder = McpBuilder::new()
            .add_stdio_server("fs", "npx", ["-y", "server-fs"])
            .add_http_server("api", "http://localhost:8080/mcp");

        let d = builder.descriptors();
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].kind, ServerKind::Stdio);
        assert_eq!(d[0].args, vec!["-y", "server-fs"]);
        assert_eq!(d[1].kind, ServerKind::Http);
        assert_eq!(d[1].base_url, "http://localhost:8080/mcp");
    }

    #[test]
    fn test_add_http_server_with_auth() {
        let builder =
            McpBuilder::new().add_http_server_with_auth("auth", "https://api.example.com/mcp", "secret-token");
        let d = &builder.descriptors()[0];
        assert_eq!(d.name, "auth");
        assert!(d.base_url.contains("token=secret-token"));
        assert_eq!(d.auth_token.as_deref(), Some("secret-token"));

        let bad = McpBuilder::new().add_http_server_with_auth("bad", "not-a-url", "t");
        assert!(bad.descriptors().is_empty());
        assert_eq!(bad.errors().len(), 1);
    }

    #[test]
    fn test_parse_stdio_url_with_host() {
        let d = parse_server_url("stdio://myserver/usr/bin/test?arg1=val1&arg2").unwrap();
        assert_eq!(d.name, "myserver");
        assert_eq!(d.kind, ServerKind::Stdio);
        assert_eq!(d.command, "/usr/bin/test");
        assert_eq!(d.args, vec!["--arg1=val1", "--arg2"]);
    }

    #[test]
    fn test_parse_stdio_url_without_host() {
        let d = parse_server_url("stdio:///command/path/to/executable").unwrap();
        assert_eq!(d.name, "command");
        assert_eq!(d.command, "/path/to/executable");
        assert!(d.args.is_empty());
    }

    #[test]
    fn test_parse_http_urls() {
        let d = parse_server_url("http://localhost:8080/mcp").unwrap();
        assert_eq!(d.name, "localhost:8080");
        assert_eq!(d.kind, ServerKind::Http);
        assert_eq!(d.base_url, "http://localhost:8080/mcp");

        let d = parse_server_url("https://api.example.com/mcp?token=secret").unwrap();
        assert_eq!(d.name, "api.example.com");
        assert_eq!(d.base_url, "https://api.example.com/mcp?token=secret");
    }

    #[test]
    fn test_parse_invalid_urls() {
        assert!(parse_server_url("stdio://").is_err());
        assert!(parse_server_url("not a url").is_err());
        assert!(parse_server_url("not://a-valid-url").is_err());
        let err = parse_server_url("ftp://server.com/path").unwrap_err();
        assert!(err.contains("ftp"));
    }

    #[test]
    fn test_build_lazy_preserves_order() {
        let descriptors = McpBuilder::new()
            .add_stdio_server("server1", "cmd1", Vec::<String>::new())
            .add_server("http://server2:9000/mcp")
            .add_stdio_server("server3", "cmd3", Vec::<String>::new())
            .build_lazy()
            .unwrap();
        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["server1", "server2:9000", "server3"]);
    }

    #[test]
    fn test_build_lazy_fails_together() {
        let err = McpBuilder::new()
            .add_server("ftp://x")
            .add_server("stdio://ok/usr/bin/tool")
            .add_server("gopher://y")
            .build_lazy()
            .unwrap_err();

        assert_eq!(err.kind(), McpErrorKind::Configuration);
        let message = err.to_string();
        assert!(message.contains("builder errors: "));
        assert!(message.contains("ftp"));
        assert!(message.contains("; "));
        assert!(message.contains("gopher"));
    }

    #[test]
    fn test_empty_stdio_command_is_an_error() {
        let builder = McpBuilder::new().add_stdio_server("s", "", Vec::<String>::new());
        assert_eq!(builder.errors().len(), 1);
        assert!(builder.errors()[0].contains("command is required"));
    }

    #[test]
    fn test_unknown_preset_is_recorded() {
        let builder = McpBuilder::new().add_preset("no-such-preset");
        assert_eq!(builder.errors(), &["preset \"no-such-preset\" not found".to_string()]);
    }

    #[tokio::test]
    async fn test_default_build_is_lazy() {
        let output = McpBuilder::new()
            .add_stdio_server("never-started", "/definitely/not/a/real/command-xyz", Vec::<String>::new())
            .add_http_server("api", "http://127.0.0.1:1/mcp")
            .build(&CancellationToken::new())
            .await
            .unwrap();
        assert!(output.clients.is_empty());
        let names: Vec<_> = output.descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["never-started", "api"]);
    }

    #[tokio::test]
    async fn test_build_with_errors_returns_no_descriptors() {
        let result = McpBuilder::new()
            .with_health_check(false)
            .add_server("ftp://x")
            .add_server("stdio://ok/usr/bin/tool")
            .build(&CancellationToken::new())
            .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("builder errors"));
    }

    #[tokio::test]
    async fn test_health_check_failure_is_classified() {
        let err = McpBuilder::new()
            .with_health_check(true)
            .with_retry(1, Duration::from_millis(1))
            .add_stdio_server("missing", "definitely-not-a-real-command-xyz", Vec::<String>::new())
            .build(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), McpErrorKind::ServerNotFound);
        assert_eq!(err.server_name(), "missing");
    }
}
