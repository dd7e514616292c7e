//! Server configuration files.
//!
//! A file lists servers and a few global knobs. TOML and JSON are accepted,
//! chosen by extension:
//!
//! ```toml
//! [global]
//! timeout = "30s"
//! retry_attempts = 3
//!
//! [[servers]]
//! name = "files"
//! type = "stdio"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Format, Json, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::builder::{LazyServerDescriptor, McpBuilder, ServerKind};

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported config format for {0} (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<figment::Error>,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

/// A tool declared up front for a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpToolConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

fn default_enabled() -> bool {
    true
}

/// One server entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub name: String,
    /// `"stdio"` or `"http"`.
    #[serde(rename = "type", default)]
    pub server_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// `KEY=value` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<McpToolConfig>,
}

impl McpServerConfig {
    fn from_descriptor(d: &LazyServerDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            server_type: d.kind.as_str().to_string(),
            url: d.base_url.clone(),
            command: d.command.clone(),
            args: d.args.clone(),
            env: d.env.clone(),
            token: d.auth_token.clone(),
            enabled: true,
            description: String::new(),
            tags: Vec::new(),
            config: BTreeMap::new(),
            tools: Vec::new(),
        }
    }
}

/// Settings applying to every server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpGlobalConfig {
    /// Per-request timeout, e.g. `"30s"` or `"500ms"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Contents of a server configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfiguration {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub global: McpGlobalConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Toml,
    Json,
}

fn file_format(path: &Path) -> Result<FileFormat, ConfigFileError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(FileFormat::Toml),
        Some("json") => Ok(FileFormat::Json),
        _ => Err(ConfigFileError::UnsupportedFormat(path.to_path_buf())),
    }
}

impl McpConfiguration {
    /// Load a file; the extension selects the format.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let format = file_format(path)?;
        if !path.is_file() {
            return Err(ConfigFileError::NotFound(path.to_path_buf()));
        }

        let figment = match format {
            FileFormat::Toml => Figment::from(Toml::file(path)),
            FileFormat::Json => Figment::from(Json::file(path)),
        };
        let config: Self = figment.extract().map_err(|e| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;

        debug!(path = %path.display(), servers = config.servers.len(), "Loaded server config");
        Ok(config)
    }

    /// Write the configuration; the extension selects the format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigFileError> {
        let path = path.as_ref();
        let contents = match file_format(path)? {
            FileFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| ConfigFileError::Serialize(e.to_string()))?,
            FileFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| ConfigFileError::Serialize(e.to_string()))?,
        };
        std::fs::write(path, contents).map_err(|source| ConfigFileError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Configuration describing `descriptors`, all enabled.
    pub fn from_descriptors(descriptors: &[LazyServerDescriptor]) -> Self {
        Self {
            servers: descriptors.iter().map(McpServerConfig::from_descriptor).collect(),
            global: McpGlobalConfig {
                health_check: Some(true),
                ..Default::default()
            },
        }
    }

    /// Report the first structural problem, if any.
    pub fn validate(&self) -> Result<(), ConfigFileError> {
        let mut names = HashSet::new();

        for (i, server) in self.servers.iter().enumerate() {
            if server.name.is_empty() {
                return Err(ConfigFileError::Invalid(format!("server {}: name is required", i)));
            }
            if !names.insert(server.name.as_str()) {
                return Err(ConfigFileError::Invalid(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
            match server.server_type.as_str() {
                "stdio" if server.command.is_empty() => {
                    return Err(ConfigFileError::Invalid(format!(
                        "server {}: command is required for stdio type",
                        server.name
                    )))
                }
                "http" if server.url.is_empty() => {
                    return Err(ConfigFileError::Invalid(format!(
                        "server {}: url is required for http type",
                        server.name
                    )))
                }
                "stdio" | "http" => {}
                other => {
                    return Err(ConfigFileError::Invalid(format!(
                        "server {}: invalid type {} (must be 'stdio' or 'http')",
                        server.name, other
                    )))
                }
            }
        }

        if let Some(ref timeout) = self.global.timeout {
            parse_duration(timeout).map_err(ConfigFileError::Invalid)?;
        }
        Ok(())
    }

    /// Add the enabled servers and global settings to `builder`.
    pub fn apply(&self, mut builder: McpBuilder) -> McpBuilder {
        if let Some(ref timeout) = self.global.timeout {
            match parse_duration(timeout) {
                Ok(d) => builder = builder.with_timeout(d),
                Err(e) => warn!(timeout = %timeout, error = %e, "Ignoring invalid global timeout"),
            }
        }
        if let Some(attempts) = self.global.retry_attempts.filter(|n| *n > 0) {
            let initial = builder.retry_policy().initial_delay;
            builder = builder.with_retry(attempts, initial);
        }
        if let Some(enabled) = self.global.health_check {
            builder = builder.with_health_check(enabled);
        }

        let mut enabled_count = 0;
        for server in &self.servers {
            if !server.enabled {
                debug!(server = %server.name, "Skipping disabled server");
                continue;
            }

            builder = match server.server_type.parse::<ServerKind>() {
                Ok(ServerKind::Stdio) => builder.add_descriptor(
                    LazyServerDescriptor::stdio(
                        server.name.as_str(),
                        server.command.as_str(),
                        server.args.clone(),
                    )
                    .with_env(server.env.clone()),
                ),
                Ok(ServerKind::Http) => match server.token {
                    Some(ref token) if !token.is_empty() => builder.add_http_server_with_auth(
                        server.name.as_str(),
                        server.url.as_str(),
                        token.as_str(),
                    ),
                    _ => builder.add_http_server(server.name.as_str(), server.url.as_str()),
                },
                Err(_) => {
                    warn!(server = %server.name, server_type = %server.server_type, "Unknown server type, skipping");
                    continue;
                }
            };

            enabled_count += 1;
            info!(server = %server.name, server_type = %server.server_type, "Configured server from file");
        }

        info!(
            total_servers = self.servers.len(),
            enabled_servers = enabled_count,
            "Applied server configuration"
        );
        builder
    }
}

/// Parse `"500ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let (number, unit_ms): (&str, u64) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        return Err(format!("invalid duration {:?}: missing unit (ms, s, m, h)", input));
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {:?}", input))?;
    Ok(Duration::from_millis(value.saturating_mul(unit_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn stdio(name: &str, command: &str) -> McpServerConfig {
        McpServerConfig {
            name: name.to_string(),
            server_type: "stdio".to_string(),
            url: String::new(),
            command: command.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            token: None,
            enabled: true,
            description: String::new(),
            tags: Vec::new(),
            config: BTreeMap::new(),
            tools: Vec::new(),
        }
    }

    fn http(name: &str, url: &str) -> McpServerConfig {
        McpServerConfig {
            server_type: "http".to_string(),
            url: url.to_string(),
            command: String::new(),
            ..stdio(name, "")
        }
    }

    fn invalid(config: &McpConfiguration) -> String {
        config.validate().unwrap_err().to_string()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("abcs").is_err());
    }

    #[test]
    fn test_validate_messages() {
        let mut config = McpConfiguration::default();
        assert!(config.validate().is_ok());

        config.servers = vec![stdio("", "cmd")];
        assert_eq!(invalid(&config), "server 0: name is required");

        config.servers = vec![stdio("a", "cmd"), stdio("a", "cmd")];
        assert_eq!(invalid(&config), "duplicate server name: a");

        let mut odd = stdio("b", "cmd");
        odd.server_type = "grpc".to_string();
        config.servers = vec![odd];
        assert_eq!(
            invalid(&config),
            "server b: invalid type grpc (must be 'stdio' or 'http')"
        );

        config.servers = vec![stdio("c", "")];
        assert_eq!(invalid(&config), "server c: command is required for stdio type");

        config.servers = vec![http("d", "")];
        assert_eq!(invalid(&config), "server d: url is required for http type");
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[global]
timeout = "10s"
retry_attempts = 2

[[servers]]
name = "files"
type = "stdio"
command = "npx"
args = ["-y", "server-fs"]
env = ["ROOT=/tmp"]

[[servers]]
name = "off"
type = "stdio"
command = "x"
enabled = false
"#
        )
        .unwrap();

        let config = McpConfiguration::load(&path).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers[0].enabled);
        assert!(!config.servers[1].enabled);
        assert_eq!(config.global.timeout.as_deref(), Some("10s"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"{"servers":[{"name":"api","type":"http","url":"https://example.com/mcp","token":"t"}],
                "global":{"health_check":false}}"#,
        )
        .unwrap();

        let config = McpConfiguration::load(&path).unwrap();
        assert_eq!(config.servers[0].server_type, "http");
        assert_eq!(config.servers[0].token.as_deref(), Some("t"));
        assert_eq!(config.global.health_check, Some(false));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            McpConfiguration::load(dir.path().join("missing.toml")),
            Err(ConfigFileError::NotFound(_))
        ));
        assert!(matches!(
            McpConfiguration::load(dir.path().join("servers.yaml")),
            Err(ConfigFileError::UnsupportedFormat(_))
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            McpConfiguration::load(&bad),
            Err(ConfigFileError::Parse { .. })
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let descriptors = vec![
            LazyServerDescriptor::stdio("fs", "npx", vec!["-y".into()]).with_env(vec!["A=1".into()]),
            LazyServerDescriptor::http("api", "https://example.com/mcp"),
        ];
        let config = McpConfiguration::from_descriptors(&descriptors);

        for name in ["out.json", "out.toml"] {
            let path = dir.path().join(name);
            config.save(&path).unwrap();
            let loaded = McpConfiguration::load(&path).unwrap();
            assert_eq!(loaded, config, "format: {}", name);
        }
    }

    #[test]
    fn test_apply_adds_enabled_servers() {
        let mut disabled = stdio("off", "x");
        disabled.enabled = false;
        let mut unknown = stdio("weird", "x");
        unknown.server_type = "grpc".to_string();
        let mut authed = http("secure", "https://example.com/mcp");
        authed.token = Some("abc".to_string());

        let config = McpConfiguration {
            servers: vec![
                stdio("fs", "npx"),
                disabled,
                unknown,
                http("plain", "http://localhost:9000/mcp"),
                authed,
            ],
            global: McpGlobalConfig {
                timeout: Some("5s".to_string()),
                retry_attempts: Some(2),
                health_check: Some(false),
                log_level: None,
            },
        };

        let builder = config.apply(McpBuilder::new());
        assert_eq!(builder.timeout(), Duration::from_secs(5));
        assert_eq!(builder.retry_policy().max_attempts, 2);
        assert!(!builder.health_check());

        let names: Vec<_> = builder.descriptors().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["fs", "plain", "secure"]);
        let secure = &builder.descriptors()[2];
        assert_eq!(secure.auth_token.as_deref(), Some("abc"));
        assert!(secure.base_url.contains("token=abc"));
    }
}
