//! Assembling remote tool servers from config, files and flags.

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use toolweave_core::Config;
use toolweave_mcp::{McpBuilder, McpConfiguration, McpServerManager};

use crate::ServerArgs;

/// Accumulate every configured server into one builder.
///
/// Order: `[mcp]` presets from config, the server file, `--preset`, `--server`.
pub fn builder(config: &Config, args: &ServerArgs) -> anyhow::Result<McpBuilder> {
    let mut builder = McpBuilder::from_settings(&config.mcp);

    if let Some(path) = args.mcp_config.as_ref().or(config.mcp.config_file.as_ref()) {
        let file = McpConfiguration::load(path)
            .with_context(|| format!("loading MCP configuration from {}", path.display()))?;
        file.validate()?;
        debug!(path = %path.display(), servers = file.servers.len(), "Loaded MCP configuration");
        builder = file.apply(builder);
    }

    for preset in &args.presets {
        builder = builder.add_preset(preset);
    }
    for url in &args.servers {
        builder = builder.add_server(url);
    }
    if args.lazy {
        builder = builder.with_health_check(false);
    }
    Ok(builder)
}

/// Build the server manager, connecting eagerly unless health checks are off.
pub async fn manager(
    config: &Config,
    args: &ServerArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<McpServerManager> {
    let builder = builder(config, args)?;
    Ok(McpServerManager::from_builder(builder, cancel).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builder_collects_all_sources() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[servers]]
name = "files"
type = "stdio"
command = "fs-server"
"#
        )
        .unwrap();

        let args = ServerArgs {
            mcp_config: Some(file.path().to_path_buf()),
            presets: vec!["time".into()],
            servers: vec!["stdio://local/usr/bin/tool?verbose".into()],
            lazy: true,
        };
        let builder = builder(&Config::default(), &args).unwrap();

        let names: Vec<_> = builder.descriptors().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["files", "time", "local"]);
        assert!(!builder.health_check());
    }

    #[test]
    fn test_invalid_server_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"servers": [{{"name": "x", "type": "ftp"}}]}}"#).unwrap();

        let args = ServerArgs {
            mcp_config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let err = builder(&Config::default(), &args).unwrap_err();
        assert!(err.to_string().contains("invalid type ftp"));
    }

    #[test]
    fn test_bad_urls_surface_at_build() {
        let args = ServerArgs {
            servers: vec!["ftp://nope".into()],
            ..Default::default()
        };
        let builder = builder(&Config::default(), &args).unwrap();
        assert_eq!(builder.errors().len(), 1);
        assert!(builder.build_lazy().is_err());
    }
}
