//! MCP server inspection commands.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use toolweave_core::Config;
use toolweave_mcp::presets::find_preset;
use toolweave_mcp::{list_presets, preset_info, McpConfiguration};

use crate::commands::servers;
use crate::McpAction;

pub async fn handle(action: McpAction, config: &Config) -> anyhow::Result<()> {
    match action {
        McpAction::Presets => {
            println!("Available presets:");
            for line in preset_lines() {
                println!("  {}", line);
            }
        }
        McpAction::PresetInfo { name } => {
            print!("{}", preset_info(&name)?);
        }
        McpAction::Validate { file } => {
            println!("{}", validate_file(&file)?);
        }
        McpAction::Tools(args) => {
            let cancel = CancellationToken::new();
            let manager = servers::manager(config, &args, &cancel).await?;
            if manager.is_empty() {
                println!("No MCP servers configured.");
                return Ok(());
            }

            for client in manager.clients() {
                println!("{}:", client.name());
                match client.list_tools(&cancel).await {
                    Ok(tools) if tools.is_empty() => println!("  (no tools)"),
                    Ok(tools) => {
                        for tool in tools {
                            match tool.description {
                                Some(ref description) => {
                                    println!("  {} - {}", tool.name, description)
                                }
                                None => println!("  {}", tool.name),
                            }
                        }
                    }
                    Err(e) => println!("  error: {}", e.user_friendly_message()),
                }
            }
            manager.close_all().await;
        }
    }
    Ok(())
}

fn preset_lines() -> Vec<String> {
    list_presets()
        .into_iter()
        .filter_map(find_preset)
        .map(|preset| format!("{:<14} {}", preset.name, preset.description))
        .collect()
}

/// Load and validate a server file, summarizing it.
fn validate_file(path: &Path) -> anyhow::Result<String> {
    let file = McpConfiguration::load(path)?;
    file.validate()?;
    let enabled = file.servers.iter().filter(|s| s.enabled).count();
    Ok(format!(
        "{} is valid: {} servers ({} enabled)",
        path.display(),
        file.servers.len(),
        enabled
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_preset_lines_are_sorted() {
        let lines = preset_lines();
        assert_eq!(lines.len(), list_presets().len());
        assert!(lines[0].starts_with("aws"));
        assert!(lines.iter().any(|l| l.starts_with("filesystem")));
    }

    #[test]
    fn test_validate_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"servers": [
                {{"name": "a", "type": "stdio", "command": "a-server"}},
                {{"name": "b", "type": "http", "url": "http://localhost:8080", "enabled": false}}
            ]}}"#
        )
        .unwrap();

        let summary = validate_file(file.path()).unwrap();
        assert!(summary.ends_with("is valid: 2 servers (1 enabled)"));
    }

    #[test]
    fn test_validate_file_reports_problem() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[servers]]
name = "web"
type = "http"
"#
        )
        .unwrap();

        let err = validate_file(file.path()).unwrap_err();
        assert_eq!(err.to_string(), "server web: url is required for http type");
    }
}
