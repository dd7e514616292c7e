//! Configuration management commands.

use toolweave_core::config::IssueSeverity;
use toolweave_core::Config;
use toolweave_mcp::presets::find_preset;

use crate::ConfigAction;

pub fn handle(action: ConfigAction, config: &Config) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Validate => {
            let result = config.validate();
            for line in issue_lines(config) {
                println!("{}", line);
            }
            if !result.is_ok() {
                anyhow::bail!("configuration has {} error(s)", result.errors().len());
            }
            println!("Configuration is valid.");
        }
    }
    Ok(())
}

/// Core validation issues plus warnings for presets that do not exist.
fn issue_lines(config: &Config) -> Vec<String> {
    let mut lines: Vec<String> = config
        .validate()
        .issues
        .iter()
        .map(|issue| {
            let level = match issue.severity {
                IssueSeverity::Error => "error",
                IssueSeverity::Warning => "warning",
            };
            format!("{}: {}: {}", level, issue.field, issue.message)
        })
        .collect();

    for preset in &config.mcp.presets {
        if find_preset(preset).is_none() {
            lines.push(format!("warning: mcp.presets: unknown preset \"{}\"", preset));
        }
    }
    lines
}
