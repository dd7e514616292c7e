//! Built-in table of well-known tool servers.

use thiserror::Error;

use crate::builder::{LazyServerDescriptor, ServerKind};

/// A predefined server configuration.
#[derive(Debug, Clone, Copy)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ServerKind,
    pub command: &'static str,
    pub args: &'static [&'static str],
    pub url: &'static str,
    /// Variables that must be set; their values are forwarded to the child.
    pub required_env: &'static [&'static str],
}

const fn npx(
    name: &'static str,
    description: &'static str,
    args: &'static [&'static str],
    required_env: &'static [&'static str],
) -> Preset {
    Preset {
        name,
        description,
        kind: ServerKind::Stdio,
        command: "npx",
        args,
        url: "",
        required_env,
    }
}

static PRESETS: &[Preset] = &[
    npx(
        "filesystem",
        "MCP server for file system operations",
        &["-y", "@modelcontextprotocol/server-filesystem"],
        &[],
    ),
    npx(
        "github",
        "MCP server for GitHub operations",
        &["-y", "@modelcontextprotocol/server-github"],
        &["GITHUB_TOKEN"],
    ),
    npx(
        "git",
        "MCP server for Git operations",
        &["-y", "@modelcontextprotocol/server-git"],
        &[],
    ),
    npx(
        "postgres",
        "MCP server for PostgreSQL database operations",
        &["-y", "@modelcontextprotocol/server-postgres"],
        &["DATABASE_URL"],
    ),
    npx(
        "slack",
        "MCP server for Slack operations",
        &["-y", "@modelcontextprotocol/server-slack"],
        &["SLACK_BOT_TOKEN", "SLACK_TEAM_ID"],
    ),
    npx(
        "gdrive",
        "MCP server for Google Drive operations",
        &["-y", "@modelcontextprotocol/server-gdrive"],
        &["GOOGLE_CREDENTIALS"],
    ),
    npx(
        "puppeteer",
        "MCP server for web automation with Puppeteer",
        &["-y", "@modelcontextprotocol/server-puppeteer"],
        &[],
    ),
    npx(
        "memory",
        "MCP server for memory and knowledge management",
        &["-y", "@modelcontextprotocol/server-memory"],
        &[],
    ),
    npx(
        "fetch",
        "MCP server for making HTTP requests",
        &["-y", "@modelcontextprotocol/server-fetch"],
        &[],
    ),
    npx(
        "brave-search",
        "MCP server for Brave Search API",
        &["-y", "@modelcontextprotocol/server-brave-search"],
        &["BRAVE_API_KEY"],
    ),
    npx(
        "time",
        "MCP server for time and date operations",
        &["-y", "@modelcontextprotocol/server-time"],
        &[],
    ),
    npx(
        "sqlite",
        "MCP server for SQLite database operations",
        &["-y", "@modelcontextprotocol/server-sqlite", "path/to/database.db"],
        &[],
    ),
    Preset {
        name: "docker",
        description: "MCP server for Docker container management",
        kind: ServerKind::Stdio,
        command: "docker",
        args: &[
            "run",
            "--rm",
            "-i",
            "--volume",
            "/var/run/docker.sock:/var/run/docker.sock",
            "mcp/docker-server:latest",
        ],
        url: "",
        required_env: &[],
    },
    Preset {
        name: "kubectl",
        description: "MCP server for Kubernetes operations",
        kind: ServerKind::Stdio,
        command: "kubectl-mcp",
        args: &["serve"],
        url: "",
        required_env: &[],
    },
    Preset {
        name: "aws",
        description: "MCP server for AWS operations",
        kind: ServerKind::Stdio,
        command: "docker",
        args: &[
            "run",
            "--rm",
            "-i",
            "--env",
            "AWS_REGION",
            "--env",
            "AWS_ACCESS_KEY_ID",
            "--env",
            "AWS_SECRET_ACCESS_KEY",
            "public.ecr.aws/awslabs-mcp/awslabs/aws-api-mcp-server:latest",
        ],
        url: "",
        required_env: &["AWS_REGION", "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresetError {
    #[error("preset \"{0}\" not found")]
    NotFound(String),

    #[error("preset \"{preset}\" requires environment variable {var} to be set")]
    MissingEnv { preset: String, var: String },
}

/// Look up a preset entry without resolving it.
pub fn find_preset(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.name == name)
}

/// Resolve a preset against the process environment.
pub fn get_preset(name: &str) -> Result<LazyServerDescriptor, PresetError> {
    get_preset_with(name, |var| std::env::var(var).ok())
}

/// Resolve a preset, reading required variables through `lookup`.
pub fn get_preset_with<F>(name: &str, lookup: F) -> Result<LazyServerDescriptor, PresetError>
where
    F: Fn(&str) -> Option<String>,
{
    let preset = find_preset(name).ok_or_else(|| PresetError::NotFound(name.to_string()))?;

    let mut env = Vec::with_capacity(preset.required_env.len());
    for var in preset.required_env {
        match lookup(var) {
            Some(value) if !value.is_empty() => env.push(format!("{}={}", var, value)),
            _ => {
                return Err(PresetError::MissingEnv {
                    preset: name.to_string(),
                    var: var.to_string(),
                })
            }
        }
    }

    let args = preset.args.iter().map(|a| a.to_string()).collect();
    let descriptor = match preset.kind {
        ServerKind::Stdio => LazyServerDescriptor::stdio(preset.name, preset.command, args),
        ServerKind::Http => LazyServerDescriptor::http(preset.name, preset.url),
    };
    Ok(descriptor.with_env(env))
}

/// Preset names, sorted.
pub fn list_presets() -> Vec<&'static str> {
    let mut names: Vec<_> = PRESETS.iter().map(|p| p.name).collect();
    names.sort_unstable();
    names
}

/// Human-readable summary of a preset.
pub fn preset_info(name: &str) -> Result<String, PresetError> {
    let preset = find_preset(name).ok_or_else(|| PresetError::NotFound(name.to_string()))?;

    let mut info = format!(
        "Name: {}\nDescription: {}\nType: {}\n",
        preset.name, preset.description, preset.kind
    );
    match preset.kind {
        ServerKind::Stdio => {
            info.push_str(&format!("Command: {}\n", preset.command));
            if !preset.args.is_empty() {
                info.push_str(&format!("Args: [{}]\n", preset.args.join(" ")));
            }
        }
        ServerKind::Http => info.push_str(&format!("URL: {}\n", preset.url)),
    }
    if !preset.required_env.is_empty() {
        info.push_str(&format!(
            "Required Environment Variables: [{}]\n",
            preset.required_env.join(" ")
        ));
    }
    Ok(info)
}
