//! # toolweave-cli
//!
//! Command-line interface for toolweave.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use toolweave_core::Config;
use toolweave_mcp::format_user_friendly_error;

mod commands;

/// toolweave - stream tool-augmented conversations with a language model
#[derive(Parser, Debug)]
#[command(name = "toolweave")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load configuration from this file instead of the default locations
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a prompt and stream the answer
    Run(RunArgs),
    /// MCP server inspection
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Prompt to send
    prompt: String,

    /// Model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Tool-calling iterations before the final answer
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Show prose the model writes while calling tools
    #[arg(long)]
    include_intermediate: bool,

    #[command(flatten)]
    servers: ServerArgs,
}

/// Where remote tool servers come from.
#[derive(Args, Debug, Default)]
struct ServerArgs {
    /// MCP server configuration file (TOML or JSON)
    #[arg(long, value_name = "FILE")]
    mcp_config: Option<PathBuf>,

    /// Enable a preset server (repeatable)
    #[arg(long = "preset", value_name = "NAME")]
    presets: Vec<String>,

    /// Add a server by URL, e.g. stdio://fs/usr/bin/fs-server (repeatable)
    #[arg(long = "server", value_name = "URL")]
    servers: Vec<String>,

    /// Skip the startup health check and connect on first use
    #[arg(long)]
    lazy: bool,
}

#[derive(Subcommand, Debug)]
enum McpAction {
    /// List preset servers
    Presets,
    /// Show details of a preset
    PresetInfo {
        /// Preset name
        name: String,
    },
    /// Validate an MCP configuration file
    Validate {
        /// Configuration file
        file: PathBuf,
    },
    /// Connect to servers and list their tools
    Tools(ServerArgs),
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Validate the effective configuration
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so streamed answers on stdout stay clean.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {}", format_user_friendly_error(&e));
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref());

    match cli.command {
        Commands::Run(args) => commands::run::run(args, config).await,
        Commands::Mcp { action } => commands::mcp::handle(action, &config).await,
        Commands::Config { action } => commands::config::handle(action, &config),
        Commands::Version => {
            println!("toolweave {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Config {
    let loaded = match path {
        Some(path) => Config::load_from(path.clone()),
        None => Config::load(),
    };
    loaded.unwrap_or_else(|e| {
        tracing::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "toolweave",
            "run",
            "what time is it?",
            "--max-iterations",
            "3",
            "--preset",
            "time",
            "--server",
            "stdio://fs/usr/bin/fs-server",
            "--include-intermediate",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.prompt, "what time is it?");
                assert_eq!(args.max_iterations, Some(3));
                assert!(args.include_intermediate);
                assert_eq!(args.servers.presets, vec!["time"]);
                assert_eq!(args.servers.servers, vec!["stdio://fs/usr/bin/fs-server"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_mcp_tools() {
        let cli = Cli::try_parse_from(["toolweave", "-v", "mcp", "tools", "--lazy", "--preset", "git"])
            .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Mcp {
                action: McpAction::Tools(args),
            } => {
                assert!(args.lazy);
                assert_eq!(args.presets, vec!["git"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_prompt() {
        assert!(Cli::try_parse_from(["toolweave", "run"]).is_err());
    }
}
