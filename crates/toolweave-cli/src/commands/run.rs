//! `toolweave run`: stream one prompt through the orchestrator.

use std::io::{self, Write};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use toolweave_agent::{Orchestrator, StreamEventKind, StreamOptions};
use toolweave_core::Config;
use toolweave_providers::{Backend, OpenAiCompatibleBackend};

use crate::commands::servers;
use crate::RunArgs;

const RESULT_PREVIEW_CHARS: usize = 200;

pub async fn run(args: RunArgs, config: Config) -> anyhow::Result<()> {
    let backend = OpenAiCompatibleBackend::from_config(&config.backend);
    if !backend.is_configured() {
        anyhow::bail!(
            "No API key configured. Set {} or backend.api_key in the config file.",
            config.backend.api_key_env
        );
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let manager = servers::manager(&config, &args.servers, &cancel).await?;
    info!(servers = manager.len(), "Remote tool servers ready");

    let orchestrator = Orchestrator::from_config(Arc::new(backend), &config)
        .with_options(options(&config, &args))
        .with_sources(manager.sources());

    let outcome = stream_to_terminal(&orchestrator, cancel.clone(), args.prompt).await;
    manager.close_all().await;
    outcome
}

fn options(config: &Config, args: &RunArgs) -> StreamOptions {
    let mut options = StreamOptions::from_config(config);
    if let Some(ref model) = args.model {
        options.model = model.clone();
    }
    if let Some(max_iterations) = args.max_iterations {
        options.max_iterations = max_iterations;
    }
    if args.include_intermediate {
        options.include_intermediate_messages = true;
    }
    options
}

/// Answer text to stdout, tool activity to stderr.
async fn stream_to_terminal(
    orchestrator: &Orchestrator,
    cancel: CancellationToken,
    prompt: String,
) -> anyhow::Result<()> {
    let mut rx = orchestrator.run(cancel.clone(), prompt).await?;
    let mut stdout = io::stdout();

    while let Some(event) = rx.recv().await {
        match event.kind {
            StreamEventKind::ContentDelta(text) => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            StreamEventKind::ToolUse(call) => {
                eprintln!("→ {} {}", call.name, call.arguments);
            }
            StreamEventKind::ToolResult {
                call,
                result,
                is_error,
            } => {
                let marker = if is_error { "✗" } else { "✓" };
                eprintln!("{} {}: {}", marker, call.name, preview(&result));
            }
            StreamEventKind::MessageStop => {
                writeln!(stdout)?;
            }
            StreamEventKind::Error(err) => {
                writeln!(stdout)?;
                // Keep the classified error in the chain for the friendly formatter.
                return Err(err.into());
            }
            StreamEventKind::MessageStart
            | StreamEventKind::Thinking(_)
            | StreamEventKind::ContentComplete(_) => {}
        }
    }

    if cancel.is_cancelled() {
        eprintln!("\nInterrupted");
    }
    Ok(())
}

/// First line of a tool result, shortened for display.
fn preview(result: &str) -> String {
    let line = result.lines().next().unwrap_or_default();
    if line.chars().count() > RESULT_PREVIEW_CHARS {
        let cut: String = line.chars().take(RESULT_PREVIEW_CHARS).collect();
        format!("{}…", cut)
    } else if result.lines().nth(1).is_some() {
        format!("{} …", line)
    } else {
        line.to_string()
    }
}
