//! a2a-console - replay recorded A2A traffic through the sync engine.
//!
//! ## Usage
//!
//! ```bash
//! # Feed a JSON-lines capture through a fresh conversation
//! a2a-console replay capture.jsonl --prompt "List my apps"
//!
//! # Stop the stream after 10 messages, as a user cancel would
//! a2a-console replay capture.jsonl --cancel-after 10
//!
//! # Show the remote conversation list
//! a2a-console --base-url http://localhost:8000 conversations
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use a2a_console_core::models::{ConversationsStore, StreamManager};
use a2a_console_core::repositories::{HttpRemoteStore, InMemoryRemoteStore, RemoteStore};
use a2a_console_core::services::{ExtractedView, ReconcileOutcome};
use a2a_console_core::settings::{SyncSettingsJsonRepository, SyncSettingsRepository};
use a2a_console_core::{ConsoleController, SyncEngine, SyncSettings};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "a2a-console", version, about = "A2A conversation sync console")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Remote store root; without it everything stays in memory
    #[arg(long, global = true, env = "A2A_CONSOLE_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token for the remote store
    #[arg(long, global = true, env = "A2A_CONSOLE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Do not read from or write to the remote store
    #[arg(long, global = true)]
    no_persist: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a JSON-lines file of raw protocol messages as one turn
    Replay {
        file: PathBuf,

        /// User message that opens the turn (defaults to the file name)
        #[arg(long)]
        prompt: Option<String>,

        /// Cancel the turn after this many protocol messages
        #[arg(long)]
        cancel_after: Option<usize>,
    },
    /// Reconcile and list conversations
    Conversations,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    if let Err(err) = run().await {
        eprintln!("Error: {err:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli).await?;
    let engine = build_engine(settings)?;

    match cli.command {
        Command::Replay {
            file,
            prompt,
            cancel_after,
        } => replay(engine, &file, prompt, cancel_after).await,
        Command::Conversations => list_conversations(engine).await,
    }
}

async fn load_settings(cli: &Cli) -> Result<SyncSettings> {
    let repository = match &cli.settings {
        Some(path) => SyncSettingsJsonRepository::with_path(path.clone()),
        None => SyncSettingsJsonRepository::new().context("Failed to resolve settings path")?,
    };
    let mut settings = repository
        .load()
        .await
        .with_context(|| format!("Failed to load settings from {}", repository.storage_path()))?;

    if let Some(base_url) = &cli.base_url {
        settings.base_url = Some(base_url.clone());
    }
    if let Some(token) = &cli.token {
        settings.api_token = Some(token.clone());
    }
    if cli.no_persist {
        settings.persistence_enabled = false;
    }
    Ok(settings)
}

fn build_engine(settings: SyncSettings) -> Result<SyncEngine> {
    let remote: Arc<dyn RemoteStore> = match &settings.base_url {
        Some(base_url) => {
            info!(base_url = %base_url, "Using remote conversation store");
            Arc::new(
                HttpRemoteStore::new(base_url.clone(), settings.api_token.clone())
                    .context("Failed to build HTTP client")?,
            )
        }
        None => {
            info!("No base URL configured, keeping conversations in memory");
            Arc::new(InMemoryRemoteStore::new())
        }
    };

    Ok(SyncEngine::new(
        ConversationsStore::with_debug_capacity(settings.max_debug_events).into_shared(),
        StreamManager::new().into_shared(),
        remote,
        settings,
    ))
}

async fn replay(
    engine: SyncEngine,
    file: &Path,
    prompt: Option<String>,
    cancel_after: Option<usize>,
) -> Result<()> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let prompt = prompt.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "Replay".to_string())
    });

    let controller = ConsoleController::new(engine.clone());
    let conv_id = engine.create_conversation();
    let turn = controller
        .start_turn(&conv_id, &prompt)
        .context("Conversation disappeared before the turn started")?;

    let mut ingested = 0usize;
    let mut cancelled = false;
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if turn.handle.is_cancelled() {
            break;
        }
        let raw: serde_json::Value = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed line");
                continue;
            }
        };
        if controller.ingest(&conv_id, raw).is_some() {
            ingested += 1;
        }
        if cancel_after.is_some_and(|limit| ingested >= limit) {
            controller.cancel_turn(&conv_id);
            cancelled = true;
        }
    }

    if !cancelled {
        controller.complete_turn(&conv_id);
    }
    let view = controller.snapshot(&conv_id).unwrap_or_default();
    engine.flush_pending_saves().await;

    let reply = engine
        .store()
        .lock()
        .get_conversation(&conv_id)
        .and_then(|c| c.message(&turn.assistant_message_id).map(|m| m.content.clone()))
        .unwrap_or_default();

    println!("Conversation {} ({} events applied)", conv_id, ingested);
    print_view(&view);
    if !reply.is_empty() {
        println!("\nReply:\n{}", reply);
    }
    Ok(())
}

fn print_view(view: &ExtractedView) {
    if !view.execution_tasks.is_empty() {
        println!("\nExecution plan:");
        for task in &view.execution_tasks {
            println!(
                "  {:>2}. [{}] {} ({:?})",
                task.order + 1,
                task.agent,
                task.description,
                task.status
            );
        }
    }

    let tools = view
        .active_tool_calls
        .iter()
        .chain(view.completed_tool_calls.iter());
    let mut printed_header = false;
    for call in tools {
        if !printed_header {
            println!("\nTool calls:");
            printed_header = true;
        }
        let agent = call.agent.as_deref().unwrap_or("-");
        println!("  {} via {} ({:?})", call.tool_name, agent, call.status);
    }
}

async fn list_conversations(engine: SyncEngine) -> Result<()> {
    match engine.load_conversations_from_server().await {
        ReconcileOutcome::Reconciled(summary) => {
            info!(added = summary.added.len(), "Conversation list loaded");
        }
        ReconcileOutcome::Disabled => {
            println!("Persistence is disabled");
            return Ok(());
        }
        ReconcileOutcome::Failed => {
            anyhow::bail!("Could not load conversations from the remote store");
        }
    }

    let store = engine.store().lock();
    if store.count() == 0 {
        println!("No conversations");
    }
    for conv in store.list_all() {
        println!(
            "{}  {}  {}",
            conv.id(),
            conv.updated_at().format("%Y-%m-%d %H:%M"),
            conv.title()
        );
    }
    Ok(())
}
