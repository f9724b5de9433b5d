//! tether - terminal client for a remote coding agent

mod api;
mod chat;
mod commands;
mod config;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use tether_client::{ChatClient, WsTransport};
use tether_wire::{Conversation, ConversationId, ProjectId};
use tracing_subscriber::EnvFilter;

use crate::api::ApiClient;
use crate::chat::Chat;

/// tether - chat with a remote coding agent
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket URL of the bridge service
    #[arg(long)]
    server: Option<String>,

    /// Base URL of the REST API
    #[arg(long)]
    api: Option<String>,

    /// Continue an existing conversation by ID
    #[arg(short = 'C', long)]
    conversation: Option<String>,

    /// Project to work in
    #[arg(short, long)]
    project: Option<String>,

    /// Attach a file to the first message (repeatable)
    #[arg(short, long)]
    attach: Vec<PathBuf>,

    /// Run in non-interactive mode with a single prompt
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// List conversations and exit
    #[arg(long)]
    list: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("tether=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();

    // Merge config with CLI args (CLI takes precedence)
    let server_url = args
        .server
        .or(cfg.server_url.clone())
        .unwrap_or_else(|| config::DEFAULT_SERVER_URL.to_string());
    let api_url = args
        .api
        .or(cfg.api_url.clone())
        .unwrap_or_else(|| config::DEFAULT_API_URL.to_string());
    let project = args.project.or(cfg.project.clone()).map(ProjectId::from);

    let api = ApiClient::new(api_url);

    if args.list {
        return list_conversations(&api, project.as_ref()).await;
    }

    let attachments = args
        .attach
        .iter()
        .map(|path| utils::load_attachment(path))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let conversation =
        resolve_conversation(&api, args.conversation.map(ConversationId::from), project.as_ref())
            .await?;
    let conversation_id = conversation.id.clone();

    let client = ChatClient::new(
        cfg.client_config(),
        Arc::new(WsTransport::new(server_url)),
    );
    let (handle, task) = client.spawn();

    handle.set_conversation(conversation)?;
    handle.open_conversation(conversation_id.clone())?;
    if let Some(project) = &project {
        handle.join_project(project.clone())?;
    }
    if let Err(e) = handle.connect().await {
        eprintln!("Warning: {} (reconnecting in the background)", e);
    }

    let chat = Chat::new(api, handle.clone(), conversation_id);
    chat.refresh_history().await;

    let result = match args.command {
        Some(command) => chat.run_command(&command, attachments).await,
        None => chat.run_interactive(attachments).await,
    };

    handle.shutdown();
    let _ = task.await;
    result
}

/// Find the requested conversation, or create a new one
async fn resolve_conversation(
    api: &ApiClient,
    requested: Option<ConversationId>,
    project: Option<&ProjectId>,
) -> anyhow::Result<Conversation> {
    let Some(id) = requested else {
        let conversation = api.create_conversation(project).await?;
        tracing::info!("Created conversation {}", conversation.id);
        return Ok(conversation);
    };

    let conversations = api.list_conversations(project).await?;
    match conversations.into_iter().find(|c| c.id == id) {
        Some(conversation) => Ok(conversation),
        None => bail!("Unknown conversation: {}", id),
    }
}

async fn list_conversations(api: &ApiClient, project: Option<&ProjectId>) -> anyhow::Result<()> {
    let conversations = api.list_conversations(project).await?;
    if conversations.is_empty() {
        println!("No conversations found.");
        return Ok(());
    }

    println!("Conversations:");
    for conversation in conversations.iter().filter(|c| !c.archived) {
        let updated = utils::format_timestamp(conversation.updated_at);
        let title = if conversation.title.is_empty() {
            "(untitled)"
        } else {
            conversation.title.as_str()
        };
        println!("  {} - {} ({})", conversation.id, title, updated);
    }
    println!("\nUse --conversation <id> to continue one.");
    Ok(())
}
