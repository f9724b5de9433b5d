//! Line-based chat loop on top of a running client

use std::io::{self, IsTerminal, Write};

use anyhow::Result;
use tether_client::{
    ClientEvent, ClientHandle, ConnectionStatus, OutgoingMessage, TimelineItem, Turn, TurnUpdate,
};
use tether_wire::{
    Attachment, ConversationId, Decision, Fragment, PendingPrompt, PromptKind, Role, SessionState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::api::ApiClient;
use crate::commands::{self, SlashCommand};
use crate::utils::truncate_chars;

/// Whether the input loop keeps going
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// One conversation driven from the terminal
#[derive(Clone)]
pub struct Chat {
    api: ApiClient,
    handle: ClientHandle,
    conversation_id: ConversationId,
}

impl Chat {
    pub fn new(api: ApiClient, handle: ClientHandle, conversation_id: ConversationId) -> Self {
        Self {
            api,
            handle,
            conversation_id,
        }
    }

    /// Send a single prompt and wait for its turn to finish.
    ///
    /// Slash commands typed while it runs are still honored, so prompts
    /// raised by the agent can be answered.
    pub async fn run_command(&self, command: &str, mut attachments: Vec<Attachment>) -> Result<()> {
        println!("tether> {}", command);
        println!();

        let printer = self.spawn_event_printer();
        let turn = self
            .handle
            .send(
                OutgoingMessage::new(self.conversation_id.clone(), command)
                    .with_attachments(std::mem::take(&mut attachments)),
            )
            .await?;
        let mut turn_task = tokio::spawn(stream_turn(turn));

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        loop {
            tokio::select! {
                _ = &mut turn_task => break,
                line = lines.next_line(), if stdin_open => match line? {
                    Some(line) => {
                        if self.handle_line(&line, &mut attachments).await? == Flow::Quit {
                            self.handle.abort_conversation(self.conversation_id.clone()).await?;
                            break;
                        }
                    }
                    None => stdin_open = false,
                },
            }
        }

        printer.abort();
        Ok(())
    }

    pub async fn run_interactive(&self, mut attachments: Vec<Attachment>) -> Result<()> {
        if io::stderr().is_terminal() {
            eprintln!("tether conversation: {}", self.conversation_id);
            eprintln!("Type /help for available commands.");
            eprintln!();
        }

        let printer = self.spawn_event_printer();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                // EOF
                break;
            };
            if self.handle_line(&line, &mut attachments).await? == Flow::Quit {
                break;
            }
        }

        printer.abort();
        Ok(())
    }

    async fn handle_line(&self, line: &str, attachments: &mut Vec<Attachment>) -> Result<Flow> {
        let input = line.trim();
        if input.is_empty() {
            return Ok(Flow::Continue);
        }

        let Some(command) = commands::parse(input) else {
            let message = OutgoingMessage::new(self.conversation_id.clone(), input)
                .with_attachments(attachments.clone());
            match self.handle.send(message).await {
                Ok(turn) => {
                    attachments.clear();
                    tokio::spawn(stream_turn(turn));
                }
                Err(e) => eprintln!("Error: {}", e),
            }
            return Ok(Flow::Continue);
        };

        let conversation_id = self.conversation_id.clone();
        match command {
            SlashCommand::Help => println!("{}", commands::help_message()),
            SlashCommand::Abort => match self.handle.abort_conversation(conversation_id).await? {
                Some(request_id) => println!("[aborting {}]", request_id),
                None => println!("Nothing to abort."),
            },
            SlashCommand::Decide(decision) => {
                if let Err(e) = self.decide(decision).await {
                    eprintln!("Error: {:#}", e);
                }
            }
            SlashCommand::Init => match self.handle.initialize_session(conversation_id).await {
                Ok(()) => println!("[the next message starts a fresh session]"),
                Err(e) => eprintln!("Error: {}", e),
            },
            SlashCommand::Retry => match self.handle.retry().await {
                Ok(()) => println!("[reconnected]"),
                Err(e) => eprintln!("Error: {}", e),
            },
            SlashCommand::History => {
                self.refresh_history().await;
                print_timeline(&self.handle.timeline(conversation_id).await?);
            }
            SlashCommand::Status => self.print_status().await?,
            SlashCommand::Quit => return Ok(Flow::Quit),
            SlashCommand::Usage(usage) => println!("Usage: {}", usage),
            SlashCommand::Unknown(cmd) => {
                println!("Unknown command: /{}", cmd);
                println!("Type /help for available commands.");
            }
        }
        Ok(Flow::Continue)
    }

    /// Answer the conversation's active prompt
    async fn decide(&self, decision: Decision) -> Result<()> {
        let snapshot = self.handle.snapshot(self.conversation_id.clone()).await?;
        let Some(prompt) = snapshot.pending_prompts.first().cloned() else {
            println!("No pending prompt.");
            return Ok(());
        };

        if let Decision::Plan(plan) = &decision {
            if self.handle.connection().status != ConnectionStatus::Connected {
                self.api.submit_plan_decision(&prompt.prompt_id, plan).await?;
                self.handle.dismiss_prompt(prompt.prompt_id.clone())?;
                println!("[plan decision sent over HTTP]");
                return Ok(());
            }
        }

        self.handle
            .resolve_prompt(prompt.prompt_id.clone(), decision)
            .await?;
        Ok(())
    }

    /// Refetch persisted history and hand it to the client
    pub async fn refresh_history(&self) {
        let session_id = match self.handle.snapshot(self.conversation_id.clone()).await {
            Ok(snapshot) => snapshot.session_id,
            Err(_) => return,
        };
        match self
            .api
            .fetch_history(&self.conversation_id, session_id.as_ref())
            .await
        {
            Ok(messages) => {
                let _ = self
                    .handle
                    .load_history(self.conversation_id.clone(), messages);
            }
            Err(e) => tracing::warn!("History refresh failed: {:#}", e),
        }
    }

    async fn print_status(&self) -> Result<()> {
        let connection = self.handle.connection();
        let snapshot = self.handle.snapshot(self.conversation_id.clone()).await?;

        println!(
            "Connection: {:?} (reconnect attempts: {})",
            connection.status, connection.reconnect_attempts
        );
        match &snapshot.session_id {
            Some(id) => println!("Session: {:?} ({})", snapshot.session_state, id),
            None => println!("Session: {:?}", snapshot.session_state),
        }
        println!(
            "Tokens: {} in, {} out | ${:.4}",
            snapshot.usage.input, snapshot.usage.output, snapshot.usage.cost_usd
        );
        if let Some(request_id) = &snapshot.active_request {
            println!("Running: {}", request_id);
        }
        if !snapshot.pending_prompts.is_empty() {
            println!("Pending prompts: {}", snapshot.pending_prompts.len());
        }
        if let Some(error) = &snapshot.last_error {
            println!("Last error: {}", error);
        }
        Ok(())
    }

    fn spawn_event_printer(&self) -> JoinHandle<()> {
        let chat = self.clone();
        let mut events = BroadcastStream::new(self.handle.subscribe());
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => chat.on_event(event).await,
                    Err(e) => tracing::warn!("Event printer fell behind: {}", e),
                }
            }
        })
    }

    async fn on_event(&self, event: ClientEvent) {
        if event
            .conversation_id()
            .is_some_and(|id| *id != self.conversation_id)
        {
            return;
        }

        match event {
            ClientEvent::ConnectionChanged {
                status,
                reconnect_attempts,
            } => match status {
                ConnectionStatus::Disconnected if reconnect_attempts > 0 => {
                    eprintln!("\n[disconnected, reconnect attempt {}]", reconnect_attempts)
                }
                ConnectionStatus::Lost => {
                    eprintln!("\n[connection lost, type /retry to reconnect]")
                }
                _ => tracing::debug!("Connection {:?}", status),
            },
            ClientEvent::SessionChanged {
                state: SessionState::Error,
                ..
            } => eprintln!("\n[session failed, type /init to start a fresh one]"),
            ClientEvent::PromptSurfaced { prompt } => print_prompt(&prompt),
            ClientEvent::PromptRejected { reason, .. } => {
                eprintln!("\n[prompt resolution rejected: {}]", reason)
            }
            ClientEvent::HistoryStale { .. } => self.refresh_history().await,
            ClientEvent::Domain { event, .. } => tracing::debug!("Domain event '{}'", event),
            ClientEvent::Error {
                request_id: None,
                message,
                ..
            } => eprintln!("\nError: {}", message),
            _ => {}
        }
    }
}

/// Print a turn's output as it streams
async fn stream_turn(mut turn: Turn) {
    let is_tty = io::stdout().is_terminal();
    let mut streamed = false;

    while let Some(update) = turn.updates.recv().await {
        match update {
            TurnUpdate::Fragment(fragment) => match fragment {
                Fragment::ContentDelta { text } => {
                    streamed = true;
                    print!("{}", text);
                    io::stdout().flush().ok();
                }
                Fragment::Text { text } if !streamed => {
                    print!("{}", text);
                    io::stdout().flush().ok();
                }
                Fragment::ToolUse { name, .. } => {
                    print!("\n[{}...", name);
                    io::stdout().flush().ok();
                }
                Fragment::ToolResult {
                    content, is_error, ..
                } => {
                    if is_error {
                        println!(" error]");
                        println!("  {}", truncate_chars(&content, 80).replace('\n', " "));
                    } else {
                        let first_line = content.lines().next().unwrap_or("");
                        println!(" {}]", truncate_chars(first_line, 40));
                    }
                }
                Fragment::Result { usage, .. } if is_tty => {
                    println!(
                        "\n[{} in, {} out | ${:.4}]",
                        usage.input, usage.output, usage.cost_usd
                    );
                }
                _ => {}
            },
            TurnUpdate::Completed { .. } => println!(),
            TurnUpdate::Failed(e) => eprintln!("\nError: {}", e),
            TurnUpdate::Aborted => println!("\n[aborted]"),
        }
    }
}

fn print_prompt(prompt: &PendingPrompt) {
    match &prompt.kind {
        PromptKind::Permission { tool_name, input } => {
            println!(
                "\n[permission] {} wants to run: {}",
                tool_name,
                truncate_chars(&input.to_string(), 200)
            );
            println!("  /allow, /always or /deny");
        }
        PromptKind::PlanReview { plan } => {
            println!("\n[plan review]\n{}", plan);
            println!("  /accept, /review, /edit <plan> or /reject [feedback]");
        }
    }
}

fn print_timeline(items: &[TimelineItem]) {
    for item in items {
        match item {
            TimelineItem::Message(message) => match message.role {
                Role::User => println!("> {}", message.content),
                Role::Assistant => println!("{}", message.content),
                Role::Tool => println!("[{}]", truncate_chars(&message.content, 80)),
                Role::Error => println!("[error] {}", message.content),
                Role::Abort => println!("[aborted]"),
                Role::System | Role::Result => {}
            },
            TimelineItem::Prompt(prompt) => print_prompt(prompt),
        }
    }
}
