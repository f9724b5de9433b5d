//! The chat client: a single owner of all coordination state

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_wire::protocol::{AbortPayload, MessageComplete, PromptResolved, SendMessage, SessionInvalidated};
use tether_wire::{
    Attachment, ClientMessage, Conversation, ConversationId, Decision, Fragment, Message,
    MessageId, PendingPrompt, ProjectId, PromptId, RequestId, RequestStatus, ServerMessage,
    SessionId, SessionState, Usage,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::channel::{ChannelConfig, ChannelEvent, ChannelManager, ConnectionState, ConnectionStatus, Room};
use crate::conversation::ConversationState;
use crate::correlator::{Correlator, TurnReceiver, TurnUpdate};
use crate::error::{Error, PromptResolutionError, Result, SessionError, TransportError};
use crate::events::ClientEvent;
use crate::handle::{ClientHandle, Command};
use crate::negotiation::{Acknowledgment, NegotiationManager, Registration};
use crate::session::SessionManager;
use crate::timeline::{self, TimelineItem};
use crate::transport::{RetryConfig, Transport};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection and reconnection settings
    pub channel: ChannelConfig,
    /// Deadline of a single turn
    pub request_timeout: Duration,
    /// How long a new session may take to report its id
    pub init_timeout: Duration,
    /// How long a prompt resolution may wait for the server's acknowledgment
    pub ack_timeout: Duration,
    /// Period of the timeout sweep
    pub tick_interval: Duration,
    /// Capacity of the event broadcast
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            request_timeout: Duration::from_secs(600),
            init_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.channel.retry = retry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.channel.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

/// A user turn to send
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Caller-chosen request id; generated when absent
    pub request_id: Option<RequestId>,
}

impl OutgoingMessage {
    pub fn new(conversation_id: impl Into<ConversationId>, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: content.into(),
            attachments: vec![],
            request_id: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// A submitted turn
#[derive(Debug)]
pub struct Turn {
    pub request_id: RequestId,
    pub conversation_id: ConversationId,
    /// Fragments as they arrive, then exactly one terminal update
    pub updates: TurnReceiver,
}

impl Turn {
    /// Wait for the turn to finish, skipping fragments
    pub async fn finished(mut self) -> Result<Option<MessageId>> {
        while let Some(update) = self.updates.recv().await {
            match update {
                TurnUpdate::Fragment(_) => continue,
                TurnUpdate::Completed { message_id } => return Ok(message_id),
                TurnUpdate::Failed(error) => return Err(error),
                TurnUpdate::Aborted => return Err(Error::AbortedByUser(self.request_id)),
            }
        }
        Err(Error::Shutdown)
    }
}

/// Point-in-time view of one conversation
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub session_state: SessionState,
    pub session_id: Option<SessionId>,
    pub usage: Usage,
    pub active_request: Option<RequestId>,
    pub pending_prompts: Vec<Arc<PendingPrompt>>,
    pub last_error: Option<String>,
}

/// Coordinates every conversation over one shared channel.
///
/// All state is owned here and every handler runs to completion before
/// the next event is looked at. Drive it directly, or hand it to
/// [`ChatClient::spawn`] and talk to it through a [`ClientHandle`].
pub struct ChatClient {
    config: ClientConfig,
    channel: ChannelManager,
    correlator: Correlator,
    sessions: SessionManager,
    aggregator: Aggregator,
    prompts: NegotiationManager,
    conversations: HashMap<ConversationId, ConversationState>,
    event_tx: broadcast::Sender<ClientEvent>,
    connection: Arc<Mutex<ConnectionState>>,
    cancel: CancellationToken,
}

impl ChatClient {
    /// Create a disconnected client
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            channel: ChannelManager::new(transport, config.channel.clone()),
            correlator: Correlator::new(config.request_timeout),
            sessions: SessionManager::new(config.init_timeout),
            aggregator: Aggregator::new(),
            prompts: NegotiationManager::new().with_ack_timeout(config.ack_timeout),
            conversations: HashMap::new(),
            event_tx,
            connection: Arc::new(Mutex::new(ConnectionState::default())),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Subscribe to client events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection_state(&self) -> &ConnectionState {
        self.channel.state()
    }

    /// Move the client onto its own task
    pub fn spawn(self) -> (ClientHandle, tokio::task::JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = ClientHandle::new(
            command_tx,
            self.event_tx.clone(),
            Arc::clone(&self.connection),
            self.cancel.clone(),
        );
        let task = tokio::spawn(self.run(command_rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let cancel = self.cancel.clone();
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = self.channel.next_event() => self.handle_channel_event(event),
                _ = tick.tick() => self.tick(Instant::now()),
            }
        }

        tracing::debug!("Client loop stopped");
        self.channel.disconnect();
        self.sync_connection();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect().await);
            }
            Command::Retry(reply) => {
                let _ = reply.send(self.retry().await);
            }
            Command::Disconnect => self.disconnect(),
            Command::OpenConversation(conversation_id) => self.open_conversation(conversation_id),
            Command::JoinProject(project_id) => self.join_project(project_id),
            Command::Send(message, reply) => {
                let _ = reply.send(self.send_message(message));
            }
            Command::Abort(request_id) => {
                self.abort(&request_id);
            }
            Command::AbortConversation(conversation_id, reply) => {
                let _ = reply.send(self.abort_conversation(&conversation_id));
            }
            Command::ResolvePrompt {
                prompt_id,
                decision,
                reply,
            } => {
                let _ = reply.send(self.resolve_prompt(&prompt_id, &decision));
            }
            Command::DismissPrompt(prompt_id) => self.dismiss_prompt(&prompt_id),
            Command::InitializeSession(conversation_id, reply) => {
                let _ = reply.send(self.initialize_session(&conversation_id));
            }
            Command::SetConversation(conversation) => self.set_conversation(conversation),
            Command::LoadHistory {
                conversation_id,
                messages,
            } => self.load_history(&conversation_id, messages),
            Command::Timeline(conversation_id, reply) => {
                let _ = reply.send(self.timeline(&conversation_id));
            }
            Command::Snapshot(conversation_id, reply) => {
                let _ = reply.send(self.snapshot(&conversation_id));
            }
        }
    }

    fn publish(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish_session(&self, conversation_id: &ConversationId) {
        self.publish(ClientEvent::SessionChanged {
            conversation_id: conversation_id.clone(),
            state: self.sessions.state(conversation_id),
            session_id: self.sessions.session_id(conversation_id).cloned(),
        });
    }

    fn publish_timeline(&self, conversation_id: &ConversationId) {
        self.publish(ClientEvent::TimelineChanged {
            conversation_id: conversation_id.clone(),
        });
    }

    /// Copy the channel state into the shared snapshot
    fn sync_connection(&self) {
        let state = self.channel.state().clone();
        let changed = {
            let mut shared = self.connection.lock();
            let changed = shared.status != state.status
                || shared.reconnect_attempts != state.reconnect_attempts;
            *shared = state.clone();
            changed
        };
        if changed {
            self.publish(ClientEvent::ConnectionChanged {
                status: state.status,
                reconnect_attempts: state.reconnect_attempts,
            });
        }
    }

    // -- connection ---------------------------------------------------------

    /// Open the channel
    pub async fn connect(&mut self) -> Result<()> {
        let result = self.channel.connect().await;
        self.after_attempt();
        result.map_err(Error::from)
    }

    /// Leave `Lost` and connect with a fresh attempt budget
    pub async fn retry(&mut self) -> Result<()> {
        let result = self.channel.retry().await;
        self.after_attempt();
        result.map_err(Error::from)
    }

    pub fn disconnect(&mut self) {
        self.channel.disconnect();
        self.prompts.reset_awaiting();
        self.sync_connection();
    }

    fn after_attempt(&mut self) {
        if self.channel.status() == ConnectionStatus::Lost {
            self.on_connection_lost(self.config.channel.retry.max_attempts);
        }
        self.sync_connection();
    }

    /// Make a conversation the active one; its room follows every reconnect
    pub fn open_conversation(&mut self, conversation_id: ConversationId) {
        self.conversations.entry(conversation_id.clone()).or_default();
        self.channel.set_active_conversation(Some(conversation_id));
        self.sync_connection();
    }

    pub fn join_project(&mut self, project_id: ProjectId) {
        self.channel.join_room(Room::Project(project_id));
        self.sync_connection();
    }

    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => self.handle_server_message(message),
            ChannelEvent::Connected => {}
            ChannelEvent::Disconnected { .. } => {
                let cleared = self.prompts.reset_awaiting();
                if cleared > 0 {
                    tracing::debug!("Cleared {} unacknowledged prompt resolutions", cleared);
                }
            }
            ChannelEvent::Lost { attempts } => self.on_connection_lost(attempts),
        }
        self.sync_connection();
    }

    fn on_connection_lost(&mut self, attempts: u32) {
        self.prompts.reset_awaiting();
        for (request_id, conversation_id) in self.correlator.in_flight() {
            let error = Error::Transport(TransportError::ConnectionLost { attempts });
            self.fail_turn(&conversation_id, &request_id, error);
            if self.sessions.invalidate(&conversation_id, "connection lost mid-turn") {
                self.publish_session(&conversation_id);
            }
        }
        self.publish(ClientEvent::Error {
            conversation_id: None,
            request_id: None,
            message: TransportError::ConnectionLost { attempts }.to_string(),
        });
    }

    // -- turns --------------------------------------------------------------

    /// Send a user turn.
    ///
    /// Rejected without emitting anything when the channel is down or the
    /// conversation's session gate is closed.
    pub fn send_message(&mut self, message: OutgoingMessage) -> Result<Turn> {
        if !self.channel.is_connected() {
            return Err(TransportError::NotConnected.into());
        }

        let conversation_id = message.conversation_id.clone();
        let request_id = message.request_id.clone().unwrap_or_else(RequestId::generate);
        if self.correlator.is_known(&request_id) {
            return Err(Error::DuplicateRequest(request_id));
        }
        let now = Instant::now();
        let state_before = self.sessions.state(&conversation_id);
        let session_id = self.sessions.begin_turn(&conversation_id, &request_id, now)?;

        let updates = match self.correlator.register_with_id(
            request_id.clone(),
            conversation_id.clone(),
            now,
        ) {
            Ok(updates) => updates,
            Err(e) => {
                self.sessions.rollback_turn(&conversation_id, &request_id);
                return Err(e);
            }
        };
        self.aggregator
            .start(conversation_id.clone(), request_id.clone());
        self.conversations
            .entry(conversation_id.clone())
            .or_default()
            .add_optimistic(Message::optimistic_user(
                conversation_id.clone(),
                request_id.clone(),
                message.content.clone(),
            ));

        let frame = ClientMessage::SendMessage(SendMessage {
            conversation_id: conversation_id.clone(),
            content: message.content,
            attachments: message.attachments,
            request_id: request_id.clone(),
            session_id,
        });
        if let Err(e) = self.channel.emit(frame) {
            tracing::warn!("Failed to send turn {}: {}", request_id, e);
            self.correlator.cancel(&request_id);
            self.aggregator.discard(&request_id);
            if let Some(state) = self.conversations.get_mut(&conversation_id) {
                state.remove_optimistic(&request_id);
            }
            self.sessions.rollback_turn(&conversation_id, &request_id);
            return Err(e.into());
        }

        tracing::debug!("Sent turn {} on conversation {}", request_id, conversation_id);
        if self.sessions.state(&conversation_id) != state_before {
            self.publish_session(&conversation_id);
        }
        self.publish_timeline(&conversation_id);
        Ok(Turn {
            request_id,
            conversation_id,
            updates,
        })
    }

    /// Abort a turn without waiting for the server.
    ///
    /// Returns `false` if the request is not in flight.
    pub fn abort(&mut self, request_id: &RequestId) -> bool {
        let Some(conversation_id) = self.correlator.conversation_of(request_id).cloned() else {
            tracing::debug!("Abort for inactive request {}", request_id);
            return false;
        };
        let frame = ClientMessage::Abort(AbortPayload {
            request_id: request_id.clone(),
        });
        if let Err(e) = self.channel.emit(frame) {
            tracing::debug!("Abort of {} not delivered: {}", request_id, e);
        }
        if self.correlator.abort(request_id).is_some() {
            self.settle_turn(&conversation_id, request_id, RequestStatus::Aborted, None);
        }
        true
    }

    /// Abort whatever turn is in flight on the conversation
    pub fn abort_conversation(&mut self, conversation_id: &ConversationId) -> Option<RequestId> {
        let request_id = self.sessions.active_request(conversation_id).cloned()?;
        self.abort(&request_id).then_some(request_id)
    }

    fn fail_turn(&mut self, conversation_id: &ConversationId, request_id: &RequestId, error: Error) {
        let message = match &error {
            Error::Stream { message, .. } => message.clone(),
            other => other.to_string(),
        };
        if self.correlator.fail(request_id, error).is_some() {
            self.settle_turn(
                conversation_id,
                request_id,
                RequestStatus::Errored,
                Some(&message),
            );
        }
    }

    /// Bring every component in line with a turn the correlator resolved
    fn settle_turn(
        &mut self,
        conversation_id: &ConversationId,
        request_id: &RequestId,
        status: RequestStatus,
        failure: Option<&str>,
    ) {
        match status {
            RequestStatus::Aborted => self.aggregator.abort(request_id),
            RequestStatus::Errored => self
                .aggregator
                .fail(request_id, failure.unwrap_or("Request failed")),
            _ => self.aggregator.apply(request_id, &Fragment::Done),
        };

        match failure {
            Some(message) => {
                if self.sessions.fail_turn(conversation_id, request_id, message) {
                    self.publish_session(conversation_id);
                }
                self.publish(ClientEvent::Error {
                    conversation_id: Some(conversation_id.clone()),
                    request_id: Some(request_id.clone()),
                    message: message.to_string(),
                });
            }
            None if status == RequestStatus::Aborted => {
                if self.sessions.abort_turn(conversation_id, request_id) {
                    self.publish_session(conversation_id);
                }
            }
            None => self.sessions.end_turn(conversation_id, request_id),
        }

        for changed in self.prompts.withdraw_request(request_id) {
            self.surface_prompt(&changed);
        }

        tracing::debug!("Turn {} finished as {:?}", request_id, status);
        self.publish(ClientEvent::TurnFinished {
            conversation_id: conversation_id.clone(),
            request_id: request_id.clone(),
            status,
        });
        self.publish_timeline(conversation_id);
    }

    fn on_fragment(&mut self, request_id: &RequestId, fragment: Fragment) {
        let Some(conversation_id) = self.correlator.conversation_of(request_id).cloned() else {
            self.on_late_fragment(request_id, &fragment);
            return;
        };

        if let Some(session_id) = fragment.session_id() {
            if self.sessions.on_session_assigned(&conversation_id, session_id) {
                self.publish_session(&conversation_id);
            }
        }

        match fragment {
            Fragment::Done => {
                if self.correlator.complete(request_id, None).is_some() {
                    self.settle_turn(&conversation_id, request_id, RequestStatus::Completed, None);
                }
            }
            Fragment::Aborted => {
                if self.correlator.abort(request_id).is_some() {
                    self.settle_turn(&conversation_id, request_id, RequestStatus::Aborted, None);
                }
            }
            Fragment::Error { message } => {
                let error = Error::Stream {
                    request_id: request_id.clone(),
                    message,
                };
                self.fail_turn(&conversation_id, request_id, error);
            }
            fragment => {
                if let Fragment::Result { usage, .. } = &fragment {
                    self.sessions.record_usage(&conversation_id, usage);
                }
                self.correlator.deliver_fragment(request_id, &fragment);
                let changed = self.aggregator.apply(request_id, &fragment);

                if let Fragment::Result {
                    is_error: true,
                    text,
                    ..
                } = fragment
                {
                    let error = Error::Stream {
                        request_id: request_id.clone(),
                        message: text.unwrap_or_else(|| "Agent reported an error".to_string()),
                    };
                    self.fail_turn(&conversation_id, request_id, error);
                } else if changed {
                    self.publish_timeline(&conversation_id);
                }
            }
        }
    }

    /// A finished turn's fragment can still carry the session it opened
    fn on_late_fragment(&mut self, request_id: &RequestId, fragment: &Fragment) {
        if let (Some(session_id), Some(conversation_id)) =
            (fragment.session_id(), self.correlator.owner(request_id).cloned())
        {
            if self.sessions.adopt_late_session(&conversation_id, session_id) {
                self.publish_session(&conversation_id);
            }
        }
        tracing::debug!("Dropping {:?} for inactive request {}", fragment, request_id);
    }

    // -- server events ------------------------------------------------------

    /// Route one inbound frame
    pub fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::StreamResponse(response) => {
                for fragment in response.fragments() {
                    self.on_fragment(&response.request_id, fragment);
                }
            }
            ServerMessage::MessageComplete(complete) => self.on_message_complete(complete),
            ServerMessage::ChatError(e) => {
                self.on_fragment(&e.request_id, Fragment::Error { message: e.error });
            }
            ServerMessage::ChatAborted(a) => self.on_fragment(&a.request_id, Fragment::Aborted),
            ServerMessage::PromptRequest(prompt) => self.on_prompt_request(prompt),
            ServerMessage::PromptResolved(ack) => self.on_prompt_resolved(&ack),
            ServerMessage::SessionInvalidated(invalidated) => {
                self.on_session_invalidated(invalidated)
            }
            ServerMessage::Domain { event, data } => {
                self.publish(ClientEvent::Domain { event, data });
            }
            ServerMessage::Unknown { event, .. } => {
                tracing::debug!("Ignoring unknown event '{}'", event);
            }
        }
    }

    fn on_message_complete(&mut self, complete: MessageComplete) {
        let Some(conversation_id) = self.correlator.owner(&complete.request_id).cloned() else {
            tracing::debug!("Completion for unknown request {}", complete.request_id);
            return;
        };
        self.publish(ClientEvent::HistoryStale {
            conversation_id,
            request_id: complete.request_id,
            message_id: complete.message_id,
        });
    }

    fn on_session_invalidated(&mut self, invalidated: SessionInvalidated) {
        let conversation_id = invalidated.conversation_id;
        if let (Some(stale), Some(current)) = (
            invalidated.session_id.as_ref(),
            self.sessions.session_id(&conversation_id),
        ) {
            if stale != current {
                tracing::debug!("Ignoring invalidation of stale session {}", stale);
                return;
            }
        }

        let reason = invalidated
            .reason
            .unwrap_or_else(|| "session invalidated by server".to_string());
        for request_id in self.correlator.in_flight_for(&conversation_id) {
            let error = Error::Session(SessionError::Invalidated {
                conversation_id: conversation_id.clone(),
                reason: reason.clone(),
            });
            self.fail_turn(&conversation_id, &request_id, error);
        }
        if self.sessions.invalidate(&conversation_id, &reason) {
            self.publish_session(&conversation_id);
        }
    }

    // -- prompts ------------------------------------------------------------

    fn surface_prompt(&self, conversation_id: &ConversationId) {
        if let Some(prompt) = self.prompts.active(conversation_id) {
            self.publish(ClientEvent::PromptSurfaced {
                prompt: (*prompt).clone(),
            });
        }
        self.publish_timeline(conversation_id);
    }

    fn on_prompt_request(&mut self, prompt: PendingPrompt) {
        let conversation_id = prompt.conversation_id.clone();
        match self.prompts.register(prompt) {
            Registration::Active => self.surface_prompt(&conversation_id),
            Registration::Queued => {
                tracing::debug!("Prompt queued on conversation {}", conversation_id)
            }
            Registration::Duplicate => {}
        }
    }

    fn on_prompt_resolved(&mut self, ack: &PromptResolved) {
        match self.prompts.acknowledge(ack) {
            Acknowledgment::Resolved {
                conversation_id,
                prompt_id,
                ..
            } => {
                self.publish(ClientEvent::PromptResolved {
                    conversation_id: conversation_id.clone(),
                    prompt_id,
                });
                self.surface_prompt(&conversation_id);
            }
            Acknowledgment::Rejected {
                conversation_id,
                error,
            } => {
                self.publish(ClientEvent::PromptRejected {
                    conversation_id,
                    prompt_id: ack.prompt_id.clone(),
                    reason: error.to_string(),
                });
            }
            Acknowledgment::Ignored => {}
        }
    }

    /// Send a decision for the conversation's active prompt.
    ///
    /// The prompt stays pending until the server acknowledges.
    pub fn resolve_prompt(&mut self, prompt_id: &PromptId, decision: &Decision) -> Result<()> {
        let frame = self.prompts.resolve(prompt_id, decision)?;
        if let Err(e) = self.channel.emit(frame) {
            self.prompts.cancel_resolution(prompt_id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop a prompt that was resolved out of band
    pub fn dismiss_prompt(&mut self, prompt_id: &PromptId) {
        self.on_prompt_resolved(&PromptResolved {
            prompt_id: prompt_id.clone(),
            ok: true,
            error: None,
        });
    }

    // -- sessions and history -------------------------------------------------

    /// Start a fresh session: the next send opens it
    pub fn initialize_session(&mut self, conversation_id: &ConversationId) -> Result<()> {
        self.sessions.initialize_session(conversation_id)?;
        self.publish_session(conversation_id);
        Ok(())
    }

    /// Record the backend's conversation record, adopting its session
    pub fn set_conversation(&mut self, conversation: Conversation) {
        let conversation_id = conversation.id.clone();
        if let Some(session_id) = &conversation.session_id {
            if self.sessions.state(&conversation_id) == SessionState::Uninitialized
                && self.sessions.on_session_assigned(&conversation_id, session_id)
            {
                self.publish_session(&conversation_id);
            }
        }
        self.conversations
            .entry(conversation_id)
            .or_default()
            .conversation = Some(conversation);
    }

    /// Replace a conversation's persisted history
    pub fn load_history(&mut self, conversation_id: &ConversationId, messages: Vec<Message>) {
        let state = self.conversations.entry(conversation_id.clone()).or_default();
        let mut changed = state.replace_history(messages);
        let dropped = self
            .aggregator
            .reconcile_persisted(conversation_id, &state.persisted);
        changed |= !dropped.is_empty();
        if changed {
            self.publish_timeline(conversation_id);
        }
    }

    /// The conversation's composed timeline
    pub fn timeline(&self, conversation_id: &ConversationId) -> Vec<TimelineItem> {
        let stream = self.aggregator.items(conversation_id);
        let prompt = self.prompts.active(conversation_id);
        match self.conversations.get(conversation_id) {
            Some(state) => timeline::compose(
                &state.persisted,
                &state.optimistic,
                &stream,
                prompt.as_ref(),
            ),
            None => timeline::compose(&[], &[], &stream, prompt.as_ref()),
        }
    }

    pub fn snapshot(&self, conversation_id: &ConversationId) -> ConversationSnapshot {
        ConversationSnapshot {
            conversation_id: conversation_id.clone(),
            session_state: self.sessions.state(conversation_id),
            session_id: self.sessions.session_id(conversation_id).cloned(),
            usage: self.sessions.usage(conversation_id),
            active_request: self.sessions.active_request(conversation_id).cloned(),
            pending_prompts: self.prompts.pending(conversation_id),
            last_error: self.sessions.last_error(conversation_id).map(str::to_string),
        }
    }

    pub fn session_state(&self, conversation_id: &ConversationId) -> SessionState {
        self.sessions.state(conversation_id)
    }

    pub fn request_status(&self, request_id: &RequestId) -> Option<RequestStatus> {
        self.correlator.status(request_id)
    }

    /// Sweep request, session-initialization and prompt-acknowledgment
    /// deadlines
    pub fn tick(&mut self, now: Instant) {
        for (request_id, conversation_id) in self.correlator.expire(now) {
            let message = Error::RequestTimeout(request_id.clone()).to_string();
            self.settle_turn(
                &conversation_id,
                &request_id,
                RequestStatus::Errored,
                Some(&message),
            );
        }

        for (conversation_id, request_id) in self.sessions.expire(now) {
            self.publish_session(&conversation_id);
            let error = Error::Session(SessionError::InitTimeout(conversation_id.clone()));
            self.fail_turn(&conversation_id, &request_id, error);
        }

        for (conversation_id, prompt_id) in self.prompts.expire(now) {
            let error = PromptResolutionError::AckTimeout(prompt_id.clone());
            self.publish(ClientEvent::PromptRejected {
                conversation_id: conversation_id.clone(),
                prompt_id,
                reason: error.to_string(),
            });
            self.surface_prompt(&conversation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, ServerSide};
    use serde_json::{Value, json};
    use tether_wire::{PermissionDecision, Role};

    fn frame(event: &str, data: Value) -> ServerMessage {
        ServerMessage::from_parts(event.to_string(), data).unwrap()
    }

    fn record(request: &str, record: Value) -> ServerMessage {
        frame(
            "chat:stream-response",
            json!({"requestId": request, "type": "claude_json", "data": record}),
        )
    }

    fn init(request: &str, session: &str) -> ServerMessage {
        record(
            request,
            json!({"type": "system", "subtype": "init", "session_id": session, "model": "claude-sonnet"}),
        )
    }

    fn delta(request: &str, text: &str) -> ServerMessage {
        record(
            request,
            json!({
                "type": "stream_event",
                "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}
            }),
        )
    }

    fn done(request: &str) -> ServerMessage {
        frame(
            "chat:stream-response",
            json!({"requestId": request, "type": "done"}),
        )
    }

    fn prompt_request(prompt: &str, request: &str) -> ServerMessage {
        frame(
            "prompt:request",
            json!({
                "promptId": prompt,
                "conversationId": "c1",
                "sessionId": "s1",
                "requestId": request,
                "kind": "permission",
                "toolName": "Bash",
                "input": {"command": "ls"}
            }),
        )
    }

    async fn connected() -> (ChatClient, MockTransport, ServerSide) {
        let transport = MockTransport::new();
        let mut client = ChatClient::new(ClientConfig::default(), Arc::new(transport.clone()));
        client.connect().await.unwrap();
        let server = transport.take_server();
        (client, transport, server)
    }

    fn sent_turns(frames: &[ClientMessage]) -> Vec<&SendMessage> {
        frames
            .iter()
            .filter_map(|f| match f {
                ClientMessage::SendMessage(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn drain_events(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn c1() -> ConversationId {
        "c1".into()
    }

    fn ready(client: &mut ChatClient, request: &str) -> Turn {
        let turn = client
            .send_message(OutgoingMessage::new("c1", "hello").with_request_id(request))
            .unwrap();
        client.handle_server_message(init(request, "s1"));
        turn
    }

    #[tokio::test]
    async fn test_first_turn_opens_session_and_streams() {
        let (mut client, _transport, mut server) = connected().await;

        let mut turn = client
            .send_message(OutgoingMessage::new("c1", "hello").with_request_id("r1"))
            .unwrap();
        assert_eq!(client.session_state(&c1()), SessionState::Pending);
        let frames = server.drain();
        let sent = sent_turns(&frames);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].request_id, "r1".into());
        assert_eq!(sent[0].session_id, None);

        client.handle_server_message(init("r1", "s1"));
        assert_eq!(client.session_state(&c1()), SessionState::Ready);

        client.handle_server_message(delta("r1", "Hel"));
        client.handle_server_message(delta("r1", "lo"));
        assert_eq!(client.request_status(&"r1".into()), Some(RequestStatus::Streaming));
        client.handle_server_message(done("r1"));
        assert_eq!(client.request_status(&"r1".into()), Some(RequestStatus::Completed));

        let items = client.timeline(&c1());
        assert_eq!(items.len(), 2);
        let user = items[0].as_message().unwrap();
        assert_eq!((user.role, user.content.as_str()), (Role::User, "hello"));
        let reply = items[1].as_message().unwrap();
        assert_eq!((reply.role, reply.content.as_str()), (Role::Assistant, "Hello"));
        assert!(reply.complete);

        let mut updates = vec![];
        while let Ok(update) = turn.updates.try_recv() {
            updates.push(update);
        }
        assert!(matches!(updates[0], TurnUpdate::Fragment(Fragment::Init { .. })));
        assert_eq!(updates.last(), Some(&TurnUpdate::Completed { message_id: None }));
        assert_eq!(updates.iter().filter(|u| u.is_terminal()).count(), 1);

        // The next turn resumes the assigned session
        client
            .send_message(OutgoingMessage::new("c1", "more").with_request_id("r2"))
            .unwrap();
        let frames = server.drain();
        assert_eq!(sent_turns(&frames)[0].session_id, Some("s1".into()));
    }

    #[tokio::test]
    async fn test_second_send_while_streaming_is_rejected_before_emission() {
        let (mut client, _transport, mut server) = connected().await;
        let _turn = ready(&mut client, "r1");
        client.handle_server_message(delta("r1", "working"));
        server.drain();

        let err = client
            .send_message(OutgoingMessage::new("c1", "again"))
            .unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::Busy { .. })));
        assert!(server.drain().is_empty());
        assert_eq!(client.timeline(&c1()).len(), 2);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_fast() {
        let transport = MockTransport::new();
        let mut client = ChatClient::new(ClientConfig::default(), Arc::new(transport.clone()));
        let err = client
            .send_message(OutgoingMessage::new("c1", "hello"))
            .unwrap_err();
        assert_eq!(err, Error::Transport(TransportError::NotConnected));
        assert_eq!(client.session_state(&c1()), SessionState::Uninitialized);
        assert!(client.timeline(&c1()).is_empty());
    }

    #[tokio::test]
    async fn test_failed_emit_rolls_back() {
        let (mut client, _transport, server) = connected().await;
        drop(server);

        let err = client
            .send_message(OutgoingMessage::new("c1", "hello").with_request_id("r1"))
            .unwrap_err();
        assert_eq!(err, Error::Transport(TransportError::Closed));
        assert_eq!(client.session_state(&c1()), SessionState::Uninitialized);
        assert_eq!(client.request_status(&"r1".into()), None);
        assert!(client.timeline(&c1()).is_empty());
    }

    #[tokio::test]
    async fn test_prompts_surface_in_order() {
        let (mut client, _transport, mut server) = connected().await;
        let _turn = ready(&mut client, "r1");
        let mut events = client.subscribe();

        client.handle_server_message(prompt_request("p1", "r1"));
        client.handle_server_message(prompt_request("p2", "r1"));
        let surfaced: Vec<PromptId> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::PromptSurfaced { prompt } => Some(prompt.prompt_id),
                _ => None,
            })
            .collect();
        assert_eq!(surfaced, vec![PromptId::from("p1")]);
        assert!(matches!(
            client.timeline(&c1()).last(),
            Some(TimelineItem::Prompt(p)) if p.prompt_id == "p1".into()
        ));

        server.drain();
        client
            .resolve_prompt(&"p1".into(), &PermissionDecision::Deny.into())
            .unwrap();
        let frames = server.drain();
        assert!(matches!(
            &frames[..],
            [ClientMessage::ResolvePrompt(r)] if r.decision == "deny"
        ));
        // Not yet acknowledged
        assert_eq!(client.snapshot(&c1()).pending_prompts.len(), 2);

        client.handle_server_message(frame(
            "prompt:resolved",
            json!({"promptId": "p1", "ok": true}),
        ));
        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::PromptResolved { prompt_id, .. } if *prompt_id == "p1".into()
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::PromptSurfaced { prompt } if prompt.prompt_id == "p2".into()
        )));
        assert_eq!(client.snapshot(&c1()).pending_prompts.len(), 1);
    }

    #[tokio::test]
    async fn test_unacknowledged_resolution_times_out() {
        let (mut client, _transport, mut server) = connected().await;
        let _turn = ready(&mut client, "r1");
        client.handle_server_message(prompt_request("p1", "r1"));
        client
            .resolve_prompt(&"p1".into(), &PermissionDecision::AllowOnce.into())
            .unwrap();
        let mut events = client.subscribe();

        client.tick(Instant::now() + Duration::from_secs(31));
        assert!(drain_events(&mut events).iter().any(|e| matches!(
            e,
            ClientEvent::PromptRejected { prompt_id, .. } if *prompt_id == "p1".into()
        )));

        // The prompt can be answered again
        server.drain();
        client
            .resolve_prompt(&"p1".into(), &PermissionDecision::AllowOnce.into())
            .unwrap();
        assert!(matches!(&server.drain()[..], [ClientMessage::ResolvePrompt(_)]));
    }

    #[tokio::test]
    async fn test_unknown_prompt_resolution_changes_nothing() {
        let (mut client, _transport, mut server) = connected().await;
        client.handle_server_message(prompt_request("p1", "r1"));
        server.drain();

        let err = client
            .resolve_prompt(&"nope".into(), &PermissionDecision::AllowOnce.into())
            .unwrap_err();
        assert!(matches!(err, Error::PromptResolution(_)));
        assert!(server.drain().is_empty());
        assert_eq!(client.snapshot(&c1()).pending_prompts.len(), 1);
    }

    #[tokio::test]
    async fn test_abort_then_late_done() {
        let (mut client, _transport, mut server) = connected().await;
        let turn = ready(&mut client, "r1");
        client.handle_server_message(delta("r1", "partial"));
        server.drain();

        assert!(client.abort(&"r1".into()));
        assert!(matches!(
            &server.drain()[..],
            [ClientMessage::Abort(a)] if a.request_id == "r1".into()
        ));
        assert_eq!(client.request_status(&"r1".into()), Some(RequestStatus::Aborted));

        client.handle_server_message(done("r1"));
        client.handle_server_message(delta("r1", "late"));
        assert_eq!(client.request_status(&"r1".into()), Some(RequestStatus::Aborted));

        let items = client.timeline(&c1());
        assert_eq!(items.last().unwrap().as_message().unwrap().role, Role::Abort);
        assert_eq!(
            turn.finished().await,
            Err(Error::AbortedByUser("r1".into()))
        );

        // Input is re-enabled immediately
        assert!(client.send_message(OutgoingMessage::new("c1", "next")).is_ok());
        assert!(!client.abort(&"r1".into()));
    }

    #[tokio::test]
    async fn test_aborting_opening_turn_reenables_input() {
        let (mut client, _transport, mut server) = connected().await;
        client
            .send_message(OutgoingMessage::new("c1", "hello").with_request_id("r1"))
            .unwrap();
        assert!(client.abort(&"r1".into()));
        assert_eq!(client.session_state(&c1()), SessionState::Uninitialized);

        // The server opened a session before it saw the abort
        client.handle_server_message(init("r1", "s1"));
        assert_eq!(client.session_state(&c1()), SessionState::Ready);

        server.drain();
        client
            .send_message(OutgoingMessage::new("c1", "again").with_request_id("r2"))
            .unwrap();
        assert_eq!(sent_turns(&server.drain())[0].session_id, Some("s1".into()));

        client.tick(Instant::now() + Duration::from_secs(61));
        assert_eq!(client.session_state(&c1()), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_reused_request_id_is_rejected() {
        let (mut client, _transport, mut server) = connected().await;
        let a: ConversationId = "a".into();
        let b: ConversationId = "b".into();
        client
            .send_message(OutgoingMessage::new("a", "one").with_request_id("r1"))
            .unwrap();
        server.drain();

        let err = client
            .send_message(OutgoingMessage::new("b", "two").with_request_id("r1"))
            .unwrap_err();
        assert_eq!(err, Error::DuplicateRequest("r1".into()));
        assert!(server.drain().is_empty());
        assert_eq!(client.session_state(&b), SessionState::Uninitialized);
        assert!(client.timeline(&b).is_empty());

        // The original turn still owns the id and settles normally
        assert!(client.abort(&"r1".into()));
        assert_eq!(client.snapshot(&a).active_request, None);
        assert!(client.send_message(OutgoingMessage::new("a", "again")).is_ok());
    }

    #[tokio::test]
    async fn test_request_timeout_finalizes_as_error() {
        let (mut client, _transport, _server) = connected().await;
        let turn = ready(&mut client, "r1");

        client.tick(Instant::now() + Duration::from_secs(599));
        assert_eq!(client.request_status(&"r1".into()), Some(RequestStatus::Streaming));

        client.tick(Instant::now() + Duration::from_secs(600));
        assert_eq!(client.request_status(&"r1".into()), Some(RequestStatus::Errored));
        assert_eq!(client.session_state(&c1()), SessionState::Ready);
        let last = client.timeline(&c1()).last().cloned().unwrap();
        assert_eq!(last.as_message().unwrap().role, Role::Error);
        assert_eq!(turn.finished().await, Err(Error::RequestTimeout("r1".into())));
    }

    #[tokio::test]
    async fn test_init_timeout_requires_reinitialization() {
        let (mut client, _transport, mut server) = connected().await;
        let turn = client
            .send_message(OutgoingMessage::new("c1", "hello").with_request_id("r1"))
            .unwrap();

        client.tick(Instant::now() + Duration::from_secs(60));
        assert_eq!(client.session_state(&c1()), SessionState::Error);
        assert_eq!(
            turn.finished().await,
            Err(Error::Session(SessionError::InitTimeout(c1())))
        );

        let err = client
            .send_message(OutgoingMessage::new("c1", "retry"))
            .unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::Invalidated { .. })));

        client.initialize_session(&c1()).unwrap();
        assert_eq!(client.session_state(&c1()), SessionState::Pending);
        server.drain();
        client
            .send_message(OutgoingMessage::new("c1", "retry").with_request_id("r2"))
            .unwrap();
        assert_eq!(sent_turns(&server.drain())[0].session_id, None);
        client.handle_server_message(init("r2", "s2"));
        assert_eq!(client.session_state(&c1()), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_stream_error_while_pending_fails_session() {
        let (mut client, _transport, _server) = connected().await;
        client
            .send_message(OutgoingMessage::new("c1", "hello").with_request_id("r1"))
            .unwrap();
        client.handle_server_message(frame(
            "chat:error",
            json!({"requestId": "r1", "error": "agent failed to start"}),
        ));
        assert_eq!(client.request_status(&"r1".into()), Some(RequestStatus::Errored));
        assert_eq!(client.session_state(&c1()), SessionState::Error);
        assert_eq!(
            client.snapshot(&c1()).last_error.as_deref(),
            Some("agent failed to start")
        );
    }

    #[tokio::test]
    async fn test_missing_session_error_invalidates() {
        let (mut client, _transport, _server) = connected().await;
        let _turn = ready(&mut client, "r1");
        client.handle_server_message(frame(
            "chat:stream-response",
            json!({"requestId": "r1", "type": "error", "error": "No conversation found with session ID: s1"}),
        ));
        assert_eq!(client.session_state(&c1()), SessionState::Error);
    }

    #[tokio::test]
    async fn test_ordinary_error_keeps_session() {
        let (mut client, _transport, _server) = connected().await;
        let _turn = ready(&mut client, "r1");
        client.handle_server_message(frame(
            "chat:error",
            json!({"requestId": "r1", "error": "tool crashed"}),
        ));
        assert_eq!(client.session_state(&c1()), SessionState::Ready);
        assert!(client.send_message(OutgoingMessage::new("c1", "next")).is_ok());
    }

    #[tokio::test]
    async fn test_server_invalidation_fails_in_flight_turn() {
        let (mut client, _transport, _server) = connected().await;
        let turn = ready(&mut client, "r1");
        client.handle_server_message(frame(
            "session:invalidated",
            json!({"conversationId": "c1", "sessionId": "s1", "reason": "expired"}),
        ));
        assert_eq!(client.session_state(&c1()), SessionState::Error);
        assert!(matches!(
            turn.finished().await,
            Err(Error::Session(SessionError::Invalidated { .. }))
        ));
    }

    #[tokio::test]
    async fn test_stale_invalidation_is_ignored() {
        let (mut client, _transport, _server) = connected().await;
        let _turn = ready(&mut client, "r1");
        client.handle_server_message(frame(
            "session:invalidated",
            json!({"conversationId": "c1", "sessionId": "s0"}),
        ));
        assert_eq!(client.session_state(&c1()), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_history_supersedes_local_entries() {
        let (mut client, _transport, _server) = connected().await;
        let _turn = ready(&mut client, "r1");
        client.handle_server_message(delta("r1", "Hi there"));
        client.handle_server_message(done("r1"));
        assert_eq!(client.timeline(&c1()).len(), 2);

        let persisted = vec![
            Message::new("m1", c1(), Role::User, "hello")
                .with_request_id("r1".into())
                .with_created_at(1),
            Message::new("m2", c1(), Role::Assistant, "Hi there")
                .with_request_id("r1".into())
                .with_created_at(2),
        ];
        client.load_history(&c1(), persisted.clone());
        let ids: Vec<String> = client
            .timeline(&c1())
            .iter()
            .filter_map(|i| i.as_message().map(|m| m.id.to_string()))
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        // Reloading identical history keeps the same allocations
        let before = client.timeline(&c1());
        client.load_history(&c1(), persisted);
        let after = client.timeline(&c1());
        assert!(before.iter().zip(&after).all(|(a, b)| a.ptr_eq(b)));
    }

    #[tokio::test]
    async fn test_message_complete_marks_history_stale() {
        let (mut client, _transport, _server) = connected().await;
        let _turn = ready(&mut client, "r1");
        client.handle_server_message(done("r1"));
        let mut events = client.subscribe();

        client.handle_server_message(frame(
            "chat:message-complete",
            json!({"requestId": "r1", "messageId": "m9"}),
        ));
        assert!(drain_events(&mut events).iter().any(|e| matches!(
            e,
            ClientEvent::HistoryStale { message_id, .. } if *message_id == "m9".into()
        )));
    }

    #[tokio::test]
    async fn test_domain_events_are_forwarded() {
        let (mut client, _transport, _server) = connected().await;
        let mut events = client.subscribe();
        client.handle_server_message(frame("task-updated", json!({"id": 7})));
        client.handle_server_message(frame("mystery", json!({})));
        let events = drain_events(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ClientEvent::Domain { event, .. } if event == "task-updated"));
    }

    #[tokio::test]
    async fn test_adopts_session_of_existing_conversation() {
        let (mut client, _transport, mut server) = connected().await;
        let mut conversation = Conversation::new("c1", None);
        conversation.session_id = Some("s7".into());
        client.set_conversation(conversation);
        assert_eq!(client.session_state(&c1()), SessionState::Ready);

        client.send_message(OutgoingMessage::new("c1", "hi")).unwrap();
        assert_eq!(sent_turns(&server.drain())[0].session_id, Some("s7".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_fails_in_flight_turns() {
        let transport = MockTransport::new();
        let config = ClientConfig::default().with_retry_config(RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        });
        let mut client = ChatClient::new(config, Arc::new(transport.clone()));
        client.connect().await.unwrap();
        let server = transport.take_server();
        let turn = ready(&mut client, "r1");

        transport.fail_next(5);
        drop(server);
        let event = client.channel.next_event().await;
        assert!(matches!(event, ChannelEvent::Disconnected { .. }));
        client.handle_channel_event(event);
        // A transient drop keeps the turn alive
        assert_eq!(client.request_status(&"r1".into()), Some(RequestStatus::Streaming));

        let event = client.channel.next_event().await;
        assert_eq!(event, ChannelEvent::Lost { attempts: 1 });
        client.handle_channel_event(event);

        assert_eq!(client.connection.lock().status, ConnectionStatus::Lost);
        assert_eq!(client.session_state(&c1()), SessionState::Error);
        assert_eq!(
            turn.finished().await,
            Err(Error::Transport(TransportError::ConnectionLost { attempts: 1 }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_client_reconnects_through_slow_handshakes() {
        let transport = MockTransport::new();
        let client = ChatClient::new(ClientConfig::default(), Arc::new(transport.clone()));
        let (handle, task) = client.spawn();
        handle.connect().await.unwrap();

        // Every later handshake outlasts the tick period
        transport.set_open_delay(Duration::from_secs(2));
        drop(transport.take_server());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.connection().status, ConnectionStatus::Connected);
        assert_eq!(handle.connection().reconnect_attempts, 0);
        assert_eq!(transport.open_count(), 2);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_drives_spawned_client() {
        let transport = MockTransport::new();
        let client = ChatClient::new(ClientConfig::default(), Arc::new(transport.clone()));
        let (handle, task) = client.spawn();
        let mut events = handle.subscribe();

        handle.connect().await.unwrap();
        assert_eq!(handle.connection().status, ConnectionStatus::Connected);
        handle.open_conversation("c1".into()).unwrap();
        let mut server = transport.take_server();

        let turn = handle
            .send(OutgoingMessage::new("c1", "hello").with_request_id("r1"))
            .await
            .unwrap();
        assert_eq!(turn.request_id, "r1".into());

        server.push.send(init("r1", "s1")).unwrap();
        server.push.send(delta("r1", "Hi")).unwrap();
        server.push.send(done("r1")).unwrap();
        assert_eq!(turn.finished().await, Ok(None));

        let items = handle.timeline("c1".into()).await.unwrap();
        assert_eq!(items.len(), 2);
        let snapshot = handle.snapshot("c1".into()).await.unwrap();
        assert_eq!(snapshot.session_id, Some("s1".into()));

        let frames = server.drain();
        assert!(frames.iter().any(|f| matches!(f, ClientMessage::Join(r) if r.room == "conversation:c1")));

        let mut saw_finish = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::TurnFinished { status: RequestStatus::Completed, .. }) {
                saw_finish = true;
            }
        }
        assert!(saw_finish);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(handle.connection().status, ConnectionStatus::Disconnected);
    }
}
