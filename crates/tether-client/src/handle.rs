//! Cloneable handle to a spawned [`ChatClient`](crate::ChatClient)

use std::sync::Arc;

use parking_lot::Mutex;
use tether_wire::{Conversation, ConversationId, Decision, Message, ProjectId, PromptId, RequestId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::channel::ConnectionState;
use crate::client::{ConversationSnapshot, OutgoingMessage, Turn};
use crate::error::{Error, Result};
use crate::events::ClientEvent;
use crate::timeline::TimelineItem;

/// Work queued for the client task
pub(crate) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Retry(oneshot::Sender<Result<()>>),
    Disconnect,
    OpenConversation(ConversationId),
    JoinProject(ProjectId),
    Send(OutgoingMessage, oneshot::Sender<Result<Turn>>),
    Abort(RequestId),
    AbortConversation(ConversationId, oneshot::Sender<Option<RequestId>>),
    ResolvePrompt {
        prompt_id: PromptId,
        decision: Decision,
        reply: oneshot::Sender<Result<()>>,
    },
    DismissPrompt(PromptId),
    InitializeSession(ConversationId, oneshot::Sender<Result<()>>),
    SetConversation(Conversation),
    LoadHistory {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    Timeline(ConversationId, oneshot::Sender<Vec<TimelineItem>>),
    Snapshot(ConversationId, oneshot::Sender<ConversationSnapshot>),
}

/// Talks to a client running on its own task.
///
/// Every call is queued and handled in order, so a `send` issued after
/// `open_conversation` sees the room already joined.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    connection: Arc<Mutex<ConnectionState>>,
    cancel: CancellationToken,
}

impl ClientHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        events: broadcast::Sender<ClientEvent>,
        connection: Arc<Mutex<ConnectionState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            commands,
            events,
            connection,
            cancel,
        }
    }

    fn post(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Shutdown)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Subscribe to client events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Latest connection state
    pub fn connection(&self) -> ConnectionState {
        self.connection.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.commands.is_closed()
    }

    /// Stop the client task; the channel is closed on the way out
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await?
    }

    pub async fn retry(&self) -> Result<()> {
        self.request(Command::Retry).await?
    }

    pub fn disconnect(&self) -> Result<()> {
        self.post(Command::Disconnect)
    }

    pub fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.post(Command::OpenConversation(conversation_id))
    }

    pub fn join_project(&self, project_id: ProjectId) -> Result<()> {
        self.post(Command::JoinProject(project_id))
    }

    /// Send a user turn
    pub async fn send(&self, message: OutgoingMessage) -> Result<Turn> {
        self.request(|reply| Command::Send(message, reply)).await?
    }

    /// Fire-and-forget abort of one turn
    pub fn abort(&self, request_id: RequestId) -> Result<()> {
        self.post(Command::Abort(request_id))
    }

    /// Abort the conversation's in-flight turn, returning its id
    pub async fn abort_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<RequestId>> {
        self.request(|reply| Command::AbortConversation(conversation_id, reply))
            .await
    }

    pub async fn resolve_prompt(&self, prompt_id: PromptId, decision: Decision) -> Result<()> {
        self.request(|reply| Command::ResolvePrompt {
            prompt_id,
            decision,
            reply,
        })
        .await?
    }

    pub fn dismiss_prompt(&self, prompt_id: PromptId) -> Result<()> {
        self.post(Command::DismissPrompt(prompt_id))
    }

    pub async fn initialize_session(&self, conversation_id: ConversationId) -> Result<()> {
        self.request(|reply| Command::InitializeSession(conversation_id, reply))
            .await?
    }

    pub fn set_conversation(&self, conversation: Conversation) -> Result<()> {
        self.post(Command::SetConversation(conversation))
    }

    pub fn load_history(&self, conversation_id: ConversationId, messages: Vec<Message>) -> Result<()> {
        self.post(Command::LoadHistory {
            conversation_id,
            messages,
        })
    }

    pub async fn timeline(&self, conversation_id: ConversationId) -> Result<Vec<TimelineItem>> {
        self.request(|reply| Command::Timeline(conversation_id, reply))
            .await
    }

    pub async fn snapshot(&self, conversation_id: ConversationId) -> Result<ConversationSnapshot> {
        self.request(|reply| Command::Snapshot(conversation_id, reply))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ChatClient, ClientConfig};
    use crate::testing::MockTransport;

    #[tokio::test]
    async fn test_calls_fail_after_shutdown() {
        let transport = MockTransport::new();
        let client = ChatClient::new(ClientConfig::default(), Arc::new(transport));
        let (handle, task) = client.spawn();
        assert!(handle.is_running());

        handle.shutdown();
        task.await.unwrap();
        assert!(!handle.is_running());
        assert_eq!(handle.connect().await, Err(Error::Shutdown));
        assert_eq!(
            handle.snapshot("c1".into()).await.map(|s| s.conversation_id),
            Err(Error::Shutdown)
        );
    }

    #[tokio::test]
    async fn test_send_before_connect_is_rejected() {
        let transport = MockTransport::new();
        let client = ChatClient::new(ClientConfig::default(), Arc::new(transport.clone()));
        let (handle, _task) = client.spawn();

        let result = handle.send(OutgoingMessage::new("c1", "hello")).await;
        assert!(matches!(
            result,
            Err(Error::Transport(crate::error::TransportError::NotConnected))
        ));
        assert_eq!(transport.open_count(), 0);
        handle.shutdown();
    }
}
