//! Channel manager: connection lifecycle, reconnection and room subscriptions

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tether_wire::protocol::{ProjectPayload, RoomPayload};
use tether_wire::{ClientMessage, ConversationId, ProjectId, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::transport::{Link, RetryConfig, Transport};

/// A server-side subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    Conversation(ConversationId),
    Project(ProjectId),
    Named(String),
}

impl Room {
    /// The room name used on the wire
    pub fn name(&self) -> String {
        match self {
            Room::Conversation(id) => format!("conversation:{}", id),
            Room::Project(id) => format!("project:{}", id),
            Room::Named(name) => name.clone(),
        }
    }

    fn join_message(&self) -> ClientMessage {
        match self {
            Room::Project(project_id) => ClientMessage::JoinProject(ProjectPayload {
                project_id: project_id.clone(),
            }),
            _ => ClientMessage::Join(RoomPayload { room: self.name() }),
        }
    }

    fn leave_message(&self) -> ClientMessage {
        ClientMessage::Leave(RoomPayload { room: self.name() })
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection gave up; only an explicit retry leaves this state
    Lost,
}

/// Observable connection state
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed (re)connect attempts
    pub reconnect_attempts: u32,
    /// Rooms the client wants to be subscribed to
    pub joined_rooms: BTreeSet<Room>,
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Conversation whose room is rejoined on every connect
    pub active_conversation: Option<ConversationId>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            joined_rooms: BTreeSet::new(),
            last_connected_at: None,
            active_conversation: None,
        }
    }
}

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub retry: RetryConfig,
    /// Timeout of a single connection attempt
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// What the channel did while being driven
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// An inbound frame
    Message(ServerMessage),
    /// A (re)connect succeeded and subscriptions were reconciled
    Connected,
    /// The link dropped or an attempt failed; another attempt is scheduled
    Disconnected {
        error: TransportError,
        attempt: u32,
        retry_in: Duration,
    },
    /// Attempts are exhausted
    Lost { attempts: u32 },
}

/// Owns the single duplex connection shared by all conversations
pub struct ChannelManager {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
    inbound: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    /// Rooms joined on the current link
    actual_rooms: BTreeSet<Room>,
    retry_at: Option<Instant>,
    /// In-flight open; survives dropped `next_event` calls
    opening: Option<BoxFuture<'static, Result<Link, TransportError>>>,
}

impl ChannelManager {
    /// Create a disconnected channel manager
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        Self {
            transport,
            config,
            state: ConnectionState::default(),
            outbound: None,
            inbound: None,
            actual_rooms: BTreeSet::new(),
            retry_at: None,
            opening: None,
        }
    }

    /// Get the current state
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    pub fn is_connected(&self) -> bool {
        self.state.status == ConnectionStatus::Connected
    }

    /// Open the channel unless it is already open.
    ///
    /// An attempt already in flight is awaited rather than duplicated, so
    /// `Ok` always means a live link.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.opening.is_none() {
            self.start_attempt();
        }
        match self.finish_attempt().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.schedule_reconnect(e.clone());
                Err(e)
            }
        }
    }

    /// Explicit user-triggered retry, the only way out of `Lost`
    pub async fn retry(&mut self) -> Result<(), TransportError> {
        self.drop_link();
        self.state.status = ConnectionStatus::Disconnected;
        self.state.reconnect_attempts = 0;
        self.retry_at = None;
        self.connect().await
    }

    /// Tear the channel down and cancel any scheduled reconnect
    pub fn disconnect(&mut self) {
        self.drop_link();
        self.state.status = ConnectionStatus::Disconnected;
        self.state.reconnect_attempts = 0;
        self.retry_at = None;
        tracing::info!("Channel disconnected");
    }

    /// Send a frame, failing fast when not connected
    pub fn emit(&self, message: ClientMessage) -> Result<(), TransportError> {
        let outbound = match (&self.outbound, self.state.status) {
            (Some(outbound), ConnectionStatus::Connected) => outbound,
            _ => return Err(TransportError::NotConnected),
        };
        tracing::debug!("Emitting '{}'", message.event());
        outbound.send(message).map_err(|_| TransportError::Closed)
    }

    /// Add a room to the desired subscriptions
    pub fn join_room(&mut self, room: Room) {
        self.state.joined_rooms.insert(room);
        self.reconcile_subscriptions();
    }

    /// Remove a room from the desired subscriptions
    pub fn leave_room(&mut self, room: &Room) {
        self.state.joined_rooms.remove(room);
        self.reconcile_subscriptions();
    }

    /// Set the conversation whose room must be rejoined on every connect
    pub fn set_active_conversation(&mut self, conversation_id: Option<ConversationId>) {
        self.state.active_conversation = conversation_id;
        self.reconcile_subscriptions();
    }

    fn desired_rooms(&self) -> BTreeSet<Room> {
        let mut rooms = self.state.joined_rooms.clone();
        if let Some(ref active) = self.state.active_conversation {
            rooms.insert(Room::Conversation(active.clone()));
        }
        rooms
    }

    /// Bring the current link's subscriptions in line with the desired set.
    /// Returns the number of frames emitted.
    fn reconcile_subscriptions(&mut self) -> usize {
        if !self.is_connected() {
            return 0;
        }
        let desired = self.desired_rooms();
        let to_join: Vec<Room> = desired.difference(&self.actual_rooms).cloned().collect();
        let to_leave: Vec<Room> = self.actual_rooms.difference(&desired).cloned().collect();

        let mut emitted = 0;
        for room in to_leave {
            if self.emit(room.leave_message()).is_ok() {
                emitted += 1;
            }
            self.actual_rooms.remove(&room);
        }
        for room in to_join {
            if self.emit(room.join_message()).is_ok() {
                emitted += 1;
                self.actual_rooms.insert(room);
            }
        }
        emitted
    }

    fn drop_link(&mut self) {
        self.opening = None;
        self.outbound = None;
        self.inbound = None;
        self.actual_rooms.clear();
    }

    /// Start one connection attempt under the connect timeout
    fn start_attempt(&mut self) {
        self.state.status = ConnectionStatus::Connecting;
        let transport = Arc::clone(&self.transport);
        let timeout = self.config.connect_timeout;
        self.opening = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, transport.open()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout(timeout)),
            }
        }));
    }

    /// Await the in-flight attempt. Cancel-safe: if dropped, the attempt
    /// stays stored and the next call resumes it.
    async fn finish_attempt(&mut self) -> Result<(), TransportError> {
        let result = match self.opening.as_mut() {
            Some(opening) => opening.await,
            None => return Err(TransportError::NotConnected),
        };
        self.opening = None;
        self.on_link(result?);
        Ok(())
    }

    fn on_link(&mut self, link: Link) {
        self.outbound = Some(link.outbound);
        self.inbound = Some(link.inbound);
        self.actual_rooms.clear();
        self.state.status = ConnectionStatus::Connected;
        self.state.reconnect_attempts = 0;
        self.state.last_connected_at = Some(Utc::now());
        self.retry_at = None;
        let rejoined = self.reconcile_subscriptions();
        tracing::info!("Channel connected, rejoined {} rooms", rejoined);
    }

    fn schedule_reconnect(&mut self, error: TransportError) -> ChannelEvent {
        self.drop_link();
        self.state.reconnect_attempts += 1;
        let attempt = self.state.reconnect_attempts;

        if attempt > self.config.retry.max_attempts {
            self.state.status = ConnectionStatus::Lost;
            self.retry_at = None;
            tracing::warn!("Connection lost after {} attempts: {}", attempt - 1, error);
            return ChannelEvent::Lost {
                attempts: attempt - 1,
            };
        }

        let retry_in = self.config.retry.delay_for_attempt(attempt - 1);
        self.state.status = ConnectionStatus::Disconnected;
        self.retry_at = Some(Instant::now() + retry_in);
        tracing::warn!(
            "Channel down (attempt {}/{}): {}. Reconnecting in {:?}...",
            attempt,
            self.config.retry.max_attempts,
            error,
            retry_in
        );
        ChannelEvent::Disconnected {
            error,
            attempt,
            retry_in,
        }
    }

    /// Drive the channel: yields inbound frames and connection transitions.
    ///
    /// Cancel-safe: a dropped call leaves the scheduled reconnect, or the
    /// attempt already in flight, for the next call to pick up.
    pub async fn next_event(&mut self) -> ChannelEvent {
        if let Some(inbound) = self.inbound.as_mut() {
            return match inbound.recv().await {
                Some(message) => ChannelEvent::Message(message),
                None => self.schedule_reconnect(TransportError::Closed),
            };
        }

        if self.opening.is_none() {
            let Some(at) = self.retry_at else {
                return std::future::pending().await;
            };
            tokio::time::sleep_until(at).await;
            self.retry_at = None;
            self.start_attempt();
        }
        match self.finish_attempt().await {
            Ok(()) => ChannelEvent::Connected,
            Err(e) => self.schedule_reconnect(e),
        }
    }
}
