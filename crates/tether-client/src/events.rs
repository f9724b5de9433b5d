//! Client event types

use serde::Serialize;
use tether_wire::{
    ConversationId, MessageId, PendingPrompt, PromptId, RequestId, RequestStatus, SessionId,
    SessionState,
};

use crate::channel::ConnectionStatus;

/// Events broadcast by the running client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// The channel changed status
    ConnectionChanged {
        status: ConnectionStatus,
        reconnect_attempts: u32,
    },

    /// A conversation's session moved to a new state
    SessionChanged {
        conversation_id: ConversationId,
        state: SessionState,
        session_id: Option<SessionId>,
    },

    /// The conversation's composed timeline changed
    TimelineChanged { conversation_id: ConversationId },

    /// A turn reached a terminal state; input may be re-enabled
    TurnFinished {
        conversation_id: ConversationId,
        request_id: RequestId,
        status: RequestStatus,
    },

    /// A prompt became the conversation's active prompt
    PromptSurfaced { prompt: PendingPrompt },

    /// The server accepted a resolution
    PromptResolved {
        conversation_id: ConversationId,
        prompt_id: PromptId,
    },

    /// The server refused a resolution; the prompt is still pending
    PromptRejected {
        conversation_id: ConversationId,
        prompt_id: PromptId,
        reason: String,
    },

    /// The backend persisted a turn; history should be refetched
    HistoryStale {
        conversation_id: ConversationId,
        request_id: RequestId,
        message_id: MessageId,
    },

    /// A collaborator-only event, forwarded untouched
    Domain {
        event: String,
        data: serde_json::Value,
    },

    /// Error occurred
    Error {
        conversation_id: Option<ConversationId>,
        request_id: Option<RequestId>,
        message: String,
    },
}

impl ClientEvent {
    /// The conversation this event concerns, if any
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            ClientEvent::SessionChanged {
                conversation_id, ..
            }
            | ClientEvent::TimelineChanged { conversation_id }
            | ClientEvent::TurnFinished {
                conversation_id, ..
            }
            | ClientEvent::PromptResolved {
                conversation_id, ..
            }
            | ClientEvent::PromptRejected {
                conversation_id, ..
            }
            | ClientEvent::HistoryStale {
                conversation_id, ..
            } => Some(conversation_id),
            ClientEvent::PromptSurfaced { prompt } => Some(&prompt.conversation_id),
            ClientEvent::Error {
                conversation_id, ..
            } => conversation_id.as_ref(),
            ClientEvent::ConnectionChanged { .. } | ClientEvent::Domain { .. } => None,
        }
    }
}
