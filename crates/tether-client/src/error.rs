//! Error types for tether-client

use tether_wire::{ConversationId, PromptId, RequestId};
use thiserror::Error;

/// Result type alias using tether-client Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the duplex channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Emit attempted while the channel is not connected
    #[error("Not connected")]
    NotConnected,

    /// A single connection attempt exceeded its timeout
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// A connection attempt failed
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The live link closed underneath us
    #[error("Channel closed")]
    Closed,

    /// Reconnection gave up; explicit retry required
    #[error("Connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
}

/// Failures of the per-conversation session gate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The first turn is out and the session id has not arrived yet
    #[error("Session for conversation {0} is still initializing")]
    Pending(ConversationId),

    /// A turn is already in flight on this conversation
    #[error("Conversation {conversation_id} is busy with request {request_id}")]
    Busy {
        conversation_id: ConversationId,
        request_id: RequestId,
    },

    /// The session failed or was invalidated; re-initialize before sending
    #[error("Session for conversation {conversation_id} is unusable: {reason}")]
    Invalidated {
        conversation_id: ConversationId,
        reason: String,
    },

    /// No session id arrived within the initialization timeout
    #[error("Session for conversation {0} timed out during initialization")]
    InitTimeout(ConversationId),
}

/// Failures resolving a pending prompt. None of them mutate prompt state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptResolutionError {
    #[error("Unknown prompt {0}")]
    Unknown(PromptId),

    #[error("Prompt {0} was already resolved")]
    AlreadyResolved(PromptId),

    /// The prompt is queued behind the conversation's active prompt
    #[error("Prompt {0} is queued behind another prompt")]
    Queued(PromptId),

    /// A resolution was sent and is awaiting acknowledgment
    #[error("Prompt {0} is awaiting server acknowledgment")]
    AwaitingAck(PromptId),

    /// The server never acknowledged the resolution; it may be sent again
    #[error("Server did not acknowledge resolution of prompt {0}")]
    AckTimeout(PromptId),

    #[error("Decision '{decision}' does not apply to {kind} prompt {prompt_id}")]
    DecisionMismatch {
        prompt_id: PromptId,
        decision: &'static str,
        kind: &'static str,
    },

    /// The server did not accept the resolution
    #[error("Server rejected resolution of prompt {prompt_id}: {reason}")]
    Rejected { prompt_id: PromptId, reason: String },
}

/// Errors that can occur in the coordination core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Request {0} timed out")]
    RequestTimeout(RequestId),

    /// Server-reported mid-turn failure
    #[error("Request {request_id} failed: {message}")]
    Stream {
        request_id: RequestId,
        message: String,
    },

    #[error(transparent)]
    PromptResolution(#[from] PromptResolutionError),

    #[error("Request {0} aborted by user")]
    AbortedByUser(RequestId),

    /// The id is already in flight or was used by a recent turn
    #[error("Request id {0} is already in use")]
    DuplicateRequest(RequestId),

    /// The client task has shut down
    #[error("Client is shut down")]
    Shutdown,

    /// A generic client error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error left the conversation able to accept a new turn
    pub fn is_recoverable_turn_error(&self) -> bool {
        matches!(
            self,
            Error::RequestTimeout(_) | Error::Stream { .. } | Error::AbortedByUser(_)
        )
    }

    /// The request this error concerns, if any
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Error::RequestTimeout(id) | Error::AbortedByUser(id) => Some(id),
            Error::Stream { request_id, .. } => Some(request_id),
            Error::Session(SessionError::Busy { request_id, .. }) => Some(request_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transparent_wrapping() {
        let e: Error = TransportError::NotConnected.into();
        assert_eq!(e.to_string(), "Not connected");
        let e: Error = SessionError::Pending("c1".into()).into();
        assert!(e.to_string().contains("still initializing"));
    }

    #[test]
    fn test_request_id_extraction() {
        let e = Error::Stream {
            request_id: "r1".into(),
            message: "boom".into(),
        };
        assert_eq!(e.request_id().map(|r| r.as_str()), Some("r1"));
        assert!(e.is_recoverable_turn_error());

        let busy: Error = SessionError::Busy {
            conversation_id: "c1".into(),
            request_id: "r2".into(),
        }
        .into();
        assert_eq!(busy.request_id().map(|r| r.as_str()), Some("r2"));
        assert!(!busy.is_recoverable_turn_error());
    }
}
