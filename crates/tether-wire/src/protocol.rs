//! Channel frames exchanged with the bridge service
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! Outbound frames are a closed enum serialized with adjacent tagging.
//! Inbound frames are decoded by hand so unrecognized events land in an
//! explicit [`ServerMessage::Unknown`] variant instead of failing the socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::fragment::{Fragment, decode_agent_record};
use crate::types::{
    Attachment, ConversationId, Decision, MessageId, PendingPrompt, PlanDecision, ProjectId,
    PromptId, RequestId, SessionId,
};

/// Payload of `join` / `leave`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomPayload {
    pub room: String,
}

/// Payload of `join-project`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPayload {
    pub project_id: ProjectId,
}

/// Payload of `chat:send-message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Payload of `claude:abort`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortPayload {
    pub request_id: RequestId,
}

/// Payload of `prompt:resolve`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResolution {
    pub prompt_id: PromptId,
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_plan: Option<String>,
}

impl PromptResolution {
    /// Build the resolution frame for a decision
    pub fn new(prompt_id: PromptId, decision: &Decision) -> Self {
        let (feedback, edited_plan) = match decision {
            Decision::Plan(PlanDecision::EditPlan {
                edited_plan,
                feedback,
            }) => (feedback.clone(), Some(edited_plan.clone())),
            Decision::Plan(PlanDecision::Reject { feedback }) => (feedback.clone(), None),
            _ => (None, None),
        };
        Self {
            prompt_id,
            decision: decision.as_str().to_string(),
            feedback,
            edited_plan,
        }
    }
}

/// Frames sent from the client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "join")]
    Join(RoomPayload),
    #[serde(rename = "leave")]
    Leave(RoomPayload),
    #[serde(rename = "join-project")]
    JoinProject(ProjectPayload),
    #[serde(rename = "chat:send-message")]
    SendMessage(SendMessage),
    #[serde(rename = "claude:abort")]
    Abort(AbortPayload),
    #[serde(rename = "prompt:resolve")]
    ResolvePrompt(PromptResolution),
}

impl ClientMessage {
    /// The wire event name
    pub fn event(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Leave(_) => "leave",
            ClientMessage::JoinProject(_) => "join-project",
            ClientMessage::SendMessage(_) => "chat:send-message",
            ClientMessage::Abort(_) => "claude:abort",
            ClientMessage::ResolvePrompt(_) => "prompt:resolve",
        }
    }

    /// Encode as a JSON text frame
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Stream record type inside `chat:stream-response`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    ClaudeJson,
    Error,
    Done,
    Aborted,
    #[serde(other)]
    Unknown,
}

/// Payload of `chat:stream-response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    pub request_id: RequestId,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl StreamResponse {
    /// Decode this response into fragments
    pub fn fragments(&self) -> Vec<Fragment> {
        match self.kind {
            StreamKind::ClaudeJson => match &self.data {
                Some(record) => decode_agent_record(record),
                None => vec![],
            },
            StreamKind::Error => vec![Fragment::Error {
                message: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "Unknown stream error".to_string()),
            }],
            StreamKind::Done => vec![Fragment::Done],
            StreamKind::Aborted => vec![Fragment::Aborted],
            StreamKind::Unknown => vec![Fragment::Unknown {
                record_type: "stream-response".to_string(),
            }],
        }
    }
}

/// Payload of `chat:message-complete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageComplete {
    pub request_id: RequestId,
    pub message_id: MessageId,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Payload of `chat:error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatError {
    pub request_id: RequestId,
    pub error: String,
}

/// Payload of `chat:aborted`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAborted {
    pub request_id: RequestId,
}

/// Payload of `prompt:resolved`, the server's acknowledgment of a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResolved {
    pub prompt_id: PromptId,
    #[serde(default = "default_ok")]
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_ok() -> bool {
    true
}

/// Payload of `session:invalidated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInvalidated {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Frames received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    StreamResponse(StreamResponse),
    MessageComplete(MessageComplete),
    ChatError(ChatError),
    ChatAborted(ChatAborted),
    PromptRequest(PendingPrompt),
    PromptResolved(PromptResolved),
    SessionInvalidated(SessionInvalidated),
    /// Domain events for collaborators (`task-*`, `claude-todo-*`, `plan:*`)
    Domain { event: String, data: Value },
    /// Any event this client does not recognize
    Unknown { event: String, data: Value },
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Whether an event name belongs to the collaborator-only domain families
pub fn is_domain_event(event: &str) -> bool {
    event.starts_with("task-") || event.starts_with("claude-todo-") || event.starts_with("plan:")
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::invalid_payload(event, e))
}

impl ServerMessage {
    /// Decode a JSON text frame
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(Error::MalformedFrame("frame is not an object".to_string()));
        }
        let frame: Frame = serde_json::from_value(value)
            .map_err(|e| Error::MalformedFrame(e.to_string()))?;
        Self::from_parts(frame.event, frame.data)
    }

    /// Decode an already split event name and payload
    pub fn from_parts(event: String, data: Value) -> Result<Self> {
        let message = match event.as_str() {
            "chat:stream-response" => ServerMessage::StreamResponse(payload(&event, data)?),
            "chat:message-complete" => ServerMessage::MessageComplete(payload(&event, data)?),
            "chat:error" => ServerMessage::ChatError(payload(&event, data)?),
            "chat:aborted" => ServerMessage::ChatAborted(payload(&event, data)?),
            "prompt:request" => ServerMessage::PromptRequest(payload(&event, data)?),
            "prompt:resolved" => ServerMessage::PromptResolved(payload(&event, data)?),
            "session:invalidated" => ServerMessage::SessionInvalidated(payload(&event, data)?),
            name if is_domain_event(name) => ServerMessage::Domain { event, data },
            _ => ServerMessage::Unknown { event, data },
        };
        Ok(message)
    }

    /// The request id this frame is correlated with, if any
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            ServerMessage::StreamResponse(r) => Some(&r.request_id),
            ServerMessage::MessageComplete(m) => Some(&m.request_id),
            ServerMessage::ChatError(e) => Some(&e.request_id),
            ServerMessage::ChatAborted(a) => Some(&a.request_id),
            ServerMessage::PromptRequest(p) => p.request_id.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PermissionDecision, PromptKind};
    use serde_json::json;

    #[test]
    fn test_send_message_encoding() {
        let msg = ClientMessage::SendMessage(SendMessage {
            conversation_id: "c1".into(),
            content: "hello".into(),
            attachments: vec![],
            request_id: "r1".into(),
            session_id: None,
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "chat:send-message",
                "data": { "conversationId": "c1", "content": "hello", "requestId": "r1" }
            })
        );
    }

    #[test]
    fn test_join_project_encoding() {
        let msg = ClientMessage::JoinProject(ProjectPayload {
            project_id: "p9".into(),
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "join-project");
        assert_eq!(value["data"]["projectId"], "p9");
        assert_eq!(msg.event(), "join-project");
    }

    #[test]
    fn test_resolution_carries_plan_edits() {
        let decision = Decision::Plan(PlanDecision::EditPlan {
            edited_plan: "1. smaller step".into(),
            feedback: Some("too big".into()),
        });
        let resolution = PromptResolution::new("p1".into(), &decision);
        assert_eq!(resolution.decision, "edit_plan");
        assert_eq!(resolution.edited_plan.as_deref(), Some("1. smaller step"));
        assert_eq!(resolution.feedback.as_deref(), Some("too big"));

        let deny = PromptResolution::new("p2".into(), &PermissionDecision::Deny.into());
        let value = serde_json::to_value(&deny).unwrap();
        assert_eq!(value, json!({ "promptId": "p2", "decision": "deny" }));
    }

    #[test]
    fn test_decode_stream_response() {
        let text = json!({
            "event": "chat:stream-response",
            "data": {
                "requestId": "r1",
                "type": "claude_json",
                "data": { "type": "system", "subtype": "init", "session_id": "s1" },
                "timestamp": "2025-01-01T00:00:00Z"
            }
        })
        .to_string();
        let msg = ServerMessage::decode(&text).unwrap();
        assert_eq!(msg.request_id().map(|r| r.as_str()), Some("r1"));
        match msg {
            ServerMessage::StreamResponse(r) => {
                let fragments = r.fragments();
                assert_eq!(fragments[0].session_id().map(|s| s.as_str()), Some("s1"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_stream_error_without_text() {
        let r = StreamResponse {
            request_id: "r1".into(),
            kind: StreamKind::Error,
            data: None,
            error: None,
            timestamp: None,
        };
        assert!(matches!(&r.fragments()[0], Fragment::Error { message } if !message.is_empty()));
    }

    #[test]
    fn test_unknown_stream_kind() {
        let msg = ServerMessage::decode(
            &json!({ "event": "chat:stream-response", "data": { "requestId": "r1", "type": "heartbeat" } })
                .to_string(),
        )
        .unwrap();
        match msg {
            ServerMessage::StreamResponse(r) => {
                assert_eq!(r.kind, StreamKind::Unknown);
                assert!(matches!(r.fragments()[0], Fragment::Unknown { .. }));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_prompt_request() {
        let text = json!({
            "event": "prompt:request",
            "data": {
                "promptId": "p1",
                "conversationId": "c1",
                "sessionId": "s1",
                "requestId": "r1",
                "kind": "plan_review",
                "plan": "1. refactor"
            }
        })
        .to_string();
        match ServerMessage::decode(&text).unwrap() {
            ServerMessage::PromptRequest(prompt) => {
                assert_eq!(prompt.prompt_id.as_str(), "p1");
                assert_eq!(
                    prompt.kind,
                    PromptKind::PlanReview { plan: "1. refactor".into() }
                );
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_prompt_resolved_defaults_ok() {
        let msg = ServerMessage::decode(
            &json!({ "event": "prompt:resolved", "data": { "promptId": "p1" } }).to_string(),
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::PromptResolved(PromptResolved {
                prompt_id: "p1".into(),
                ok: true,
                error: None
            })
        );
    }

    #[test]
    fn test_domain_and_unknown_events() {
        let domain = ServerMessage::decode(
            &json!({ "event": "task-updated", "data": { "id": 3 } }).to_string(),
        )
        .unwrap();
        assert!(matches!(domain, ServerMessage::Domain { ref event, .. } if event == "task-updated"));

        let plan = ServerMessage::decode(&json!({ "event": "plan:created" }).to_string()).unwrap();
        assert!(matches!(plan, ServerMessage::Domain { .. }));

        let unknown = ServerMessage::decode(
            &json!({ "event": "presence", "data": [1, 2] }).to_string(),
        )
        .unwrap();
        assert!(matches!(unknown, ServerMessage::Unknown { ref event, .. } if event == "presence"));
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(matches!(ServerMessage::decode("[1]"), Err(Error::MalformedFrame(_))));
        assert!(matches!(ServerMessage::decode("not json"), Err(Error::Json(_))));
        assert!(matches!(
            ServerMessage::decode(&json!({ "data": {} }).to_string()),
            Err(Error::MalformedFrame(_))
        ));
        let err = ServerMessage::decode(
            &json!({ "event": "chat:error", "data": { "requestId": "r1" } }).to_string(),
        )
        .unwrap_err();
        assert_eq!(err.event(), Some("chat:error"));
    }
}
