//! Core types for the conversation data model

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is the empty string
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Client-generated, opaque identifier of one turn
    RequestId
);
string_id!(
    /// Server-assigned, opaque identifier of an agent session
    SessionId
);
string_id!(
    /// Conversation identifier
    ConversationId
);
string_id!(
    /// Project identifier
    ProjectId
);
string_id!(
    /// Server-assigned identifier of a pending prompt
    PromptId
);
string_id!(
    /// Message identifier (temporary for optimistic messages)
    MessageId
);

impl RequestId {
    /// Generate a fresh collision-resistant request id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Prefix marking locally synthesized message ids
pub const OPTIMISTIC_ID_PREFIX: &str = "tmp-";

impl MessageId {
    /// Generate a temporary id for an optimistic message
    pub fn temporary() -> Self {
        Self(format!("{}{}", OPTIMISTIC_ID_PREFIX, uuid::Uuid::new_v4()))
    }

    /// Whether this id was synthesized locally
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(OPTIMISTIC_ID_PREFIX)
    }
}

/// A conversation as stored by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub archived: bool,
    /// The conversation's active agent session, if one exists
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

impl Conversation {
    /// Create a new, session-less conversation
    pub fn new(id: impl Into<ConversationId>, project_id: Option<ProjectId>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            project_id,
            title: String::new(),
            created_at: now,
            updated_at: now,
            archived: false,
            session_id: None,
        }
    }
}

/// Token usage and cost information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl Usage {
    /// Add another usage record to this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.cost_usd += other.cost_usd;
    }

    /// Total tokens across all categories
    pub fn total_tokens(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }
}

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Result,
    Error,
    Abort,
}

impl Role {
    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
            Role::Result => "result",
            Role::Error => "error",
            Role::Abort => "abort",
        }
    }
}

/// Execution state of a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Running,
    Succeeded,
    Failed,
}

/// Metadata attached to a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// The turn that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_state: Option<ToolState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A single timeline message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// Creation time in milliseconds since the epoch
    #[serde(default)]
    pub created_at: i64,
    /// Whether the message is final (streamed entries start incomplete)
    #[serde(default = "default_true")]
    pub complete: bool,
}

fn default_true() -> bool {
    true
}

impl Message {
    /// Create a message with the current timestamp
    pub fn new(
        id: impl Into<MessageId>,
        conversation_id: ConversationId,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id,
            role,
            content: content.into(),
            metadata: MessageMetadata::default(),
            created_at: chrono::Utc::now().timestamp_millis(),
            complete: true,
        }
    }

    /// Create the locally synthesized echo of a user turn
    pub fn optimistic_user(
        conversation_id: ConversationId,
        request_id: RequestId,
        content: impl Into<String>,
    ) -> Self {
        let mut message = Self::new(MessageId::temporary(), conversation_id, Role::User, content);
        message.metadata.request_id = Some(request_id);
        message
    }

    /// Attach the request id that produced this message
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.metadata.request_id = Some(request_id);
        self
    }

    /// Override the creation timestamp
    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// The request id this message belongs to, if known
    pub fn request_id(&self) -> Option<&RequestId> {
        self.metadata.request_id.as_ref()
    }

    /// Whether this is a locally synthesized message
    pub fn is_optimistic(&self) -> bool {
        self.id.is_temporary()
    }
}

/// A file attached to an outbound turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Base64-encoded file contents
    pub data: String,
}

/// Lifecycle status of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Streaming,
    Completed,
    Errored,
    Aborted,
}

impl RequestStatus {
    /// Whether the request has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Errored | RequestStatus::Aborted
        )
    }

    /// Whether moving to `next` is a forward transition
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        match self {
            RequestStatus::Pending => next != RequestStatus::Pending,
            RequestStatus::Streaming => next.is_terminal(),
            _ => false,
        }
    }
}

/// Lifecycle state of a conversation's agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Pending,
    Ready,
    Error,
}

/// The two families of server-initiated prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptKind {
    /// Permission to execute a tool
    Permission {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Review of a proposed plan
    PlanReview { plan: String },
}

impl PromptKind {
    pub fn name(&self) -> &'static str {
        match self {
            PromptKind::Permission { .. } => "permission",
            PromptKind::PlanReview { .. } => "plan_review",
        }
    }
}

/// A server-initiated request for a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPrompt {
    pub prompt_id: PromptId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(flatten)]
    pub kind: PromptKind,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub resolved_at: Option<i64>,
}

/// Decisions for a tool permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionDecision {
    AllowOnce,
    AllowPermanently,
    Deny,
}

impl PermissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionDecision::AllowOnce => "allow-once",
            PermissionDecision::AllowPermanently => "allow-permanently",
            PermissionDecision::Deny => "deny",
        }
    }
}

/// Decisions for a plan-review prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PlanDecision {
    AutoAccept,
    ReviewAccept,
    EditPlan {
        edited_plan: String,
        feedback: Option<String>,
    },
    Reject {
        feedback: Option<String>,
    },
}

impl PlanDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanDecision::AutoAccept => "auto_accept",
            PlanDecision::ReviewAccept => "review_accept",
            PlanDecision::EditPlan { .. } => "edit_plan",
            PlanDecision::Reject { .. } => "reject",
        }
    }
}

/// A decision for either prompt family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Permission(PermissionDecision),
    Plan(PlanDecision),
}

impl Decision {
    /// Wire name of the decision
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Permission(d) => d.as_str(),
            Decision::Plan(d) => d.as_str(),
        }
    }

    /// Whether this decision answers a prompt of the given kind
    pub fn applies_to(&self, kind: &PromptKind) -> bool {
        matches!(
            (self, kind),
            (Decision::Permission(_), PromptKind::Permission { .. })
                | (Decision::Plan(_), PromptKind::PlanReview { .. })
        )
    }
}

impl From<PermissionDecision> for Decision {
    fn from(d: PermissionDecision) -> Self {
        Decision::Permission(d)
    }
}

impl From<PlanDecision> for Decision {
    fn from(d: PlanDecision) -> Self {
        Decision::Plan(d)
    }
}
