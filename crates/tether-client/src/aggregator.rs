//! Folds per-request fragment streams into timeline entries

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tether_wire::{
    ConversationId, Fragment, Message, MessageId, RequestId, Role, ToolState, Usage,
};

/// Finalized streams kept per conversation when history never supersedes them
const FINALIZED_CAPACITY: usize = 64;

/// Where a request's stream stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Streaming,
    Done,
    Errored,
    Aborted,
}

impl StreamStatus {
    pub fn is_final(&self) -> bool {
        *self != StreamStatus::Streaming
    }
}

/// Accumulated entries of one request
struct StreamEntry {
    conversation_id: ConversationId,
    request_id: RequestId,
    status: StreamStatus,
    items: Vec<Arc<Message>>,
    tools: HashMap<String, usize>,
    streamed_deltas: bool,
    started_at: i64,
}

impl StreamEntry {
    fn new(conversation_id: ConversationId, request_id: RequestId, started_at: i64) -> Self {
        Self {
            conversation_id,
            request_id,
            status: StreamStatus::Streaming,
            items: vec![],
            tools: HashMap::new(),
            streamed_deltas: false,
            started_at,
        }
    }

    fn push(&mut self, role: Role, content: impl Into<String>) -> usize {
        let index = self.items.len();
        let id = MessageId::new(format!("tmp-{}-{}", self.request_id, index));
        let mut message = Message::new(id, self.conversation_id.clone(), role, content)
            .with_request_id(self.request_id.clone())
            .with_created_at(self.started_at + index as i64);
        message.complete = false;
        self.items.push(Arc::new(message));
        index
    }

    fn update(&mut self, index: usize, f: impl FnOnce(&mut Message)) {
        f(Arc::make_mut(&mut self.items[index]));
    }

    /// Append text to the trailing assistant entry, opening one if needed
    fn append_text(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        match self.items.last() {
            Some(last) if last.role == Role::Assistant => {
                let index = self.items.len() - 1;
                self.update(index, |m| m.content.push_str(text));
            }
            _ => {
                self.push(Role::Assistant, text);
            }
        }
        true
    }

    fn tool_use(&mut self, id: &str, name: &str, input: &serde_json::Value) -> bool {
        if let Some(&index) = self.tools.get(id) {
            // The result overtook its invocation; fill in what it lacked
            self.update(index, |m| {
                m.metadata.tool_name = Some(name.to_string());
                m.metadata.tool_input = Some(input.clone());
            });
            return true;
        }
        let index = self.push(Role::Tool, "");
        self.update(index, |m| {
            m.metadata.tool_use_id = Some(id.to_string());
            m.metadata.tool_name = Some(name.to_string());
            m.metadata.tool_input = Some(input.clone());
            m.metadata.tool_state = Some(ToolState::Running);
        });
        self.tools.insert(id.to_string(), index);
        true
    }

    fn tool_result(&mut self, tool_use_id: &str, content: &str, is_error: bool) -> bool {
        let state = if is_error {
            ToolState::Failed
        } else {
            ToolState::Succeeded
        };
        let index = match self.tools.get(tool_use_id) {
            Some(&index) => index,
            None => {
                let index = self.push(Role::Tool, "");
                self.update(index, |m| m.metadata.tool_use_id = Some(tool_use_id.to_string()));
                self.tools.insert(tool_use_id.to_string(), index);
                index
            }
        };
        self.update(index, |m| {
            m.content = content.to_string();
            m.metadata.tool_state = Some(state);
            m.complete = true;
        });
        true
    }

    fn attach_result(&mut self, usage: &Usage, duration_ms: Option<u64>) {
        let Some(index) = self.items.iter().rposition(|m| m.role == Role::Assistant) else {
            return;
        };
        self.update(index, |m| {
            m.metadata.usage = Some(usage.clone());
            m.metadata.cost_usd = Some(usage.cost_usd);
            m.metadata.duration_ms = duration_ms;
        });
    }

    fn finalize(&mut self, status: StreamStatus) {
        self.status = status;
        for index in 0..self.items.len() {
            let item = &self.items[index];
            let stale_tool = status != StreamStatus::Done
                && item.metadata.tool_state == Some(ToolState::Running);
            if item.complete && !stale_tool {
                continue;
            }
            self.update(index, |m| {
                m.complete = true;
                if stale_tool {
                    m.metadata.tool_state = Some(ToolState::Failed);
                }
            });
        }
    }

    fn fail(&mut self, message: &str) {
        let index = self.push(Role::Error, message);
        self.update(index, |m| m.complete = true);
        self.finalize(StreamStatus::Errored);
    }

    fn abort(&mut self) {
        let index = self.push(Role::Abort, "Request aborted");
        self.update(index, |m| m.complete = true);
        self.finalize(StreamStatus::Aborted);
    }

    fn apply(&mut self, fragment: &Fragment) -> bool {
        match fragment {
            Fragment::ContentDelta { text } => {
                self.streamed_deltas = true;
                self.append_text(text)
            }
            Fragment::Text { text } if !self.streamed_deltas => self.append_text(text),
            Fragment::Text { .. } => false,
            Fragment::ToolUse { id, name, input } => self.tool_use(id, name, input),
            Fragment::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => self.tool_result(tool_use_id, content, *is_error),
            Fragment::Result {
                text,
                usage,
                duration_ms,
                is_error,
                ..
            } => {
                if *is_error {
                    let message = text.as_deref().unwrap_or("Agent reported an error");
                    self.fail(message);
                    return true;
                }
                let has_text = self.items.iter().any(|m| m.role == Role::Assistant);
                if !has_text {
                    if let Some(text) = text {
                        self.append_text(text);
                    }
                }
                self.attach_result(usage, *duration_ms);
                true
            }
            Fragment::Error { message } => {
                self.fail(message);
                true
            }
            Fragment::Done => {
                self.finalize(StreamStatus::Done);
                true
            }
            Fragment::Aborted => {
                self.abort();
                true
            }
            Fragment::Init { .. } | Fragment::Unknown { .. } => false,
        }
    }
}

/// In-flight stream entries across all conversations, in send order
pub struct Aggregator {
    streams: Vec<StreamEntry>,
    finalized_capacity: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            streams: vec![],
            finalized_capacity: FINALIZED_CAPACITY,
        }
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the finalized streams kept for each conversation
    pub fn with_finalized_capacity(mut self, capacity: usize) -> Self {
        self.finalized_capacity = capacity;
        self
    }

    fn entry(&self, request_id: &RequestId) -> Option<&StreamEntry> {
        self.streams.iter().find(|s| &s.request_id == request_id)
    }

    fn entry_mut(&mut self, request_id: &RequestId) -> Option<&mut StreamEntry> {
        self.streams.iter_mut().find(|s| &s.request_id == request_id)
    }

    /// Open an empty stream for a request. A no-op if it already exists.
    pub fn start(&mut self, conversation_id: ConversationId, request_id: RequestId) {
        if self.entry(&request_id).is_some() {
            return;
        }
        let started_at = chrono::Utc::now().timestamp_millis();
        self.streams
            .push(StreamEntry::new(conversation_id.clone(), request_id, started_at));
        self.prune(&conversation_id);
    }

    /// Drop the oldest finalized streams of a conversation beyond capacity
    fn prune(&mut self, conversation_id: &ConversationId) {
        let finalized = self
            .streams
            .iter()
            .filter(|s| &s.conversation_id == conversation_id && s.status.is_final())
            .count();
        let mut excess = finalized.saturating_sub(self.finalized_capacity);
        if excess == 0 {
            return;
        }
        tracing::debug!(
            "Dropping {} finalized streams of conversation {}",
            excess,
            conversation_id
        );
        self.streams.retain(|s| {
            let evict =
                excess > 0 && &s.conversation_id == conversation_id && s.status.is_final();
            if evict {
                excess -= 1;
            }
            !evict
        });
    }

    /// Fold one fragment into its request's entries.
    ///
    /// Returns whether anything visible changed. Fragments for unknown
    /// requests, or arriving after a terminal fragment, are dropped.
    pub fn apply(&mut self, request_id: &RequestId, fragment: &Fragment) -> bool {
        let Some(entry) = self.entry_mut(request_id) else {
            tracing::debug!("Dropping fragment for untracked request {}", request_id);
            return false;
        };
        if entry.status.is_final() {
            tracing::debug!(
                "Dropping fragment after {:?} for request {}",
                entry.status,
                request_id
            );
            return false;
        }
        entry.apply(fragment)
    }

    /// Finalize a request as errored without a stream fragment
    pub fn fail(&mut self, request_id: &RequestId, message: &str) -> bool {
        self.apply(
            request_id,
            &Fragment::Error {
                message: message.to_string(),
            },
        )
    }

    /// Finalize a request as aborted without a stream fragment
    pub fn abort(&mut self, request_id: &RequestId) -> bool {
        self.apply(request_id, &Fragment::Aborted)
    }

    pub fn status(&self, request_id: &RequestId) -> Option<StreamStatus> {
        self.entry(request_id).map(|s| s.status)
    }

    /// Concatenated assistant text of a request
    pub fn assistant_text(&self, request_id: &RequestId) -> Option<String> {
        self.entry(request_id).map(|s| {
            s.items
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .map(|m| m.content.as_str())
                .collect()
        })
    }

    /// Stream entries of a conversation, in send order
    pub fn items(&self, conversation_id: &ConversationId) -> Vec<Arc<Message>> {
        self.streams
            .iter()
            .filter(|s| &s.conversation_id == conversation_id)
            .flat_map(|s| s.items.iter().cloned())
            .collect()
    }

    /// Drop a stream that never reached the wire
    pub fn discard(&mut self, request_id: &RequestId) {
        self.streams.retain(|s| &s.request_id != request_id);
    }

    /// Drop finalized streams whose durable copy is now in history.
    ///
    /// Returns the request ids that were dropped.
    pub fn reconcile_persisted(
        &mut self,
        conversation_id: &ConversationId,
        persisted: &[Arc<Message>],
    ) -> Vec<RequestId> {
        let durable = durable_request_ids(persisted);
        let mut dropped = vec![];
        self.streams.retain(|s| {
            let superseded = &s.conversation_id == conversation_id
                && s.status.is_final()
                && durable.contains(&s.request_id);
            if superseded {
                dropped.push(s.request_id.clone());
            }
            !superseded
        });
        dropped
    }
}

/// Request ids with a persisted agent-side message
pub fn durable_request_ids(persisted: &[Arc<Message>]) -> HashSet<RequestId> {
    persisted
        .iter()
        .filter(|m| m.role != Role::User)
        .filter_map(|m| m.request_id().cloned())
        .collect()
}
