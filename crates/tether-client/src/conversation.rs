//! Conversation state: persisted history and optimistic echoes.

use std::collections::HashMap;
use std::sync::Arc;

use tether_wire::{Conversation, Message, MessageId, RequestId};

/// Client-side state of one conversation.
#[derive(Debug, Default)]
pub struct ConversationState {
    /// Backend record, once known
    pub conversation: Option<Conversation>,
    /// Persisted history as last loaded
    pub persisted: Vec<Arc<Message>>,
    /// Locally echoed user messages awaiting their durable copy
    pub optimistic: Vec<Arc<Message>>,
    /// Whether history has been loaded at least once
    pub history_loaded: bool,
}

impl ConversationState {
    /// Echo an outbound user message
    pub fn add_optimistic(&mut self, message: Message) -> Arc<Message> {
        let message = Arc::new(message);
        self.optimistic.push(message.clone());
        message
    }

    /// Withdraw the echo of a turn that never reached the wire
    pub fn remove_optimistic(&mut self, request_id: &RequestId) -> bool {
        let before = self.optimistic.len();
        self.optimistic
            .retain(|m| m.request_id() != Some(request_id));
        self.optimistic.len() != before
    }

    /// Replace persisted history.
    ///
    /// Messages equal to ones already held keep their existing `Arc`, and
    /// optimistic echoes whose request now has a persisted message are
    /// dropped. Returns whether anything changed.
    pub fn replace_history(&mut self, messages: Vec<Message>) -> bool {
        let mut changed = messages.len() != self.persisted.len();
        let persisted: Vec<Arc<Message>> = {
            let previous: HashMap<&MessageId, &Arc<Message>> =
                self.persisted.iter().map(|m| (&m.id, m)).collect();
            messages
                .into_iter()
                .map(|message| match previous.get(&message.id) {
                    Some(&existing) if **existing == message => Arc::clone(existing),
                    _ => {
                        changed = true;
                        Arc::new(message)
                    }
                })
                .collect()
        };
        self.persisted = persisted;
        self.history_loaded = true;

        let before = self.optimistic.len();
        let persisted = &self.persisted;
        self.optimistic.retain(|o| {
            o.request_id()
                .is_none_or(|r| !persisted.iter().any(|m| m.request_id() == Some(r)))
        });
        changed || self.optimistic.len() != before
    }
}
