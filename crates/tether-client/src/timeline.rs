//! Composition of the displayed conversation timeline

use std::collections::HashSet;
use std::sync::Arc;

use tether_wire::{Message, PendingPrompt, RequestId};

use crate::aggregator::durable_request_ids;

/// One displayed entry
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineItem {
    Message(Arc<Message>),
    Prompt(Arc<PendingPrompt>),
}

impl TimelineItem {
    /// Whether both items share the same allocation
    pub fn ptr_eq(&self, other: &TimelineItem) -> bool {
        match (self, other) {
            (TimelineItem::Message(a), TimelineItem::Message(b)) => Arc::ptr_eq(a, b),
            (TimelineItem::Prompt(a), TimelineItem::Prompt(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            TimelineItem::Message(m) => Some(m),
            TimelineItem::Prompt(_) => None,
        }
    }
}

/// Merge every source into the ordered display sequence.
///
/// Persisted messages come first in creation order, then optimistic
/// messages no persisted message has superseded, then stream items whose
/// request has no durable copy yet, then the active prompt.
pub fn compose(
    persisted: &[Arc<Message>],
    optimistic: &[Arc<Message>],
    stream: &[Arc<Message>],
    prompt: Option<&Arc<PendingPrompt>>,
) -> Vec<TimelineItem> {
    let mut ordered: Vec<&Arc<Message>> = persisted.iter().collect();
    ordered.sort_by_key(|m| m.created_at);

    let persisted_requests: HashSet<&RequestId> =
        persisted.iter().filter_map(|m| m.request_id()).collect();
    let durable = durable_request_ids(persisted);

    let optimistic = optimistic
        .iter()
        .filter(|m| m.request_id().is_none_or(|r| !persisted_requests.contains(r)));
    let stream = stream
        .iter()
        .filter(|m| m.request_id().is_none_or(|r| !durable.contains(r)));

    ordered
        .into_iter()
        .chain(optimistic)
        .chain(stream)
        .map(|m| TimelineItem::Message(m.clone()))
        .chain(prompt.map(|p| TimelineItem::Prompt(p.clone())))
        .collect()
}
