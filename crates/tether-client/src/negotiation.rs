//! Server-initiated prompts awaiting a human decision

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tether_wire::protocol::{PromptResolution, PromptResolved};
use tether_wire::{ClientMessage, ConversationId, Decision, PendingPrompt, PromptId, RequestId};
use tokio::time::Instant;

use crate::error::PromptResolutionError;

/// How many resolved prompt ids are remembered
const RESOLVED_CAPACITY: usize = 256;

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a newly registered prompt landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// It is now the conversation's active prompt
    Active,
    /// It waits behind the active prompt
    Queued,
    /// Already known or already resolved
    Duplicate,
}

/// Outcome of a server acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub enum Acknowledgment {
    /// The prompt is gone; `next` is the newly surfaced one
    Resolved {
        conversation_id: ConversationId,
        prompt_id: PromptId,
        next: Option<Arc<PendingPrompt>>,
    },
    /// The server refused; the prompt stays pending
    Rejected {
        conversation_id: ConversationId,
        error: PromptResolutionError,
    },
    /// No such prompt
    Ignored,
}

#[derive(Default)]
struct PromptQueue {
    prompts: VecDeque<Arc<PendingPrompt>>,
    awaiting_ack: Option<PromptId>,
    ack_deadline: Option<Instant>,
}

/// Per-conversation FIFO of pending prompts. Only the head is actionable.
pub struct NegotiationManager {
    ack_timeout: Duration,
    queues: HashMap<ConversationId, PromptQueue>,
    owners: HashMap<PromptId, ConversationId>,
    resolved: HashSet<PromptId>,
    resolved_order: VecDeque<PromptId>,
}

impl Default for NegotiationManager {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            queues: HashMap::new(),
            owners: HashMap::new(),
            resolved: HashSet::new(),
            resolved_order: VecDeque::new(),
        }
    }
}

impl NegotiationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a sent resolution may wait for the server's acknowledgment
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Add a prompt. Re-registering a known id is ignored.
    pub fn register(&mut self, prompt: PendingPrompt) -> Registration {
        if self.owners.contains_key(&prompt.prompt_id) || self.resolved.contains(&prompt.prompt_id) {
            tracing::debug!("Ignoring duplicate prompt {}", prompt.prompt_id);
            return Registration::Duplicate;
        }
        let conversation_id = prompt.conversation_id.clone();
        self.owners
            .insert(prompt.prompt_id.clone(), conversation_id.clone());
        let queue = self.queues.entry(conversation_id).or_default();
        queue.prompts.push_back(Arc::new(prompt));
        if queue.prompts.len() == 1 {
            Registration::Active
        } else {
            Registration::Queued
        }
    }

    /// The conversation's actionable prompt
    pub fn active(&self, conversation_id: &ConversationId) -> Option<Arc<PendingPrompt>> {
        self.queues
            .get(conversation_id)
            .and_then(|q| q.prompts.front().cloned())
    }

    /// Every pending prompt of the conversation, active first
    pub fn pending(&self, conversation_id: &ConversationId) -> Vec<Arc<PendingPrompt>> {
        self.queues
            .get(conversation_id)
            .map(|q| q.prompts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, prompt_id: &PromptId) -> Option<Arc<PendingPrompt>> {
        let conversation_id = self.owners.get(prompt_id)?;
        self.queues
            .get(conversation_id)?
            .prompts
            .iter()
            .find(|p| &p.prompt_id == prompt_id)
            .cloned()
    }

    pub fn is_awaiting_ack(&self, prompt_id: &PromptId) -> bool {
        self.owners
            .get(prompt_id)
            .and_then(|c| self.queues.get(c))
            .is_some_and(|q| q.awaiting_ack.as_ref() == Some(prompt_id))
    }

    /// Validate a decision and build the frame that carries it.
    ///
    /// On success the prompt is marked awaiting acknowledgment; it stays
    /// pending until the server confirms. Errors leave all state untouched.
    pub fn resolve(
        &mut self,
        prompt_id: &PromptId,
        decision: &Decision,
    ) -> Result<ClientMessage, PromptResolutionError> {
        self.resolve_at(prompt_id, decision, Instant::now())
    }

    /// [`resolve`](Self::resolve) with an explicit clock for the ack deadline
    pub fn resolve_at(
        &mut self,
        prompt_id: &PromptId,
        decision: &Decision,
        now: Instant,
    ) -> Result<ClientMessage, PromptResolutionError> {
        let Some(conversation_id) = self.owners.get(prompt_id) else {
            if self.resolved.contains(prompt_id) {
                return Err(PromptResolutionError::AlreadyResolved(prompt_id.clone()));
            }
            return Err(PromptResolutionError::Unknown(prompt_id.clone()));
        };
        let queue = self
            .queues
            .get_mut(conversation_id)
            .ok_or_else(|| PromptResolutionError::Unknown(prompt_id.clone()))?;
        let Some(head) = queue.prompts.front() else {
            return Err(PromptResolutionError::Unknown(prompt_id.clone()));
        };
        if &head.prompt_id != prompt_id {
            return Err(PromptResolutionError::Queued(prompt_id.clone()));
        }
        if queue.awaiting_ack.is_some() {
            return Err(PromptResolutionError::AwaitingAck(prompt_id.clone()));
        }
        if !decision.applies_to(&head.kind) {
            return Err(PromptResolutionError::DecisionMismatch {
                prompt_id: prompt_id.clone(),
                decision: decision.as_str(),
                kind: head.kind.name(),
            });
        }

        queue.awaiting_ack = Some(prompt_id.clone());
        queue.ack_deadline = Some(now + self.ack_timeout);
        Ok(ClientMessage::ResolvePrompt(PromptResolution::new(
            prompt_id.clone(),
            decision,
        )))
    }

    /// Clear the awaiting mark of a resolution that never reached the server
    pub fn cancel_resolution(&mut self, prompt_id: &PromptId) {
        if let Some(queue) = self
            .owners
            .get(prompt_id)
            .and_then(|c| self.queues.get_mut(c))
        {
            if queue.awaiting_ack.as_ref() == Some(prompt_id) {
                queue.awaiting_ack = None;
            }
        }
    }

    /// Clear every awaiting mark. Acknowledgments in flight on a dropped
    /// connection never arrive.
    pub fn reset_awaiting(&mut self) -> usize {
        self.queues
            .values_mut()
            .filter_map(|q| q.awaiting_ack.take())
            .count()
    }

    /// Clear awaiting marks whose acknowledgment is overdue, making those
    /// prompts actionable again. Returns the prompts that timed out.
    pub fn expire(&mut self, now: Instant) -> Vec<(ConversationId, PromptId)> {
        let mut expired = vec![];
        for (conversation_id, queue) in &mut self.queues {
            if !queue.ack_deadline.is_some_and(|deadline| deadline <= now) {
                continue;
            }
            queue.ack_deadline = None;
            if let Some(prompt_id) = queue.awaiting_ack.take() {
                tracing::warn!("No acknowledgment for prompt {}", prompt_id);
                expired.push((conversation_id.clone(), prompt_id));
            }
        }
        expired
    }

    /// Apply the server's verdict on a resolution
    pub fn acknowledge(&mut self, ack: &PromptResolved) -> Acknowledgment {
        let Some(conversation_id) = self.owners.get(&ack.prompt_id).cloned() else {
            tracing::debug!("Acknowledgment for unknown prompt {}", ack.prompt_id);
            return Acknowledgment::Ignored;
        };

        if !ack.ok {
            self.cancel_resolution(&ack.prompt_id);
            let reason = ack
                .error
                .clone()
                .unwrap_or_else(|| "resolution rejected".to_string());
            tracing::warn!("Resolution of prompt {} rejected: {}", ack.prompt_id, reason);
            return Acknowledgment::Rejected {
                conversation_id,
                error: PromptResolutionError::Rejected {
                    prompt_id: ack.prompt_id.clone(),
                    reason,
                },
            };
        }

        self.remove(&ack.prompt_id);
        Acknowledgment::Resolved {
            next: self.active(&conversation_id),
            prompt_id: ack.prompt_id.clone(),
            conversation_id,
        }
    }

    /// Drop prompts tied to a request that reached a terminal state.
    ///
    /// Returns the conversations whose active prompt changed.
    pub fn withdraw_request(&mut self, request_id: &RequestId) -> Vec<ConversationId> {
        let withdrawn: Vec<(PromptId, ConversationId)> = self
            .queues
            .iter()
            .flat_map(|(conversation_id, q)| {
                q.prompts
                    .iter()
                    .filter(|p| p.request_id.as_ref() == Some(request_id))
                    .map(move |p| (p.prompt_id.clone(), conversation_id.clone()))
            })
            .collect();

        let mut changed = vec![];
        for (prompt_id, conversation_id) in withdrawn {
            let was_active = self
                .active(&conversation_id)
                .is_some_and(|p| p.prompt_id == prompt_id);
            tracing::debug!("Withdrawing prompt {} of request {}", prompt_id, request_id);
            self.remove(&prompt_id);
            if was_active && !changed.contains(&conversation_id) {
                changed.push(conversation_id);
            }
        }
        changed
    }

    fn remove(&mut self, prompt_id: &PromptId) {
        let Some(conversation_id) = self.owners.remove(prompt_id) else {
            return;
        };
        if let Some(queue) = self.queues.get_mut(&conversation_id) {
            queue.prompts.retain(|p| &p.prompt_id != prompt_id);
            if queue.awaiting_ack.as_ref() == Some(prompt_id) {
                queue.awaiting_ack = None;
            }
            if queue.prompts.is_empty() {
                self.queues.remove(&conversation_id);
            }
        }

        if self.resolved_order.len() >= RESOLVED_CAPACITY {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
        self.resolved_order.push_back(prompt_id.clone());
        self.resolved.insert(prompt_id.clone());
    }
}
