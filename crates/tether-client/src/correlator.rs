//! Request correlation: turn ids, resolvers and per-request timeouts

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tether_wire::{ConversationId, Fragment, MessageId, RequestId, RequestStatus};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Error;

/// Updates delivered to the resolver of one turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnUpdate {
    Fragment(Fragment),
    Completed { message_id: Option<MessageId> },
    Failed(Error),
    Aborted,
}

impl TurnUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnUpdate::Fragment(_))
    }
}

/// Receiving end of a turn's resolver
pub type TurnReceiver = mpsc::UnboundedReceiver<TurnUpdate>;

/// How many resolved request ids are remembered for late-event detection
const FINISHED_CAPACITY: usize = 256;

struct InFlight {
    conversation_id: ConversationId,
    status: RequestStatus,
    deadline: Instant,
    resolver: mpsc::UnboundedSender<TurnUpdate>,
}

/// Maps in-flight request ids to their resolvers
pub struct Correlator {
    request_timeout: Duration,
    in_flight: HashMap<RequestId, InFlight>,
    finished: HashMap<RequestId, (RequestStatus, ConversationId)>,
    finished_order: VecDeque<RequestId>,
}

impl Correlator {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            in_flight: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
        }
    }

    /// Register a new turn under a freshly generated id
    pub fn register(
        &mut self,
        conversation_id: ConversationId,
        now: Instant,
    ) -> Result<(RequestId, TurnReceiver), Error> {
        let request_id = RequestId::generate();
        let receiver = self.register_with_id(request_id.clone(), conversation_id, now)?;
        Ok((request_id, receiver))
    }

    /// Register a turn under a caller-chosen id.
    ///
    /// Ids that are in flight or remembered as finished are rejected, so a
    /// live resolver is never replaced.
    pub fn register_with_id(
        &mut self,
        request_id: RequestId,
        conversation_id: ConversationId,
        now: Instant,
    ) -> Result<TurnReceiver, Error> {
        if self.is_known(&request_id) {
            return Err(Error::DuplicateRequest(request_id));
        }
        let (resolver, receiver) = mpsc::unbounded_channel();
        self.in_flight.insert(
            request_id,
            InFlight {
                conversation_id,
                status: RequestStatus::Pending,
                deadline: now + self.request_timeout,
                resolver,
            },
        );
        Ok(receiver)
    }

    /// Whether the id is in flight or recently finished
    pub fn is_known(&self, request_id: &RequestId) -> bool {
        self.in_flight.contains_key(request_id) || self.finished.contains_key(request_id)
    }

    /// Status of an in-flight or recently resolved request
    pub fn status(&self, request_id: &RequestId) -> Option<RequestStatus> {
        self.in_flight
            .get(request_id)
            .map(|r| r.status)
            .or_else(|| self.finished.get(request_id).map(|(status, _)| *status))
    }

    /// Conversation of an in-flight request
    pub fn conversation_of(&self, request_id: &RequestId) -> Option<&ConversationId> {
        self.in_flight.get(request_id).map(|r| &r.conversation_id)
    }

    /// Conversation of an in-flight or recently resolved request
    pub fn owner(&self, request_id: &RequestId) -> Option<&ConversationId> {
        self.conversation_of(request_id)
            .or_else(|| self.finished.get(request_id).map(|(_, c)| c))
    }

    /// Whether the id belongs to a request that already resolved
    pub fn is_finished(&self, request_id: &RequestId) -> bool {
        self.finished.contains_key(request_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Every in-flight request with its conversation
    pub fn in_flight(&self) -> Vec<(RequestId, ConversationId)> {
        self.in_flight
            .iter()
            .map(|(id, r)| (id.clone(), r.conversation_id.clone()))
            .collect()
    }

    /// In-flight requests of a conversation
    pub fn in_flight_for(&self, conversation_id: &ConversationId) -> Vec<RequestId> {
        self.in_flight
            .iter()
            .filter(|(_, r)| &r.conversation_id == conversation_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forward a fragment to the request's resolver. Returns `false` for
    /// unknown or already-resolved ids, which are silently ignored.
    pub fn deliver_fragment(&mut self, request_id: &RequestId, fragment: &Fragment) -> bool {
        let Some(request) = self.in_flight.get_mut(request_id) else {
            tracing::debug!("Ignoring fragment for inactive request {}", request_id);
            return false;
        };
        if request.status == RequestStatus::Pending {
            request.status = RequestStatus::Streaming;
        }
        let _ = request.resolver.send(TurnUpdate::Fragment(fragment.clone()));
        true
    }

    /// Resolve a request as completed
    pub fn complete(
        &mut self,
        request_id: &RequestId,
        message_id: Option<MessageId>,
    ) -> Option<ConversationId> {
        self.finish(
            request_id,
            RequestStatus::Completed,
            TurnUpdate::Completed { message_id },
        )
    }

    /// Resolve a request as errored
    pub fn fail(&mut self, request_id: &RequestId, error: Error) -> Option<ConversationId> {
        self.finish(request_id, RequestStatus::Errored, TurnUpdate::Failed(error))
    }

    /// Resolve a request as aborted
    pub fn abort(&mut self, request_id: &RequestId) -> Option<ConversationId> {
        self.finish(request_id, RequestStatus::Aborted, TurnUpdate::Aborted)
    }

    /// Forget a request that never reached the wire
    pub fn cancel(&mut self, request_id: &RequestId) -> bool {
        self.in_flight.remove(request_id).is_some()
    }

    /// Fail every request whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<(RequestId, ConversationId)> {
        let expired: Vec<RequestId> = self
            .in_flight
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                tracing::warn!("Request {} timed out", id);
                let conversation_id = self.fail(&id, Error::RequestTimeout(id.clone()))?;
                Some((id, conversation_id))
            })
            .collect()
    }

    fn finish(
        &mut self,
        request_id: &RequestId,
        status: RequestStatus,
        update: TurnUpdate,
    ) -> Option<ConversationId> {
        let Some(request) = self.in_flight.get(request_id) else {
            tracing::debug!(
                "Ignoring {:?} for inactive request {}",
                status,
                request_id
            );
            return None;
        };
        if !request.status.can_transition_to(status) {
            return None;
        }

        let request = self.in_flight.remove(request_id)?;
        let _ = request.resolver.send(update);
        self.remember(request_id.clone(), status, request.conversation_id.clone());
        Some(request.conversation_id)
    }

    fn remember(&mut self, request_id: RequestId, status: RequestStatus, conversation_id: ConversationId) {
        if self.finished_order.len() >= FINISHED_CAPACITY {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
        self.finished_order.push_back(request_id.clone());
        self.finished.insert(request_id, (status, conversation_id));
    }
}
