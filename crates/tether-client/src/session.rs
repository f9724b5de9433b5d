//! Per-conversation agent session lifecycle and the send gate

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tether_wire::{ConversationId, RequestId, SessionId, SessionState, Usage};
use tokio::time::Instant;

use crate::error::SessionError;

/// Error texts meaning the backend no longer knows the session
static INVALID_SESSION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)no.?conversation.?found.?with.?session",
        r"(?i)session.?(not.?found|does.?not.?exist|expired)",
        r"(?i)invalid.?session",
        r"(?i)unknown.?session",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check if an error message means the agent session is gone
pub fn is_session_invalid_error(error: &str) -> bool {
    INVALID_SESSION_PATTERNS.iter().any(|re| re.is_match(error))
}

#[derive(Debug, Clone)]
struct SessionEntry {
    state: SessionState,
    session_id: Option<SessionId>,
    usage: Usage,
    /// Pending because of an explicit re-initialization
    explicit_init: bool,
    /// The turn that opened the session, while waiting for its id
    init_request: Option<RequestId>,
    init_deadline: Option<Instant>,
    active_request: Option<RequestId>,
    last_error: Option<String>,
}

impl Default for SessionEntry {
    fn default() -> Self {
        Self {
            state: SessionState::Uninitialized,
            session_id: None,
            usage: Usage::default(),
            explicit_init: false,
            init_request: None,
            init_deadline: None,
            active_request: None,
            last_error: None,
        }
    }
}

impl SessionEntry {
    fn fail(&mut self, reason: impl Into<String>) {
        self.state = SessionState::Error;
        self.session_id = None;
        self.explicit_init = false;
        self.init_request = None;
        self.init_deadline = None;
        self.last_error = Some(reason.into());
    }
}

/// Tracks the session state of every conversation the client has touched
pub struct SessionManager {
    init_timeout: Duration,
    sessions: HashMap<ConversationId, SessionEntry>,
}

impl SessionManager {
    pub fn new(init_timeout: Duration) -> Self {
        Self {
            init_timeout,
            sessions: HashMap::new(),
        }
    }

    pub fn state(&self, conversation_id: &ConversationId) -> SessionState {
        self.sessions
            .get(conversation_id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Uninitialized)
    }

    pub fn session_id(&self, conversation_id: &ConversationId) -> Option<&SessionId> {
        self.sessions
            .get(conversation_id)
            .and_then(|s| s.session_id.as_ref())
    }

    /// Accumulated usage of the conversation's turns
    pub fn usage(&self, conversation_id: &ConversationId) -> Usage {
        self.sessions
            .get(conversation_id)
            .map(|s| s.usage.clone())
            .unwrap_or_default()
    }

    /// The turn currently in flight on the conversation
    pub fn active_request(&self, conversation_id: &ConversationId) -> Option<&RequestId> {
        self.sessions
            .get(conversation_id)
            .and_then(|s| s.active_request.as_ref())
    }

    pub fn last_error(&self, conversation_id: &ConversationId) -> Option<&str> {
        self.sessions
            .get(conversation_id)
            .and_then(|s| s.last_error.as_deref())
    }

    /// Pass the send gate for a new turn.
    ///
    /// Returns the session id to resume, or `None` when this turn opens a
    /// new session. Nothing is mutated when the gate rejects.
    pub fn begin_turn(
        &mut self,
        conversation_id: &ConversationId,
        request_id: &RequestId,
        now: Instant,
    ) -> Result<Option<SessionId>, SessionError> {
        let entry = self.sessions.entry(conversation_id.clone()).or_default();

        if let Some(active) = &entry.active_request {
            return Err(SessionError::Busy {
                conversation_id: conversation_id.clone(),
                request_id: active.clone(),
            });
        }

        let resume = match entry.state {
            SessionState::Ready => entry.session_id.clone(),
            SessionState::Uninitialized => None,
            SessionState::Pending if entry.init_request.is_none() => None,
            SessionState::Pending => {
                return Err(SessionError::Pending(conversation_id.clone()));
            }
            SessionState::Error => {
                return Err(SessionError::Invalidated {
                    conversation_id: conversation_id.clone(),
                    reason: entry
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "session error".to_string()),
                });
            }
        };

        if entry.state != SessionState::Ready {
            tracing::info!("Opening session for conversation {}", conversation_id);
            entry.state = SessionState::Pending;
            entry.init_request = Some(request_id.clone());
            entry.init_deadline = Some(now + self.init_timeout);
        }
        entry.active_request = Some(request_id.clone());
        Ok(resume)
    }

    /// Undo `begin_turn` for a turn that never reached the wire
    pub fn rollback_turn(&mut self, conversation_id: &ConversationId, request_id: &RequestId) {
        let Some(entry) = self.sessions.get_mut(conversation_id) else {
            return;
        };
        if entry.active_request.as_ref() == Some(request_id) {
            entry.active_request = None;
        }
        if entry.init_request.as_ref() == Some(request_id) {
            entry.init_request = None;
            entry.init_deadline = None;
            if !entry.explicit_init {
                entry.state = SessionState::Uninitialized;
            }
        }
    }

    /// Release the gate after a turn reached a terminal state
    pub fn end_turn(&mut self, conversation_id: &ConversationId, request_id: &RequestId) {
        if let Some(entry) = self.sessions.get_mut(conversation_id) {
            if entry.active_request.as_ref() == Some(request_id) {
                entry.active_request = None;
            }
        }
    }

    /// Release the gate after an aborted turn.
    ///
    /// Aborting the turn that was opening a session also releases the pending
    /// gate, so the next send can open one. Returns whether the state changed.
    pub fn abort_turn(&mut self, conversation_id: &ConversationId, request_id: &RequestId) -> bool {
        let before = self.state(conversation_id);
        self.rollback_turn(conversation_id, request_id);
        self.state(conversation_id) != before
    }

    /// Record a session id reported by a turn that already finished.
    ///
    /// Only taken when no other turn is opening a session, so a stale id never
    /// overrides a live one.
    pub fn adopt_late_session(
        &mut self,
        conversation_id: &ConversationId,
        session_id: &SessionId,
    ) -> bool {
        let open = match self.sessions.get(conversation_id) {
            Some(entry) => match entry.state {
                SessionState::Uninitialized => true,
                SessionState::Pending => entry.init_request.is_none(),
                SessionState::Ready | SessionState::Error => false,
            },
            None => true,
        };
        open && self.on_session_assigned(conversation_id, session_id)
    }

    /// Release the gate after a failed turn.
    ///
    /// A failure while the session is still pending, or one whose text names
    /// a missing session, moves it to `Error`. Returns whether it did.
    pub fn fail_turn(
        &mut self,
        conversation_id: &ConversationId,
        request_id: &RequestId,
        message: &str,
    ) -> bool {
        self.end_turn(conversation_id, request_id);
        let Some(entry) = self.sessions.get_mut(conversation_id) else {
            return false;
        };
        let init_failed = entry.state == SessionState::Pending
            && entry.init_request.as_ref() == Some(request_id);
        if init_failed || is_session_invalid_error(message) {
            tracing::info!(
                "Session for conversation {} failed: {}",
                conversation_id,
                message
            );
            entry.fail(message);
            return true;
        }
        false
    }

    /// Record a server-assigned session id. Empty ids are ignored.
    ///
    /// Returns `true` when this moved the conversation to `Ready`.
    pub fn on_session_assigned(
        &mut self,
        conversation_id: &ConversationId,
        session_id: &SessionId,
    ) -> bool {
        if session_id.is_empty() {
            return false;
        }
        let entry = self.sessions.entry(conversation_id.clone()).or_default();
        match entry.state {
            SessionState::Pending | SessionState::Uninitialized => {
                tracing::info!(
                    "Session {} ready for conversation {}",
                    session_id,
                    conversation_id
                );
                entry.state = SessionState::Ready;
                entry.session_id = Some(session_id.clone());
                entry.explicit_init = false;
                entry.init_request = None;
                entry.init_deadline = None;
                entry.last_error = None;
                true
            }
            SessionState::Ready => {
                if entry.session_id.as_ref() != Some(session_id) {
                    tracing::debug!(
                        "Session for conversation {} changed to {}",
                        conversation_id,
                        session_id
                    );
                    entry.session_id = Some(session_id.clone());
                }
                false
            }
            SessionState::Error => {
                tracing::warn!(
                    "Ignoring late session {} for failed conversation {}",
                    session_id,
                    conversation_id
                );
                false
            }
        }
    }

    /// Move the conversation to `Error`. Returns `false` if already there.
    pub fn invalidate(&mut self, conversation_id: &ConversationId, reason: &str) -> bool {
        let entry = self.sessions.entry(conversation_id.clone()).or_default();
        if entry.state == SessionState::Error {
            return false;
        }
        tracing::info!(
            "Session for conversation {} invalidated: {}",
            conversation_id,
            reason
        );
        entry.fail(reason);
        true
    }

    /// Explicitly start over: the next send opens a fresh session
    pub fn initialize_session(&mut self, conversation_id: &ConversationId) -> Result<(), SessionError> {
        let entry = self.sessions.entry(conversation_id.clone()).or_default();
        if let Some(active) = &entry.active_request {
            return Err(SessionError::Busy {
                conversation_id: conversation_id.clone(),
                request_id: active.clone(),
            });
        }
        entry.state = SessionState::Pending;
        entry.session_id = None;
        entry.explicit_init = true;
        entry.init_request = None;
        entry.init_deadline = None;
        entry.last_error = None;
        Ok(())
    }

    /// Fail every initialization past its deadline.
    ///
    /// Returns the conversations and the turns that opened them.
    pub fn expire(&mut self, now: Instant) -> Vec<(ConversationId, RequestId)> {
        let mut expired = vec![];
        for (conversation_id, entry) in &mut self.sessions {
            let overdue = entry.state == SessionState::Pending
                && entry.init_deadline.is_some_and(|deadline| deadline <= now);
            if !overdue {
                continue;
            }
            tracing::warn!("Session init timed out for conversation {}", conversation_id);
            if let Some(request_id) = entry.init_request.clone() {
                expired.push((conversation_id.clone(), request_id));
            }
            entry.fail("session initialization timed out");
        }
        expired
    }

    pub fn record_usage(&mut self, conversation_id: &ConversationId, usage: &Usage) {
        self.sessions
            .entry(conversation_id.clone())
            .or_default()
            .usage
            .accumulate(usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(Duration::from_secs(60))
    }

    fn c1() -> ConversationId {
        "c1".into()
    }

    #[test]
    fn test_first_send_opens_session() {
        let mut sessions = manager();
        let now = Instant::now();
        assert_eq!(sessions.state(&c1()), SessionState::Uninitialized);

        let resume = sessions.begin_turn(&c1(), &"r1".into(), now).unwrap();
        assert_eq!(resume, None);
        assert_eq!(sessions.state(&c1()), SessionState::Pending);
        assert_eq!(sessions.active_request(&c1()), Some(&"r1".into()));

        assert!(sessions.on_session_assigned(&c1(), &"s1".into()));
        assert_eq!(sessions.state(&c1()), SessionState::Ready);
        assert_eq!(sessions.session_id(&c1()), Some(&"s1".into()));
    }

    #[test]
    fn test_gate_rejects_while_in_flight() {
        let mut sessions = manager();
        let now = Instant::now();
        sessions.begin_turn(&c1(), &"r1".into(), now).unwrap();

        let err = sessions.begin_turn(&c1(), &"r2".into(), now).unwrap_err();
        assert_eq!(
            err,
            SessionError::Busy {
                conversation_id: c1(),
                request_id: "r1".into()
            }
        );

        sessions.on_session_assigned(&c1(), &"s1".into());
        sessions.end_turn(&c1(), &"r1".into());
        let resume = sessions.begin_turn(&c1(), &"r2".into(), now).unwrap();
        assert_eq!(resume, Some("s1".into()));
    }

    #[test]
    fn test_pending_rejects_second_turn() {
        let mut sessions = manager();
        let now = Instant::now();
        sessions.begin_turn(&c1(), &"r1".into(), now).unwrap();
        // The first turn failed softly but the session id never arrived
        sessions.end_turn(&c1(), &"r1".into());
        assert_eq!(
            sessions.begin_turn(&c1(), &"r2".into(), now),
            Err(SessionError::Pending(c1()))
        );
    }

    #[test]
    fn test_empty_session_id_is_ignored() {
        let mut sessions = manager();
        sessions.begin_turn(&c1(), &"r1".into(), Instant::now()).unwrap();
        assert!(!sessions.on_session_assigned(&c1(), &"".into()));
        assert_eq!(sessions.state(&c1()), SessionState::Pending);
    }

    #[test]
    fn test_error_until_explicit_init() {
        let mut sessions = manager();
        let now = Instant::now();
        sessions.begin_turn(&c1(), &"r1".into(), now).unwrap();
        assert!(sessions.fail_turn(&c1(), &"r1".into(), "agent crashed"));
        assert_eq!(sessions.state(&c1()), SessionState::Error);

        let err = sessions.begin_turn(&c1(), &"r2".into(), now).unwrap_err();
        assert!(matches!(err, SessionError::Invalidated { ref reason, .. } if reason == "agent crashed"));

        // A late assignment does not resurrect the session
        assert!(!sessions.on_session_assigned(&c1(), &"s-late".into()));
        assert_eq!(sessions.state(&c1()), SessionState::Error);

        sessions.initialize_session(&c1()).unwrap();
        assert_eq!(sessions.state(&c1()), SessionState::Pending);
        assert_eq!(sessions.begin_turn(&c1(), &"r3".into(), now), Ok(None));
        assert_eq!(
            sessions.begin_turn(&c1(), &"r4".into(), now),
            Err(SessionError::Busy {
                conversation_id: c1(),
                request_id: "r3".into()
            })
        );
    }

    #[test]
    fn test_ready_session_survives_ordinary_failure() {
        let mut sessions = manager();
        let now = Instant::now();
        sessions.begin_turn(&c1(), &"r1".into(), now).unwrap();
        sessions.on_session_assigned(&c1(), &"s1".into());
        assert!(!sessions.fail_turn(&c1(), &"r1".into(), "tool exploded"));
        assert_eq!(sessions.state(&c1()), SessionState::Ready);
        assert_eq!(sessions.active_request(&c1()), None);
    }

    #[test]
    fn test_invalid_session_error_text() {
        let mut sessions = manager();
        let now = Instant::now();
        sessions.begin_turn(&c1(), &"r1".into(), now).unwrap();
        sessions.on_session_assigned(&c1(), &"s1".into());
        sessions.end_turn(&c1(), &"r1".into());

        sessions.begin_turn(&c1(), &"r2".into(), now).unwrap();
        assert!(sessions.fail_turn(
            &c1(),
            &"r2".into(),
            "No conversation found with session ID: s1"
        ));
        assert_eq!(sessions.state(&c1()), SessionState::Error);
        assert_eq!(sessions.session_id(&c1()), None);
    }

    #[test]
    fn test_is_session_invalid_error() {
        assert!(is_session_invalid_error("No conversation found with session ID abc"));
        assert!(is_session_invalid_error("Session not found"));
        assert!(is_session_invalid_error("invalid session"));
        assert!(!is_session_invalid_error("rate limit exceeded"));
        assert!(!is_session_invalid_error("tool call failed"));
    }

    #[test]
    fn test_aborting_the_opening_turn_releases_the_gate() {
        let mut sessions = manager();
        let now = Instant::now();
        sessions.begin_turn(&c1(), &"r1".into(), now).unwrap();
        assert!(sessions.abort_turn(&c1(), &"r1".into()));
        assert_eq!(sessions.state(&c1()), SessionState::Uninitialized);
        assert_eq!(sessions.active_request(&c1()), None);

        // The id the aborted turn opened still arrives
        assert!(sessions.adopt_late_session(&c1(), &"s1".into()));
        assert_eq!(sessions.state(&c1()), SessionState::Ready);
        assert_eq!(sessions.begin_turn(&c1(), &"r2".into(), now), Ok(Some("s1".into())));
    }

    #[test]
    fn test_late_session_never_overrides_an_opening_turn() {
        let mut sessions = manager();
        let now = Instant::now();
        sessions.begin_turn(&c1(), &"r1".into(), now).unwrap();
        sessions.abort_turn(&c1(), &"r1".into());
        sessions.begin_turn(&c1(), &"r2".into(), now).unwrap();

        assert!(!sessions.adopt_late_session(&c1(), &"s1".into()));
        assert_eq!(sessions.state(&c1()), SessionState::Pending);

        sessions.on_session_assigned(&c1(), &"s2".into());
        assert!(!sessions.adopt_late_session(&c1(), &"s1".into()));
        assert_eq!(sessions.session_id(&c1()), Some(&"s2".into()));
    }

    #[test]
    fn test_rollback_restores_prior_state() {
        let mut sessions = manager();
        let now = Instant::now();
        sessions.begin_turn(&c1(), &"r1".into(), now).unwrap();
        sessions.rollback_turn(&c1(), &"r1".into());
        assert_eq!(sessions.state(&c1()), SessionState::Uninitialized);
        assert_eq!(sessions.active_request(&c1()), None);

        sessions.initialize_session(&c1()).unwrap();
        sessions.begin_turn(&c1(), &"r2".into(), now).unwrap();
        sessions.rollback_turn(&c1(), &"r2".into());
        assert_eq!(sessions.state(&c1()), SessionState::Pending);
        assert_eq!(sessions.begin_turn(&c1(), &"r3".into(), now), Ok(None));
    }

    #[test]
    fn test_init_timeout() {
        let mut sessions = SessionManager::new(Duration::from_secs(60));
        let start = Instant::now();
        sessions.begin_turn(&c1(), &"r1".into(), start).unwrap();

        assert!(sessions.expire(start + Duration::from_secs(59)).is_empty());
        let expired = sessions.expire(start + Duration::from_secs(60));
        assert_eq!(expired, vec![(c1(), "r1".into())]);
        assert_eq!(sessions.state(&c1()), SessionState::Error);
        assert!(sessions.expire(start + Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn test_invalidate_and_usage() {
        let mut sessions = manager();
        assert!(sessions.invalidate(&c1(), "server said so"));
        assert!(!sessions.invalidate(&c1(), "again"));
        assert_eq!(sessions.last_error(&c1()), Some("server said so"));

        let usage = Usage {
            input: 10,
            output: 5,
            ..Default::default()
        };
        sessions.record_usage(&c1(), &usage);
        sessions.record_usage(&c1(), &usage);
        assert_eq!(sessions.usage(&c1()).total_tokens(), 30);
    }
}
