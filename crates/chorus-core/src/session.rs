//! Connection registry.
//!
//! Owns one [`Session`] per live connection together with its outbound queue.
//! Other components refer to sessions only by [`SessionId`].

use chorus_protocol::{SessionId, UserId};
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::HubError;
use crate::queue::{outbound_queue, PushOutcome, QueueReceiver, QueueSender, QueuedEvent};

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The client disconnected or logged out.
    ClientClosed,
    /// No inbound traffic within the heartbeat timeout.
    IdleTimeout,
    /// The outbound queue filled with undroppable events.
    QueueSaturated,
    /// The writer could not deliver to the connection.
    TransportFailed,
    /// The hub is shutting down.
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::QueueSaturated => "queue_saturated",
            CloseReason::TransportFailed => "transport_failed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// One live connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    user_id: UserId,
    queue: QueueSender,
    opened_at: Instant,
    last_activity: Instant,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// A session stays alive while its writer holds the queue receiver.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.queue.is_closed()
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.queue.is_degraded()
    }

    #[must_use]
    pub fn queue(&self) -> &QueueSender {
        &self.queue
    }
}

/// Registry of live sessions, indexed by id and by user.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_user: HashMap<UserId, HashSet<SessionId>>,
    next_id: u64,
    queue_capacity: usize,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create a registry with the given per-session queue capacity.
    #[must_use]
    pub fn new(queue_capacity: usize, max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            by_user: HashMap::new(),
            next_id: 1,
            queue_capacity,
            max_sessions,
        }
    }

    /// Create a session for an authenticated user.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::CapacityReached`] when the session limit is hit.
    pub fn open(
        &mut self,
        user_id: &str,
        now: Instant,
    ) -> Result<(SessionId, QueueReceiver), HubError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(HubError::CapacityReached);
        }

        let id = SessionId(self.next_id);
        self.next_id += 1;

        let (queue, receiver) = outbound_queue(self.queue_capacity);
        self.sessions.insert(
            id,
            Session {
                id,
                user_id: user_id.to_string(),
                queue,
                opened_at: now,
                last_activity: now,
            },
        );
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(id);

        debug!(session = %id, user = %user_id, "Session opened");
        Ok((id, receiver))
    }

    /// Remove a session and close its queue.
    ///
    /// Returns `None` if the session was already closed.
    pub fn close(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        session.queue.close();

        if let Some(ids) = self.by_user.get_mut(&session.user_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_user.remove(&session.user_id);
            }
        }

        debug!(session = %id, user = %session.user_id, "Session closed");
        Some(session)
    }

    /// Push an event onto a session's queue.
    ///
    /// Unknown sessions report [`PushOutcome::Closed`].
    pub fn enqueue(&self, id: SessionId, event: QueuedEvent) -> PushOutcome {
        match self.sessions.get(&id) {
            Some(session) => {
                let outcome = session.queue.push(event);
                trace!(session = %id, outcome = ?outcome, "Enqueued event");
                outcome
            }
            None => PushOutcome::Closed,
        }
    }

    /// Record inbound activity on a session.
    pub fn touch(&mut self, id: SessionId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_activity = now;
        }
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Owning user of a session.
    #[must_use]
    pub fn user_of(&self, id: SessionId) -> Option<&str> {
        self.sessions.get(&id).map(|s| s.user_id.as_str())
    }

    /// Live sessions of a user.
    pub fn sessions_of<'a>(&'a self, user_id: &str) -> impl Iterator<Item = SessionId> + 'a {
        self.by_user
            .get(user_id)
            .into_iter()
            .flat_map(|ids| ids.iter().copied())
    }

    /// Number of live sessions owned by a user.
    #[must_use]
    pub fn live_count(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, HashSet::len)
    }

    /// All session ids.
    pub fn ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of distinct connected users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    /// Number of sessions currently flagged degraded.
    #[must_use]
    pub fn degraded_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_degraded()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::{EventPayload, ServerEvent};
    use std::sync::Arc;

    fn pong() -> QueuedEvent {
        Arc::new(ServerEvent::new(EventPayload::Pong))
    }

    #[test]
    fn test_open_assigns_distinct_ids() {
        let mut registry = SessionRegistry::new(8, 10);
        let now = Instant::now();

        let (a, _rx_a) = registry.open("alice", now).unwrap();
        let (b, _rx_b) = registry.open("alice", now).unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.live_count("alice"), 2);
        assert_eq!(registry.user_count(), 1);
        assert_eq!(registry.user_of(a), Some("alice"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut registry = SessionRegistry::new(8, 10);
        let (id, _rx) = registry.open("alice", Instant::now()).unwrap();

        assert!(registry.close(id).is_some());
        assert!(registry.close(id).is_none());
        assert_eq!(registry.live_count("alice"), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let mut registry = SessionRegistry::new(8, 1);
        let now = Instant::now();
        let _first = registry.open("alice", now).unwrap();
        assert!(matches!(
            registry.open("bob", now),
            Err(HubError::CapacityReached)
        ));
    }

    #[test]
    fn test_enqueue_reaches_receiver() {
        let mut registry = SessionRegistry::new(8, 10);
        let (id, mut rx) = registry.open("alice", Instant::now()).unwrap();

        assert_eq!(registry.enqueue(id, pong()), PushOutcome::Queued);
        assert!(rx.try_recv().is_some());

        registry.close(id);
        assert_eq!(registry.enqueue(id, pong()), PushOutcome::Closed);
    }

    #[test]
    fn test_session_dies_with_receiver() {
        let mut registry = SessionRegistry::new(8, 10);
        let (id, rx) = registry.open("alice", Instant::now()).unwrap();
        assert!(registry.get(id).unwrap().is_alive());

        drop(rx);
        assert!(!registry.get(id).unwrap().is_alive());
    }
}
