//! Fan-out of events to channel members.
//!
//! Every publish runs inside a coordinator step, so each member queue sees a
//! channel's events in acceptance order. Pushes never block: a session that
//! cannot take an event is reported back for closing instead.

use chorus_protocol::SessionId;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::membership::MembershipIndex;
use crate::queue::{PushOutcome, QueuedEvent};
use crate::session::{CloseReason, SessionRegistry};

/// Result of delivering one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Fanout {
    /// Queues the event was appended to.
    pub delivered: usize,
    /// Droppable events discarded to make room.
    pub dropped: usize,
    /// Sessions that must be closed.
    pub to_close: Vec<(SessionId, CloseReason)>,
}

impl Fanout {
    fn record(&mut self, session: SessionId, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Queued => self.delivered += 1,
            PushOutcome::DroppedOldest => {
                self.delivered += 1;
                self.dropped += 1;
            }
            PushOutcome::DroppedNew => self.dropped += 1,
            PushOutcome::Saturated => {
                warn!(session = %session, "Outbound queue saturated");
                self.to_close.push((session, CloseReason::QueueSaturated));
            }
            PushOutcome::Closed => {
                self.to_close.push((session, CloseReason::TransportFailed));
            }
        }
    }
}

/// Running totals across all deliveries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub saturated: u64,
}

/// Delivers events to channel members or single sessions.
#[derive(Debug, Default)]
pub struct BroadcastEngine {
    stats: BroadcastStats,
}

impl BroadcastEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to every member of a channel.
    ///
    /// The origin session is skipped for echo-suppressed events.
    pub fn publish(
        &mut self,
        membership: &MembershipIndex,
        registry: &SessionRegistry,
        channel: &str,
        event: QueuedEvent,
        origin: Option<SessionId>,
    ) -> Fanout {
        let skip = origin.filter(|_| event.payload.is_echo_suppressed());
        let mut fanout = Fanout::default();

        for session in membership.iter_members(channel) {
            if Some(session) == skip {
                continue;
            }
            fanout.record(session, registry.enqueue(session, Arc::clone(&event)));
        }

        trace!(
            channel = %channel,
            event = event.name(),
            recipients = fanout.delivered,
            "Published event"
        );
        self.stats.published += 1;
        self.account(&fanout);
        fanout
    }

    /// Deliver an event to a single session.
    pub fn deliver(
        &mut self,
        registry: &SessionRegistry,
        session: SessionId,
        event: QueuedEvent,
    ) -> Fanout {
        let mut fanout = Fanout::default();
        fanout.record(session, registry.enqueue(session, event));
        self.account(&fanout);
        fanout
    }

    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }

    fn account(&mut self, fanout: &Fanout) {
        self.stats.delivered += fanout.delivered as u64;
        self.stats.dropped += fanout.dropped as u64;
        self.stats.saturated += fanout
            .to_close
            .iter()
            .filter(|(_, reason)| *reason == CloseReason::QueueSaturated)
            .count() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueReceiver;
    use chorus_protocol::events::{ChatMessage, EventPayload, Typing};
    use chorus_protocol::ServerEvent;
    use tokio::time::Instant;

    const LIMIT: usize = 100;

    fn chat(id: u64) -> QueuedEvent {
        Arc::new(ServerEvent::new(EventPayload::MessageSent(ChatMessage {
            message_id: id,
            channel_id: "general".into(),
            user_id: "alice".into(),
            content: "hi".into(),
            created_at: 0,
        })))
    }

    fn ids(rx: &mut QueueReceiver) -> Vec<u64> {
        rx.drain()
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::MessageSent(m) => Some(m.message_id),
                _ => None,
            })
            .collect()
    }

    fn setup(
        queue_capacity: usize,
    ) -> (
        MembershipIndex,
        SessionRegistry,
        Vec<(SessionId, QueueReceiver)>,
    ) {
        let mut registry = SessionRegistry::new(queue_capacity, 100);
        let mut membership = MembershipIndex::new();
        let now = Instant::now();
        let mut sessions = Vec::new();
        for user in ["alice", "bob", "carol"] {
            let (id, rx) = registry.open(user, now).unwrap();
            membership.join(id, "general", LIMIT).unwrap();
            sessions.push((id, rx));
        }
        (membership, registry, sessions)
    }

    #[test]
    fn test_every_member_sees_publish_order() {
        let (membership, registry, mut sessions) = setup(64);
        let mut engine = BroadcastEngine::new();

        for id in 1..=20 {
            engine.publish(&membership, &registry, "general", chat(id), None);
        }

        let expected: Vec<u64> = (1..=20).collect();
        for (_, rx) in &mut sessions {
            assert_eq!(ids(rx), expected);
        }
        assert_eq!(engine.stats().published, 20);
        assert_eq!(engine.stats().delivered, 60);
    }

    #[test]
    fn test_echo_suppressed_skips_origin() {
        let (membership, registry, mut sessions) = setup(64);
        let mut engine = BroadcastEngine::new();
        let origin = sessions[0].0;

        let fanout = engine.publish(&membership, &registry, "general", chat(1), Some(origin));
        assert_eq!(fanout.delivered, 2);
        assert!(ids(&mut sessions[0].1).is_empty());
        assert_eq!(ids(&mut sessions[1].1), vec![1]);

        let ended = Arc::new(ServerEvent::new(EventPayload::CallEnded(
            chorus_protocol::events::CallEnded {
                call_id: "call_1".into(),
                channel_id: "general".into(),
            },
        )));
        let fanout = engine.publish(&membership, &registry, "general", ended, Some(origin));
        assert_eq!(fanout.delivered, 3);
    }

    #[test]
    fn test_saturated_member_is_reported_without_blocking_others() {
        let (membership, registry, mut sessions) = setup(2);
        let mut engine = BroadcastEngine::new();

        // Bob never drains.
        let bob = sessions[1].0;
        for id in 1..=2 {
            engine.publish(&membership, &registry, "general", chat(id), None);
            ids(&mut sessions[0].1);
            ids(&mut sessions[2].1);
        }

        let fanout = engine.publish(&membership, &registry, "general", chat(3), None);
        assert_eq!(fanout.delivered, 2);
        assert_eq!(fanout.to_close, vec![(bob, CloseReason::QueueSaturated)]);
        assert_eq!(ids(&mut sessions[0].1), vec![3]);
        assert_eq!(engine.stats().saturated, 1);
    }

    #[test]
    fn test_droppable_flood_counts_drops() {
        let (membership, registry, _sessions) = setup(4);
        let mut engine = BroadcastEngine::new();

        for _ in 0..10 {
            let typing = Arc::new(ServerEvent::new(EventPayload::UserTyping(Typing {
                channel_id: "general".into(),
                user_id: "dave".into(),
            })));
            let fanout = engine.publish(&membership, &registry, "general", typing, None);
            assert!(fanout.to_close.is_empty());
        }

        assert_eq!(engine.stats().dropped, 18);
    }

    #[test]
    fn test_discarded_indicator_is_not_counted_as_delivered() {
        let (membership, registry, _sessions) = setup(2);
        let mut engine = BroadcastEngine::new();
        for id in 1..=2 {
            engine.publish(&membership, &registry, "general", chat(id), None);
        }

        let typing = Arc::new(ServerEvent::new(EventPayload::UserTyping(Typing {
            channel_id: "general".into(),
            user_id: "dave".into(),
        })));
        let fanout = engine.publish(&membership, &registry, "general", typing, None);
        assert_eq!(fanout.delivered, 0);
        assert_eq!(fanout.dropped, 3);
        assert!(fanout.to_close.is_empty());
        assert_eq!(engine.stats().delivered, 6);
        assert_eq!(engine.stats().dropped, 3);
    }
}
