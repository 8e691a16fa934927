//! Bounded per-session outbound queue.
//!
//! The coordinator pushes without ever blocking. When the queue is full the
//! oldest droppable event is discarded so chat, call and signaling events keep
//! their relative order. A queue full of undroppable events reports
//! saturation and the session is closed.

use chorus_protocol::ServerEvent;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// An event shared between every queue it was fanned out to.
pub type QueuedEvent = Arc<ServerEvent>;

/// Result of pushing onto a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended without loss.
    Queued,
    /// Appended after discarding the oldest droppable event.
    DroppedOldest,
    /// Not appended: the queue is full of undroppable events and the new one is droppable.
    DroppedNew,
    /// The queue is full of undroppable events.
    Saturated,
    /// The receiving side is gone.
    Closed,
}

#[derive(Debug)]
struct QueueState {
    events: VecDeque<QueuedEvent>,
    closed: bool,
    degraded: bool,
    dropped: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a queue holding at most `capacity` events.
#[must_use]
pub fn outbound_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            events: VecDeque::with_capacity(capacity.min(1024)),
            closed: false,
            degraded: false,
            dropped: 0,
        }),
        notify: Notify::new(),
        capacity: capacity.max(1),
    });

    (
        QueueSender {
            shared: Arc::clone(&shared),
        },
        QueueReceiver { shared },
    )
}

/// Producer half, held by the session registry.
#[derive(Debug, Clone)]
pub struct QueueSender {
    shared: Arc<Shared>,
}

impl QueueSender {
    /// Push an event without blocking.
    pub fn push(&self, event: QueuedEvent) -> PushOutcome {
        let mut state = self.shared.lock();
        if state.closed {
            return PushOutcome::Closed;
        }

        let outcome = if state.events.len() < self.shared.capacity {
            state.events.push_back(event);
            PushOutcome::Queued
        } else if let Some(index) = state.events.iter().position(|e| e.is_droppable()) {
            state.events.remove(index);
            state.events.push_back(event);
            state.degraded = true;
            state.dropped += 1;
            PushOutcome::DroppedOldest
        } else if event.is_droppable() {
            // Nothing older may go, so the new indicator is the one discarded.
            state.degraded = true;
            state.dropped += 1;
            return PushOutcome::DroppedNew;
        } else {
            state.degraded = true;
            return PushOutcome::Saturated;
        };

        drop(state);
        self.shared.notify.notify_one();
        outcome
    }

    /// Close the queue; the receiver yields `None` from now on.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Whether events were dropped since the queue last drained empty.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.shared.lock().degraded
    }

    /// Mark the queue degraded, e.g. after a transient send failure.
    pub fn mark_degraded(&self) {
        self.shared.lock().degraded = true;
    }

    /// Total number of events dropped over the queue's lifetime.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Consumer half, drained by the session's writer task.
#[derive(Debug)]
pub struct QueueReceiver {
    shared: Arc<Shared>,
}

impl QueueReceiver {
    /// Wait for the next event.
    ///
    /// Returns `None` once the queue is closed; events still queued at that
    /// point are discarded.
    pub async fn recv(&mut self) -> Option<QueuedEvent> {
        loop {
            if let Some(next) = self.poll_next() {
                return next;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<QueuedEvent> {
        self.poll_next().flatten()
    }

    /// Take every queued event.
    pub fn drain(&mut self) -> Vec<QueuedEvent> {
        let mut state = self.shared.lock();
        state.degraded = false;
        state.events.drain(..).collect()
    }

    /// Handle for flagging the queue from the writer side.
    #[must_use]
    pub fn sender(&self) -> QueueSender {
        QueueSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// `Some(None)` when closed, `Some(Some(event))` when ready, `None` when empty.
    fn poll_next(&self) -> Option<Option<QueuedEvent>> {
        let mut state = self.shared.lock();
        if state.closed {
            return Some(None);
        }
        let event = state.events.pop_front()?;
        if state.events.is_empty() {
            state.degraded = false;
        }
        Some(Some(event))
    }
}

impl Drop for QueueReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.closed = true;
        state.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::events::{ChatMessage, EventPayload, Typing};

    fn typing(user: &str) -> QueuedEvent {
        Arc::new(ServerEvent::new(EventPayload::UserTyping(Typing {
            channel_id: "general".into(),
            user_id: user.into(),
        })))
    }

    fn chat(id: u64) -> QueuedEvent {
        Arc::new(ServerEvent::new(EventPayload::MessageSent(ChatMessage {
            message_id: id,
            channel_id: "general".into(),
            user_id: "alice".into(),
            content: format!("message {id}"),
            created_at: 0,
        })))
    }

    fn message_id(event: &ServerEvent) -> Option<u64> {
        match &event.payload {
            EventPayload::MessageSent(msg) => Some(msg.message_id),
            _ => None,
        }
    }

    #[test]
    fn test_push_and_receive_in_order() {
        let (tx, mut rx) = outbound_queue(8);
        for id in 0..5 {
            assert_eq!(tx.push(chat(id)), PushOutcome::Queued);
        }
        let ids: Vec<_> = rx.drain().iter().filter_map(|e| message_id(e)).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_typing_flood_keeps_chat_message() {
        let (tx, mut rx) = outbound_queue(16);
        assert_eq!(tx.push(chat(1)), PushOutcome::Queued);

        for i in 0..1_000 {
            let outcome = tx.push(typing(&format!("user-{i}")));
            assert_ne!(outcome, PushOutcome::Saturated);
        }

        assert!(tx.is_degraded());
        assert!(tx.dropped() > 0);
        assert_eq!(tx.len(), 16);

        let events = rx.drain();
        assert_eq!(message_id(&events[0]), Some(1));
        assert_eq!(events.iter().filter(|e| message_id(e).is_some()).count(), 1);
    }

    #[test]
    fn test_oldest_droppable_goes_first() {
        let (tx, mut rx) = outbound_queue(3);
        tx.push(typing("first"));
        tx.push(chat(1));
        tx.push(typing("second"));

        assert_eq!(tx.push(chat(2)), PushOutcome::DroppedOldest);

        let names: Vec<_> = rx
            .drain()
            .iter()
            .map(|e| match &e.payload {
                EventPayload::UserTyping(t) => t.user_id.clone(),
                EventPayload::MessageSent(m) => format!("chat-{}", m.message_id),
                _ => String::new(),
            })
            .collect();
        assert_eq!(names, vec!["chat-1", "second", "chat-2"]);
    }

    #[test]
    fn test_saturation_when_nothing_droppable() {
        let (tx, _rx) = outbound_queue(2);
        tx.push(chat(1));
        tx.push(chat(2));

        assert_eq!(tx.push(typing("late")), PushOutcome::DroppedNew);
        assert!(tx.is_degraded());
        assert_eq!(tx.push(chat(3)), PushOutcome::Saturated);
        assert_eq!(tx.len(), 2);
    }

    #[test]
    fn test_degraded_clears_after_drain() {
        let (tx, mut rx) = outbound_queue(1);
        tx.push(typing("a"));
        tx.push(typing("b"));
        assert!(tx.is_degraded());

        assert!(rx.try_recv().is_some());
        assert!(!tx.is_degraded());
    }

    #[test]
    fn test_dropped_receiver_closes_queue() {
        let (tx, rx) = outbound_queue(4);
        drop(rx);
        assert_eq!(tx.push(chat(1)), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push_and_close() {
        let (tx, mut rx) = outbound_queue(4);

        let producer = tx.clone();
        let handle = tokio::spawn(async move {
            producer.push(chat(9));
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(message_id(&event), Some(9));
        handle.await.unwrap();

        tx.close();
        assert!(rx.recv().await.is_none());
    }
}
