//! Shared fixtures for Chorus benchmarks.

use chorus_core::{HubConfig, HubState, QueueReceiver};
use chorus_protocol::{ClientIntent, SessionId};
use tokio::time::Instant;

/// A hub state with every session subscribed to one channel.
pub struct Fixture {
    pub state: HubState,
    pub sessions: Vec<(SessionId, QueueReceiver)>,
}

impl Fixture {
    /// Open `members` sessions, one user each, all joined to `channel`.
    ///
    /// # Panics
    ///
    /// Panics if a session cannot be opened.
    #[must_use]
    pub fn channel(channel: &str, members: usize) -> Self {
        let mut state = HubState::new(HubConfig {
            max_sessions: members.max(1),
            queue_capacity: 1024,
            ..HubConfig::default()
        });
        let now = Instant::now();

        let mut sessions = Vec::with_capacity(members);
        for i in 0..members {
            let (id, receiver) = state
                .open(&format!("user-{i}"), now)
                .expect("session limit sized to members");
            state.handle(id, ClientIntent::join(channel), now);
            sessions.push((id, receiver));
        }

        let mut fixture = Self { state, sessions };
        fixture.drain();
        fixture
    }

    /// Session that originates traffic.
    #[must_use]
    pub fn sender(&self) -> SessionId {
        self.sessions[0].0
    }

    /// Empty every outbound queue, returning the number of events taken.
    pub fn drain(&mut self) -> usize {
        self.sessions
            .iter_mut()
            .map(|(_, receiver)| receiver.drain().len())
            .sum()
    }
}
