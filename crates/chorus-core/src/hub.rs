//! Hub coordinator.
//!
//! All state changes go through one task draining a bounded command intake.
//! Each command is applied to [`HubState`] as a single step, after which a
//! read-only [`HubSnapshot`] is published for concurrent readers.

use arc_swap::ArcSwap;
use chorus_protocol::events::{
    ChannelJoined, ChannelLeft, ChatMessage, Connected, MemberPresence,
    PresenceChanged, Typing,
};
use chorus_protocol::intents::{CallRef, ChannelRef, IceSignal, SdpSignal};
use chorus_protocol::{
    now_millis, CallState, ChannelId, ClientIntent, EventPayload, IntentKind, MessageId,
    PresenceStatus, ServerEvent, SessionId, UserId, PROTOCOL_VERSION,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::broadcast::BroadcastEngine;
use crate::call::{CallJoin, CallLeave, CallRelay, SignalKind, SignalPayload, SignalingEnvelope};
use crate::directory::{MembershipAuthority, MessageRecord, MessageStore};
use crate::error::HubError;
use crate::membership::{JoinOutcome, MembershipIndex};
use crate::presence::{PresenceChange, PresenceTracker};
use crate::queue::QueueReceiver;
use crate::session::{CloseReason, SessionRegistry};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound queue capacity per session.
    pub queue_capacity: usize,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// Maximum joined channels per session.
    pub max_channels_per_session: usize,
    /// Maximum chat message length in bytes.
    pub max_content_length: usize,
    /// Lifetime of a typing indicator without renewal.
    pub typing_window: Duration,
    /// Interval between presence sweeps.
    pub sweep_interval: Duration,
    /// Idle time before a user is marked away.
    pub away_after: Option<Duration>,
    /// Heartbeat interval announced to clients.
    pub heartbeat_interval: Duration,
    /// Number of ended call ids remembered.
    pub ended_call_retention: usize,
    /// Command intake capacity.
    pub intake_capacity: usize,
    /// Persistence hand-off capacity.
    pub persist_capacity: usize,
    /// Fact stream capacity.
    pub fact_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_sessions: 100_000,
            max_channels_per_session: 100,
            max_content_length: 4_000,
            typing_window: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            away_after: None,
            heartbeat_interval: Duration::from_secs(30),
            ended_call_retention: 1_024,
            intake_capacity: 4_096,
            persist_capacity: 1_024,
            fact_capacity: 1_024,
        }
    }
}

/// Session and presence facts published to external collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubFact {
    SessionOpened {
        session: SessionId,
        user_id: UserId,
    },
    SessionClosed {
        session: SessionId,
        user_id: UserId,
        reason: CloseReason,
    },
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
        last_active_at: u64,
    },
}

/// A unit of work for the coordinator.
pub enum Command {
    Open {
        user_id: UserId,
        reply: oneshot::Sender<Result<(SessionId, QueueReceiver), HubError>>,
    },
    Close {
        session: SessionId,
        reason: CloseReason,
    },
    Intent {
        session: SessionId,
        intent: ClientIntent,
    },
    /// An intent refused before reaching the coordinator, or a frame that
    /// never decoded into one.
    Reject {
        session: SessionId,
        kind: Option<IntentKind>,
        error: HubError,
    },
    Sweep,
    Evict {
        user_id: UserId,
        channel_id: ChannelId,
    },
    ApplyMembership {
        channel_id: ChannelId,
        users: HashSet<UserId>,
    },
    Inject {
        channel_id: ChannelId,
        payload: EventPayload,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Open { user_id, .. } => write!(f, "Open({user_id})"),
            Command::Close { session, reason } => write!(f, "Close({session}, {reason:?})"),
            Command::Intent { session, intent } => {
                write!(f, "Intent({session}, {})", intent.kind().as_str())
            }
            Command::Reject { session, kind, .. } => {
                let kind = kind.map_or("frame", IntentKind::as_str);
                write!(f, "Reject({session}, {kind})")
            }
            Command::Sweep => write!(f, "Sweep"),
            Command::Evict { user_id, channel_id } => write!(f, "Evict({user_id}, {channel_id})"),
            Command::ApplyMembership { channel_id, users } => {
                write!(f, "ApplyMembership({channel_id}, {} users)", users.len())
            }
            Command::Inject {
                channel_id,
                payload,
            } => write!(f, "Inject({channel_id}, {})", payload.name()),
            Command::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

/// Hub-wide counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub sessions: usize,
    pub users: usize,
    pub channels: usize,
    pub memberships: usize,
    pub calls: usize,
    pub degraded_sessions: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub saturation_closes: u64,
    pub messages: u64,
    pub persist_dropped: u64,
}

/// Read-only view of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub call_id: String,
    pub channel_id: ChannelId,
    pub state: CallState,
    pub participants: Vec<UserId>,
}

/// State as of the last completed coordinator step.
#[derive(Debug, Default, Clone)]
pub struct HubSnapshot {
    pub channels: HashMap<ChannelId, Vec<SessionId>>,
    pub sessions: HashMap<SessionId, UserId>,
    pub presence: HashMap<UserId, PresenceStatus>,
    pub calls: Vec<CallSummary>,
    pub stats: HubStats,
}

impl HubSnapshot {
    /// Sessions subscribed to a channel.
    #[must_use]
    pub fn members_of(&self, channel_id: &str) -> Vec<SessionId> {
        self.channels.get(channel_id).cloned().unwrap_or_default()
    }

    /// Distinct users present in a channel, with their status.
    #[must_use]
    pub fn channel_users(&self, channel_id: &str) -> Vec<MemberPresence> {
        let users: BTreeSet<&UserId> = self
            .members_of(channel_id)
            .iter()
            .filter_map(|session| self.sessions.get(session))
            .collect();

        users
            .into_iter()
            .map(|user_id| MemberPresence {
                user_id: user_id.clone(),
                status: self.status(user_id),
            })
            .collect()
    }

    #[must_use]
    pub fn status(&self, user_id: &str) -> PresenceStatus {
        self.presence
            .get(user_id)
            .copied()
            .unwrap_or(PresenceStatus::Offline)
    }
}

/// The coordinator's state. Mutated one command at a time.
pub struct HubState {
    config: HubConfig,
    registry: SessionRegistry,
    membership: MembershipIndex,
    presence: PresenceTracker,
    calls: CallRelay,
    engine: BroadcastEngine,
    pending_closes: Vec<(SessionId, CloseReason)>,
    facts: broadcast::Sender<HubFact>,
    persist: Option<mpsc::Sender<MessageRecord>>,
    next_message_id: MessageId,
    messages: u64,
    persist_dropped: u64,
}

impl HubState {
    /// Create an empty hub state.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let (facts, _) = broadcast::channel(config.fact_capacity.max(1));
        Self {
            registry: SessionRegistry::new(config.queue_capacity, config.max_sessions),
            membership: MembershipIndex::new(),
            presence: PresenceTracker::new(config.typing_window, config.away_after),
            calls: CallRelay::new(config.ended_call_retention),
            engine: BroadcastEngine::new(),
            pending_closes: Vec::new(),
            facts,
            persist: None,
            // Unique across restarts while under 4096 messages per millisecond.
            next_message_id: now_millis() << 12,
            messages: 0,
            persist_dropped: 0,
            config,
        }
    }

    /// Hand accepted messages to a persister.
    #[must_use]
    pub fn with_persistence(mut self, persist: mpsc::Sender<MessageRecord>) -> Self {
        self.persist = Some(persist);
        self
    }

    /// Subscribe to the fact stream.
    pub fn subscribe_facts(&self) -> broadcast::Receiver<HubFact> {
        self.facts.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub fn membership(&self) -> &MembershipIndex {
        &self.membership
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    #[must_use]
    pub fn calls(&self) -> &CallRelay {
        &self.calls
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Apply one command.
    ///
    /// Returns `false` once the hub has shut down.
    pub fn apply(&mut self, command: Command, now: Instant) -> bool {
        trace!(command = ?command, "Applying command");
        match command {
            Command::Open { user_id, reply } => {
                let result = self.open(&user_id, now);
                if let Err(Ok((session, _))) = reply.send(result) {
                    debug!(session = %session, "Opener went away");
                    self.close(session, CloseReason::ClientClosed);
                }
            }
            Command::Close { session, reason } => self.close(session, reason),
            Command::Intent { session, intent } => self.handle(session, intent, now),
            Command::Reject {
                session,
                kind,
                error,
            } => self.reject(session, kind, &error),
            Command::Sweep => self.sweep(now),
            Command::Evict {
                user_id,
                channel_id,
            } => self.evict(&user_id, &channel_id),
            Command::ApplyMembership { channel_id, users } => {
                self.apply_membership(&channel_id, &users);
            }
            Command::Inject {
                channel_id,
                payload,
            } => self.inject(&channel_id, payload),
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    /// Open a session for an authenticated user.
    ///
    /// # Errors
    ///
    /// Returns `CapacityReached` when the session limit is hit.
    pub fn open(
        &mut self,
        user_id: &str,
        now: Instant,
    ) -> Result<(SessionId, QueueReceiver), HubError> {
        let (session, receiver) = self.registry.open(user_id, now)?;

        self.deliver(
            session,
            EventPayload::Connected(Connected {
                session_id: session,
                user_id: user_id.to_string(),
                protocol_version: PROTOCOL_VERSION,
                heartbeat_ms: self.config.heartbeat_interval.as_millis() as u64,
            }),
        );
        let _ = self.facts.send(HubFact::SessionOpened {
            session,
            user_id: user_id.to_string(),
        });

        if let Some(change) = self.presence.session_opened(user_id, now) {
            self.publish_presence(change);
        }

        info!(session = %session, user = %user_id, "Session opened");
        self.settle();
        Ok((session, receiver))
    }

    /// Close a session and release it from every channel and call.
    ///
    /// Closing an unknown session is a no-op.
    pub fn close(&mut self, session: SessionId, reason: CloseReason) {
        self.pending_closes.push((session, reason));
        self.settle();
    }

    /// Handle a client intent.
    pub fn handle(&mut self, session: SessionId, intent: ClientIntent, now: Instant) {
        let kind = intent.kind();
        if let Err(error) = self.dispatch(session, intent, now) {
            self.reject(session, Some(kind), &error);
        }
        self.settle();
    }

    /// Answer a failed intent with an `error` event.
    pub fn reject(&mut self, session: SessionId, kind: Option<IntentKind>, error: &HubError) {
        if !self.registry.contains(session) {
            return;
        }
        debug!(
            session = %session,
            intent = kind.map_or("frame", IntentKind::as_str),
            error = %error,
            "Intent rejected"
        );
        self.deliver(session, EventPayload::Error(error.to_reply(kind)));
        self.settle();
    }

    /// Expire typing indicators and idle users.
    pub fn sweep(&mut self, now: Instant) {
        for change in self.presence.sweep(now) {
            self.publish_presence(change);
        }
        self.settle();
    }

    /// Remove every session of a user from a channel.
    pub fn evict(&mut self, user_id: &str, channel_id: &str) {
        let mut sessions: Vec<_> = self
            .registry
            .sessions_of(user_id)
            .filter(|session| self.membership.is_member(*session, channel_id))
            .collect();
        sessions.sort();

        for session in sessions {
            info!(session = %session, user = %user_id, channel = %channel_id, "Evicting from channel");
            self.leave_channel(session, user_id, channel_id);
        }
        self.settle();
    }

    /// Reconcile a channel with an authoritative member list.
    pub fn apply_membership(&mut self, channel_id: &str, users: &HashSet<UserId>) {
        let mut sessions: Vec<_> = self.membership.iter_members(channel_id).collect();
        sessions.sort();

        for session in sessions {
            let Some(user_id) = self.registry.user_of(session).map(str::to_string) else {
                continue;
            };
            if !users.contains(&user_id) {
                info!(session = %session, user = %user_id, channel = %channel_id, "Membership revoked");
                self.leave_channel(session, &user_id, channel_id);
            }
        }
        self.settle();
    }

    /// Publish a collaborator event, such as an edit or deletion, to a channel.
    pub fn inject(&mut self, channel_id: &str, payload: EventPayload) {
        debug!(channel = %channel_id, event = payload.name(), "Injecting event");
        self.publish(channel_id, payload, None);
        self.settle();
    }

    /// Close every session.
    pub fn shutdown(&mut self) {
        let mut sessions: Vec<_> = self.registry.ids().collect();
        sessions.sort();
        info!(sessions = sessions.len(), "Hub shutting down");
        self.pending_closes
            .extend(sessions.into_iter().map(|s| (s, CloseReason::Shutdown)));
        self.settle();
    }

    /// Build a read-only snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> HubSnapshot {
        let channels = self
            .membership
            .channels()
            .iter()
            .map(|(channel, members)| {
                let mut members: Vec<_> = members.iter().copied().collect();
                members.sort();
                (channel.clone(), members)
            })
            .collect();

        let sessions = self
            .registry
            .ids()
            .filter_map(|id| Some((id, self.registry.user_of(id)?.to_string())))
            .collect();

        let mut calls: Vec<_> = self
            .calls
            .calls()
            .map(|call| CallSummary {
                call_id: call.id().to_string(),
                channel_id: call.channel_id().to_string(),
                state: call.state(),
                participants: call.participants(),
            })
            .collect();
        calls.sort_by(|a, b| a.call_id.cmp(&b.call_id));

        HubSnapshot {
            channels,
            sessions,
            presence: self.presence.statuses(),
            calls,
            stats: self.stats(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        let engine = self.engine.stats();
        HubStats {
            sessions: self.registry.len(),
            users: self.registry.user_count(),
            channels: self.membership.channel_count(),
            memberships: self.membership.total_memberships(),
            calls: self.calls.len(),
            degraded_sessions: self.registry.degraded_count(),
            published: engine.published,
            delivered: engine.delivered,
            dropped: engine.dropped,
            saturation_closes: engine.saturated,
            messages: self.messages,
            persist_dropped: self.persist_dropped,
        }
    }

    fn dispatch(
        &mut self,
        session: SessionId,
        intent: ClientIntent,
        now: Instant,
    ) -> Result<(), HubError> {
        let user_id = self
            .registry
            .user_of(session)
            .ok_or(HubError::SessionNotFound)?
            .to_string();

        self.registry.touch(session, now);
        if let Some(change) = self.presence.touch(&user_id, now) {
            self.publish_presence(change);
        }

        match intent {
            ClientIntent::JoinChannel(ChannelRef { channel_id }) => {
                self.join_channel(session, &user_id, &channel_id)
            }
            ClientIntent::LeaveChannel(ChannelRef { channel_id }) => {
                self.leave_channel(session, &user_id, &channel_id);
                Ok(())
            }
            ClientIntent::SendMessage(message) => {
                self.send_message(session, &user_id, message.channel_id, message.content)
            }
            ClientIntent::Typing(ChannelRef { channel_id }) => {
                self.typing(session, &user_id, &channel_id, now)
            }
            ClientIntent::StartCall(start) => {
                if !self.membership.is_member(session, &start.channel_id) {
                    return Err(HubError::ChannelNotFound(start.channel_id));
                }
                let started =
                    self.calls
                        .start_call(&start.channel_id, &user_id, session, &start.title);
                self.publish(&start.channel_id, EventPayload::CallStarted(started), None);
                Ok(())
            }
            ClientIntent::JoinCall(CallRef { call_id }) => {
                self.join_call(session, &user_id, &call_id)
            }
            ClientIntent::LeaveCall(CallRef { call_id }) => {
                let leave = self.calls.leave_call(&call_id, session)?;
                self.publish_call_leave(leave);
                Ok(())
            }
            ClientIntent::EndCall(CallRef { call_id }) => {
                let ended = self.calls.end_call(&call_id, session)?;
                let channel_id = ended.channel_id.clone();
                self.publish(&channel_id, EventPayload::CallEnded(ended), None);
                Ok(())
            }
            ClientIntent::WebrtcOffer(signal) => {
                self.relay_sdp(session, &user_id, SignalKind::Offer, signal)
            }
            ClientIntent::WebrtcAnswer(signal) => {
                self.relay_sdp(session, &user_id, SignalKind::Answer, signal)
            }
            ClientIntent::WebrtcIceCandidate(IceSignal {
                call_id,
                to_user_id,
                candidate,
            }) => self.relay(SignalingEnvelope {
                call_id,
                from_user: user_id,
                from_session: session,
                to_user: to_user_id,
                kind: SignalKind::IceCandidate,
                payload: SignalPayload::Candidate(candidate),
            }),
            ClientIntent::SetStatus(update) => {
                if let Some(change) = self.presence.set_status(&user_id, update.status, now)? {
                    self.publish_presence(change);
                }
                Ok(())
            }
            ClientIntent::Ping => {
                self.deliver(session, EventPayload::Pong);
                Ok(())
            }
        }
    }

    fn join_channel(
        &mut self,
        session: SessionId,
        user_id: &str,
        channel_id: &str,
    ) -> Result<(), HubError> {
        let first_for_user = !self.user_in_channel(user_id, channel_id);
        let outcome =
            self.membership
                .join(session, channel_id, self.config.max_channels_per_session)?;

        let members = self.channel_users(channel_id);
        self.deliver(
            session,
            EventPayload::ChannelJoined(ChannelJoined {
                channel_id: channel_id.to_string(),
                members,
            }),
        );

        if outcome == JoinOutcome::Joined && first_for_user {
            let change = PresenceChanged {
                user_id: user_id.to_string(),
                status: self.presence.status(user_id),
                last_active_at: now_millis(),
            };
            self.publish(channel_id, EventPayload::PresenceChanged(change), None);
        }
        Ok(())
    }

    /// Leave a channel, its calls, and the user's typing indicator there.
    fn leave_channel(&mut self, session: SessionId, user_id: &str, channel_id: &str) {
        if !self.membership.is_member(session, channel_id) {
            return;
        }

        for leave in self.calls.leave_channel(session, channel_id) {
            self.publish_call_leave(leave);
        }
        self.membership.leave(session, channel_id);

        if !self.user_in_channel(user_id, channel_id) {
            if let Some(stopped) = self.presence.clear_typing(user_id, channel_id) {
                self.publish_presence(stopped);
            }
        }

        self.deliver(
            session,
            EventPayload::ChannelLeft(ChannelLeft {
                channel_id: channel_id.to_string(),
            }),
        );
    }

    fn send_message(
        &mut self,
        session: SessionId,
        user_id: &str,
        channel_id: ChannelId,
        content: String,
    ) -> Result<(), HubError> {
        if !self.membership.is_member(session, &channel_id) {
            return Err(HubError::NotAMember(channel_id));
        }
        if content.trim().is_empty() {
            return Err(HubError::InvalidMessage("message content cannot be empty"));
        }
        if content.len() > self.config.max_content_length {
            return Err(HubError::InvalidMessage("message content too long"));
        }

        if let Some(stopped) = self.presence.clear_typing(user_id, &channel_id) {
            self.publish_presence(stopped);
        }

        self.next_message_id += 1;
        let message = ChatMessage {
            message_id: self.next_message_id,
            channel_id,
            user_id: user_id.to_string(),
            content,
            created_at: now_millis(),
        };
        let record = MessageRecord::from(&message);
        let channel_id = message.channel_id.clone();

        self.publish(&channel_id, EventPayload::MessageSent(message), Some(session));
        self.messages += 1;
        self.persist(record);
        Ok(())
    }

    fn typing(
        &mut self,
        session: SessionId,
        user_id: &str,
        channel_id: &str,
        now: Instant,
    ) -> Result<(), HubError> {
        if !self.membership.is_member(session, channel_id) {
            return Err(HubError::NotAMember(channel_id.to_string()));
        }
        if self.presence.mark_typing(user_id, channel_id, now).is_some() {
            let typing = Typing {
                channel_id: channel_id.to_string(),
                user_id: user_id.to_string(),
            };
            self.publish(channel_id, EventPayload::UserTyping(typing), Some(session));
        }
        Ok(())
    }

    fn join_call(&mut self, session: SessionId, user_id: &str, call_id: &str) -> Result<(), HubError> {
        let channel_id = self.calls.live_call(call_id)?.channel_id().to_string();
        if !self.membership.is_member(session, &channel_id) {
            return Err(HubError::NotAMember(channel_id));
        }

        let CallJoin {
            joined, replaced, ..
        } = self.calls.join_call(call_id, user_id, session)?;

        if let Some(previous) = replaced {
            debug!(call = %call_id, session = %previous, "Call session replaced");
            self.deliver(previous, EventPayload::UserLeftCall(joined.clone()));
        }
        self.publish(&channel_id, EventPayload::UserJoinedCall(joined), None);
        Ok(())
    }

    fn relay_sdp(
        &mut self,
        session: SessionId,
        user_id: &str,
        kind: SignalKind,
        signal: SdpSignal,
    ) -> Result<(), HubError> {
        self.relay(SignalingEnvelope {
            call_id: signal.call_id,
            from_user: user_id.to_string(),
            from_session: session,
            to_user: signal.to_user_id,
            kind,
            payload: SignalPayload::Sdp(signal.sdp),
        })
    }

    fn relay(&mut self, envelope: SignalingEnvelope) -> Result<(), HubError> {
        if let Some((recipient, payload)) = self.calls.relay(envelope)? {
            self.deliver(recipient, payload);
        }
        Ok(())
    }

    fn publish_call_leave(&mut self, leave: CallLeave) {
        let channel_id = leave.left.channel_id.clone();
        self.publish(&channel_id, EventPayload::UserLeftCall(leave.left), None);
        if let Some(ended) = leave.ended {
            self.publish(&channel_id, EventPayload::CallEnded(ended), None);
        }
    }

    fn close_session(&mut self, session: SessionId, reason: CloseReason) {
        let Some(closed) = self.registry.close(session) else {
            return;
        };
        let user_id = closed.user_id().to_string();

        let call_leaves = self.calls.remove_session(session);
        let mut channels: Vec<_> = self.membership.remove_session(session).into_iter().collect();
        channels.sort();

        for leave in call_leaves {
            self.publish_call_leave(leave);
        }

        if self.registry.live_count(&user_id) > 0 {
            for channel_id in &channels {
                if !self.user_in_channel(&user_id, channel_id) {
                    if let Some(stopped) = self.presence.clear_typing(&user_id, channel_id) {
                        self.publish_presence(stopped);
                    }
                }
            }
        }

        for change in self.presence.session_closed(&user_id) {
            match change {
                PresenceChange::Status {
                    user_id,
                    status,
                    last_active_at,
                } => self.publish_status(user_id, status, last_active_at, &channels),
                other => self.publish_presence(other),
            }
        }

        let _ = self.facts.send(HubFact::SessionClosed {
            session,
            user_id: user_id.clone(),
            reason,
        });
        info!(session = %session, user = %user_id, reason = reason.as_str(), "Session closed");
    }

    /// Drain forced closes, including those triggered by earlier closes.
    fn settle(&mut self) {
        while !self.pending_closes.is_empty() {
            for (session, reason) in std::mem::take(&mut self.pending_closes) {
                self.close_session(session, reason);
            }
        }

        #[cfg(debug_assertions)]
        self.assert_invariants();
    }

    fn publish(&mut self, channel_id: &str, payload: EventPayload, origin: Option<SessionId>) {
        let event = Arc::new(ServerEvent::new(payload));
        let fanout =
            self.engine
                .publish(&self.membership, &self.registry, channel_id, event, origin);
        self.pending_closes.extend(fanout.to_close);
    }

    fn deliver(&mut self, session: SessionId, payload: EventPayload) {
        let event = Arc::new(ServerEvent::new(payload));
        let fanout = self.engine.deliver(&self.registry, session, event);
        self.pending_closes.extend(fanout.to_close);
    }

    /// Broadcast a presence change to the channels the user is in.
    fn publish_presence(&mut self, change: PresenceChange) {
        let (channel_id, payload) = match change {
            PresenceChange::Status {
                user_id,
                status,
                last_active_at,
            } => {
                let channels = self.user_channels(&user_id);
                self.publish_status(user_id, status, last_active_at, &channels);
                return;
            }
            PresenceChange::TypingStarted {
                user_id,
                channel_id,
            } => (
                channel_id.clone(),
                EventPayload::UserTyping(Typing {
                    channel_id,
                    user_id,
                }),
            ),
            PresenceChange::TypingStopped {
                user_id,
                channel_id,
            } => (
                channel_id.clone(),
                EventPayload::TypingStopped(Typing {
                    channel_id,
                    user_id,
                }),
            ),
        };
        self.publish(&channel_id, payload, None);
    }

    /// Deliver a status change once to every session sharing one of `channels`.
    fn publish_status(
        &mut self,
        user_id: UserId,
        status: PresenceStatus,
        last_active_at: u64,
        channels: &[ChannelId],
    ) {
        let _ = self.facts.send(HubFact::PresenceChanged {
            user_id: user_id.clone(),
            status,
            last_active_at,
        });

        let recipients: BTreeSet<SessionId> = channels
            .iter()
            .flat_map(|channel| self.membership.iter_members(channel))
            .collect();
        if recipients.is_empty() {
            return;
        }

        let event = Arc::new(ServerEvent::new(EventPayload::PresenceChanged(
            PresenceChanged {
                user_id,
                status,
                last_active_at,
            },
        )));
        for session in recipients {
            let fanout = self
                .engine
                .deliver(&self.registry, session, Arc::clone(&event));
            self.pending_closes.extend(fanout.to_close);
        }
    }

    fn persist(&mut self, record: MessageRecord) {
        let Some(persist) = &self.persist else {
            return;
        };
        if let Err(err) = persist.try_send(record) {
            self.persist_dropped += 1;
            warn!(error = %err, "Persistence backlog full, message not persisted");
        }
    }

    fn user_in_channel(&self, user_id: &str, channel_id: &str) -> bool {
        self.registry
            .sessions_of(user_id)
            .any(|session| self.membership.is_member(session, channel_id))
    }

    /// Union of the channels joined by any of the user's sessions, sorted.
    fn user_channels(&self, user_id: &str) -> Vec<ChannelId> {
        let channels: BTreeSet<ChannelId> = self
            .registry
            .sessions_of(user_id)
            .flat_map(|session| self.membership.channels_of(session))
            .collect();
        channels.into_iter().collect()
    }

    fn channel_users(&self, channel_id: &str) -> Vec<MemberPresence> {
        let users: BTreeSet<&str> = self
            .membership
            .iter_members(channel_id)
            .filter_map(|session| self.registry.user_of(session))
            .collect();

        users
            .into_iter()
            .map(|user_id| MemberPresence {
                user_id: user_id.to_string(),
                status: self.presence.status(user_id),
            })
            .collect()
    }

    #[cfg(debug_assertions)]
    fn assert_invariants(&self) {
        self.membership.assert_consistent();

        for session in self.membership.channels().values().flatten() {
            assert!(
                self.registry.contains(*session),
                "closed session {session} still holds memberships"
            );
        }
        for call in self.calls.calls() {
            for user_id in call.participants() {
                let session = call.session_of(&user_id);
                assert!(
                    session.is_some_and(|s| self.registry.contains(s)),
                    "call {} references a closed session",
                    call.id()
                );
            }
        }
        for session in self.registry.ids() {
            if let Some(user_id) = self.registry.user_of(session) {
                assert_eq!(
                    self.presence.live_sessions(user_id),
                    self.registry.live_count(user_id),
                    "presence out of sync for {user_id}"
                );
            }
        }
    }
}

/// Entry point for spawning the coordinator.
pub struct Hub;

impl Hub {
    /// Spawn the coordinator, its sweep ticker and its persister.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        config: HubConfig,
        authority: Arc<dyn MembershipAuthority>,
        store: Arc<dyn MessageStore>,
    ) -> HubHandle {
        let (intake, commands) = mpsc::channel(config.intake_capacity.max(1));
        let (persist, records) = mpsc::channel(config.persist_capacity.max(1));

        let state = HubState::new(config.clone()).with_persistence(persist);
        let facts = state.facts.clone();
        let snapshot = Arc::new(ArcSwap::from_pointee(state.snapshot()));

        tokio::spawn(run_coordinator(state, commands, Arc::clone(&snapshot)));
        tokio::spawn(run_sweeper(intake.downgrade(), config.sweep_interval));
        tokio::spawn(run_persister(records, store));

        info!(
            queue_capacity = config.queue_capacity,
            max_sessions = config.max_sessions,
            "Hub started"
        );
        HubHandle {
            intake,
            snapshot,
            facts,
            authority,
        }
    }
}

async fn run_coordinator(
    mut state: HubState,
    mut commands: mpsc::Receiver<Command>,
    snapshot: Arc<ArcSwap<HubSnapshot>>,
) {
    while let Some(command) = commands.recv().await {
        let running = state.apply(command, Instant::now());
        snapshot.store(Arc::new(state.snapshot()));
        if !running {
            break;
        }
    }
    debug!("Coordinator stopped");
}

async fn run_sweeper(intake: mpsc::WeakSender<Command>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(intake) = intake.upgrade() else {
            break;
        };
        if intake.send(Command::Sweep).await.is_err() {
            break;
        }
    }
    debug!("Sweeper stopped");
}

async fn run_persister(mut records: mpsc::Receiver<MessageRecord>, store: Arc<dyn MessageStore>) {
    while let Some(record) = records.recv().await {
        let message_id = record.message_id;
        if let Err(err) = store.append(record).await {
            warn!(message = message_id, error = %err, "Failed to persist message");
        }
    }
    debug!("Persister stopped");
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    intake: mpsc::Sender<Command>,
    snapshot: Arc<ArcSwap<HubSnapshot>>,
    facts: broadcast::Sender<HubFact>,
    authority: Arc<dyn MembershipAuthority>,
}

impl fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubHandle")
            .field("closed", &self.intake.is_closed())
            .finish_non_exhaustive()
    }
}

impl HubHandle {
    /// Open a session for an authenticated user.
    ///
    /// # Errors
    ///
    /// Returns `CapacityReached` at the session limit, `HubUnavailable` if
    /// the coordinator stopped.
    pub async fn open(
        &self,
        user_id: impl Into<UserId>,
    ) -> Result<(SessionHandle, QueueReceiver), HubError> {
        let user_id = user_id.into();
        let (reply, response) = oneshot::channel();
        self.send(Command::Open {
            user_id: user_id.clone(),
            reply,
        })
        .await?;

        let (id, receiver) = response.await.map_err(|_| HubError::HubUnavailable)??;
        Ok((
            SessionHandle {
                id,
                user_id,
                hub: self.clone(),
            },
            receiver,
        ))
    }

    /// Close a session.
    pub async fn close(&self, session: SessionId, reason: CloseReason) -> Result<(), HubError> {
        self.send(Command::Close { session, reason }).await
    }

    /// Submit an intent on behalf of a session.
    ///
    /// Channel joins are authorized here, before the intent reaches the
    /// coordinator. A refusal is queued in order with the session's other
    /// intents.
    pub async fn submit(
        &self,
        session: SessionId,
        user_id: &str,
        intent: ClientIntent,
    ) -> Result<(), HubError> {
        if let ClientIntent::JoinChannel(ChannelRef { channel_id }) = &intent {
            let allowed = match self.authority.may_join(user_id, channel_id).await {
                Ok(allowed) => allowed,
                Err(err) => {
                    warn!(user = %user_id, channel = %channel_id, error = %err, "Authorization failed");
                    false
                }
            };
            if !allowed {
                return self
                    .send(Command::Reject {
                        session,
                        kind: Some(IntentKind::JoinChannel),
                        error: HubError::NotAMember(channel_id.clone()),
                    })
                    .await;
            }
        }

        self.send(Command::Intent { session, intent }).await
    }

    /// Remove every session of a user from a channel.
    pub async fn evict(
        &self,
        user_id: impl Into<UserId>,
        channel_id: impl Into<ChannelId>,
    ) -> Result<(), HubError> {
        self.send(Command::Evict {
            user_id: user_id.into(),
            channel_id: channel_id.into(),
        })
        .await
    }

    /// Reconcile a channel with an authoritative member list.
    pub async fn apply_membership(
        &self,
        channel_id: impl Into<ChannelId>,
        users: HashSet<UserId>,
    ) -> Result<(), HubError> {
        self.send(Command::ApplyMembership {
            channel_id: channel_id.into(),
            users,
        })
        .await
    }

    /// Publish a collaborator event such as `message_edited` to a channel.
    pub async fn inject(
        &self,
        channel_id: impl Into<ChannelId>,
        payload: EventPayload,
    ) -> Result<(), HubError> {
        self.send(Command::Inject {
            channel_id: channel_id.into(),
            payload,
        })
        .await
    }

    /// Expire typing indicators now instead of waiting for the next tick.
    pub async fn sweep(&self) -> Result<(), HubError> {
        self.send(Command::Sweep).await
    }

    /// State as of the last completed step.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HubSnapshot> {
        self.snapshot.load_full()
    }

    /// Sessions subscribed to a channel, from the latest snapshot.
    #[must_use]
    pub fn members_of(&self, channel_id: &str) -> Vec<SessionId> {
        self.snapshot.load().members_of(channel_id)
    }

    /// Subscribe to session and presence facts.
    #[must_use]
    pub fn subscribe_facts(&self) -> broadcast::Receiver<HubFact> {
        self.facts.subscribe()
    }

    /// Close every session and stop the coordinator.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        done.await.map_err(|_| HubError::HubUnavailable)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.intake.is_closed()
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.intake
            .send(command)
            .await
            .map_err(|_| HubError::HubUnavailable)
    }
}

/// A session's handle onto the hub.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    user_id: UserId,
    hub: HubHandle,
}

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Submit an intent from this session.
    pub async fn submit(&self, intent: ClientIntent) -> Result<(), HubError> {
        self.hub.submit(self.id, &self.user_id, intent).await
    }

    /// Answer an undecodable frame with an `error` event.
    pub async fn reject(&self, kind: Option<IntentKind>, error: HubError) -> Result<(), HubError> {
        self.hub
            .send(Command::Reject {
                session: self.id,
                kind,
                error,
            })
            .await
    }

    /// Close this session.
    pub async fn close(&self, reason: CloseReason) -> Result<(), HubError> {
        self.hub.close(self.id, reason).await
    }

    #[must_use]
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }
}
