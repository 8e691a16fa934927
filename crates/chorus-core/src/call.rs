//! Call signaling relay.
//!
//! Tracks call lifecycle (`pending → active → ended`) and forwards WebRTC
//! handshake messages between participants. Media never passes through here.

use chorus_protocol::events::{CallEnded, CallParticipant, CallStarted, Signal};
use chorus_protocol::{
    now_millis, CallId, CallState, ChannelId, EventPayload, SessionId, UserId,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use crate::error::HubError;

/// Kind of signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Opaque signaling payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Sdp(String),
    Candidate(serde_json::Value),
}

/// A signaling message on its way from one participant to another.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingEnvelope {
    pub call_id: CallId,
    pub from_user: UserId,
    pub from_session: SessionId,
    pub to_user: UserId,
    pub kind: SignalKind,
    pub payload: SignalPayload,
}

/// A live call.
#[derive(Debug, Clone)]
pub struct Call {
    id: CallId,
    channel_id: ChannelId,
    title: String,
    started_by: UserId,
    state: CallState,
    created_at: u64,
    /// One session per participating user.
    participants: BTreeMap<UserId, SessionId>,
    /// Next sequence number per (sender, recipient).
    sequences: HashMap<(UserId, UserId), u64>,
}

impl Call {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Participating users, sorted.
    #[must_use]
    pub fn participants(&self) -> Vec<UserId> {
        self.participants.keys().cloned().collect()
    }

    /// The session a user takes part with.
    #[must_use]
    pub fn session_of(&self, user_id: &str) -> Option<SessionId> {
        self.participants.get(user_id).copied()
    }

    fn participant_event(&self, user_id: &str) -> CallParticipant {
        CallParticipant {
            call_id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            user_id: user_id.to_string(),
            state: self.state,
            participants: self.participants(),
        }
    }

    fn ended_event(&self) -> CallEnded {
        CallEnded {
            call_id: self.id.clone(),
            channel_id: self.channel_id.clone(),
        }
    }
}

/// Outcome of a successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct CallJoin {
    /// Broadcast to the call's channel.
    pub joined: CallParticipant,
    /// The user's previous session in this call, now evicted.
    pub replaced: Option<SessionId>,
    /// True when this join moved the call from `pending` to `active`.
    pub activated: bool,
}

/// Outcome of a participant leaving.
#[derive(Debug, Clone, PartialEq)]
pub struct CallLeave {
    /// Broadcast to the call's channel.
    pub left: CallParticipant,
    /// Set when the last participant left.
    pub ended: Option<CallEnded>,
}

/// Registry of calls and relay of their signaling.
#[derive(Debug)]
pub struct CallRelay {
    calls: HashMap<CallId, Call>,
    ended: VecDeque<CallId>,
    ended_lookup: HashSet<CallId>,
    ended_retention: usize,
    next_id: u64,
}

impl CallRelay {
    /// Create a relay remembering up to `ended_retention` ended call ids.
    #[must_use]
    pub fn new(ended_retention: usize) -> Self {
        Self {
            calls: HashMap::new(),
            ended: VecDeque::new(),
            ended_lookup: HashSet::new(),
            ended_retention,
            next_id: 0,
        }
    }

    /// Start a call with the caller as first participant.
    ///
    /// The caller must already be a member of the channel.
    pub fn start_call(
        &mut self,
        channel_id: &str,
        user_id: &str,
        session: SessionId,
        title: &str,
    ) -> CallStarted {
        self.next_id += 1;
        let id = format!("call_{:x}{:04x}", now_millis(), self.next_id & 0xffff);

        let mut participants = BTreeMap::new();
        participants.insert(user_id.to_string(), session);

        let call = Call {
            id: id.clone(),
            channel_id: channel_id.to_string(),
            title: title.to_string(),
            started_by: user_id.to_string(),
            state: CallState::Pending,
            created_at: now_millis(),
            participants,
            sequences: HashMap::new(),
        };

        info!(call = %id, channel = %channel_id, user = %user_id, "Call started");
        let started = CallStarted {
            call_id: id.clone(),
            channel_id: call.channel_id.clone(),
            title: call.title.clone(),
            started_by: call.started_by.clone(),
            state: call.state,
        };
        self.calls.insert(id, call);
        started
    }

    /// Join a call from a session.
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound` or `CallEnded` for stale ids.
    pub fn join_call(
        &mut self,
        call_id: &str,
        user_id: &str,
        session: SessionId,
    ) -> Result<CallJoin, HubError> {
        let call = self.live_call_mut(call_id)?;

        let replaced = call
            .participants
            .insert(user_id.to_string(), session)
            .filter(|previous| *previous != session);

        let activated = call.state == CallState::Pending && call.participants.len() >= 2;
        if activated {
            call.state = CallState::Active;
            info!(call = %call_id, "Call active");
        }

        debug!(call = %call_id, user = %user_id, session = %session, "Joined call");
        Ok(CallJoin {
            joined: call.participant_event(user_id),
            replaced,
            activated,
        })
    }

    /// Remove the participant taking part with `session`.
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound`, `CallEnded`, or `NotInCall`.
    pub fn leave_call(&mut self, call_id: &str, session: SessionId) -> Result<CallLeave, HubError> {
        let call = self.live_call_mut(call_id)?;

        let user_id = call
            .participants
            .iter()
            .find(|(_, s)| **s == session)
            .map(|(user, _)| user.clone())
            .ok_or_else(|| HubError::NotInCall(call_id.to_string()))?;

        // Sequence counters outlive a leave so a rejoin keeps counting up.
        call.participants.remove(&user_id);
        debug!(call = %call_id, user = %user_id, "Left call");

        if call.participants.is_empty() {
            call.state = CallState::Ended;
            let left = call.participant_event(&user_id);
            let ended = self.finish(call_id);
            return Ok(CallLeave { left, ended });
        }

        Ok(CallLeave {
            left: call.participant_event(&user_id),
            ended: None,
        })
    }

    /// End a call for everyone.
    ///
    /// # Errors
    ///
    /// Only participants may end a call.
    pub fn end_call(&mut self, call_id: &str, session: SessionId) -> Result<CallEnded, HubError> {
        let call = self.live_call_mut(call_id)?;
        if !call.participants.values().any(|s| *s == session) {
            return Err(HubError::NotInCall(call_id.to_string()));
        }
        self.finish(call_id)
            .ok_or_else(|| HubError::CallNotFound(call_id.to_string()))
    }

    /// Forward a signaling message.
    ///
    /// Returns the recipient session and the event to deliver, or `None`
    /// when the recipient is not (or no longer) a participant.
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound`/`CallEnded` for stale ids and `NotInCall` when
    /// the sender does not take part from this session.
    pub fn relay(
        &mut self,
        envelope: SignalingEnvelope,
    ) -> Result<Option<(SessionId, EventPayload)>, HubError> {
        let call = self.live_call_mut(&envelope.call_id)?;

        if call.session_of(&envelope.from_user) != Some(envelope.from_session) {
            return Err(HubError::NotInCall(envelope.call_id));
        }

        let Some(recipient) = call.session_of(&envelope.to_user) else {
            debug!(
                call = %envelope.call_id,
                from = %envelope.from_user,
                to = %envelope.to_user,
                "Recipient not in call, dropping signal"
            );
            return Ok(None);
        };

        let seq = call
            .sequences
            .entry((envelope.from_user.clone(), envelope.to_user.clone()))
            .or_insert(0);
        *seq += 1;

        let (sdp, candidate) = match envelope.payload {
            SignalPayload::Sdp(sdp) => (Some(sdp), None),
            SignalPayload::Candidate(candidate) => (None, Some(candidate)),
        };
        let signal = Signal {
            call_id: envelope.call_id,
            from_user_id: envelope.from_user,
            to_user_id: envelope.to_user,
            seq: *seq,
            sdp,
            candidate,
        };

        let payload = match envelope.kind {
            SignalKind::Offer => EventPayload::WebrtcOffer(signal),
            SignalKind::Answer => EventPayload::WebrtcAnswer(signal),
            SignalKind::IceCandidate => EventPayload::WebrtcIceCandidate(signal),
        };
        Ok(Some((recipient, payload)))
    }

    /// Leave every call a session takes part in.
    pub fn remove_session(&mut self, session: SessionId) -> Vec<CallLeave> {
        self.leave_matching(|call| call.participants.values().any(|s| *s == session), session)
    }

    /// Leave the calls of one channel a session takes part in.
    pub fn leave_channel(&mut self, session: SessionId, channel_id: &str) -> Vec<CallLeave> {
        self.leave_matching(
            |call| {
                call.channel_id == channel_id && call.participants.values().any(|s| *s == session)
            },
            session,
        )
    }

    /// Look up a live call.
    #[must_use]
    pub fn get(&self, call_id: &str) -> Option<&Call> {
        self.calls.get(call_id)
    }

    /// Look up a live call, telling ended calls apart from unknown ones.
    ///
    /// # Errors
    ///
    /// Returns `CallEnded` or `CallNotFound`.
    pub fn live_call(&self, call_id: &str) -> Result<&Call, HubError> {
        if self.ended_lookup.contains(call_id) {
            return Err(HubError::CallEnded(call_id.to_string()));
        }
        self.calls
            .get(call_id)
            .ok_or_else(|| HubError::CallNotFound(call_id.to_string()))
    }

    /// Iterate live calls.
    pub fn calls(&self) -> impl Iterator<Item = &Call> {
        self.calls.values()
    }

    #[must_use]
    pub fn is_ended(&self, call_id: &str) -> bool {
        self.ended_lookup.contains(call_id)
    }

    /// Number of live calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn leave_matching(
        &mut self,
        matches: impl Fn(&Call) -> bool,
        session: SessionId,
    ) -> Vec<CallLeave> {
        let mut ids: Vec<_> = self
            .calls
            .values()
            .filter(|call| matches(call))
            .map(|call| call.id.clone())
            .collect();
        ids.sort();

        ids.iter()
            .filter_map(|id| self.leave_call(id, session).ok())
            .collect()
    }

    fn live_call_mut(&mut self, call_id: &str) -> Result<&mut Call, HubError> {
        if self.ended_lookup.contains(call_id) {
            return Err(HubError::CallEnded(call_id.to_string()));
        }
        self.calls
            .get_mut(call_id)
            .ok_or_else(|| HubError::CallNotFound(call_id.to_string()))
    }

    fn finish(&mut self, call_id: &str) -> Option<CallEnded> {
        let mut call = self.calls.remove(call_id)?;
        call.state = CallState::Ended;

        self.ended.push_back(call.id.clone());
        self.ended_lookup.insert(call.id.clone());
        while self.ended.len() > self.ended_retention {
            if let Some(old) = self.ended.pop_front() {
                self.ended_lookup.remove(&old);
            }
        }

        info!(call = %call_id, channel = %call.channel_id, "Call ended");
        Some(call.ended_event())
    }
}
