//! Outbound events delivered by the hub.
//!
//! Every event is serialized as `{type, data, timestamp}`.

use serde::{Deserialize, Serialize};

use crate::types::{
    now_millis, CallId, CallState, ChannelId, MessageId, PresenceStatus, SessionId, UserId,
};

/// Sent once, first, on every new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub protocol_version: u8,
    /// Recommended heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
}

/// A channel member and its presence, as listed in `channel_joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPresence {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

/// Confirms a join and lists who is currently in the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelJoined {
    pub channel_id: ChannelId,
    pub members: Vec<MemberPresence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelLeft {
    pub channel_id: ChannelId,
}

/// A chat message, as accepted or edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub channel_id: ChannelId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceChanged {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_active_at: u64,
}

/// Describes a call when it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStarted {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    pub title: String,
    pub started_by: UserId,
    pub state: CallState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub call_id: CallId,
    pub channel_id: ChannelId,
}

/// A participant joined or left a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    pub call_id: CallId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub state: CallState,
    pub participants: Vec<UserId>,
}

/// A relayed signaling message.
///
/// Exactly one of `sdp` (offer/answer) or `candidate` (ICE) is set. `seq`
/// increases per (call, sender, recipient) so recipients can discard
/// duplicates and stale messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub call_id: CallId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<serde_json::Value>,
}

/// Error reply to the originating session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    pub code: u16,
    pub kind: String,
    pub message: String,
    /// Wire name of the intent that failed, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

/// Event payload, tagged by `type` with content in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Connected(Connected),
    Pong,
    ChannelJoined(ChannelJoined),
    ChannelLeft(ChannelLeft),
    MessageSent(ChatMessage),
    MessageEdited(ChatMessage),
    MessageDeleted(MessageDeleted),
    UserTyping(Typing),
    TypingStopped(Typing),
    PresenceChanged(PresenceChanged),
    CallStarted(CallStarted),
    CallEnded(CallEnded),
    UserJoinedCall(CallParticipant),
    UserLeftCall(CallParticipant),
    WebrtcOffer(Signal),
    WebrtcAnswer(Signal),
    WebrtcIceCandidate(Signal),
    Error(ErrorReply),
}

impl EventPayload {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::Connected(_) => "connected",
            EventPayload::Pong => "pong",
            EventPayload::ChannelJoined(_) => "channel_joined",
            EventPayload::ChannelLeft(_) => "channel_left",
            EventPayload::MessageSent(_) => "message_sent",
            EventPayload::MessageEdited(_) => "message_edited",
            EventPayload::MessageDeleted(_) => "message_deleted",
            EventPayload::UserTyping(_) => "user_typing",
            EventPayload::TypingStopped(_) => "typing_stopped",
            EventPayload::PresenceChanged(_) => "presence_changed",
            EventPayload::CallStarted(_) => "call_started",
            EventPayload::CallEnded(_) => "call_ended",
            EventPayload::UserJoinedCall(_) => "user_joined_call",
            EventPayload::UserLeftCall(_) => "user_left_call",
            EventPayload::WebrtcOffer(_) => "webrtc_offer",
            EventPayload::WebrtcAnswer(_) => "webrtc_answer",
            EventPayload::WebrtcIceCandidate(_) => "webrtc_ice_candidate",
            EventPayload::Error(_) => "error",
        }
    }

    /// Whether a saturated queue may discard this event.
    ///
    /// Only typing indicators qualify. Presence transitions are never
    /// repeated, so losing one would leave the client's view stale.
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            EventPayload::UserTyping(_) | EventPayload::TypingStopped(_)
        )
    }

    /// Whether fan-out skips the session that caused this event.
    #[must_use]
    pub fn is_echo_suppressed(&self) -> bool {
        matches!(
            self,
            EventPayload::MessageSent(_) | EventPayload::UserTyping(_)
        )
    }
}

/// An outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Milliseconds since the Unix epoch at which the hub produced the event.
    pub timestamp: u64,
}

impl ServerEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: now_millis(),
        }
    }

    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.payload.name()
    }

    #[must_use]
    pub fn is_droppable(&self) -> bool {
        self.payload.is_droppable()
    }
}

impl From<EventPayload> for ServerEvent {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}
