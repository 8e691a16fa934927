//! Hub errors.

use chorus_protocol::events::ErrorReply;
use chorus_protocol::{CallId, ChannelId, IntentKind};
use thiserror::Error;

/// Errors produced by the hub.
///
/// Validation errors are reported to the originating session only and
/// never change shared state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// No valid identity could be established for the connection.
    #[error("Authentication required")]
    AuthRequired,

    /// The user may not access the channel, or the session has not joined it.
    #[error("Not a member of channel: {0}")]
    NotAMember(ChannelId),

    /// The starting session is not a member of the channel.
    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    /// No call exists with this id.
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// The call has already ended.
    #[error("Call has ended: {0}")]
    CallEnded(CallId),

    /// The session is not a participant of the call.
    #[error("Not a participant of call: {0}")]
    NotInCall(CallId),

    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Message rejected by validation.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Maximum joined channels per session reached.
    #[error("Maximum channels per session reached")]
    TooManyChannels,

    /// Maximum number of live sessions reached.
    #[error("Maximum sessions reached")]
    CapacityReached,

    /// The session is gone.
    #[error("Session not found")]
    SessionNotFound,

    /// The outbound queue is full of events that may not be dropped.
    #[error("Outbound queue saturated")]
    QueueSaturated,

    /// The coordinator is no longer running.
    #[error("Hub unavailable")]
    HubUnavailable,
}

impl HubError {
    /// Stable numeric code sent to clients.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            HubError::AuthRequired => 1001,
            HubError::NotAMember(_) => 1002,
            HubError::ChannelNotFound(_) => 1003,
            HubError::CallNotFound(_) => 1004,
            HubError::CallEnded(_) => 1005,
            HubError::NotInCall(_) => 1006,
            HubError::InvalidChannel(_) => 1007,
            HubError::InvalidMessage(_) => 1008,
            HubError::TooManyChannels => 1009,
            HubError::CapacityReached => 1010,
            HubError::SessionNotFound => 1011,
            HubError::QueueSaturated => 1012,
            HubError::HubUnavailable => 1013,
        }
    }

    /// Machine-readable error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::AuthRequired => "AuthRequired",
            HubError::NotAMember(_) => "NotAMember",
            HubError::ChannelNotFound(_) => "ChannelNotFound",
            HubError::CallNotFound(_) => "CallNotFound",
            HubError::CallEnded(_) => "CallEnded",
            HubError::NotInCall(_) => "NotInCall",
            HubError::InvalidChannel(_) => "InvalidChannel",
            HubError::InvalidMessage(_) => "InvalidMessage",
            HubError::TooManyChannels => "TooManyChannels",
            HubError::CapacityReached => "CapacityReached",
            HubError::SessionNotFound => "SessionNotFound",
            HubError::QueueSaturated => "QueueSaturated",
            HubError::HubUnavailable => "HubUnavailable",
        }
    }

    /// Build the `error` event payload for a failed intent.
    #[must_use]
    pub fn to_reply(&self, intent: Option<IntentKind>) -> ErrorReply {
        ErrorReply {
            code: self.code(),
            kind: self.kind().to_string(),
            message: self.to_string(),
            intent: intent.map(|kind| kind.as_str().to_string()),
        }
    }
}
