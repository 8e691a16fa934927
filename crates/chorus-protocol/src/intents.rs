//! Inbound intents sent by clients.
//!
//! Every intent travels as a `{type, data}` envelope. The `type` tag selects
//! the variant and `data` carries its strongly shaped payload.

use serde::{Deserialize, Serialize};

use crate::types::{CallId, ChannelId, PresenceStatus, UserId};

/// Intent type identifiers, mostly useful for logging and error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    JoinChannel,
    LeaveChannel,
    SendMessage,
    Typing,
    StartCall,
    JoinCall,
    LeaveCall,
    EndCall,
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcIceCandidate,
    SetStatus,
    Ping,
}

impl IntentKind {
    /// Wire name of the intent.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            IntentKind::JoinChannel => "join_channel",
            IntentKind::LeaveChannel => "leave_channel",
            IntentKind::SendMessage => "send_message",
            IntentKind::Typing => "typing",
            IntentKind::StartCall => "start_call",
            IntentKind::JoinCall => "join_call",
            IntentKind::LeaveCall => "leave_call",
            IntentKind::EndCall => "end_call",
            IntentKind::WebrtcOffer => "webrtc_offer",
            IntentKind::WebrtcAnswer => "webrtc_answer",
            IntentKind::WebrtcIceCandidate => "webrtc_ice_candidate",
            IntentKind::SetStatus => "set_status",
            IntentKind::Ping => "ping",
        }
    }
}

/// Reference to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub channel_id: ChannelId,
}

/// Reference to a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub call_id: CallId,
}

/// A chat message to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub channel_id: ChannelId,
    pub content: String,
}

/// Start a call bound to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCall {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub title: String,
}

/// An SDP offer or answer addressed to one call participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpSignal {
    pub call_id: CallId,
    pub to_user_id: UserId,
    pub sdp: String,
}

/// An ICE candidate addressed to one call participant.
///
/// The candidate is opaque to the hub and forwarded as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceSignal {
    pub call_id: CallId,
    pub to_user_id: UserId,
    pub candidate: serde_json::Value,
}

/// Explicit status selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: PresenceStatus,
}

/// An intent sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientIntent {
    JoinChannel(ChannelRef),
    LeaveChannel(ChannelRef),
    SendMessage(SendMessage),
    Typing(ChannelRef),
    StartCall(StartCall),
    JoinCall(CallRef),
    LeaveCall(CallRef),
    EndCall(CallRef),
    WebrtcOffer(SdpSignal),
    WebrtcAnswer(SdpSignal),
    WebrtcIceCandidate(IceSignal),
    SetStatus(StatusUpdate),
    Ping,
}

impl ClientIntent {
    /// Get the intent kind.
    #[must_use]
    pub fn kind(&self) -> IntentKind {
        match self {
            ClientIntent::JoinChannel(_) => IntentKind::JoinChannel,
            ClientIntent::LeaveChannel(_) => IntentKind::LeaveChannel,
            ClientIntent::SendMessage(_) => IntentKind::SendMessage,
            ClientIntent::Typing(_) => IntentKind::Typing,
            ClientIntent::StartCall(_) => IntentKind::StartCall,
            ClientIntent::JoinCall(_) => IntentKind::JoinCall,
            ClientIntent::LeaveCall(_) => IntentKind::LeaveCall,
            ClientIntent::EndCall(_) => IntentKind::EndCall,
            ClientIntent::WebrtcOffer(_) => IntentKind::WebrtcOffer,
            ClientIntent::WebrtcAnswer(_) => IntentKind::WebrtcAnswer,
            ClientIntent::WebrtcIceCandidate(_) => IntentKind::WebrtcIceCandidate,
            ClientIntent::SetStatus(_) => IntentKind::SetStatus,
            ClientIntent::Ping => IntentKind::Ping,
        }
    }

    /// Create a `join_channel` intent.
    #[must_use]
    pub fn join(channel_id: impl Into<ChannelId>) -> Self {
        ClientIntent::JoinChannel(ChannelRef {
            channel_id: channel_id.into(),
        })
    }

    /// Create a `leave_channel` intent.
    #[must_use]
    pub fn leave(channel_id: impl Into<ChannelId>) -> Self {
        ClientIntent::LeaveChannel(ChannelRef {
            channel_id: channel_id.into(),
        })
    }

    /// Create a `send_message` intent.
    #[must_use]
    pub fn send(channel_id: impl Into<ChannelId>, content: impl Into<String>) -> Self {
        ClientIntent::SendMessage(SendMessage {
            channel_id: channel_id.into(),
            content: content.into(),
        })
    }

    /// Create a `typing` intent.
    #[must_use]
    pub fn typing(channel_id: impl Into<ChannelId>) -> Self {
        ClientIntent::Typing(ChannelRef {
            channel_id: channel_id.into(),
        })
    }

    /// Create a `start_call` intent.
    #[must_use]
    pub fn start_call(channel_id: impl Into<ChannelId>, title: impl Into<String>) -> Self {
        ClientIntent::StartCall(StartCall {
            channel_id: channel_id.into(),
            title: title.into(),
        })
    }

    /// Create a `join_call` intent.
    #[must_use]
    pub fn join_call(call_id: impl Into<CallId>) -> Self {
        ClientIntent::JoinCall(CallRef {
            call_id: call_id.into(),
        })
    }

    /// Create a `leave_call` intent.
    #[must_use]
    pub fn leave_call(call_id: impl Into<CallId>) -> Self {
        ClientIntent::LeaveCall(CallRef {
            call_id: call_id.into(),
        })
    }

    /// Create a `webrtc_offer` intent.
    #[must_use]
    pub fn offer(
        call_id: impl Into<CallId>,
        to_user_id: impl Into<UserId>,
        sdp: impl Into<String>,
    ) -> Self {
        ClientIntent::WebrtcOffer(SdpSignal {
            call_id: call_id.into(),
            to_user_id: to_user_id.into(),
            sdp: sdp.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_send_message() {
        let raw = r#"{"type":"send_message","data":{"channelId":"general","content":"hi"}}"#;
        let intent: ClientIntent = serde_json::from_str(raw).unwrap();
        assert_eq!(intent, ClientIntent::send("general", "hi"));
        assert_eq!(intent.kind(), IntentKind::SendMessage);
    }

    #[test]
    fn test_parse_ice_candidate_keeps_payload() {
        let raw = json!({
            "type": "webrtc_ice_candidate",
            "data": {
                "callId": "call_1",
                "toUserId": "bob",
                "candidate": {"candidate": "candidate:1 1 UDP 2122260223 10.0.0.1 54400 typ host", "sdpMid": "0"}
            }
        });
        let intent: ClientIntent = serde_json::from_value(raw).unwrap();
        match intent {
            ClientIntent::WebrtcIceCandidate(signal) => {
                assert_eq!(signal.to_user_id, "bob");
                assert_eq!(signal.candidate["sdpMid"], "0");
            }
            other => panic!("unexpected intent {:?}", other),
        }
    }

    #[test]
    fn test_parse_ping_without_data() {
        let intent: ClientIntent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(intent, ClientIntent::Ping);
    }

    #[test]
    fn test_start_call_title_defaults_to_empty() {
        let raw = r#"{"type":"start_call","data":{"channelId":"general"}}"#;
        let intent: ClientIntent = serde_json::from_str(raw).unwrap();
        assert_eq!(intent, ClientIntent::start_call("general", ""));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let raw = r#"{"type":"launch_rockets","data":{}}"#;
        assert!(serde_json::from_str::<ClientIntent>(raw).is_err());
    }
}
