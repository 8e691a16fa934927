//! # chorus-protocol
//!
//! Wire protocol definitions for the Chorus messaging hub.
//!
//! Clients send [`ClientIntent`]s and receive [`ServerEvent`]s. Both are
//! `{type, data}` envelopes (events also carry a `timestamp`), encoded as
//! JSON text frames or length-prefixed MessagePack binary frames.
//!
//! ## Example
//!
//! ```rust
//! use chorus_protocol::{codec, ClientIntent, Encoding};
//!
//! let intent = ClientIntent::send("general", "hi");
//! let frame = codec::encode(&intent, Encoding::Json).unwrap();
//! let decoded = codec::decode_intent(&frame).unwrap();
//! assert_eq!(intent, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod intents;
pub mod types;

pub use codec::{decode_intent, encode_event, Encoding, Frame, ProtocolError};
pub use events::{EventPayload, ServerEvent};
pub use intents::{ClientIntent, IntentKind};
pub use types::{
    now_millis, CallId, CallState, ChannelId, MessageId, PresenceStatus, SessionId, UserId,
};

/// Current protocol version, announced in the `connected` event.
pub const PROTOCOL_VERSION: u8 = 1;
