//! # chorus-core
//!
//! Session registry, channel membership, presence, fan-out and call
//! signaling for the Chorus messaging hub.
//!
//! - **Session** - Live connections and their bounded outbound queues
//! - **Membership** - Channel ↔ session index
//! - **Presence** - Online/away/offline status and typing indicators
//! - **Broadcast** - Per-channel fan-out that never blocks on a slow reader
//! - **Call** - Call lifecycle and WebRTC signaling relay
//! - **Hub** - The coordinator that applies every change in one place
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  intents   ┌─────────────┐   events   ┌──────────────┐
//! │  Connection │──────────▶│     Hub     │──────────▶│ Outbound     │
//! │  (reader)   │           │ Coordinator │           │ queue/writer │
//! └─────────────┘           └─────────────┘           └──────────────┘
//!                                  │
//!            ┌──────────┬──────────┼──────────┬──────────┐
//!            ▼          ▼          ▼          ▼          ▼
//!        Sessions  Membership  Presence  Broadcast    Calls
//! ```

pub mod broadcast;
pub mod call;
pub mod directory;
pub mod error;
pub mod hub;
pub mod membership;
pub mod presence;
pub mod queue;
pub mod session;

pub use broadcast::{BroadcastEngine, BroadcastStats, Fanout};
pub use call::{Call, CallRelay, SignalKind, SignalPayload, SignalingEnvelope};
pub use directory::{
    DirectoryError, IdentityResolver, InMemoryDirectory, InMemoryMessageStore, MembershipAuthority,
    MessageRecord, MessageStore, NullMessageStore,
};
pub use error::HubError;
pub use hub::{
    CallSummary, Command, Hub, HubConfig, HubFact, HubHandle, HubSnapshot, HubState, HubStats,
    SessionHandle,
};
pub use membership::{validate_channel_name, JoinOutcome, MembershipIndex};
pub use presence::{PresenceChange, PresenceTracker};
pub use queue::{outbound_queue, PushOutcome, QueueReceiver, QueueSender, QueuedEvent};
pub use session::{CloseReason, Session, SessionRegistry};
