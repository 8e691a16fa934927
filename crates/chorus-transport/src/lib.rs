//! # chorus-transport
//!
//! Transport abstraction layer for the Chorus messaging hub.
//!
//! - **WebSocket** - Upgraded axum sockets, JSON text or MessagePack binary
//! - **Memory** - A connected in-process pair for tests
//!
//! ## Transport Abstraction
//!
//! Every connection splits into an [`IntentStream`] and an [`EventSink`],
//! allowing the server to be protocol-agnostic.
//!
//! ```rust,ignore
//! use chorus_transport::{Connection, Inbound};
//!
//! async fn handle_connection(conn: Box<dyn Connection>) {
//!     let (mut intents, mut events) = conn.split();
//!     while let Ok(Some(Inbound::Intent(intent))) = intents.recv().await {
//!         // Submit to the hub
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{memory_pair, MemoryClient, MemoryConnection};
pub use traits::{Connection, ConnectionId, EventSink, Inbound, IntentStream, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection};
