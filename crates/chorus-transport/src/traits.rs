//! Transport abstraction traits for Chorus.
//!
//! A connection splits into an [`IntentStream`] read by the session's reader
//! task and an [`EventSink`] written by its writer task, so the server never
//! depends on a concrete wire.

use async_trait::async_trait;
use chorus_protocol::{ClientIntent, ProtocolError, ServerEvent};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection, used in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let seq = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{seq}", chorus_protocol::now_millis()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame could not be decoded or encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the connection is unusable after this error.
    ///
    /// Protocol errors affect a single frame; the connection stays open.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Protocol(_))
    }
}

/// Something received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A decoded intent.
    Intent(ClientIntent),
    /// Transport-level keepalive; only proves the client is alive.
    Heartbeat,
}

/// Inbound half of a connection.
#[async_trait]
pub trait IntentStream: Send {
    /// Receive the next inbound item.
    ///
    /// Returns `None` when the client closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait EventSink: Send {
    /// Encode and send one event.
    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

/// An accepted connection, before it is split between reader and writer.
pub trait Connection: Send {
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned halves.
    fn split(self: Box<Self>) -> (Box<dyn IntentStream>, Box<dyn EventSink>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_protocol_errors_are_not_fatal() {
        let err = TransportError::from(ProtocolError::Invalid("bad frame".into()));
        assert!(!err.is_fatal());
        assert!(TransportError::ConnectionClosed.is_fatal());
        assert!(TransportError::SendFailed("reset".into()).is_fatal());
    }
}
