//! In-memory transport.
//!
//! A connected pair of a server-side [`MemoryConnection`] and a
//! [`MemoryClient`]. Frames go through the real codec, so session tasks can
//! be exercised without sockets.

use async_trait::async_trait;
use chorus_protocol::{codec, ClientIntent, Encoding, Frame, ServerEvent};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, EventSink, Inbound, IntentStream, TransportError};

#[derive(Debug)]
enum Wire {
    Frame(Frame),
    Heartbeat,
}

#[derive(Debug)]
struct Shared {
    open: AtomicBool,
    failing_sends: AtomicUsize,
}

/// Create a connected in-memory pair.
#[must_use]
pub fn memory_pair(encoding: Encoding) -> (MemoryConnection, MemoryClient) {
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        open: AtomicBool::new(true),
        failing_sends: AtomicUsize::new(0),
    });

    (
        MemoryConnection {
            id: ConnectionId::generate(),
            inbound: from_client,
            outbound: to_client,
            encoding,
            shared: Arc::clone(&shared),
        },
        MemoryClient {
            outbound: Some(to_server),
            inbound: from_server,
            encoding,
            shared,
        },
    )
}

/// Server side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<Wire>,
    outbound: mpsc::UnboundedSender<Frame>,
    encoding: Encoding,
    shared: Arc<Shared>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn IntentStream>, Box<dyn EventSink>) {
        let reader = MemoryReader {
            inbound: self.inbound,
            shared: Arc::clone(&self.shared),
        };
        let writer = MemoryWriter {
            outbound: self.outbound,
            encoding: self.encoding,
            shared: self.shared,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Wire>,
    shared: Arc<Shared>,
}

#[async_trait]
impl IntentStream for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.inbound.recv().await {
            Some(Wire::Frame(frame)) => Ok(Some(Inbound::Intent(codec::decode_intent(&frame)?))),
            Some(Wire::Heartbeat) => Ok(Some(Inbound::Heartbeat)),
            None => {
                self.shared.open.store(false, Ordering::SeqCst);
                Ok(None)
            }
        }
    }
}

struct MemoryWriter {
    outbound: mpsc::UnboundedSender<Frame>,
    encoding: Encoding,
    shared: Arc<Shared>,
}

#[async_trait]
impl EventSink for MemoryWriter {
    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let injected = self
            .shared
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::SendFailed("injected failure".into()));
        }

        let frame = codec::encode_event(event, self.encoding)?;
        self.outbound.send(frame).map_err(|_| {
            self.shared.open.store(false, Ordering::SeqCst);
            TransportError::ConnectionClosed
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shared.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }
}

/// Client side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryClient {
    outbound: Option<mpsc::UnboundedSender<Wire>>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    encoding: Encoding,
    shared: Arc<Shared>,
}

impl MemoryClient {
    /// Encode and send an intent.
    ///
    /// # Errors
    ///
    /// Returns an error once the connection is closed.
    pub fn send(&self, intent: &ClientIntent) -> Result<(), TransportError> {
        let frame = codec::encode(intent, self.encoding)?;
        self.send_frame(frame)
    }

    /// Send a raw frame, which need not decode.
    pub fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.wire(Wire::Frame(frame))
    }

    /// Send a transport-level keepalive.
    pub fn heartbeat(&self) -> Result<(), TransportError> {
        self.wire(Wire::Heartbeat)
    }

    /// Receive and decode the next event.
    ///
    /// Returns `None` once the server side is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        let frame = self.inbound.recv().await?;
        codec::decode(&frame).ok()
    }

    /// Make the next `count` server sends fail without closing.
    pub fn fail_next_sends(&self, count: usize) {
        self.shared.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Hang up. The server reader sees a clean close.
    pub fn disconnect(&mut self) {
        self.outbound = None;
    }

    /// Whether the server still considers the connection open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn wire(&self, wire: Wire) -> Result<(), TransportError> {
        self.outbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(wire)
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::EventPayload;

    #[tokio::test]
    async fn test_intents_and_events_cross_the_pair() {
        for encoding in [Encoding::Json, Encoding::MessagePack] {
            let (connection, mut client) = memory_pair(encoding);
            let (mut reader, mut writer) = Box::new(connection).split();

            client.send(&ClientIntent::join("general")).unwrap();
            let inbound = reader.recv().await.unwrap();
            assert_eq!(inbound, Some(Inbound::Intent(ClientIntent::join("general"))));

            writer
                .send(&ServerEvent::new(EventPayload::Pong))
                .await
                .unwrap();
            let event = client.recv().await.unwrap();
            assert_eq!(event.payload, EventPayload::Pong);
        }
    }

    #[tokio::test]
    async fn test_garbage_frame_is_a_protocol_error() {
        let (connection, client) = memory_pair(Encoding::Json);
        let (mut reader, _writer) = Box::new(connection).split();

        client.send_frame(Frame::Text("{not json".into())).unwrap();
        let err = reader.recv().await.unwrap_err();
        assert!(!err.is_fatal());

        client.heartbeat().unwrap();
        assert_eq!(reader.recv().await.unwrap(), Some(Inbound::Heartbeat));
    }

    #[tokio::test]
    async fn test_disconnect_ends_reader_and_writer() {
        let (connection, mut client) = memory_pair(Encoding::Json);
        let (mut reader, mut writer) = Box::new(connection).split();

        client.disconnect();
        assert_eq!(reader.recv().await.unwrap(), None);
        assert!(!writer.is_open());
        assert!(writer
            .send(&ServerEvent::new(EventPayload::Pong))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_injected_send_failures() {
        let (connection, mut client) = memory_pair(Encoding::Json);
        let (_reader, mut writer) = Box::new(connection).split();
        let pong = ServerEvent::new(EventPayload::Pong);

        client.fail_next_sends(2);
        assert!(writer.send(&pong).await.is_err());
        assert!(writer.send(&pong).await.is_err());
        assert!(writer.is_open());
        writer.send(&pong).await.unwrap();
        assert!(client.recv().await.is_some());
    }
}
