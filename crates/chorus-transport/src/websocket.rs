//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum [`WebSocket`]. Text frames carry JSON, binary frames
//! carry length-prefixed MessagePack; outbound frames use the encoding chosen
//! at connect time.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use chorus_protocol::{codec, Encoding, Frame, ProtocolError, ServerEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, EventSink, Inbound, IntentStream, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Encoding of outbound frames.
    pub encoding: Encoding,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
            encoding: Encoding::Json,
        }
    }
}

/// A WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    config: WebSocketConfig,
}

impl WebSocketConnection {
    #[must_use]
    pub fn new(socket: WebSocket, config: WebSocketConfig) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
            config,
        }
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn IntentStream>, Box<dyn EventSink>) {
        let (sink, stream) = self.socket.split();
        let is_open = Arc::new(AtomicBool::new(true));

        let reader = WebSocketReader {
            id: self.id.clone(),
            stream,
            is_open: Arc::clone(&is_open),
            max_message_size: self.config.max_message_size,
        };
        let writer = WebSocketWriter {
            id: self.id,
            sink,
            is_open,
            encoding: self.config.encoding,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct WebSocketReader {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    is_open: Arc<AtomicBool>,
    max_message_size: usize,
}

impl WebSocketReader {
    fn decode(&self, frame: Frame) -> Result<Option<Inbound>, TransportError> {
        if frame.len() > self.max_message_size {
            warn!(
                connection = %self.id,
                size = frame.len(),
                max = self.max_message_size,
                "Message too large"
            );
            return Err(ProtocolError::FrameTooLarge(frame.len()).into());
        }
        let intent = codec::decode_intent(&frame)?;
        Ok(Some(Inbound::Intent(intent)))
    }
}

#[async_trait]
impl IntentStream for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => self.decode(Frame::Text(text)),
            Some(Ok(Message::Binary(data))) => self.decode(Frame::Binary(Bytes::from(data))),
            // axum answers pings itself.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => Ok(Some(Inbound::Heartbeat)),
            Some(Ok(Message::Close(_))) => {
                debug!(connection = %self.id, "Received close frame");
                self.is_open.store(false, Ordering::SeqCst);
                Ok(None)
            }
            Some(Err(e)) => {
                debug!(connection = %self.id, error = %e, "WebSocket error");
                self.is_open.store(false, Ordering::SeqCst);
                Err(TransportError::ReceiveFailed(e.to_string()))
            }
            None => {
                debug!(connection = %self.id, "WebSocket stream ended");
                self.is_open.store(false, Ordering::SeqCst);
                Ok(None)
            }
        }
    }
}

struct WebSocketWriter {
    id: ConnectionId,
    sink: SplitSink<WebSocket, Message>,
    is_open: Arc<AtomicBool>,
    encoding: Encoding,
}

#[async_trait]
impl EventSink for WebSocketWriter {
    async fn send(&mut self, event: &ServerEvent) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = to_message(codec::encode_event(event, self.encoding)?);
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        debug!(connection = %self.id, "Closing WebSocket");
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            debug!(connection = %self.id, error = %e, "Close frame not sent");
        }
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {e}")))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

/// Map an encoded frame onto a WebSocket message.
#[must_use]
pub fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data.to_vec()),
    }
}
