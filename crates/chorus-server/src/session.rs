//! Per-connection session tasks.
//!
//! Each connection runs a reader (frames to intents to the hub) and a writer
//! (outbound queue to the wire). Whichever finishes first ends the session.

use chorus_core::{CloseReason, HubError, HubHandle, QueueReceiver, QueueSender, SessionHandle};
use chorus_protocol::events::EventPayload;
use chorus_protocol::{ServerEvent, UserId};
use chorus_transport::{Connection, EventSink, Inbound, IntentStream, TransportError};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};

/// How long the writer may keep flushing after the reader has finished.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Silence after which the connection is closed.
    pub heartbeat_timeout: Duration,
    /// Resend attempts after a transient send failure.
    pub send_retries: u32,
    pub retry_backoff: Duration,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            send_retries: config.queue.send_retries,
            retry_backoff: Duration::from_millis(config.queue.retry_backoff_ms),
        }
    }
}

/// Drive one authenticated connection until it closes.
pub async fn run_session(
    connection: Box<dyn Connection>,
    user_id: UserId,
    hub: HubHandle,
    config: SessionConfig,
) {
    let connection_id = connection.id().clone();
    let remote = connection.remote_addr();
    let (intents, mut events) = connection.split();

    let (session, queue) = match hub.open(user_id.clone()).await {
        Ok(opened) => opened,
        Err(err) => {
            warn!(connection = %connection_id, user = %user_id, error = %err, "Session refused");
            metrics::record_error("session_refused");
            let refusal = ServerEvent::new(EventPayload::Error(err.to_reply(None)));
            if let Err(e) = events.send(&refusal).await {
                debug!(connection = %connection_id, error = %e, "Refusal not delivered");
            }
            let _ = events.close().await;
            return;
        }
    };

    let _guard = ConnectionMetricsGuard::new();
    info!(
        connection = %connection_id,
        session = %session.id(),
        user = %user_id,
        remote = ?remote,
        "Session opened"
    );

    let mut reader = tokio::spawn(read_loop(intents, session.clone(), config.heartbeat_timeout));
    let mut writer = tokio::spawn(write_loop(events, queue, config));

    let reason = tokio::select! {
        result = &mut reader => {
            let reason = result.unwrap_or(CloseReason::TransportFailed);
            close(&session, reason).await;
            // Closing the session closes the queue; let the writer finish the socket.
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
            reason
        }
        result = &mut writer => {
            reader.abort();
            let reason = result.ok().flatten().unwrap_or(CloseReason::ClientClosed);
            close(&session, reason).await;
            reason
        }
    };

    info!(
        connection = %connection_id,
        session = %session.id(),
        reason = reason.as_str(),
        "Session ended"
    );
}

async fn close(session: &SessionHandle, reason: CloseReason) {
    if let Err(err) = session.close(reason).await {
        debug!(session = %session.id(), error = %err, "Close not submitted");
    }
}

/// Forward inbound intents until the client leaves or goes silent.
async fn read_loop(
    mut intents: Box<dyn IntentStream>,
    session: SessionHandle,
    heartbeat_timeout: Duration,
) -> CloseReason {
    loop {
        let Ok(next) = tokio::time::timeout(heartbeat_timeout, intents.recv()).await else {
            info!(session = %session.id(), "Heartbeat timeout");
            return CloseReason::IdleTimeout;
        };

        let submitted = match next {
            Ok(Some(Inbound::Intent(intent))) => {
                metrics::record_intent(intent.kind().as_str());
                session.submit(intent).await
            }
            Ok(Some(Inbound::Heartbeat)) => {
                trace!(session = %session.id(), "Heartbeat");
                Ok(())
            }
            Ok(None) => return CloseReason::ClientClosed,
            Err(TransportError::Protocol(err)) => {
                debug!(session = %session.id(), error = %err, "Undecodable frame");
                metrics::record_error("protocol");
                session
                    .reject(None, HubError::InvalidMessage("malformed frame"))
                    .await
            }
            Err(err) => {
                debug!(session = %session.id(), error = %err, "Receive failed");
                return CloseReason::TransportFailed;
            }
        };

        if submitted.is_err() {
            return CloseReason::Shutdown;
        }
    }
}

/// Drain the outbound queue onto the wire.
///
/// Returns `None` when the hub closed the queue, the reason otherwise.
async fn write_loop(
    mut events: Box<dyn EventSink>,
    mut queue: QueueReceiver,
    config: SessionConfig,
) -> Option<CloseReason> {
    let flag = queue.sender();

    while let Some(event) = queue.recv().await {
        if let Err(err) = send_with_retry(events.as_mut(), &event, &flag, &config).await {
            debug!(error = %err, event = event.name(), "Send failed");
            metrics::record_error("send");
            return Some(CloseReason::TransportFailed);
        }
        metrics::record_event(event.name());
    }

    if let Err(err) = events.close().await {
        debug!(error = %err, "Close failed");
    }
    None
}

async fn send_with_retry(
    events: &mut dyn EventSink,
    event: &ServerEvent,
    flag: &QueueSender,
    config: &SessionConfig,
) -> Result<(), TransportError> {
    let mut attempt = 0;
    loop {
        match events.send(event).await {
            Ok(()) => return Ok(()),
            Err(TransportError::Protocol(err)) => {
                // Resending cannot help an event that does not encode.
                warn!(error = %err, event = event.name(), "Event not encodable, skipped");
                metrics::record_error("encode");
                return Ok(());
            }
            Err(err) if attempt < config.send_retries && events.is_open() => {
                attempt += 1;
                flag.mark_degraded();
                debug!(error = %err, attempt, "Retrying send");
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{Hub, HubConfig, HubFact, InMemoryDirectory, NullMessageStore};
    use chorus_protocol::{ClientIntent, Encoding, Frame};
    use chorus_transport::{memory_pair, MemoryClient};
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    fn test_config() -> SessionConfig {
        SessionConfig {
            heartbeat_timeout: Duration::from_secs(30),
            send_retries: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }

    fn spawn_hub() -> HubHandle {
        Hub::spawn(
            HubConfig::default(),
            Arc::new(InMemoryDirectory::new(true)),
            Arc::new(NullMessageStore),
        )
    }

    fn connect(hub: &HubHandle, user: &str, config: SessionConfig) -> (MemoryClient, JoinHandle<()>) {
        let (connection, client) = memory_pair(Encoding::Json);
        let task = tokio::spawn(run_session(
            Box::new(connection),
            user.to_string(),
            hub.clone(),
            config,
        ));
        (client, task)
    }

    async fn next_named(client: &mut MemoryClient, name: &str) -> ServerEvent {
        loop {
            let event = client.recv().await.expect("connection closed");
            if event.name() == name {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_session() {
        let hub = spawn_hub();
        let (mut client, _task) = connect(&hub, "alice", test_config());

        let connected = client.recv().await.unwrap();
        assert_eq!(connected.name(), "connected");

        client.send(&ClientIntent::join("general")).unwrap();
        next_named(&mut client, "channel_joined").await;

        client.send(&ClientIntent::Ping).unwrap();
        next_named(&mut client, "pong").await;
    }

    #[tokio::test]
    async fn test_chat_between_two_sessions() {
        let hub = spawn_hub();
        let (mut alice, _a) = connect(&hub, "alice", test_config());
        let (mut bob, _b) = connect(&hub, "bob", test_config());

        alice.send(&ClientIntent::join("general")).unwrap();
        next_named(&mut alice, "channel_joined").await;
        bob.send(&ClientIntent::join("general")).unwrap();
        next_named(&mut bob, "channel_joined").await;

        alice.send(&ClientIntent::send("general", "hi")).unwrap();
        let event = next_named(&mut bob, "message_sent").await;
        match event.payload {
            EventPayload::MessageSent(message) => {
                assert_eq!(message.content, "hi");
                assert_eq!(message.user_id, "alice");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let hub = spawn_hub();
        let (mut client, _task) = connect(&hub, "alice", test_config());
        next_named(&mut client, "connected").await;

        client.send_frame(Frame::Text("{not json".into())).unwrap();
        let error = next_named(&mut client, "error").await;
        match error.payload {
            EventPayload::Error(reply) => assert_eq!(reply.kind, "InvalidMessage"),
            other => panic!("unexpected {other:?}"),
        }

        client.send(&ClientIntent::Ping).unwrap();
        next_named(&mut client, "pong").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_closes_session() {
        let hub = spawn_hub();
        let mut facts = hub.subscribe_facts();
        let config = SessionConfig {
            heartbeat_timeout: Duration::from_secs(2),
            ..test_config()
        };
        let (mut client, task) = connect(&hub, "alice", config);
        next_named(&mut client, "connected").await;

        task.await.unwrap();
        loop {
            if let HubFact::SessionClosed { reason, .. } = facts.recv().await.unwrap() {
                assert_eq!(reason, CloseReason::IdleTimeout);
                break;
            }
        }
        while client.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_session_alive() {
        let hub = spawn_hub();
        let config = SessionConfig {
            heartbeat_timeout: Duration::from_secs(2),
            ..test_config()
        };
        let (mut client, task) = connect(&hub, "alice", config);
        next_named(&mut client, "connected").await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            client.heartbeat().unwrap();
        }
        assert!(!task.is_finished());

        client.send(&ClientIntent::Ping).unwrap();
        next_named(&mut client, "pong").await;
    }

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let hub = spawn_hub();
        let mut facts = hub.subscribe_facts();
        let (mut client, task) = connect(&hub, "alice", test_config());
        next_named(&mut client, "connected").await;

        client.disconnect();
        task.await.unwrap();

        loop {
            if let HubFact::SessionClosed { user_id, reason, .. } = facts.recv().await.unwrap() {
                assert_eq!(user_id, "alice");
                assert_eq!(reason, CloseReason::ClientClosed);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_transient_send_failures_are_retried() {
        let hub = spawn_hub();
        let (connection, mut client) = memory_pair(Encoding::Json);
        client.fail_next_sends(2);
        let _task = tokio::spawn(run_session(
            Box::new(connection),
            "alice".to_string(),
            hub.clone(),
            test_config(),
        ));

        let connected = client.recv().await.unwrap();
        assert_eq!(connected.name(), "connected");
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_refused_session_receives_error() {
        let hub = Hub::spawn(
            HubConfig {
                max_sessions: 1,
                ..HubConfig::default()
            },
            Arc::new(InMemoryDirectory::new(true)),
            Arc::new(NullMessageStore),
        );
        let (mut first, _a) = connect(&hub, "alice", test_config());
        next_named(&mut first, "connected").await;

        let (mut second, task) = connect(&hub, "bob", test_config());
        let refusal = second.recv().await.unwrap();
        match refusal.payload {
            EventPayload::Error(reply) => assert_eq!(reply.kind, "CapacityReached"),
            other => panic!("unexpected {other:?}"),
        }
        task.await.unwrap();
        assert!(!second.is_open());
    }
}
