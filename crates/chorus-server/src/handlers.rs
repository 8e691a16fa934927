//! HTTP and WebSocket handlers for the Chorus server.
//!
//! Connections authenticate before the upgrade; an accepted socket is handed
//! to [`crate::session::run_session`].

use crate::config::Config;
use crate::metrics;
use crate::session::{run_session, SessionConfig};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chorus_core::{
    Hub, HubError, HubHandle, IdentityResolver, InMemoryMessageStore, MessageRecord,
};
use chorus_protocol::events::MemberPresence;
use chorus_protocol::{ChannelId, Encoding};
use chorus_transport::{WebSocketConfig, WebSocketConnection};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The running hub.
    pub hub: HubHandle,
    /// Resolves connection tokens.
    pub identity: Arc<dyn IdentityResolver>,
    /// Messages accepted by the hub.
    pub history: Arc<InMemoryMessageStore>,
    /// Server configuration.
    pub config: Config,
    encoding: Encoding,
}

impl AppState {
    /// Spawn the hub and its in-memory collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured encoding is unknown.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let encoding = config.encoding()?;
        let directory = Arc::new(config.directory());
        let history = Arc::new(InMemoryMessageStore::new(config.limits.max_history_per_channel));
        let hub = Hub::spawn(config.hub_config(), directory.clone(), history.clone());

        Ok(Arc::new(Self {
            hub,
            identity: directory,
            history,
            config,
            encoding,
        }))
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/channels/:id/members", get(members_handler))
        .route("/api/v1/channels/:id/messages", get(messages_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::new(config.clone())?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        } else {
            metrics::spawn_hub_sampler(
                state.hub.clone(),
                Duration::from_millis(config.metrics.sample_interval_ms),
            );
        }
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Chorus server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener, then shut the hub down.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(Arc::clone(&state));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Server error")?;

    info!("Closing sessions");
    if let Err(err) = state.hub.shutdown().await {
        debug!(error = %err, "Hub already stopped");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.hub.snapshot();
    Json(serde_json::json!({
        "status": if state.hub.is_running() { "ok" } else { "stopping" },
        "version": env!("CARGO_PKG_VERSION"),
        "stats": snapshot.stats,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelMembers {
    channel_id: ChannelId,
    sessions: usize,
    members: Vec<MemberPresence>,
}

/// Read-only membership view from the latest snapshot.
async fn members_handler(
    Path(channel_id): Path<ChannelId>,
    State(state): State<Arc<AppState>>,
) -> Json<ChannelMembers> {
    let snapshot = state.hub.snapshot();
    Json(ChannelMembers {
        sessions: snapshot.members_of(&channel_id).len(),
        members: snapshot.channel_users(&channel_id),
        channel_id,
    })
}

async fn messages_handler(
    Path(channel_id): Path<ChannelId>,
    State(state): State<Arc<AppState>>,
) -> Json<Vec<MessageRecord>> {
    Json(state.history.history(&channel_id))
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
    encoding: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

fn refuse(status: StatusCode, err: &HubError) -> Response {
    (status, Json(err.to_reply(None))).into_response()
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(token) = params.token.or_else(|| bearer_token(&headers)) else {
        metrics::record_error("auth_missing");
        return refuse(StatusCode::UNAUTHORIZED, &HubError::AuthRequired);
    };

    let user_id = match state.identity.resolve(&token).await {
        Ok(user_id) => user_id,
        Err(err) => {
            warn!(remote = %remote, error = %err, "Authentication failed");
            metrics::record_error("auth_failed");
            return refuse(StatusCode::UNAUTHORIZED, &HubError::AuthRequired);
        }
    };

    let encoding = match params.encoding.as_deref() {
        None => state.encoding,
        Some(name) => match Encoding::from_name(name) {
            Some(encoding) => encoding,
            None => {
                return (StatusCode::BAD_REQUEST, format!("Unknown encoding: {name}"))
                    .into_response()
            }
        },
    };

    let ws_config = WebSocketConfig {
        max_message_size: state.config.limits.max_message_size,
        encoding,
    };
    debug!(remote = %remote, user = %user_id, ?encoding, "Upgrading connection");

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            let connection = WebSocketConnection::new(socket, ws_config).with_remote_addr(remote);
            let session_config = SessionConfig::from(&state.config);
            run_session(Box::new(connection), user_id, state.hub.clone(), session_config).await;
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserEntry;
    use chorus_protocol::{codec, ClientIntent, EventPayload, Frame, ServerEvent};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.metrics.enabled = false;
        for (token, user_id) in [("alice-token", "alice"), ("bob-token", "bob")] {
            config.directory.users.push(UserEntry {
                token: token.into(),
                user_id: user_id.into(),
            });
        }
        config
    }

    async fn start() -> (SocketAddr, Arc<AppState>) {
        let state = AppState::new(test_config()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::clone(&state), std::future::pending()));
        (addr, state)
    }

    async fn send(client: &mut Client, intent: &ClientIntent, encoding: Encoding) {
        let frame = codec::encode(intent, encoding).unwrap();
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
        };
        client.send(message).await.unwrap();
    }

    async fn next_named(client: &mut Client, name: &str) -> ServerEvent {
        loop {
            let frame = match client.next().await.unwrap().unwrap() {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(data) => Frame::Binary(data.into()),
                _ => continue,
            };
            let event: ServerEvent = codec::decode(&frame).unwrap();
            if event.name() == name {
                return event;
            }
        }
    }

    fn refused_status(err: WsError) -> u16 {
        match err {
            WsError::Http(response) => response.status().as_u16(),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_upgrade_is_refused() {
        let (addr, state) = start().await;

        let missing = connect_async(format!("ws://{addr}/ws")).await.unwrap_err();
        assert_eq!(refused_status(missing), 401);

        let unknown = connect_async(format!("ws://{addr}/ws?token=nope"))
            .await
            .unwrap_err();
        assert_eq!(refused_status(unknown), 401);

        let bad_encoding = connect_async(format!("ws://{addr}/ws?token=alice-token&encoding=xml"))
            .await
            .unwrap_err();
        assert_eq!(refused_status(bad_encoding), 400);

        assert_eq!(state.hub.snapshot().stats.sessions, 0);
    }

    #[tokio::test]
    async fn test_websocket_chat_end_to_end() {
        let (addr, state) = start().await;

        let (mut alice, _) = connect_async(format!("ws://{addr}/ws?token=alice-token"))
            .await
            .unwrap();

        let mut request = format!("ws://{addr}/ws?encoding=msgpack")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("Authorization", "Bearer bob-token".parse().unwrap());
        let (mut bob, _) = connect_async(request).await.unwrap();

        next_named(&mut alice, "connected").await;
        next_named(&mut bob, "connected").await;

        send(&mut alice, &ClientIntent::join("general"), Encoding::Json).await;
        next_named(&mut alice, "channel_joined").await;
        send(&mut bob, &ClientIntent::join("general"), Encoding::MessagePack).await;
        next_named(&mut bob, "channel_joined").await;

        send(&mut alice, &ClientIntent::send("general", "hi"), Encoding::Json).await;
        let event = next_named(&mut bob, "message_sent").await;
        match event.payload {
            EventPayload::MessageSent(message) => {
                assert_eq!(message.user_id, "alice");
                assert_eq!(message.content, "hi");
            }
            other => panic!("unexpected {other:?}"),
        }

        // A ping round trip orders the check after the membership update.
        send(&mut bob, &ClientIntent::Ping, Encoding::MessagePack).await;
        next_named(&mut bob, "pong").await;

        let Json(members) =
            members_handler(Path("general".to_string()), State(Arc::clone(&state))).await;
        assert_eq!(members.sessions, 2);
        let users: Vec<_> = members.members.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(users, vec!["alice", "bob"]);

        let Json(health) = health_handler(State(Arc::clone(&state))).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["stats"]["sessions"], 2);
    }

    #[tokio::test]
    async fn test_malformed_frame_over_websocket() {
        let (addr, _state) = start().await;
        let (mut alice, _) = connect_async(format!("ws://{addr}/ws?token=alice-token"))
            .await
            .unwrap();
        next_named(&mut alice, "connected").await;

        alice
            .send(Message::Text("{\"type\":\"warp\"}".into()))
            .await
            .unwrap();
        let error = next_named(&mut alice, "error").await;
        assert!(matches!(error.payload, EventPayload::Error(reply) if reply.code == 1008));

        send(&mut alice, &ClientIntent::Ping, Encoding::Json).await;
        next_named(&mut alice, "pong").await;
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
    }
}
