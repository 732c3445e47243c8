//! Shared Document Server - real-time collaborative text surface
//!
//! A synchronization server for one shared document:
//! - Last-write-wins content updates with server-side attribution
//! - Reference-counted presence roster
//! - Axum with WebSocket, one JSON event per text frame
//! - Bounded per-connection outbound queues so slow clients never stall others

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

mod config;
mod sync;

use config::ServerConfig;
use sync::{
    protocol::{ServerMessage, SyncProtocol},
    LastEditor, Outbox, SyncHub,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Owner of the document, presence and connections
    hub: SyncHub,
    /// Transport settings
    config: ServerConfig,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            hub: SyncHub::new(config.hub_config()),
            config,
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    connections: usize,
    joined_connections: usize,
    participants: usize,
    revision: u64,
}

#[derive(Debug, Serialize)]
struct DocumentStateResponse {
    content: String,
    last_editor: Option<LastEditor>,
    participants: Vec<String>,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: stats.uptime_seconds,
        connections: stats.connections,
        joined_connections: stats.joined_connections,
        participants: stats.participants,
        revision: stats.revision,
    })
}

/// Current document and roster
async fn document_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.hub.snapshot();

    Json(DocumentStateResponse {
        content: snapshot.content,
        last_editor: snapshot.last_editor,
        participants: state.hub.presence(),
    })
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_size = state.config.max_message_size;
    ws.max_message_size(max_size)
        .max_frame_size(max_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (ws_sender, ws_receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4().to_string();

    let (outbox, rx) = Outbox::channel(state.config.outbound_queue_capacity);
    state.hub.connect(&connection_id, outbox);

    let mut send_task = tokio::spawn(write_loop(
        ws_sender,
        rx,
        state.config.heartbeat_interval,
        connection_id.clone(),
    ));
    let mut recv_task = tokio::spawn(read_loop(ws_receiver, state.clone(), connection_id.clone()));

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {}
    }

    // Dropping the outbox lets the writer flush and close the socket.
    state.hub.disconnect(&connection_id);
}

/// Forward queued events to the socket and keep the connection alive with pings
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
    heartbeat: Duration,
    connection_id: String,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match SyncProtocol::encode_server(&msg) {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            debug!("Socket write failed for {}", connection_id);
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to encode message for {}: {}", connection_id, e);
                    }
                }
            }
            _ = ticker.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!("Heartbeat failed for {}", connection_id);
                    return;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    debug!("Send task ended for connection {}", connection_id);
}

/// Feed inbound frames to the hub until the peer goes away or idles out
async fn read_loop(mut receiver: SplitStream<WebSocket>, state: Arc<AppState>, connection_id: String) {
    let idle_timeout = state.config.idle_timeout;

    loop {
        let frame = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!("Connection {} idle for {:?}, dropping", connection_id, idle_timeout);
                break;
            }
        };

        match frame {
            Message::Text(text) => state.hub.handle_frame(&connection_id, &text),
            Message::Binary(_) => state
                .hub
                .reject_frame(&connection_id, "binary frames are not supported"),
            Message::Close(_) => {
                info!("WebSocket closed by client: {}", connection_id);
                break;
            }
            // Pong is handled automatically
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    debug!("Receive task ended for connection {}", connection_id);
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/state", get(document_state))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Log panics that escape a handler; the runtime keeps the process alive.
/// Panics inside hub event handlers are caught and logged by the hub.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        if sync::hub::panic_is_contained() {
            return;
        }
        error!("Uncaught fault: {}", info);
    }));
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shared_doc_server=info,tower_http=info".into()),
        )
        .init();

    install_panic_hook();

    let config = ServerConfig::from_env().context("Failed to load configuration")?;
    let addr = config.addr();
    let identity_policy = config.identity_policy;
    let state = Arc::new(AppState::new(config));
    let app = build_router(state);

    info!("Shared document server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Identity policy: {:?}", identity_policy);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::net::SocketAddr;
    use sync::protocol::ClientMessage;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };
    use tower::ServiceExt;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server(config: ServerConfig) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, msg: ClientMessage) {
        let text = SyncProtocol::encode_client(&msg).unwrap();
        ws.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn next_event(ws: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = frame {
                return SyncProtocol::decode_server(&text).unwrap();
            }
        }
    }

    fn presence(list: &[&str]) -> ServerMessage {
        ServerMessage::PresenceUpdate {
            identities: list.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let state = Arc::new(AppState::new(ServerConfig::default()));
        let response = build_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connections"], 0);
    }

    #[tokio::test]
    async fn test_document_state_endpoint() {
        let state = Arc::new(AppState::new(ServerConfig::default()));
        let (outbox, _rx) = Outbox::channel(8);
        state.hub.connect("c1", outbox);
        state.hub.handle_message(
            "c1",
            ClientMessage::Join {
                identity: "alice".to_string(),
            },
        );
        state.hub.handle_message(
            "c1",
            ClientMessage::ContentChange {
                content: "Hello".to_string(),
                identity: "alice".to_string(),
            },
        );

        let response = build_router(state)
            .oneshot(Request::builder().uri("/api/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["content"], "Hello");
        assert_eq!(json["last_editor"]["identity"], "alice");
        assert_eq!(json["participants"], serde_json::json!(["alice"]));
    }

    #[tokio::test]
    async fn test_websocket_scenario() {
        let (addr, _state) = spawn_server(ServerConfig::default()).await;

        let mut a = connect(addr).await;
        send(&mut a, ClientMessage::Join { identity: "alice".into() }).await;
        assert!(matches!(next_event(&mut a).await, ServerMessage::InitialState(_)));
        assert_eq!(next_event(&mut a).await, presence(&["alice"]));

        let mut b = connect(addr).await;
        send(&mut b, ClientMessage::Join { identity: "bob".into() }).await;
        assert!(matches!(next_event(&mut b).await, ServerMessage::InitialState(_)));
        assert_eq!(next_event(&mut b).await, presence(&["alice", "bob"]));
        assert_eq!(next_event(&mut a).await, presence(&["alice", "bob"]));

        send(
            &mut a,
            ClientMessage::ContentChange {
                content: "Hello".into(),
                identity: "alice".into(),
            },
        )
        .await;
        let t1 = match next_event(&mut b).await {
            ServerMessage::ContentUpdate { content, last_editor } => {
                assert_eq!(content, "Hello");
                assert_eq!(last_editor.identity, "alice");
                last_editor.timestamp
            }
            other => panic!("unexpected event: {:?}", other),
        };

        send(
            &mut b,
            ClientMessage::ContentChange {
                content: "Hello World".into(),
                identity: "bob".into(),
            },
        )
        .await;
        // Alice's next event is Bob's change, not an echo of her own.
        match next_event(&mut a).await {
            ServerMessage::ContentUpdate { content, last_editor } => {
                assert_eq!(content, "Hello World");
                assert_eq!(last_editor.identity, "bob");
                assert!(last_editor.timestamp >= t1);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        b.close(None).await.unwrap();
        assert_eq!(next_event(&mut a).await, presence(&["alice"]));
    }

    #[tokio::test]
    async fn test_websocket_error_notice() {
        let (addr, state) = spawn_server(ServerConfig::default()).await;

        let mut a = connect(addr).await;
        send(&mut a, ClientMessage::Join { identity: "".into() }).await;

        match next_event(&mut a).await {
            ServerMessage::ErrorNotice { code, message } => {
                assert_eq!(code, sync::protocol::ErrorCode::InvalidIdentity);
                assert_eq!(message, "Username is required");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(state.hub.presence().is_empty());

        // The connection stays usable after the error.
        send(&mut a, ClientMessage::Ping { timestamp: 3 }).await;
        assert!(matches!(
            next_event(&mut a).await,
            ServerMessage::Pong { timestamp: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_idle_connection_is_dropped() {
        let config = ServerConfig {
            idle_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_secs(60),
            ..ServerConfig::default()
        };
        let (addr, state) = spawn_server(config).await;

        let mut idle = connect(addr).await;
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), idle.next())
                .await
                .expect("server never dropped the idle connection");
            match frame {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }

        assert_eq!(state.hub.stats().connections, 0);
    }
}
