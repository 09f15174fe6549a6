//! HTTP and WebSocket front end.
//!
//! Each accepted WebSocket is served by one task that reads protocol messages,
//! hands them to the [`SignalingHandler`] and writes the replies. Pushes from
//! the hub arrive on the connection's outbound queue and are written by the
//! same task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::handler::{SignalingHandler, DEFAULT_SESSION_TTL};
use crate::hub::{Hub, Link};
use crate::pin::{PinManager, PIN_EXPIRY};
use crate::protocol::{ServerMessage, SignalError};
use crate::session_id;
use crate::store::SessionStore;

/// How long [`ServerHandle::shutdown`] waits for open connections.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub allowed_origin: Option<String>,
    pub session_ttl: Duration,
    pub pin_ttl: Duration,
    /// Capacity of each connection's queue of pushed messages.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            allowed_origin: None,
            session_ttl: DEFAULT_SESSION_TTL,
            pin_ttl: PIN_EXPIRY,
            outbound_queue: 16,
        }
    }
}

/// Shared state passed to axum handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    handler: SignalingHandler,
    store: Arc<dyn SessionStore>,
    allowed_origin: Option<Arc<str>>,
    outbound_queue: usize,
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/session/", get(ws_handler))
        .route("/api/v1/ping/", get(ping_handler))
        .route("/api/v1/session/", get(new_session_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Handle returned by [`start`]; keeps the background tasks alive.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections, give in-flight requests a grace period and
    /// stop the background tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());

        let mut server = self.server;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Server task ended abnormally: {}", e),
            Err(_) => {
                warn!("Shutdown grace period elapsed, aborting");
                server.abort();
            }
        }

        self.dispatcher.abort();
        self.reaper.abort();
    }
}

/// Wire up the hub, PIN manager and handler around `store` and start serving.
pub async fn start(config: ServerConfig, store: Arc<dyn SessionStore>) -> Result<ServerHandle> {
    let (hub, dispatcher) = Hub::new(Arc::clone(&store));
    let dispatcher = tokio::spawn(dispatcher.run());

    let pins = Arc::new(PinManager::new(config.pin_ttl));
    let reaper = Arc::clone(&pins).spawn_reaper(config.pin_ttl);

    let handler = SignalingHandler::new(Arc::new(hub), pins, Arc::clone(&store), config.session_ttl);
    let state = AppState {
        handler,
        store,
        allowed_origin: config.allowed_origin.map(Arc::from),
        outbound_queue: config.outbound_queue,
    };

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "Signaling server listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let router = build_router(state);
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            error!("Server error: {}", e);
        }
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        server,
        dispatcher,
        reaper,
    })
}

/// Whether a WebSocket upgrade from `origin` is acceptable.
fn origin_allowed(allowed: Option<&str>, origin: Option<&str>) -> bool {
    match (allowed, origin) {
        (_, None) => false,
        (None, Some(origin)) => !origin.is_empty(),
        (Some(allowed), Some(origin)) => allowed == origin,
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !origin_allowed(state.allowed_origin.as_deref(), origin) {
        warn!(?origin, "Rejected WebSocket upgrade");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one client connection until it closes.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(state.outbound_queue);
    let link = Link::new(outbound_tx);
    let connection = link.id();
    info!(%connection, "New connection");

    let (mut writer, mut reader) = socket.split();

    loop {
        tokio::select! {
            // Pushes routed here by the hub
            Some(push) = outbound_rx.recv() => {
                if let Err(e) = send_message(&mut writer, &push).await {
                    warn!(%connection, "Failed to send push: {}", e);
                    break;
                }
            }

            frame = reader.next() => {
                let reply = match frame {
                    Some(Ok(Message::Text(text))) => {
                        state.handler.handle_text(&link, text.as_str()).await
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => state.handler.handle_text(&link, text).await,
                        Err(_) => ServerMessage::error(&SignalError::InvalidMessage(
                            "frame is not UTF-8".to_string(),
                        )),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%connection, "Connection closed");
                        break;
                    }
                    // Ping/pong are answered by axum
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(%connection, "Read error: {}", e);
                        break;
                    }
                };

                if let Err(e) = send_message(&mut writer, &reply).await {
                    warn!(%connection, "Failed to send reply: {}", e);
                    break;
                }
            }
        }
    }

    state.handler.disconnect(connection);
    info!(%connection, "Connection handler finished");
}

/// Send a message to the client.
async fn send_message(
    writer: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    writer.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Liveness probe.
async fn ping_handler() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

/// Hand out a fresh human readable session id.
async fn new_session_handler(State(state): State<AppState>) -> Json<Value> {
    let session_id = session_id::allocate(state.store.as_ref()).await;
    Json(json!({ "sessionId": session_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_test_server(allowed_origin: Option<&str>) -> ServerHandle {
        let config = ServerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            allowed_origin: allowed_origin.map(str::to_string),
            ..ServerConfig::default()
        };
        start(config, Arc::new(MemoryStore::new())).await.unwrap()
    }

    async fn connect(handle: &ServerHandle, origin: &'static str) -> Client {
        let url = format!("ws://{}/ws/v1/session/", handle.local_addr());
        let mut request = url.into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static(origin));
        let (client, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        client
    }

    async fn request(client: &mut Client, body: Value) -> Value {
        client
            .send(WsMessage::Text(body.to_string().into()))
            .await
            .unwrap();
        next_json(client).await
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[test]
    fn test_origin_allowed() {
        assert!(origin_allowed(None, Some("http://localhost:8080")));
        assert!(!origin_allowed(None, Some("")));
        assert!(!origin_allowed(None, None));
        assert!(origin_allowed(Some("https://a.example"), Some("https://a.example")));
        assert!(!origin_allowed(Some("https://a.example"), Some("https://b.example")));
        assert!(!origin_allowed(Some("https://a.example"), None));
    }

    #[tokio::test]
    async fn test_websocket_handshake() {
        let handle = start_test_server(None).await;
        let mut a = connect(&handle, "http://localhost").await;
        let mut b = connect(&handle, "http://localhost").await;

        let reply = request(
            &mut a,
            json!({"type": "offer", "payload": {"sessionId": "x", "offerSDP": "sdp-a", "publicKey": "pk-a"}}),
        )
        .await;
        assert_eq!(reply, json!({"type": "ok", "payload": {"message": "Ok"}}));

        let reply = request(
            &mut b,
            json!({"type": "get_offer", "payload": {"sessionId": "x"}}),
        )
        .await;
        assert_eq!(
            reply,
            json!({"type": "ok", "payload": {"offerSDP": "sdp-a", "publicKey": "pk-a"}})
        );

        let reply = request(
            &mut b,
            json!({"type": "answer", "payload": {"sessionId": "x", "answerSDP": "sdp-b", "publicKey": "pk-b"}}),
        )
        .await;
        assert_eq!(reply["type"], "ok");
        let pin = reply["payload"]["pin"].as_str().unwrap().to_string();
        assert_eq!(pin.len(), 6);

        let pushed = next_json(&mut a).await;
        assert_eq!(pushed, json!({"type": "confirm_connection", "payload": {}}));

        let reply = request(
            &mut a,
            json!({"type": "get_answer", "payload": {"sessionId": "x", "pin": pin}}),
        )
        .await;
        assert_eq!(reply["type"], "ok");
        assert_eq!(reply["payload"]["answerSDP"], "sdp-b");
        assert_eq!(reply["payload"]["publicKey"], "pk-b");

        let reply = request(
            &mut a,
            json!({"type": "get_answer", "payload": {"sessionId": "x", "pin": "not-a-pin"}}),
        )
        .await;
        assert_eq!(
            reply,
            json!({"type": "error", "payload": {"message": "invalid PIN"}})
        );

        // Protocol errors keep the connection open
        let reply = request(&mut a, json!({"type": "bogus", "payload": {}})).await;
        assert_eq!(reply["payload"]["message"], "unknown message type: bogus");
        a.send(WsMessage::Text("garbage".into())).await.unwrap();
        let reply = next_json(&mut a).await;
        assert_eq!(reply["type"], "error");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_releases_session() {
        let handle = start_test_server(None).await;
        let mut a = connect(&handle, "http://localhost").await;
        let mut b = connect(&handle, "http://localhost").await;

        request(
            &mut a,
            json!({"type": "offer", "payload": {"sessionId": "y", "offerSDP": "s", "publicKey": "k"}}),
        )
        .await;
        a.close(None).await.unwrap();
        drop(a);

        // Give the server a moment to notice
        let mut released = false;
        for _ in 0..50 {
            let reply = request(
                &mut b,
                json!({"type": "answer", "payload": {"sessionId": "y", "answerSDP": "s", "publicKey": "k"}}),
            )
            .await;
            if reply["payload"]["message"] == "peer connection not found" {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_origin_is_enforced() {
        let handle = start_test_server(Some("https://files.example.com")).await;
        let url = format!("ws://{}/ws/v1/session/", handle.local_addr());

        let mut request = url.clone().into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static("https://evil.example.com"));
        assert!(tokio_tungstenite::connect_async(request).await.is_err());

        let _client = connect(&handle, "https://files.example.com").await;

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let handle = start_test_server(None).await;
        let base = format!("http://{}", handle.local_addr());

        let pong: Value = reqwest::get(format!("{base}/api/v1/ping/"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(pong, json!({"message": "pong"}));

        let session: Value = reqwest::get(format!("{base}/api/v1/session/"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = session["sessionId"].as_str().unwrap();
        assert!(id.split_once('-').is_some());

        handle.shutdown().await;
    }
}
