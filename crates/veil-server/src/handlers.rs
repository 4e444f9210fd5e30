//! HTTP, WebSocket and webhook handlers for the Veil server.
//!
//! Each WebSocket connection runs one task that owns its [`Session`]:
//! inbound frames are dispatched in order, outbound frames are drained
//! from the session queue, and the heartbeat closes silent peers.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::telegram::TelegramRelay;
use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use veil_core::{Heartbeat, Hub, InboundOutcome, Session};
use veil_protocol::{codec, ClientFrame, ProtocolError, ServerFrame};

/// Header carrying the webhook secret.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Close code sent when the server goes away.
const CLOSE_GOING_AWAY: u16 = 1001;

/// How long shutdown waits for sockets to leave their rooms.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared server state.
pub struct AppState {
    /// The instance hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    /// Relay adapter, for webhook verification and parsing.
    pub telegram: TelegramRelay,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, hub: Arc<Hub>, telegram: TelegramRelay) -> Self {
        Self {
            hub,
            config,
            telegram,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/webhook/telegram", post(telegram_webhook))
        .route("/webhook/health", get(webhook_health))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Veil server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    let app = router(Arc::clone(&state));
    let token = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing connections");
            token.cancel();
        })
        .await?;

    drain(&state.hub, DRAIN_TIMEOUT).await;
    state.hub.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Wait for open sessions to close, up to `timeout`.
async fn drain(hub: &Hub, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while hub.connection_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                connections = hub.connection_count(),
                "Shutdown timed out with connections still open"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    let status = if stats.store_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if stats.store_ready { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "instance": stats.instance_id,
            "connections": stats.connections,
            "rooms": stats.rooms,
            "store": stats.store_ready,
            "timestamp": veil_core::message::now_millis(),
        })),
    )
}

async fn webhook_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": veil_core::message::now_millis(),
    }))
}

/// Relay webhook: routes relayed messages into their rooms.
async fn telegram_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if !state.telegram.verify_secret(secret) {
        warn!("Webhook call with invalid secret");
        metrics::record_relay_inbound("forbidden");
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "Forbidden" }))).into_response();
    }

    let update: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let Some(inbound) = TelegramRelay::parse_update(update) else {
        debug!("Ignoring webhook update");
        metrics::record_relay_inbound("ignored");
        return Json(json!({ "ok": true })).into_response();
    };

    match state.hub.handle_inbound(inbound).await {
        Ok(InboundOutcome::Routed(message_id)) => {
            debug!(message = %message_id, "Webhook message routed");
            metrics::record_relay_inbound("routed");
            Json(json!({ "ok": true })).into_response()
        }
        Ok(InboundOutcome::Discarded) => {
            metrics::record_relay_inbound("discarded");
            Json(json!({ "ok": true })).into_response()
        }
        Err(e) => {
            error!(error = %e, "Webhook handling failed");
            metrics::record_relay_inbound("failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal error" })),
            )
                .into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if !state.hub.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }
    if state.hub.connection_count() >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let (mut session, mut outbound) = match state.hub.open_session() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = close(&mut sender, CLOSE_GOING_AWAY, &e.to_string()).await;
            return;
        }
    };
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = session.id().to_string();
    debug!(connection = %connection_id, "WebSocket connected");

    let period = state.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;

            () = state.shutdown.cancelled() => {
                let _ = close(&mut sender, CLOSE_GOING_AWAY, "Server shutting down").await;
                break;
            }

            Some(frame) = outbound.recv() => {
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&mut session, &text, &state).await;
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => dispatch(&mut session, &text, &state).await,
                        Err(_) => session.reject(&ProtocolError::Invalid(
                            "binary frame is not UTF-8".to_string(),
                        )),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        session.liveness_mut().mark_alive();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        session.liveness_mut().mark_alive();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                match session.liveness_mut().tick() {
                    Heartbeat::Idle => {}
                    Heartbeat::Ping => {
                        if sender.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    Heartbeat::Expired => {
                        info!(connection = %connection_id, "Heartbeat expired, closing");
                        metrics::record_error("heartbeat_timeout");
                        break;
                    }
                }
            }
        }
    }

    session.close().await;
    metrics::set_active_rooms(state.hub.router().room_count());
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode and dispatch one inbound text frame.
async fn dispatch(session: &mut Session, text: &str, state: &AppState) {
    let start = Instant::now();
    match codec::decode_client_with_limit(text, state.config.limits.max_frame_size) {
        Ok(frame) => {
            metrics::record_frame(frame.kind(), text.len(), "inbound");
            if matches!(frame, ClientFrame::Ack { .. }) {
                metrics::record_ack();
            }
            session.handle_frame(frame).await;
        }
        Err(e) => session.reject(&e),
    }
    metrics::record_dispatch(start.elapsed().as_secs_f64());
    metrics::set_active_rooms(state.hub.router().room_count());
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> Result<()> {
    let text = codec::encode(frame)?;
    metrics::record_frame(frame.kind(), text.len(), "outbound");
    if let ServerFrame::Error { code, .. } = frame {
        metrics::record_error(code.as_str());
    }
    sender.send(Message::Text(text)).await?;
    Ok(())
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) -> Result<()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex;
    use tower::ServiceExt;
    use veil_core::{HubConfig, MemoryStore, Relay, RelayError, Relayed};
    use veil_transport::{Connection, Connector, WebSocketConnector};

    #[derive(Default)]
    struct TestRelay {
        deleted: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Relay for TestRelay {
        async fn relay(&self, _room_id: &str, _payload: &str) -> Result<Relayed, RelayError> {
            Err(RelayError::NotConfigured)
        }

        async fn delete_relayed(&self, location: &str, relay_msg_id: &str) -> bool {
            self.deleted
                .lock()
                .unwrap()
                .push((location.to_string(), relay_msg_id.to_string()));
            true
        }
    }

    fn state_with(relay: Arc<TestRelay>) -> Arc<AppState> {
        state_with_config(relay, Config::default())
    }

    fn state_with_config(relay: Arc<TestRelay>, config: Config) -> Arc<AppState> {
        let hub = Arc::new(Hub::new(
            Arc::new(MemoryStore::new()),
            relay,
            HubConfig::default(),
        ));
        let telegram = TelegramRelay::new(&RelayConfig {
            api_base: "http://127.0.0.1:9".to_string(),
            bot_token: String::new(),
            chat_id: String::new(),
            webhook_url: String::new(),
            webhook_secret: "s3cret".to_string(),
        });
        Arc::new(AppState::new(config, hub, telegram))
    }

    fn webhook(secret: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook/telegram")
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header(SECRET_HEADER, secret);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn relayed_update(room: &str) -> Value {
        json!({
            "update_id": 1,
            "message": {
                "message_id": 55,
                "date": 1_700_000_000u64,
                "chat": { "id": -100 },
                "text": json!({ "r": room, "p": "cipher" }).to_string()
            }
        })
    }

    async fn body_json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = state_with(Arc::new(TestRelay::default()));
        let resp = router(state.clone())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["instance"], state.hub.instance_id());
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["rooms"], 0);
        assert_eq!(parsed["store"], true);
    }

    #[tokio::test]
    async fn test_health_reports_store_outage() {
        let state = state_with(Arc::new(TestRelay::default()));
        state.hub.set_store_ready(false);
        let resp = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["status"], "degraded");
    }

    #[tokio::test]
    async fn test_webhook_health() {
        let state = state_with(Arc::new(TestRelay::default()));
        let resp = router(state)
            .oneshot(
                Request::builder()
                    .uri("/webhook/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert!(parsed["timestamp"].is_number());
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_secret() {
        let state = state_with(Arc::new(TestRelay::default()));
        for secret in [None, Some("wrong")] {
            let resp = router(state.clone())
                .oneshot(webhook(secret, relayed_update("R-1")))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            assert_eq!(body_json(resp).await["error"], "Forbidden");
        }
    }

    #[tokio::test]
    async fn test_webhook_ignores_foreign_updates() {
        let state = state_with(Arc::new(TestRelay::default()));
        let resp = router(state)
            .oneshot(webhook(
                Some("s3cret"),
                json!({ "update_id": 2, "message": { "message_id": 1, "date": 1, "chat": { "id": 5 }, "text": "hi" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["ok"], true);
    }

    #[tokio::test]
    async fn test_webhook_for_dead_room_deletes() {
        let relay = Arc::new(TestRelay::default());
        let state = state_with(relay.clone());
        let resp = router(state)
            .oneshot(webhook(Some("s3cret"), relayed_update("GONE-1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            *relay.deleted.lock().unwrap(),
            vec![("-100".to_string(), "55".to_string())]
        );
    }

    #[tokio::test]
    async fn test_webhook_routes_into_live_room() {
        let relay = Arc::new(TestRelay::default());
        let state = state_with(relay.clone());

        let (mut session, mut rx) = state.hub.open_session().unwrap();
        session.handle_frame(ClientFrame::join("LIVE-1", None, None)).await;
        assert!(matches!(rx.recv().await, Some(ServerFrame::Joined { .. })));

        let resp = router(state.clone())
            .oneshot(webhook(Some("s3cret"), relayed_update("LIVE-1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            ServerFrame::Message {
                room,
                payload,
                timestamp,
                ..
            } => {
                assert_eq!(room, "LIVE-1");
                assert_eq!(payload, "cipher");
                assert_eq!(timestamp, Some(1_700_000_000_000));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(relay.deleted.lock().unwrap().is_empty());
        session.close().await;
    }

    async fn recv_frame(conn: &mut Box<dyn Connection>) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(2), conn.recv())
            .await
            .expect("timed out")
            .unwrap()
            .expect("closed")
    }

    #[tokio::test]
    async fn test_websocket_end_to_end() {
        let state = state_with(Arc::new(TestRelay::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let connector = WebSocketConnector::to_url(format!("ws://{addr}/ws"));
        let mut alice = connector.connect().await.unwrap();
        let mut bob = connector.connect().await.unwrap();

        alice.send(&ClientFrame::join("METEOR-7291", None, None)).await.unwrap();
        let ServerFrame::Joined {
            identity: alice_id,
            participants,
            ..
        } = recv_frame(&mut alice).await
        else {
            panic!("expected joined");
        };
        assert!(participants.is_empty());

        bob.send(&ClientFrame::join("METEOR-7291", None, None)).await.unwrap();
        let ServerFrame::Joined { participants, .. } = recv_frame(&mut bob).await else {
            panic!("expected joined");
        };
        assert_eq!(participants, vec![alice_id]);
        assert!(matches!(
            recv_frame(&mut alice).await,
            ServerFrame::UserJoined { .. }
        ));

        alice
            .send(&ClientFrame::message("METEOR-7291", "P"))
            .await
            .unwrap();
        match recv_frame(&mut bob).await {
            ServerFrame::Message { payload, .. } => assert_eq!(payload, "P"),
            other => panic!("unexpected frame {other:?}"),
        }

        bob.send(&ClientFrame::ping()).await.unwrap();
        assert_eq!(recv_frame(&mut bob).await, ServerFrame::pong());

        alice.close().await.unwrap();
        assert!(matches!(
            recv_frame(&mut bob).await,
            ServerFrame::UserLeft { .. }
        ));
        assert_eq!(state.hub.router().subscriber_count("METEOR-7291"), 1);
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped_by_heartbeat() {
        let mut config = Config::default();
        config.heartbeat.interval_ms = 50;
        config.heartbeat.missed_pongs = 2;
        let state = state_with_config(Arc::new(TestRelay::default()), config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let connector = WebSocketConnector::to_url(format!("ws://{addr}/ws"));
        let mut silent = connector.connect().await.unwrap();
        let mut bob = connector.connect().await.unwrap();

        silent.send(&ClientFrame::join("QUIET-1", None, None)).await.unwrap();
        let ServerFrame::Joined { identity: silent_id, .. } = recv_frame(&mut silent).await else {
            panic!("expected joined");
        };
        bob.send(&ClientFrame::join("QUIET-1", None, None)).await.unwrap();
        let ServerFrame::Joined { identity: bob_id, .. } = recv_frame(&mut bob).await else {
            panic!("expected joined");
        };

        // Pongs are only sent from recv, so the silent client never answers.
        match recv_frame(&mut bob).await {
            ServerFrame::UserLeft { identity, .. } => assert_eq!(identity, silent_id),
            other => panic!("unexpected frame {other:?}"),
        }

        assert_eq!(
            state.hub.presence().participants("QUIET-1").await.unwrap(),
            vec![bob_id]
        );
        assert_eq!(state.hub.router().subscriber_count("QUIET-1"), 1);

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match silent.recv().await {
                    Ok(Some(ServerFrame::UserJoined { .. })) => continue,
                    Ok(Some(other)) => panic!("unexpected frame {other:?}"),
                    Ok(None) | Err(_) => break,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "socket stayed open after heartbeat expiry");
        assert!(!silent.is_open());

        bob.close().await.unwrap();
    }
}
