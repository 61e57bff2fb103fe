//! Connection acceptor, session registry, heartbeat loop, and graceful
//! shutdown.
//!
//! Grounded in `myagent/ws/server.py`'s `AgentWebSocketServer`
//! (`handle_connection`/`_handle_message`/`_cleanup_connection`/
//! `_heartbeat_loop`/`shutdown`) and in the teacher's `server.rs` Router +
//! `ws.rs` connection loop (axum `WebSocketUpgrade`, `tokio::select!` over
//! the split socket).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{State, WebSocketUpgrade};
use axum::extract::ws::{Message, WebSocket};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use futures::StreamExt;
use plansolve_core::{
    agent_events, create_event, system_events, user_events, ConfirmationResponse, ConnectionId,
    InboundMessage, SessionId,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::retry::STANDARD_RETRY_CONFIG;
use crate::session::{build_session, AgentSession, SessionFactory};
use crate::transport::WsTransport;

pub struct WebSocketServer {
    config: GatewayConfig,
    factory: Arc<dyn SessionFactory>,
    sessions: DashMap<SessionId, Arc<AgentSession>>,
    connections: DashMap<ConnectionId, HashSet<SessionId>>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl WebSocketServer {
    pub fn new(config: GatewayConfig, factory: Arc<dyn SessionFactory>) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            sessions: DashMap::new(),
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    pub fn status(&self) -> serde_json::Value {
        json!({
            "active_sessions": self.sessions.len(),
            "active_connections": self.connections.len(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
        })
    }

    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let bind_addr: SocketAddr =
            format!("{}:{}", self.config.bind.to_addr(), self.config.port).parse()?;

        let heartbeat = Arc::clone(&self);
        tokio::spawn(async move { heartbeat.heartbeat_loop().await });

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
            .with_state(self.clone());

        info!("plan/solve gateway listening on {bind_addr}");
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    /// Stops accepting new work and closes every open session (spec §7.3).
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.sessions.iter() {
            entry.value().close().await;
        }
        self.sessions.clear();
        self.connections.clear();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.config.heartbeat_interval_secs);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let payload = json!({
                "active_sessions": self.sessions.len(),
                "uptime_secs": self.started_at.elapsed().as_secs(),
            });
            for entry in self.sessions.iter() {
                let event = create_event(system_events::HEARTBEAT)
                    .with_session(entry.key().as_str())
                    .with_content(payload.clone());
                entry.value().emit_system(event).await;
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: WebSocket) {
        let connection_id = ConnectionId::generate();
        self.connections.insert(connection_id.clone(), HashSet::new());

        let (ws_tx, mut ws_rx) = socket.split();
        let transport = WsTransport::new(ws_tx);
        let _ = transport
            .send_direct(
                &create_event(system_events::CONNECTED)
                    .with_metadata(json!({ "connection_id": connection_id.as_str() })),
            )
            .await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.clone().handle_text_message(&connection_id, transport.clone(), text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(connection = %connection_id, error = %e, "websocket error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        transport.mark_closed();
        self.cleanup_connection(&connection_id).await;
    }

    async fn handle_text_message(
        self: Arc<Self>,
        connection_id: &ConnectionId,
        transport: Arc<WsTransport>,
        text: String,
    ) {
        let message: InboundMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                let _ = transport
                    .send_direct(
                        &create_event(system_events::ERROR)
                            .with_content(json!({ "error": format!("invalid message: {e}") })),
                    )
                    .await;
                return;
            }
        };

        match message.event.as_str() {
            user_events::CREATE_SESSION => {
                self.create_session(connection_id, transport, message).await;
            }
            user_events::MESSAGE => {
                self.dispatch_to_session(&message, |session, content| async move {
                    let question = content
                        .get("question")
                        .or_else(|| content.get("content"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if let Some(tasks) = content.get("tasks").and_then(|v| v.as_array()) {
                        session.execute_direct(tasks.clone()).await;
                    } else {
                        session.execute_streaming(question).await;
                    }
                })
                .await;
            }
            user_events::RESPONSE => {
                let Some(step_id) = message.step_id.clone() else {
                    let _ = transport
                        .send_direct(&create_event(system_events::ERROR).with_content(
                            json!({ "error": "user.response requires step_id" }),
                        ))
                        .await;
                    return;
                };
                self.dispatch_to_session(&message, move |session, content| async move {
                    let response: ConfirmationResponse =
                        serde_json::from_value(content).unwrap_or_default();
                    if let Err(e) = session.handle_user_response(&step_id, response).await {
                        session
                            .emit_system(
                                create_event(agent_events::ERROR)
                                    .with_content(json!({ "error": e.to_string() })),
                            )
                            .await;
                    }
                })
                .await;
            }
            user_events::CANCEL => {
                self.dispatch_to_session(&message, |session, _content| async move {
                    session.cancel().await
                })
                .await;
            }
            other => {
                let _ = transport
                    .send_direct(
                        &create_event(system_events::ERROR)
                            .with_content(json!({ "error": format!("unknown event: {other}") })),
                    )
                    .await;
            }
        }
    }

    async fn create_session(
        self: &Arc<Self>,
        connection_id: &ConnectionId,
        transport: Arc<WsTransport>,
        _message: InboundMessage,
    ) {
        let session_id = SessionId::generate();
        let (session, _agent) = build_session(
            session_id.clone(),
            connection_id.clone(),
            self.factory.as_ref(),
            transport,
            &self.config,
            STANDARD_RETRY_CONFIG,
        )
        .await;

        self.sessions.insert(session_id.clone(), session.clone());
        self.connections
            .entry(connection_id.clone())
            .or_default()
            .insert(session_id.clone());

        session
            .emit_system(
                create_event(agent_events::SESSION_CREATED)
                    .with_content(json!({ "session_id": session_id.as_str() })),
            )
            .await;
        info!(
            session = %session_id,
            active = self.sessions.len(),
            "session created"
        );
    }

    async fn dispatch_to_session<F, Fut>(&self, message: &InboundMessage, action: F)
    where
        F: FnOnce(Arc<AgentSession>, serde_json::Value) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let Some(session_id) = message.session_id.as_deref().map(SessionId::new) else {
            return;
        };
        let Some(session) = self.sessions.get(&session_id).map(|e| e.value().clone()) else {
            warn!(session = %session_id, "message for unknown session");
            return;
        };
        let content = message.content.clone().unwrap_or_else(|| json!({}));
        action(session, content).await;
    }

    async fn cleanup_connection(&self, connection_id: &ConnectionId) {
        if let Some((_, session_ids)) = self.connections.remove(connection_id) {
            for session_id in session_ids {
                if let Some((_, session)) = self.sessions.remove(&session_id) {
                    session.close().await;
                }
            }
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<WebSocketServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| server.handle_connection(socket))
}

async fn health_handler(State(server): State<Arc<WebSocketServer>>) -> impl IntoResponse {
    Json(server.status())
}
