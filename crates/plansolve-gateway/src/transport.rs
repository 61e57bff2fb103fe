//! Adapts an axum WebSocket sink to [`plansolve_agent::outbound::Transport`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use plansolve_agent::Transport;
use plansolve_core::OutboundEvent;
use tokio::sync::Mutex;

pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        })
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Sends one event directly, bypassing the outbound queue — used for
    /// the connection-open handshake, before any session exists to own a
    /// channel.
    pub async fn send_direct(&self, event: &OutboundEvent) -> Result<(), String> {
        self.send(event).await
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, event: &OutboundEvent) -> Result<(), String> {
        let text = serde_json::to_string(event).map_err(|e| e.to_string())?;
        let mut sink = self.sink.lock().await;
        match sink.send(Message::Text(text)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_closed();
                Err(e.to_string())
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
