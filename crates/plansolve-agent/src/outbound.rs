//! Per-connection single-writer outbound channel with bounded backpressure
//! and time-windowed coalescing of high-frequency event types.
//!
//! Grounded in `myagent/ws/outbound.py`: a bounded queue drained by exactly
//! one writer task, plus a side buffer for designated event types keyed by
//! `(event_type, session_id)` that collapses bursts into one flush per
//! window.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plansolve_core::OutboundEvent;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Abstraction over "the thing this channel writes single-threaded to".
/// The gateway crate implements this over an actual WebSocket sink; tests
/// implement it over an in-memory recorder.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, event: &OutboundEvent) -> Result<(), String>;
    fn is_closed(&self) -> bool;
}

#[derive(Clone, Debug)]
pub struct OutboundChannelConfig {
    pub max_queue_size: usize,
    pub coalesce_window_ms: u64,
    pub coalesce_events: HashSet<String>,
    pub name: String,
}

impl Default for OutboundChannelConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            coalesce_window_ms: 75,
            coalesce_events: plansolve_core::default_coalesce_events(),
            name: "outbound".to_string(),
        }
    }
}

type CoalesceKey = (String, String);
type CoalesceBuffers = Arc<Mutex<HashMap<CoalesceKey, OutboundEvent>>>;

/// Per-connection outbound channel. `enqueue` is the only producer-facing
/// entry point; a single writer task owns every call to the transport.
pub struct OutboundChannel<T: Transport> {
    transport: Arc<T>,
    config: OutboundChannelConfig,
    tx: mpsc::Sender<OutboundEvent>,
    rx: Mutex<Option<mpsc::Receiver<OutboundEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    coalesce_buffers: CoalesceBuffers,
    coalesce_pending: Arc<AtomicBool>,
}

impl<T: Transport> OutboundChannel<T> {
    pub fn new(transport: Arc<T>, config: OutboundChannelConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.max_queue_size.max(1));
        Arc::new(Self {
            transport,
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            writer: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            coalesce_buffers: Arc::new(Mutex::new(HashMap::new())),
            coalesce_pending: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Idempotently launches the writer task.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.writer.lock().await;
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Some(mut rx) = self.rx.lock().await.take() else {
            return;
        };
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if this.closed.load(Ordering::Acquire) {
                    break;
                }
                if this.transport.is_closed() {
                    tracing::debug!(channel = %this.config.name, "websocket closed; dropping outbound event");
                    continue;
                }
                if let Err(err) = this.transport.send(&event).await {
                    tracing::error!(channel = %this.config.name, error = %err, "outbound send failed");
                }
            }
        });
        *guard = Some(handle);
    }

    /// Enqueue an event. Suspends when the queue is full (backpressure);
    /// never drops silently unless the channel is closed.
    pub async fn enqueue(&self, event: OutboundEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let eligible = self.config.coalesce_window_ms > 0
            && self.config.coalesce_events.contains(&event.event)
            && event.session_id.as_deref().is_some_and(|s| !s.is_empty());

        if eligible {
            let key = (
                event.event.clone(),
                event.session_id.clone().unwrap_or_default(),
            );
            {
                let mut buffers = self.coalesce_buffers.lock().await;
                buffers.insert(key, event);
            }
            if self
                .coalesce_pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.spawn_flush();
            }
            return;
        }

        if self.tx.send(event).await.is_err() {
            tracing::debug!(channel = %self.config.name, "failed to enqueue outbound event: channel closed");
        }
    }

    fn spawn_flush(&self) {
        let buffers = Arc::clone(&self.coalesce_buffers);
        let tx = self.tx.clone();
        let window = Duration::from_millis(self.config.coalesce_window_ms);
        let closed = Arc::clone(&self.closed);
        let pending = Arc::clone(&self.coalesce_pending);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if closed.load(Ordering::Acquire) {
                pending.store(false, Ordering::Release);
                return;
            }
            let to_flush: Vec<OutboundEvent> = {
                let mut guard = buffers.lock().await;
                guard.drain().map(|(_, v)| v).collect()
            };
            for event in to_flush {
                if tx.send(event).await.is_err() {
                    tracing::debug!("failed to flush coalesced event: channel closed");
                }
            }
            pending.store(false, Ordering::Release);
        });
    }

    /// Stops accepting new events, cancels the writer, best-effort drains
    /// the queue, and drops any buffered coalesced events. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.writer.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.coalesce_buffers.lock().await.clear();
        if let Some(mut rx) = self.rx.lock().await.take() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plansolve_core::create_event;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingTransport {
        sent: TokioMutex<Vec<OutboundEvent>>,
        closed: AtomicBool,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: TokioMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        async fn events(&self) -> Vec<OutboundEvent> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, event: &OutboundEvent) -> Result<(), String> {
            self.sent.lock().await.push(event.clone());
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    #[tokio::test]
    async fn preserves_fifo_order_for_noncoalesced_events() {
        let transport = RecordingTransport::new();
        let channel = OutboundChannel::new(transport.clone(), OutboundChannelConfig::default());
        channel.start().await;

        for i in 0..5 {
            channel
                .enqueue(create_event("plan.start").with_content(serde_json::json!(i)))
                .await;
        }
        // Allow the writer task to drain.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = transport.events().await;
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.content, Some(serde_json::json!(i)));
        }
    }

    #[tokio::test]
    async fn coalesces_high_frequency_events_within_window() {
        let transport = RecordingTransport::new();
        let config = OutboundChannelConfig {
            coalesce_window_ms: 30,
            ..Default::default()
        };
        let channel = OutboundChannel::new(transport.clone(), config);
        channel.start().await;

        for i in 0..10 {
            channel
                .enqueue(
                    create_event("agent.partial_answer")
                        .with_session("s1")
                        .with_content(serde_json::json!(i)),
                )
                .await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        let events = transport.events().await;
        assert_eq!(events.len(), 1, "ten rapid partials should collapse to one");
        assert_eq!(events[0].content, Some(serde_json::json!(9)));
    }

    #[tokio::test]
    async fn does_not_coalesce_across_sessions() {
        let transport = RecordingTransport::new();
        let config = OutboundChannelConfig {
            coalesce_window_ms: 30,
            ..Default::default()
        };
        let channel = OutboundChannel::new(transport.clone(), config);
        channel.start().await;

        channel
            .enqueue(create_event("agent.partial_answer").with_session("s1"))
            .await;
        channel
            .enqueue(create_event("agent.partial_answer").with_session("s2"))
            .await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let events = transport.events().await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_the_writer() {
        let transport = RecordingTransport::new();
        let channel = OutboundChannel::new(transport.clone(), OutboundChannelConfig::default());
        channel.start().await;
        channel.close().await;
        channel.close().await;

        channel.enqueue(create_event("plan.start")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.events().await.is_empty());
    }
}
