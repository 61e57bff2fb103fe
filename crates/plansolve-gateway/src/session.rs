//! Binds one connection's agent lifecycle to its outbound channel.
//!
//! Grounded in `myagent/ws/session.py`'s `AgentSession`: a concurrent-run
//! guard around `execute_streaming`, and a session-close path that always
//! emits `agent.session_end`. Cancellation signals `cancel_plan()` first
//! (per `myagent/ws/plan_solver.py`'s cooperative cancel, letting
//! `plan.cancelled` reach the client) and only aborts the in-flight task
//! as a backstop if it does not wind down on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plansolve_agent::{OutboundChannel, PlanSolverSessionAgent, Task};
use plansolve_core::{
    agent_events, create_event, ConfirmationResponse, ConnectionId, Result, SessionId,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::retry::{calculate_retry_delay, should_retry, RetryConfig};
use crate::transport::WsTransport;

/// Forwards a `PlanSolverSessionAgent`'s progress events onto a
/// connection's outbound channel.
pub(crate) struct ChannelSink(pub Arc<OutboundChannel<WsTransport>>);

#[async_trait]
impl plansolve_agent::session_agent::EventSink for ChannelSink {
    async fn emit(&self, event: plansolve_core::OutboundEvent) {
        self.0.enqueue(event).await;
    }
}

pub struct AgentSession {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    agent: Arc<PlanSolverSessionAgent>,
    outbound: Arc<OutboundChannel<WsTransport>>,
    running: AtomicBool,
    current_task: Mutex<Option<JoinHandle<()>>>,
    retry: RetryConfig,
}

impl AgentSession {
    pub fn new(
        session_id: SessionId,
        connection_id: ConnectionId,
        agent: Arc<PlanSolverSessionAgent>,
        outbound: Arc<OutboundChannel<WsTransport>>,
        retry: RetryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            connection_id,
            agent,
            outbound,
            running: AtomicBool::new(false),
            current_task: Mutex::new(None),
            retry,
        })
    }

    /// Runs a plan→solve conversation for `question`. Guards against a
    /// second concurrent run on the same session (spec §6.1 Edge case).
    pub async fn execute_streaming(self: &Arc<Self>, question: String) {
        if self.running.swap(true, Ordering::SeqCst) {
            self.emit_error("a run is already in progress for this session").await;
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_with_retry(|| {
                let this = this.clone();
                let question = question.clone();
                Box::pin(async move { this.agent.run(&question).await })
            })
            .await;
            this.running.store(false, Ordering::SeqCst);
        });
        *self.current_task.lock().await = Some(handle);
    }

    /// Runs the solver stage directly against caller-supplied tasks,
    /// skipping planning and aggregation (direct-task mode).
    pub async fn execute_direct(self: &Arc<Self>, tasks: Vec<Task>) {
        if self.running.swap(true, Ordering::SeqCst) {
            self.emit_error("a run is already in progress for this session").await;
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = this.agent.solve_tasks(tasks).await {
                this.emit_error(&e.to_string()).await;
            }
            this.running.store(false, Ordering::SeqCst);
        });
        *self.current_task.lock().await = Some(handle);
    }

    async fn run_with_retry<F>(&self, mut make_attempt: F)
    where
        F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>,
    {
        let mut attempt = 1;
        loop {
            match make_attempt().await {
                Ok(()) => return,
                Err(e) if attempt < self.retry.max_attempts && should_retry(&e) => {
                    tracing::warn!(session = %self.session_id, attempt, error = %e, "retrying session run");
                    tokio::time::sleep(calculate_retry_delay(attempt, &self.retry)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.emit_error(&e.to_string()).await;
                    return;
                }
            }
        }
    }

    /// Enqueues a pre-built event onto this session's outbound channel,
    /// stamping it with the session id.
    pub async fn emit_system(&self, event: plansolve_core::OutboundEvent) {
        self.outbound
            .enqueue(event.with_session(self.session_id.as_str()))
            .await;
    }

    async fn emit_error(&self, message: &str) {
        let event = create_event(agent_events::ERROR)
            .with_session(self.session_id.as_str())
            .with_content(serde_json::json!({ "error": message }));
        self.outbound.enqueue(event).await;
    }

    pub async fn handle_user_response(&self, step_id: &str, response: ConfirmationResponse) -> Result<()> {
        self.agent.handle_user_response(step_id, response).await
    }

    pub async fn replan(&self, question: &str) -> Result<()> {
        self.agent.replan(question).await
    }

    pub fn cancel_solver_task(&self, task_id: &str) -> bool {
        self.agent.cancel_solver_task(task_id)
    }

    pub async fn restart_solver_task(&self, task_id: &str) -> Result<()> {
        self.agent.restart_solver_task(task_id).await
    }

    /// Cancels the in-flight run, if any, and confirmation wait.
    ///
    /// `cancel_plan()` cancels an in-flight planning task or declines a
    /// pending confirmation cooperatively, which lets the session's own
    /// task wind down and emit `plan.cancelled` on its own. This gives
    /// that path a short grace period to finish before falling back to
    /// `abort()`, which would otherwise race ahead of it and kill the
    /// task before the event is emitted (spec §8.4 Scenario E).
    pub async fn cancel(&self) {
        let _ = self.agent.cancel_plan().await;
        if let Some(mut handle) = self.current_task.lock().await.take() {
            tokio::select! {
                _ = &mut handle => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    handle.abort();
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        let event = create_event(agent_events::INTERRUPTED).with_session(self.session_id.as_str());
        self.outbound.enqueue(event).await;
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        if let Some(handle) = self.current_task.lock().await.take() {
            handle.abort();
        }
        let event = create_event(agent_events::SESSION_END).with_session(self.session_id.as_str());
        self.outbound.enqueue(event).await;
        self.outbound.close().await;
    }
}

/// Produces the pipeline + mode for a newly created session. The gateway
/// crate is domain-agnostic: an integrator supplies planner/solver/
/// aggregator implementations through this factory (spec §6.2, §4.5).
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        session_id: &SessionId,
    ) -> (Arc<plansolve_agent::PlanSolverPipeline>, plansolve_agent::SessionMode);
}

pub(crate) async fn build_session(
    session_id: SessionId,
    connection_id: ConnectionId,
    factory: &dyn SessionFactory,
    transport: Arc<WsTransport>,
    config: &crate::config::GatewayConfig,
    retry: RetryConfig,
) -> (Arc<AgentSession>, Arc<PlanSolverSessionAgent>) {
    let (pipeline, mode) = factory.create(&session_id);
    let outbound_config = plansolve_agent::OutboundChannelConfig {
        max_queue_size: config.outbound_queue_size,
        coalesce_window_ms: config.coalesce_window_ms,
        coalesce_events: plansolve_core::default_coalesce_events(),
        name: format!("session:{session_id}"),
    };
    let outbound = OutboundChannel::new(transport, outbound_config);
    outbound.start().await;
    let sink: Arc<dyn plansolve_agent::session_agent::EventSink> =
        Arc::new(ChannelSink(outbound.clone()));
    let agent = PlanSolverSessionAgent::new(
        session_id.clone(),
        pipeline,
        mode,
        sink,
        config.event_namespace.clone(),
        config.broadcast_tasks,
    );
    agent.attach().await;
    let session = AgentSession::new(session_id, connection_id, agent.clone(), outbound, retry);
    (session, agent)
}
