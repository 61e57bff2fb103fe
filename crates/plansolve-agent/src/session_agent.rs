//! Session-facing adapter: drives a [`PlanSolverPipeline`] through a
//! connection's lifetime, translating pipeline progress into outbound
//! events and exposing the confirm/replan/cancel/restart control surface a
//! client interacts with over the wire.
//!
//! Grounded in `myagent/ws/plan_solver.py`'s `PlanSolverSessionAgent`:
//! the `PLANNING -> AWAITING_CONFIRM -> SOLVING -> DONE` state machine, the
//! plan-confirmation rendezvous (there implemented with an `asyncio.Future`,
//! here with a `tokio::sync::oneshot` channel), and the two different
//! restart paths depending on whether solving has already finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use plansolve_core::{
    agent_events, create_event, plan_events, ConfirmationResponse, Error, OutboundEvent, Result,
    SessionId, TaskKey,
};
use serde_json::json;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{task_key, PlanContext, PlanSolverPipeline, SolverRunResult, Task};

/// How a session drives its pipeline (spec §4.5, §6.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// Plan, then solve and aggregate immediately with no confirmation step.
    Simple,
    /// Plan, await explicit user confirmation (with optional task edits or
    /// a replan request), then solve and aggregate.
    ConfirmReplan,
    /// Skip planning entirely; the caller supplies tasks directly and only
    /// the solver stage runs.
    DirectTasks,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Planning,
    AwaitingConfirm,
    Solving,
    Done,
    Cancelled,
    Error,
}

/// Where a session's outbound events go. The gateway crate implements this
/// over a connection's `OutboundChannel`; tests implement it over a
/// recorder.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: OutboundEvent);
}

struct PendingConfirmation {
    step_id: String,
    responder: oneshot::Sender<ConfirmationResponse>,
}

/// Outcome of a planning attempt raced against cooperative cancellation.
enum PlanOutcome {
    Completed(PlanContext),
    Cancelled,
    Failed(Error),
}

pub struct PlanSolverSessionAgent {
    session_id: SessionId,
    pipeline: Arc<PlanSolverPipeline>,
    mode: SessionMode,
    sink: Arc<dyn EventSink>,
    state: RwLock<SessionState>,
    pending: Mutex<Option<PendingConfirmation>>,
    planning_cancel: Mutex<Option<CancellationToken>>,
    last_context: Mutex<Option<PlanContext>>,
    last_results: Mutex<Option<Vec<SolverRunResult>>>,
    solving_started: AtomicBool,
    replan_requested: Mutex<Option<String>>,
    event_namespace: Option<String>,
    broadcast_tasks: bool,
}

impl PlanSolverSessionAgent {
    pub fn new(
        session_id: SessionId,
        pipeline: Arc<PlanSolverPipeline>,
        mode: SessionMode,
        sink: Arc<dyn EventSink>,
        event_namespace: Option<String>,
        broadcast_tasks: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            pipeline,
            mode,
            sink,
            state: RwLock::new(SessionState::Idle),
            pending: Mutex::new(None),
            planning_cancel: Mutex::new(None),
            last_context: Mutex::new(None),
            last_results: Mutex::new(None),
            solving_started: AtomicBool::new(false),
            replan_requested: Mutex::new(None),
            event_namespace,
            broadcast_tasks,
        })
    }

    /// Wires the pipeline's progress callback to this session's sink. Call
    /// once after construction, before `run`/`solve_tasks`.
    pub async fn attach(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.pipeline
            .set_progress_callback(Some(Arc::new(move |event, mut payload| {
                let this = this.clone();
                Box::pin(async move {
                    if !this.broadcast_tasks && event == plan_events::COMPLETED {
                        if let Some(obj) = payload.as_object_mut() {
                            obj.remove("tasks");
                        }
                    }
                    let wire_event = create_event(event)
                        .namespaced(this.event_namespace.as_deref())
                        .with_session(this.session_id.as_str())
                        .with_content(payload);
                    this.sink.emit(wire_event).await;
                })
            })))
            .await;
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    async fn emit(&self, event: &str, content: Option<serde_json::Value>, metadata: Option<serde_json::Value>) {
        let mut wire_event = create_event(event)
            .namespaced(self.event_namespace.as_deref())
            .with_session(self.session_id.as_str());
        if let Some(content) = content {
            wire_event = wire_event.with_content(content);
        }
        if let Some(metadata) = metadata {
            wire_event = wire_event.with_metadata(metadata);
        }
        self.sink.emit(wire_event).await;
    }

    /// Entry point for `Simple`/`ConfirmReplan` modes.
    pub async fn run(&self, question: &str) -> Result<()> {
        match self.mode {
            SessionMode::Simple => self.run_simple(question).await,
            SessionMode::ConfirmReplan => self.run_confirm_replan(question).await,
            SessionMode::DirectTasks => Err(Error::internal(
                "direct-task sessions must call solve_tasks, not run",
            )),
        }
    }

    /// Runs the planner as an abortable task, racing it against a
    /// cancellation signal that `cancel_plan` can trigger while planning is
    /// in flight (ground truth: `asyncio.create_task(self.pipeline.plan(...))`
    /// raced against a cancel request).
    async fn run_plan(&self, question: &str) -> PlanOutcome {
        let cancel = CancellationToken::new();
        *self.planning_cancel.lock().await = Some(cancel.clone());

        let pipeline = Arc::clone(&self.pipeline);
        let question = question.to_string();
        let mut handle = tokio::spawn(async move { pipeline.plan(&question).await });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                handle.abort();
                PlanOutcome::Cancelled
            }
            joined = &mut handle => match joined {
                Ok(Ok(context)) => PlanOutcome::Completed(context),
                Ok(Err(e)) => PlanOutcome::Failed(e),
                Err(join_err) if join_err.is_cancelled() => PlanOutcome::Cancelled,
                Err(join_err) => PlanOutcome::Failed(Error::internal(format!(
                    "planning task panicked: {join_err}"
                ))),
            },
        };

        *self.planning_cancel.lock().await = None;
        outcome
    }

    async fn coerce_edited_tasks(&self, context: &PlanContext, edited: Vec<Task>) -> Result<PlanContext> {
        match self.pipeline.coerce_tasks(edited).and_then(|tasks| context.with_tasks(tasks)) {
            Ok(context) => Ok(context),
            Err(e) => {
                self.emit(plan_events::COERCION_ERROR, Some(json!({ "error": e.to_string() })), None)
                    .await;
                Err(e)
            }
        }
    }

    async fn run_simple(&self, question: &str) -> Result<()> {
        self.set_state(SessionState::Planning).await;
        let context = match self.run_plan(question).await {
            PlanOutcome::Completed(context) => context,
            PlanOutcome::Cancelled => {
                self.set_state(SessionState::Cancelled).await;
                self.emit(plan_events::CANCELLED, None, None).await;
                return Ok(());
            }
            PlanOutcome::Failed(e) => {
                self.emit(agent_events::ERROR, Some(json!({ "error": e.to_string() })), None)
                    .await;
                self.set_state(SessionState::Error).await;
                return Err(e);
            }
        };
        *self.last_context.lock().await = Some(context.clone());
        self.finish_solving(context).await
    }

    async fn run_confirm_replan(&self, question: &str) -> Result<()> {
        let mut question = question.to_string();
        loop {
            self.set_state(SessionState::Planning).await;
            let context = match self.run_plan(&question).await {
                PlanOutcome::Completed(context) => context,
                PlanOutcome::Cancelled => {
                    self.set_state(SessionState::Cancelled).await;
                    self.emit(plan_events::CANCELLED, None, None).await;
                    return Ok(());
                }
                PlanOutcome::Failed(e) => {
                    self.emit(agent_events::ERROR, Some(json!({ "error": e.to_string() })), None)
                        .await;
                    self.set_state(SessionState::Error).await;
                    return Err(e);
                }
            };
            *self.last_context.lock().await = Some(context.clone());

            let step_id = uuid::Uuid::new_v4().to_string();
            let (tx, rx) = oneshot::channel();
            *self.pending.lock().await = Some(PendingConfirmation {
                step_id: step_id.clone(),
                responder: tx,
            });
            self.set_state(SessionState::AwaitingConfirm).await;
            self.emit(
                agent_events::USER_CONFIRM,
                Some(json!({ "tasks": context.tasks, "plan_summary": context.plan_summary })),
                Some(json!({ "step_id": step_id })),
            )
            .await;

            let response = rx
                .await
                .unwrap_or_else(|_| ConfirmationResponse::declined("confirmation channel closed"));
            *self.pending.lock().await = None;

            if let Some(replan_question) = self.replan_requested.lock().await.take() {
                question = replan_question;
                continue;
            }

            if !response.confirmed {
                self.set_state(SessionState::Cancelled).await;
                self.emit(
                    plan_events::CANCELLED,
                    Some(json!({
                        "reason": response.reason.unwrap_or_else(|| "plan not confirmed".to_string())
                    })),
                    None,
                )
                .await;
                return Ok(());
            }

            let context = match response.tasks {
                Some(edited) => self.coerce_edited_tasks(&context, edited).await?,
                None => context,
            };

            return self.finish_solving(context).await;
        }
    }

    async fn finish_solving(&self, context: PlanContext) -> Result<()> {
        self.solving_started.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Solving).await;
        let result = self.pipeline.solve_and_aggregate(context).await?;
        *self.last_results.lock().await = Some(result.solver_results.clone());
        let plan_summary = result.plan_summary().map(str::to_string);
        self.emit(
            agent_events::FINAL_ANSWER,
            Some(json!({
                "plan_summary": plan_summary,
                "aggregate_output": result.aggregate_output,
            })),
            None,
        )
        .await;
        self.set_state(SessionState::Done).await;
        Ok(())
    }

    /// Entry point for `DirectTasks` mode: no planning, no aggregation.
    pub async fn solve_tasks(&self, tasks: Vec<Task>) -> Result<Vec<SolverRunResult>> {
        let tasks = match self.pipeline.coerce_tasks(tasks) {
            Ok(tasks) => tasks,
            Err(e) => {
                self.emit(plan_events::COERCION_ERROR, Some(json!({ "error": e.to_string() })), None)
                    .await;
                return Err(e);
            }
        };
        let context = PlanContext::new(
            self.pipeline.name.clone(),
            String::new(),
            tasks,
            None,
            None,
            None,
        )?;
        *self.last_context.lock().await = Some(context.clone());
        self.solving_started.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Solving).await;
        let ctx_arc = Arc::new(context.clone());
        let results = self.pipeline.run_solvers(context.tasks.clone(), ctx_arc).await;
        *self.last_results.lock().await = Some(results.clone());
        self.set_state(SessionState::Done).await;
        Ok(results)
    }

    /// Resolves a pending confirmation step. Errors if no step with that
    /// id is outstanding (spec §6.1: `user.response` with an unknown or
    /// stale `step_id`).
    pub async fn handle_user_response(
        &self,
        step_id: &str,
        response: ConfirmationResponse,
    ) -> Result<()> {
        let mut guard = self.pending.lock().await;
        match guard.take() {
            Some(pending) if pending.step_id == step_id => {
                let _ = pending.responder.send(response);
                Ok(())
            }
            Some(pending) => {
                *guard = Some(pending);
                Err(Error::StepNotFound(step_id.to_string()))
            }
            None => Err(Error::StepNotFound(step_id.to_string())),
        }
    }

    /// Requests a replan with a new question. Rejected once solving has
    /// started — a plan already being executed can no longer be discarded
    /// (spec §6.1 Edge case).
    pub async fn replan(&self, question: &str) -> Result<()> {
        if self.solving_started.load(Ordering::SeqCst) {
            let err = Error::invalid_message("cannot replan after solving has started");
            self.emit(agent_events::ERROR, Some(json!({ "error": err.to_string() })), None)
                .await;
            return Err(err);
        }
        *self.replan_requested.lock().await = Some(question.to_string());
        if let Some(pending) = self.pending.lock().await.take() {
            let _ = pending.responder.send(ConfirmationResponse::declined("replanning"));
        }
        Ok(())
    }

    /// Cancels an in-flight planning task or an in-progress confirmation
    /// wait, whichever is outstanding; a no-op if neither is. The state
    /// transition and `plan.cancelled` emission for the planning-task case
    /// happen in `run_plan`'s caller once it observes `PlanOutcome::Cancelled`;
    /// the confirmation-wait case resolves the pending oneshot as declined,
    /// which `run_confirm_replan` already reports as a cancellation.
    pub async fn cancel_plan(&self) -> Result<()> {
        if let Some(cancel) = self.planning_cancel.lock().await.take() {
            cancel.cancel();
        }
        if let Some(pending) = self.pending.lock().await.take() {
            let _ = pending.responder.send(ConfirmationResponse::declined("cancel_plan"));
        }
        Ok(())
    }

    pub fn cancel_solver_task(&self, task_id: &str) -> bool {
        self.pipeline.request_cancel_solver_task(task_id)
    }

    /// Restarts a solver task. While solving is in progress this just asks
    /// the pipeline's own scheduler to relaunch it in place. Once the solve
    /// phase has already finished, it instead reruns the single task
    /// directly, splices the fresh result into the last completed result
    /// set by task id, and re-runs the aggregator over the merged set.
    pub async fn restart_solver_task(&self, task_id: &str) -> Result<()> {
        if self.state().await == SessionState::Solving {
            self.pipeline.request_restart_solver_task(task_id);
            return Ok(());
        }

        let context = self
            .last_context
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::StepNotFound(task_id.to_string()))?;
        let key = TaskKey::from_id(task_id);
        let task = context
            .tasks
            .iter()
            .enumerate()
            .find(|(i, t)| task_key(t, *i) == key)
            .map(|(_, t)| t.clone())
            .ok_or_else(|| Error::StepNotFound(task_id.to_string()))?;

        let ctx_arc = Arc::new(context.clone());
        let mut results = self.pipeline.run_solvers(vec![task], ctx_arc).await;
        let new_result = results
            .pop()
            .ok_or_else(|| Error::SolverFailed(format!("restart of {task_id} produced no result")))?;

        let mut merged = self.last_results.lock().await.clone().unwrap_or_default();
        match merged
            .iter()
            .enumerate()
            .find(|(i, r)| task_key(&r.task, *i) == key)
            .map(|(i, _)| i)
        {
            Some(pos) => merged[pos] = new_result,
            None => merged.push(new_result),
        }
        *self.last_results.lock().await = Some(merged.clone());

        let aggregate_output = self.pipeline.run_aggregator(&context, &merged).await;
        self.emit(
            agent_events::FINAL_ANSWER,
            Some(json!({
                "plan_summary": context.plan_summary,
                "aggregate_output": aggregate_output,
            })),
            None,
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsAggregator;
    use crate::test_support::{StaticAggregator, StaticPlanner, StaticSolver};
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        events: StdMutex<Vec<OutboundEvent>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<OutboundEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, event: OutboundEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn build_session(mode: SessionMode) -> (Arc<PlanSolverSessionAgent>, Arc<RecordingSink>) {
        let planner = Arc::new(StaticPlanner::new(vec![json!({"id": 1}), json!({"id": 2})]));
        let solver = Arc::new(StaticSolver::new(vec![0, 0]));
        let aggregator = Arc::new(StaticAggregator);
        let pipeline = Arc::new(
            PlanSolverPipeline::new(
                "test",
                planner,
                solver,
                Some(aggregator),
                Some(2),
                StatsAggregator::new(),
            )
            .unwrap(),
        );
        let sink = RecordingSink::new();
        let session =
            PlanSolverSessionAgent::new(SessionId::new("s1"), pipeline, mode, sink.clone(), None, true);
        (session, sink)
    }

    #[tokio::test]
    async fn simple_mode_runs_straight_through_to_done() {
        let (session, sink) = build_session(SessionMode::Simple);
        session.attach().await;
        session.run("question").await.unwrap();
        assert_eq!(session.state().await, SessionState::Done);
        let events = sink.events();
        assert!(events.iter().any(|e| e.event == agent_events::FINAL_ANSWER));
        assert!(events.iter().any(|e| e.event == plansolve_core::plan_events::COMPLETED));
    }

    #[tokio::test]
    async fn confirm_mode_waits_then_proceeds_on_confirmation() {
        let (session, sink) = build_session(SessionMode::ConfirmReplan);
        session.attach().await;
        let session2 = session.clone();
        let run = tokio::spawn(async move { session2.run("question").await });

        // Wait for the confirmation request to be emitted.
        let step_id = loop {
            if let Some(event) = sink
                .events()
                .into_iter()
                .find(|e| e.event == agent_events::USER_CONFIRM)
            {
                break event.metadata.unwrap()["step_id"].as_str().unwrap().to_string();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(session.state().await, SessionState::AwaitingConfirm);

        session
            .handle_user_response(&step_id, ConfirmationResponse { confirmed: true, tasks: None, reason: None })
            .await
            .unwrap();

        run.await.unwrap().unwrap();
        assert_eq!(session.state().await, SessionState::Done);
    }

    #[tokio::test]
    async fn declining_confirmation_cancels_without_solving() {
        let (session, sink) = build_session(SessionMode::ConfirmReplan);
        session.attach().await;
        let session2 = session.clone();
        let run = tokio::spawn(async move { session2.run("question").await });

        let step_id = loop {
            if let Some(event) = sink
                .events()
                .into_iter()
                .find(|e| e.event == agent_events::USER_CONFIRM)
            {
                break event.metadata.unwrap()["step_id"].as_str().unwrap().to_string();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };

        session
            .handle_user_response(&step_id, ConfirmationResponse::declined("no thanks"))
            .await
            .unwrap();

        run.await.unwrap().unwrap();
        assert_eq!(session.state().await, SessionState::Cancelled);
        assert!(sink.events().iter().any(|e| e.event == plan_events::CANCELLED));
        assert!(!sink.events().iter().any(|e| e.event == agent_events::ERROR));
        assert!(!sink.events().iter().any(|e| e.event == solver_start()));
    }

    #[tokio::test]
    async fn cancelling_mid_plan_reports_cancellation_not_completion() {
        let planner = Arc::new(StaticPlanner::with_delay(vec![json!({"id": 1})], 200));
        let solver = Arc::new(StaticSolver::new(vec![0]));
        let pipeline = Arc::new(
            PlanSolverPipeline::new("test", planner, solver, None, Some(2), StatsAggregator::new()).unwrap(),
        );
        let sink = RecordingSink::new();
        let session = PlanSolverSessionAgent::new(
            SessionId::new("s1"),
            pipeline,
            SessionMode::Simple,
            sink.clone(),
            None,
            true,
        );
        session.attach().await;
        let session2 = session.clone();
        let run = tokio::spawn(async move { session2.run("question").await });

        while session.state().await != SessionState::Planning {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        session.cancel_plan().await.unwrap();

        run.await.unwrap().unwrap();
        assert_eq!(session.state().await, SessionState::Cancelled);
        assert!(sink.events().iter().any(|e| e.event == plan_events::CANCELLED));
        assert!(!sink.events().iter().any(|e| e.event == plan_events::COMPLETED));
        assert!(!sink.events().iter().any(|e| e.event == agent_events::FINAL_ANSWER));
    }

    fn solver_start() -> &'static str {
        plansolve_core::solver_events::START
    }

    #[tokio::test]
    async fn replan_rejected_once_solving_started() {
        let (session, _sink) = build_session(SessionMode::Simple);
        session.attach().await;
        session.run("question").await.unwrap();
        let err = session.replan("new question").await.unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }
}
