//! The plan→solve orchestration core: planner stage, bounded-concurrency
//! solver stage with dynamic cancel/restart, aggregator stage, and
//! statistics rollup.
//!
//! Grounded in `myagent/ws/plan_solver.py`'s `PlanSolverPipeline`, with
//! the dynamic scheduling loop adapted from the teacher's
//! `ConsciousnessLoop`/`AgentRuntime` cancellable-`tokio::select!` pattern
//! (`queue.rs`, `runtime.rs`) and task bookkeeping from `subagent.rs`.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use plansolve_core::{
    aggregate_events, annotate_call_record, pipeline_events, plan_events, solver_events,
    CallRecord, Error, Result, TaskKey,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::registry::ActiveSolverRegistry;
use crate::stats::StatsAggregator;

/// A plan task is an opaque JSON value; the orchestrator only ever looks at
/// its `id` field (spec §3, §6.2). Planner/solver/aggregator collaborators
/// interpret the rest.
pub type Task = Value;

type ProgressFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type ProgressCallback = Arc<dyn Fn(String, Value) -> ProgressFuture + Send + Sync>;

/// Contract for the external tool-using agent runtime (spec §6.3): agents
/// expose `run`, and optionally per-call statistics and a configured model
/// name used as the stats fallback.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    async fn run(&mut self, input: &str) -> Result<String>;
    fn name(&self) -> String;
    fn get_statistics(&self) -> Option<Value> {
        None
    }
    fn configured_model(&self) -> Option<String> {
        None
    }
    fn final_response(&self) -> Option<String> {
        None
    }
}

/// Contract with the planner collaborator (spec §4.5.1 / §6.2).
#[async_trait]
pub trait PlanAgent: Send + Sync {
    fn name(&self) -> &str;
    async fn build_agent(&self) -> Box<dyn AgentHandle>;

    fn build_request(&self, question: &str) -> String {
        question.to_string()
    }

    fn extract_tasks(&self, agent: &dyn AgentHandle, plan_output: &str) -> Vec<Task>;

    fn extract_summary(&self, agent: &dyn AgentHandle, plan_output: &str) -> Option<String> {
        agent.final_response().or_else(|| Some(plan_output.to_string()))
    }

    /// Convert client-edited/user-provided task values into this planner's
    /// domain task type. Default: identity.
    fn coerce_tasks(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        Ok(tasks)
    }
}

/// Contract with the solver collaborator (spec §4.5.2 / §6.2).
#[async_trait]
pub trait SolverAgent: Send + Sync {
    fn name(&self) -> &str;
    async fn build_agent(&self, task: &Task, context: &PlanContext) -> Box<dyn AgentHandle>;

    fn build_request(&self, task: &Task, _context: &PlanContext) -> String {
        task.to_string()
    }

    fn extract_result(
        &self,
        agent: &dyn AgentHandle,
        solver_output: &str,
        task: &Task,
        context: &PlanContext,
    ) -> Task;

    fn extract_summary(
        &self,
        agent: &dyn AgentHandle,
        solver_output: &str,
        _task: &Task,
        _context: &PlanContext,
    ) -> Option<String> {
        agent
            .final_response()
            .or_else(|| Some(solver_output.to_string()))
    }
}

/// Contract with the aggregator collaborator (spec §4.5.3 / §6.2).
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, context: &PlanContext, results: &[SolverRunResult]) -> Value;
}

/// Immutable context shared from planning to solving and aggregation.
#[derive(Clone, Debug, Serialize)]
pub struct PlanContext {
    pub name: String,
    pub question: String,
    pub tasks: Vec<Task>,
    pub plan_summary: Option<String>,
    pub raw_plan_output: Option<String>,
    pub plan_statistics: Option<Vec<CallRecord>>,
}

impl PlanContext {
    /// Validates task-id uniqueness (spec §9 Open Question: this
    /// implementation rejects duplicates at construction time).
    pub fn new(
        name: String,
        question: String,
        tasks: Vec<Task>,
        plan_summary: Option<String>,
        raw_plan_output: Option<String>,
        plan_statistics: Option<Vec<CallRecord>>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for (i, task) in tasks.iter().enumerate() {
            let key = task_key(task, i);
            if !seen.insert(key.clone()) {
                return Err(Error::DuplicateTaskId(key.to_string()));
            }
        }
        Ok(Self {
            name,
            question,
            tasks,
            plan_summary,
            raw_plan_output,
            plan_statistics,
        })
    }

    /// Build a new context with a substituted task list, preserving plan
    /// metadata — used when the user edits tasks during confirmation.
    pub fn with_tasks(&self, tasks: Vec<Task>) -> Result<Self> {
        Self::new(
            self.name.clone(),
            self.question.clone(),
            tasks,
            self.plan_summary.clone(),
            self.raw_plan_output.clone(),
            self.plan_statistics.clone(),
        )
    }
}

/// The outcome of one solver agent run against one task.
#[derive(Clone, Debug, Serialize)]
pub struct SolverRunResult {
    pub task: Task,
    pub output: Task,
    pub summary: Option<String>,
    pub raw_output: Option<String>,
    pub agent_name: String,
    pub statistics: Option<Vec<CallRecord>>,
}

/// Aggregate outcome of a plan→solve run.
#[derive(Clone, Debug, Serialize)]
pub struct PlanSolveResult {
    pub context: PlanContext,
    pub solver_results: Vec<SolverRunResult>,
    pub aggregate_output: Option<Value>,
    pub statistics: Option<Vec<CallRecord>>,
    pub metrics: Option<Value>,
}

impl PlanSolveResult {
    pub fn plan_summary(&self) -> Option<&str> {
        self.context.plan_summary.as_deref()
    }
}

/// Task-keying rule (spec §4.5.2, §9 GLOSSARY): tasks carrying an `id`
/// field key on `task:{id}`; otherwise they key on their position.
pub fn task_key(task: &Task, index: usize) -> TaskKey {
    match task {
        Value::Object(map) => match map.get("id") {
            Some(Value::String(s)) => TaskKey::from_id(s),
            Some(Value::Number(n)) => TaskKey::from_id(n),
            Some(Value::Null) | None => TaskKey::from_index(index),
            Some(other) => TaskKey::from_id(other),
        },
        _ => TaskKey::from_index(index),
    }
}

enum SolveOutcome {
    Completed(SolverRunResult),
    Cancelled,
    Failed(String),
}

/// Coordinates a planning agent with multiple solver agents plus an
/// optional aggregator (spec §4.5).
pub struct PlanSolverPipeline {
    pub name: String,
    planner: Arc<dyn PlanAgent>,
    solver: Arc<dyn SolverAgent>,
    aggregator: Option<Arc<dyn Aggregator>>,
    concurrency: Option<usize>,
    progress: RwLock<Option<ProgressCallback>>,
    registry: ActiveSolverRegistry<Task, SolverRunResult>,
    stats: StatsAggregator,
}

impl PlanSolverPipeline {
    pub fn new(
        name: impl Into<String>,
        planner: Arc<dyn PlanAgent>,
        solver: Arc<dyn SolverAgent>,
        aggregator: Option<Arc<dyn Aggregator>>,
        concurrency: Option<usize>,
        stats: StatsAggregator,
    ) -> Result<Self> {
        if let Some(0) = concurrency {
            return Err(Error::ConfigError(
                "concurrency must be a positive integer when provided".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            planner,
            solver,
            aggregator,
            concurrency,
            progress: RwLock::new(None),
            registry: ActiveSolverRegistry::new(),
            stats,
        })
    }

    pub async fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        *self.progress.write().await = callback;
    }

    async fn notify(&self, event: &str, payload: Value) {
        let callback = self.progress.read().await.clone();
        if let Some(callback) = callback {
            callback(event.to_string(), payload).await;
        }
    }

    /// Backwards-compatible wrapper: plan then solve+aggregate in one shot.
    pub async fn run(&self, question: &str) -> Result<PlanSolveResult> {
        let context = self.plan(question).await?;
        self.solve_and_aggregate(context).await
    }

    pub async fn plan(&self, question: &str) -> Result<PlanContext> {
        self.notify(plan_events::START, json!({ "question": question }))
            .await;

        let mut agent = self.planner.build_agent().await;
        let request = self.planner.build_request(question);
        let plan_output = agent
            .run(&request)
            .await
            .map_err(|e| Error::PlanningFailed(e.to_string()))?;

        let tasks = self.planner.extract_tasks(agent.as_ref(), &plan_output);
        if tasks.is_empty() {
            return Err(Error::empty_task_list(self.planner.name(), question));
        }

        let plan_summary = self.planner.extract_summary(agent.as_ref(), &plan_output);
        let plan_statistics = collect_statistics(agent.as_ref(), "plan", self.planner.name());

        let context = PlanContext::new(
            self.name.clone(),
            question.to_string(),
            tasks.clone(),
            plan_summary.clone(),
            Some(plan_output),
            plan_statistics.clone(),
        )?;

        let metrics = self.stats.snapshot();
        let mut payload = json!({ "tasks": tasks, "plan_summary": plan_summary });
        if let Some(stats) = &plan_statistics {
            payload["statistics"] = json!(stats);
        }
        payload["metrics"] = metrics;
        self.notify(plan_events::COMPLETED, payload).await;

        Ok(context)
    }

    pub async fn solve_and_aggregate(&self, context: PlanContext) -> Result<PlanSolveResult> {
        let context = Arc::new(context);
        let results = self.run_solvers(context.tasks.clone(), context.clone()).await;
        let aggregate_output = self.run_aggregator(&context, &results).await;
        let statistics = build_pipeline_statistics(context.plan_statistics.clone(), &results);
        let metrics = self.stats.snapshot();

        let mut payload = json!({
            "context": context.as_ref(),
            "solver_results": results,
            "aggregate_output": aggregate_output,
        });
        if let Some(stats) = &statistics {
            payload["statistics"] = json!(stats);
        }
        payload["metrics"] = metrics.clone();
        self.notify(pipeline_events::COMPLETED, payload).await;

        Ok(PlanSolveResult {
            context: (*context).clone(),
            solver_results: results,
            aggregate_output,
            statistics,
            metrics: Some(metrics),
        })
    }

    /// Runs solvers for the given task list against the given context,
    /// with bounded concurrency and dynamic cancel/restart support (spec
    /// §4.5.2). Exposed so the session adapter can drive a single-task
    /// rerun after the phase has otherwise completed.
    pub async fn run_solvers(
        &self,
        tasks: Vec<Task>,
        context: Arc<PlanContext>,
    ) -> Vec<SolverRunResult> {
        let keyed: Vec<(TaskKey, Task)> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (task_key(t, i), t.clone()))
            .collect();
        self.registry.reset(keyed.clone());

        let semaphore = self.concurrency.map(|c| Arc::new(Semaphore::new(c)));
        let mut futures = FuturesUnordered::new();
        for (key, task) in &keyed {
            self.launch(&mut futures, key.clone(), task.clone(), context.clone(), semaphore.clone())
                .await;
        }

        loop {
            let restarts = self.registry.pending_restarts();
            if !self.registry.has_active() && restarts.is_empty() {
                break;
            }

            for rkey in restarts {
                if self.registry.is_active(&rkey) {
                    continue;
                }
                let Some(task) = self.registry.task_for(&rkey) else {
                    self.registry.clear_restart(&rkey);
                    continue;
                };
                self.notify(solver_events::RESTARTED, json!({ "task": task }))
                    .await;
                self.launch(&mut futures, rkey.clone(), task, context.clone(), semaphore.clone())
                    .await;
                self.registry.clear_restart(&rkey);
            }

            let Some((key, outcome)) = futures.next().await else {
                continue;
            };
            self.registry.mark_inactive(&key);
            match outcome {
                SolveOutcome::Cancelled => {
                    let task = self.registry.task_for(&key);
                    self.notify(solver_events::CANCELLED, json!({ "task": task }))
                        .await;
                }
                SolveOutcome::Failed(message) => {
                    tracing::error!(task_key = %key, error = %message, "solver task failed");
                }
                SolveOutcome::Completed(result) => {
                    self.registry.store_result(key, result);
                }
            }
        }

        // Collect in original order; append any keys outside the original
        // set last (spec §3, §9: the restarted-only-completion extension
        // point).
        let snapshot = self.registry.results_snapshot();
        let mut results: Vec<SolverRunResult> = Vec::new();
        for (key, _) in &keyed {
            if let Some(result) = snapshot.get(key) {
                results.push(result.clone());
            }
        }
        let known: HashSet<TaskKey> = keyed.into_iter().map(|(k, _)| k).collect();
        for (key, result) in snapshot {
            if !known.contains(&key) {
                results.push(result);
            }
        }
        results
    }

    async fn launch<'a>(
        &'a self,
        futures: &mut FuturesUnordered<Pin<Box<dyn Future<Output = (TaskKey, SolveOutcome)> + Send + 'a>>>,
        key: TaskKey,
        task: Task,
        context: Arc<PlanContext>,
        semaphore: Option<Arc<Semaphore>>,
    ) {
        let cancel = CancellationToken::new();
        self.registry.mark_active(key.clone(), cancel.clone());
        let fut = self.execute_one(key, task, context, semaphore, cancel);
        futures.push(Box::pin(fut));
    }

    async fn execute_one(
        &self,
        key: TaskKey,
        task: Task,
        context: Arc<PlanContext>,
        semaphore: Option<Arc<Semaphore>>,
        cancel: CancellationToken,
    ) -> (TaskKey, SolveOutcome) {
        let _permit = if let Some(semaphore) = semaphore {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return (key, SolveOutcome::Cancelled),
                permit = semaphore.acquire_owned() => Some(permit.expect("semaphore not closed")),
            }
        } else {
            None
        };

        self.notify(solver_events::START, json!({ "task": task })).await;

        let mut agent = self.solver.build_agent(&task, &context).await;
        let request = self.solver.build_request(&task, &context);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => SolveOutcome::Cancelled,
            run_result = agent.run(&request) => match run_result {
                Ok(solver_output) => {
                    let output = self.solver.extract_result(agent.as_ref(), &solver_output, &task, &context);
                    let summary = self.solver.extract_summary(agent.as_ref(), &solver_output, &task, &context);
                    let statistics = collect_statistics(agent.as_ref(), "solver", self.solver.name());
                    let model = statistics
                        .as_ref()
                        .and_then(|calls| calls.first())
                        .and_then(|c| c.get("model").cloned());

                    let result = SolverRunResult {
                        task: task.clone(),
                        output,
                        summary,
                        raw_output: Some(solver_output),
                        agent_name: self.solver.name().to_string(),
                        statistics: statistics.clone(),
                    };

                    let mut sanitized = json!({
                        "output": result.output,
                        "summary": result.summary,
                        "agent_name": result.agent_name,
                    });
                    if let Some(model) = model {
                        sanitized["model"] = model;
                    }
                    if let Some(stats) = statistics {
                        sanitized["statistics"] = json!(stats);
                    }
                    self.notify(solver_events::COMPLETED, json!({ "task": task, "result": sanitized })).await;
                    SolveOutcome::Completed(result)
                }
                Err(e) => SolveOutcome::Failed(e.to_string()),
            },
        };
        (key, outcome)
    }

    /// Converts client-edited task values through the planner's own
    /// coercion hook (spec §4.5.1: edited plans are never trusted as-is).
    pub fn coerce_tasks(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        self.planner
            .coerce_tasks(tasks)
            .map_err(|e| Error::CoercionFailed(e.to_string()))
    }

    /// External control: cancel a running solver task by id.
    pub fn request_cancel_solver_task(&self, task_id: &str) -> bool {
        self.registry.request_cancel(&TaskKey::from_id(task_id))
    }

    /// External control: request a restart; the dynamic loop relaunches it.
    pub fn request_restart_solver_task(&self, task_id: &str) -> bool {
        self.registry.request_restart(&TaskKey::from_id(task_id));
        true
    }

    pub async fn run_aggregator(
        &self,
        context: &PlanContext,
        results: &[SolverRunResult],
    ) -> Option<Value> {
        let aggregator = self.aggregator.as_ref()?;
        self.notify(
            aggregate_events::START,
            json!({ "context": context, "solver_results": results }),
        )
        .await;
        let output = aggregator.aggregate(context, results).await;
        self.notify(
            aggregate_events::COMPLETED,
            json!({ "context": context, "solver_results": results, "output": output }),
        )
        .await;
        Some(output)
    }
}

fn collect_statistics(
    agent: &dyn AgentHandle,
    origin: &str,
    agent_name: &str,
) -> Option<Vec<CallRecord>> {
    let stats_obj = agent.get_statistics()?;
    let Value::Object(obj) = &stats_obj else {
        return None;
    };
    let top_model = obj.get("model").and_then(Value::as_str).map(String::from);
    let fallback_model = top_model.or_else(|| agent.configured_model());

    let calls: Vec<Value> = match obj.get("calls").and_then(Value::as_array) {
        Some(list) if !list.is_empty() => list.clone(),
        _ => vec![stats_obj.clone()],
    };

    let mut out = Vec::new();
    for call in calls {
        if let Value::Object(map) = call {
            out.push(annotate_call_record(
                map,
                origin,
                agent_name,
                fallback_model.as_deref(),
            ));
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Unified per-call statistics list across planner and all solvers (spec
/// §4.5.4): planning records first, then solver records in finalization
/// order.
fn build_pipeline_statistics(
    plan_statistics: Option<Vec<CallRecord>>,
    solver_results: &[SolverRunResult],
) -> Option<Vec<CallRecord>> {
    let mut combined = Vec::new();
    if let Some(calls) = plan_statistics {
        combined.extend(calls);
    }
    for result in solver_results {
        if let Some(calls) = &result.statistics {
            combined.extend(calls.iter().cloned());
        }
    }
    if combined.is_empty() {
        None
    } else {
        Some(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedAgent, StaticAggregator, StaticPlanner, StaticSolver};

    fn build_pipeline(
        concurrency: Option<usize>,
        delays_ms: Vec<u64>,
    ) -> Arc<PlanSolverPipeline> {
        let planner = Arc::new(StaticPlanner::new(vec![
            json!({"id": 1, "t": "A"}),
            json!({"id": 2, "t": "B"}),
            json!({"id": 3, "t": "C"}),
        ]));
        let solver = Arc::new(StaticSolver::new(delays_ms));
        let aggregator = Arc::new(StaticAggregator);
        Arc::new(
            PlanSolverPipeline::new(
                "test",
                planner,
                solver,
                Some(aggregator),
                concurrency,
                StatsAggregator::new(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn simple_run_produces_ordered_results_and_aggregate() {
        let pipeline = build_pipeline(Some(2), vec![0, 0, 0]);
        let result = pipeline.run("question").await.unwrap();
        assert_eq!(result.solver_results.len(), 3);
        assert_eq!(
            result.solver_results.iter().map(|r| r.task["id"].clone()).collect::<Vec<_>>(),
            vec![json!(1), json!(2), json!(3)]
        );
        assert_eq!(result.aggregate_output.unwrap()["count"], json!(3));
    }

    #[tokio::test]
    async fn empty_task_list_fails_before_any_solver_event() {
        let planner = Arc::new(StaticPlanner::new(vec![]));
        let solver = Arc::new(StaticSolver::new(vec![]));
        let pipeline = PlanSolverPipeline::new(
            "test",
            planner,
            solver,
            None,
            None,
            StatsAggregator::new(),
        )
        .unwrap();
        let err = pipeline.plan("q").await.unwrap_err();
        assert!(matches!(err, Error::EmptyTaskList { .. }));
    }

    #[tokio::test]
    async fn concurrency_one_serializes_solver_starts() {
        let pipeline = build_pipeline(Some(1), vec![5, 5, 5]);
        let events = Arc::new(tokio::sync::Mutex::new(Vec::<(String, Value)>::new()));
        let events2 = events.clone();
        pipeline
            .set_progress_callback(Some(Arc::new(move |event, payload| {
                let events = events2.clone();
                Box::pin(async move {
                    events.lock().await.push((event, payload));
                })
            })))
            .await;

        pipeline.run("q").await.unwrap();
        let log = events.lock().await;
        let starts_and_completes: Vec<&str> = log
            .iter()
            .filter(|(e, _)| e == solver_events::START || e == solver_events::COMPLETED)
            .map(|(e, _)| e.as_str())
            .collect();
        // With concurrency=1 every start must be immediately followed by its
        // own completion before the next start.
        for pair in starts_and_completes.chunks(2) {
            assert_eq!(pair, [solver_events::START, solver_events::COMPLETED]);
        }
    }

    #[tokio::test]
    async fn restart_replaces_result_for_same_task() {
        let planner = Arc::new(StaticPlanner::new(vec![json!({"id": 1}), json!({"id": 2})]));
        let solver = Arc::new(ScriptedAgent::new());
        let pipeline = Arc::new(
            PlanSolverPipeline::new(
                "test",
                planner,
                solver.clone(),
                None,
                Some(2),
                StatsAggregator::new(),
            )
            .unwrap(),
        );

        let context = pipeline.plan("q").await.unwrap();
        let ctx_arc = Arc::new(context.clone());
        let pipeline_clone = pipeline.clone();
        let tasks = context.tasks.clone();
        let run = tokio::spawn(async move { pipeline_clone.run_solvers(tasks, ctx_arc).await });

        // Give task 1 time to start, then request a restart.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(pipeline.request_restart_solver_task("1"));

        let results = run.await.unwrap();
        let task_one: Vec<_> = results
            .iter()
            .filter(|r| r.task["id"] == json!(1))
            .collect();
        assert_eq!(task_one.len(), 1, "only the restarted attempt should surface");
    }
}
