//! A minimal in-process planner/solver/aggregator so the gateway binary is
//! runnable out of the box. Splits the question into clauses, "solves"
//! each by echoing it back, and joins the results — a stand-in for a real
//! tool-using agent runtime, which is supplied by an integrator through
//! [`plansolve_gateway::SessionFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use plansolve_agent::{
    AgentHandle, Aggregator, PlanAgent, PlanContext, PlanSolverPipeline, SessionMode,
    SolverAgent, SolverRunResult, StatsAggregator, Task,
};
use plansolve_core::{Result, SessionId};
use serde_json::{json, Value};

use crate::session::SessionFactory;

/// Echoes whatever request it is given back as the response. Stands in
/// for a real LLM-backed agent runtime.
struct EchoAgent;

#[async_trait]
impl AgentHandle for EchoAgent {
    async fn run(&mut self, input: &str) -> Result<String> {
        Ok(input.to_string())
    }

    fn name(&self) -> String {
        "echo".to_string()
    }
}

struct DemoPlanner;

#[async_trait]
impl PlanAgent for DemoPlanner {
    fn name(&self) -> &str {
        "demo-planner"
    }

    async fn build_agent(&self) -> Box<dyn AgentHandle> {
        Box::new(EchoAgent)
    }

    fn extract_tasks(&self, _agent: &dyn AgentHandle, plan_output: &str) -> Vec<Task> {
        split_into_tasks(plan_output)
    }
}

/// Splits on clause-ending punctuation, falling back to the whole question
/// when it carries none.
pub fn split_into_tasks(question: &str) -> Vec<Task> {
    let clauses: Vec<&str> = question
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let clauses = if clauses.is_empty() {
        vec![question.trim()]
    } else {
        clauses
    };
    clauses
        .into_iter()
        .enumerate()
        .map(|(i, clause)| json!({ "id": i + 1, "text": clause }))
        .collect()
}

struct DemoSolver;

#[async_trait]
impl SolverAgent for DemoSolver {
    fn name(&self) -> &str {
        "demo-solver"
    }

    async fn build_agent(&self, _task: &Task, _context: &PlanContext) -> Box<dyn AgentHandle> {
        Box::new(EchoAgent)
    }

    fn build_request(&self, task: &Task, _context: &PlanContext) -> String {
        task.get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn extract_result(
        &self,
        _agent: &dyn AgentHandle,
        solver_output: &str,
        _task: &Task,
        _context: &PlanContext,
    ) -> Task {
        json!({ "answer": solver_output })
    }
}

struct DemoAggregator;

#[async_trait]
impl Aggregator for DemoAggregator {
    async fn aggregate(&self, _context: &PlanContext, results: &[SolverRunResult]) -> Value {
        let joined: Vec<&str> = results
            .iter()
            .filter_map(|r| r.output.get("answer").and_then(Value::as_str))
            .collect();
        json!({ "summary": joined.join(" ") })
    }
}

/// Always builds the demo planner/solver/aggregator pipeline in
/// confirm/replan mode, regardless of session id. Real deployments supply
/// their own [`SessionFactory`].
pub struct DemoSessionFactory {
    stats: StatsAggregator,
}

impl DemoSessionFactory {
    pub fn new() -> Self {
        Self {
            stats: StatsAggregator::new(),
        }
    }
}

impl Default for DemoSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFactory for DemoSessionFactory {
    fn create(&self, _session_id: &SessionId) -> (Arc<PlanSolverPipeline>, SessionMode) {
        let planner = Arc::new(DemoPlanner);
        let solver = Arc::new(DemoSolver);
        let aggregator = Arc::new(DemoAggregator);
        let pipeline = PlanSolverPipeline::new(
            "demo",
            planner,
            solver,
            Some(aggregator),
            Some(4),
            self.stats.clone(),
        )
        .expect("demo pipeline config is always valid");
        (Arc::new(pipeline), SessionMode::ConfirmReplan)
    }
}
