//! In-memory planner/solver/aggregator fixtures for pipeline unit tests.
//! Not part of the public API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::pipeline::{
    AgentHandle, Aggregator, PlanAgent, PlanContext, SolverAgent, SolverRunResult, Task,
};

struct DummyAgent {
    response: String,
    delay_ms: u64,
}

#[async_trait]
impl AgentHandle for DummyAgent {
    async fn run(&mut self, _input: &str) -> plansolve_core::Result<String> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(self.response.clone())
    }

    fn name(&self) -> String {
        "dummy".to_string()
    }
}

pub struct StaticPlanner {
    tasks: Vec<Task>,
    delay_ms: u64,
}

impl StaticPlanner {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks, delay_ms: 0 }
    }

    /// A planner slow enough for a test to reliably cancel before it finishes.
    pub fn with_delay(tasks: Vec<Task>, delay_ms: u64) -> Self {
        Self { tasks, delay_ms }
    }
}

#[async_trait]
impl PlanAgent for StaticPlanner {
    fn name(&self) -> &str {
        "static-planner"
    }

    async fn build_agent(&self) -> Box<dyn AgentHandle> {
        Box::new(DummyAgent {
            response: "planned".to_string(),
            delay_ms: self.delay_ms,
        })
    }

    fn extract_tasks(&self, _agent: &dyn AgentHandle, _plan_output: &str) -> Vec<Task> {
        self.tasks.clone()
    }
}

/// Solver that hands out a fixed per-call delay from a list, in call order.
pub struct StaticSolver {
    delays_ms: Vec<u64>,
    counter: AtomicUsize,
}

impl StaticSolver {
    pub fn new(delays_ms: Vec<u64>) -> Self {
        Self {
            delays_ms,
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SolverAgent for StaticSolver {
    fn name(&self) -> &str {
        "static-solver"
    }

    async fn build_agent(&self, task: &Task, _context: &PlanContext) -> Box<dyn AgentHandle> {
        let idx = self.counter.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays_ms.get(idx).copied().unwrap_or(0);
        Box::new(DummyAgent {
            response: format!("solved {task}"),
            delay_ms: delay,
        })
    }

    fn extract_result(
        &self,
        _agent: &dyn AgentHandle,
        solver_output: &str,
        task: &Task,
        _context: &PlanContext,
    ) -> Task {
        json!({ "solved": true, "output": solver_output, "task_id": task.get("id") })
    }
}

/// Solver whose delay depends on the task id and attempt count: task `1`'s
/// first attempt is slow enough for a test to reliably issue a restart
/// before it finishes; every other attempt is fast.
pub struct ScriptedAgent {
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SolverAgent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted-solver"
    }

    async fn build_agent(&self, task: &Task, _context: &PlanContext) -> Box<dyn AgentHandle> {
        let id = task
            .get("id")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let attempt = {
            let mut guard = self.attempts.lock().unwrap();
            let counter = guard.entry(id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let delay = if id == "1" {
            if attempt == 1 {
                200
            } else {
                10
            }
        } else {
            5
        };
        Box::new(DummyAgent {
            response: format!("solved {id} attempt {attempt}"),
            delay_ms: delay,
        })
    }

    fn extract_result(
        &self,
        _agent: &dyn AgentHandle,
        solver_output: &str,
        _task: &Task,
        _context: &PlanContext,
    ) -> Task {
        json!({ "output": solver_output })
    }
}

pub struct StaticAggregator;

#[async_trait]
impl Aggregator for StaticAggregator {
    async fn aggregate(&self, _context: &PlanContext, results: &[SolverRunResult]) -> Value {
        json!({ "count": results.len() })
    }
}
