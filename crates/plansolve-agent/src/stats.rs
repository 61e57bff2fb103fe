//! Process-wide runtime statistics: agent lifecycles, tool executions, and
//! model usage tallies.
//!
//! Grounded in `myagent/stats.py`'s `StatsManager`: coarse-locked counters
//! plus per-run records, with context-local attribution of tool/LLM
//! activity to the currently running agent (spec §4.6, §9).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::{json, Value};

#[derive(Clone, Debug)]
struct AgentRun {
    name: String,
    model: Option<String>,
    started: Instant,
    ended: Option<Instant>,
    status: String,
    steps: u64,
}

#[derive(Clone, Debug, Default)]
struct AgentAggregate {
    runs: u64,
    success: u64,
    error: u64,
    cancelled: u64,
    terminated: u64,
    total_duration_ms: u64,
    total_steps: u64,
    last_status: Option<String>,
    model: Option<String>,
}

#[derive(Clone, Debug)]
struct ToolRun {
    tool: String,
    agent: Option<String>,
    started: Instant,
    success: Option<bool>,
    error: Option<String>,
    args_size: usize,
    output_size: Option<usize>,
}

#[derive(Clone, Debug, Default)]
struct ToolAggregate {
    executions: u64,
    success: u64,
    failure: u64,
    total_duration_ms: u64,
    total_args_size: u64,
    total_output_size: u64,
    last_error: Option<String>,
}

#[derive(Clone, Debug, Default)]
struct ModelAggregate {
    calls: u64,
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Default)]
struct Inner {
    agent_created: HashMap<String, u64>,
    agent_runs: HashMap<String, AgentRun>,
    agent_aggregates: HashMap<String, AgentAggregate>,
    tool_runs: HashMap<String, ToolRun>,
    tool_aggregates: HashMap<String, ToolAggregate>,
    model_aggregates: HashMap<String, ModelAggregate>,
    model_by_agent: HashMap<String, HashMap<String, ModelAggregate>>,
}

/// Process-wide, thread-safe aggregator. Cloning shares the same underlying
/// state (it wraps an `Arc<Mutex<_>>`), matching the teacher's
/// singleton-via-shared-handle pattern.
#[derive(Clone, Default)]
pub struct StatsAggregator {
    inner: Arc<Mutex<Inner>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent_created(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        *inner.agent_created.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Starts a run and returns its run id. Failures in recording never
    /// propagate (spec §4.6): callers that can't obtain a lock simply skip
    /// attribution, they never panic the caller's task.
    pub fn start_agent_run(&self, name: &str, model: Option<&str>) -> String {
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().unwrap();
        inner.agent_runs.insert(
            run_id.clone(),
            AgentRun {
                name: name.to_string(),
                model: model.map(String::from),
                started: Instant::now(),
                ended: None,
                status: "started".to_string(),
                steps: 0,
            },
        );
        let agg = inner.agent_aggregates.entry(name.to_string()).or_default();
        agg.runs += 1;
        agg.last_status = Some("started".to_string());
        if agg.model.is_none() {
            agg.model = model.map(String::from);
        }
        run_id
    }

    pub fn finish_agent_run(&self, run_id: &str, status: &str, steps: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        let Some(run) = inner.agent_runs.get_mut(run_id) else {
            return;
        };
        run.status = status.to_string();
        run.ended = Some(Instant::now());
        if let Some(steps) = steps {
            run.steps = steps;
        }
        let duration_ms = run
            .ended
            .map(|e| e.duration_since(run.started).as_millis() as u64)
            .unwrap_or(0);
        let name = run.name.clone();
        let run_steps = run.steps;
        let agg = inner.agent_aggregates.entry(name).or_default();
        match status {
            "finished" => agg.success += 1,
            "error" => agg.error += 1,
            "cancelled" => agg.cancelled += 1,
            "terminated" => agg.terminated += 1,
            _ => {}
        }
        agg.total_duration_ms += duration_ms;
        agg.total_steps += run_steps;
        agg.last_status = Some(status.to_string());
    }

    pub fn start_tool_run(&self, tool: &str, agent: Option<&str>, args_size: usize) -> String {
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().unwrap();
        inner.tool_runs.insert(
            run_id.clone(),
            ToolRun {
                tool: tool.to_string(),
                agent: agent.map(String::from),
                started: Instant::now(),
                success: None,
                error: None,
                args_size,
                output_size: None,
            },
        );
        run_id
    }

    pub fn finish_tool_run(
        &self,
        run_id: &str,
        success: bool,
        output_size: Option<usize>,
        error: Option<&str>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let Some(rec) = inner.tool_runs.get_mut(run_id) else {
            return;
        };
        rec.success = Some(success);
        rec.error = error.map(String::from);
        rec.output_size = output_size;
        let duration_ms = Instant::now().duration_since(rec.started).as_millis() as u64;
        let args_size = rec.args_size as u64;
        let tool = rec.tool.clone();

        let agg = inner.tool_aggregates.entry(tool).or_default();
        agg.executions += 1;
        if success {
            agg.success += 1;
        } else {
            agg.failure += 1;
            agg.last_error = error.map(String::from);
        }
        agg.total_duration_ms += duration_ms;
        agg.total_args_size += args_size;
        if let Some(size) = output_size {
            agg.total_output_size += size as u64;
        }
    }

    pub fn record_llm_call(
        &self,
        model: Option<&str>,
        input_tokens: u64,
        output_tokens: u64,
        agent_name: Option<&str>,
    ) {
        let model_key = model.unwrap_or("unknown").to_string();
        let mut inner = self.inner.lock().unwrap();
        let agg = inner.model_aggregates.entry(model_key.clone()).or_default();
        agg.calls += 1;
        agg.input_tokens += input_tokens;
        agg.output_tokens += output_tokens;

        if let Some(agent) = agent_name {
            let by_agent = inner.model_by_agent.entry(agent.to_string()).or_default();
            let aagg = by_agent.entry(model_key).or_default();
            aagg.calls += 1;
            aagg.input_tokens += input_tokens;
            aagg.output_tokens += output_tokens;
        }
    }

    /// Read-only aggregate snapshot. Best-effort: never panics the caller.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock().unwrap();

        let agents: Value = Value::Object(
            inner
                .agent_aggregates
                .iter()
                .map(|(name, agg)| {
                    let avg_ms = if agg.runs > 0 && agg.total_duration_ms > 0 {
                        Some(agg.total_duration_ms / agg.runs.max(1))
                    } else {
                        None
                    };
                    (
                        name.clone(),
                        json!({
                            "runs": agg.runs,
                            "success": agg.success,
                            "error": agg.error,
                            "cancelled": agg.cancelled,
                            "terminated": agg.terminated,
                            "total_duration_ms": agg.total_duration_ms,
                            "total_steps": agg.total_steps,
                            "last_status": agg.last_status,
                            "model": agg.model,
                            "avg_duration_ms": avg_ms,
                        }),
                    )
                })
                .collect(),
        );

        let tools: Value = Value::Object(
            inner
                .tool_aggregates
                .iter()
                .map(|(tool, agg)| {
                    let avg_ms = if agg.executions > 0 && agg.total_duration_ms > 0 {
                        Some(agg.total_duration_ms / agg.executions.max(1))
                    } else {
                        None
                    };
                    (
                        tool.clone(),
                        json!({
                            "executions": agg.executions,
                            "success": agg.success,
                            "failure": agg.failure,
                            "total_duration_ms": agg.total_duration_ms,
                            "total_args_size": agg.total_args_size,
                            "total_output_size": agg.total_output_size,
                            "last_error": agg.last_error,
                            "avg_duration_ms": avg_ms,
                        }),
                    )
                })
                .collect(),
        );

        let by_model: Value = Value::Object(
            inner
                .model_aggregates
                .iter()
                .map(|(model, agg)| {
                    (
                        model.clone(),
                        json!({
                            "calls": agg.calls,
                            "input_tokens": agg.input_tokens,
                            "output_tokens": agg.output_tokens,
                        }),
                    )
                })
                .collect(),
        );

        let by_agent: Value = Value::Object(
            inner
                .model_by_agent
                .iter()
                .map(|(agent, models)| {
                    let inner_map: Value = Value::Object(
                        models
                            .iter()
                            .map(|(model, agg)| {
                                (
                                    model.clone(),
                                    json!({
                                        "calls": agg.calls,
                                        "input_tokens": agg.input_tokens,
                                        "output_tokens": agg.output_tokens,
                                    }),
                                )
                            })
                            .collect(),
                    );
                    (agent.clone(), inner_map)
                })
                .collect(),
        );

        json!({
            "agents": {
                "created": inner.agent_created,
                "by_agent": agents,
            },
            "tools": { "by_tool": tools },
            "models": { "by_model": by_model, "by_agent": by_agent },
        })
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_agent_lifecycle_tallies() {
        let stats = StatsAggregator::new();
        stats.agent_created("planner");
        let run_id = stats.start_agent_run("planner", Some("claude-3"));
        stats.finish_agent_run(&run_id, "finished", Some(3));

        let snap = stats.snapshot();
        assert_eq!(snap["agents"]["created"]["planner"], 1);
        assert_eq!(snap["agents"]["by_agent"]["planner"]["success"], 1);
        assert_eq!(snap["agents"]["by_agent"]["planner"]["total_steps"], 3);
    }

    #[test]
    fn tracks_tool_and_model_tallies() {
        let stats = StatsAggregator::new();
        let run_id = stats.start_tool_run("search", Some("solver"), 12);
        stats.finish_tool_run(&run_id, true, Some(42), None);
        stats.record_llm_call(Some("claude-3"), 100, 50, Some("solver"));

        let snap = stats.snapshot();
        assert_eq!(snap["tools"]["by_tool"]["search"]["executions"], 1);
        assert_eq!(snap["tools"]["by_tool"]["search"]["success"], 1);
        assert_eq!(snap["models"]["by_model"]["claude-3"]["calls"], 1);
        assert_eq!(
            snap["models"]["by_agent"]["solver"]["claude-3"]["input_tokens"],
            100
        );
    }

    #[test]
    fn reset_clears_all_state() {
        let stats = StatsAggregator::new();
        stats.agent_created("x");
        stats.reset();
        let snap = stats.snapshot();
        assert!(snap["agents"]["created"].as_object().unwrap().is_empty());
    }
}
