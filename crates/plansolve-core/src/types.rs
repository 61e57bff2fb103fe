//! Core identity and value types shared by the orchestration core and the
//! session/gateway layers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Stable identity for a task inside a single solve phase, cheaply cloneable.
///
/// Mirrors the task-keying rule in the original source: `task:{id}` when the
/// task carries a non-null `id` field, otherwise a handle derived from the
/// task's position/object identity.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct TaskKey(Arc<str>);

impl TaskKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key for a task carrying an explicit id.
    pub fn from_id(id: impl std::fmt::Display) -> Self {
        Self::new(format!("task:{id}"))
    }

    /// Key for a task with no id, derived from its position in the plan.
    pub fn from_index(index: usize) -> Self {
        Self::new(format!("task_obj:{index}"))
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for TaskKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Session identifier — cheaply cloneable, used as the map key across the
/// session registry and as the coalescing key's second component.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A connection identifier, distinct from the session id: one connection may
/// outlive several create_session round-trips before the socket closes.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single LLM-call record, opaque beyond the three attribution fields the
/// core relies on. Additional domain fields (tokens, latency, ...) may be
/// present and are preserved as-is.
pub type CallRecord = serde_json::Map<String, Value>;

/// Ensures a call record carries `origin`/`agent`, and fills `model` from a
/// fallback when the record itself does not carry one.
///
/// Precedence: record-level `model`, then `fallback_model` (the agent's
/// configured LLM model), then omitted entirely.
pub fn annotate_call_record(
    mut record: CallRecord,
    origin: &str,
    agent: &str,
    fallback_model: Option<&str>,
) -> CallRecord {
    record
        .entry("origin".to_string())
        .or_insert_with(|| Value::String(origin.to_string()));
    record
        .entry("agent".to_string())
        .or_insert_with(|| Value::String(agent.to_string()));
    let has_model = record.get("model").map(|v| !v.is_null()).unwrap_or(false);
    if !has_model {
        if let Some(model) = fallback_model {
            record.insert("model".to_string(), Value::String(model.to_string()));
        }
    }
    record
}

/// Server bind mode, mirrors the teacher's loopback/LAN split.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    #[default]
    Lan,
}

impl BindMode {
    pub fn to_addr(self) -> &'static str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_key_distinguishes_id_and_positional_keys() {
        assert_eq!(TaskKey::from_id("a").as_str(), "task:a");
        assert_eq!(TaskKey::from_index(3).as_str(), "task_obj:3");
        assert_ne!(TaskKey::from_id("3"), TaskKey::from_index(3));
    }

    #[test]
    fn annotate_call_record_fills_origin_agent_and_model_fallback() {
        let record = CallRecord::new();
        let annotated = annotate_call_record(record, "planner", "demo-planner", Some("gpt"));
        assert_eq!(annotated["origin"], "planner");
        assert_eq!(annotated["agent"], "demo-planner");
        assert_eq!(annotated["model"], "gpt");
    }

    #[test]
    fn annotate_call_record_prefers_explicit_model_over_fallback() {
        let mut record = CallRecord::new();
        record.insert("model".to_string(), Value::String("explicit".to_string()));
        let annotated = annotate_call_record(record, "solver", "demo-solver", Some("fallback"));
        assert_eq!(annotated["model"], "explicit");
    }

    #[test]
    fn bind_mode_maps_to_expected_addresses() {
        assert_eq!(BindMode::Loopback.to_addr(), "127.0.0.1");
        assert_eq!(BindMode::Lan.to_addr(), "0.0.0.0");
    }
}
