//! Wire protocol: outbound event envelope, event namespaces, and inbound
//! client messages.
//!
//! Grounded in the teacher's `EventMessage`/`ClientMessage` shapes, adapted
//! to the namespaced `plan.*`/`solver.*`/`aggregate.*`/`agent.*`/`system.*`
//! envelope this domain emits (see `myagent/ws/events.py`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every outbound message: `event`, ISO-8601 `timestamp`, and the optional
/// fields from spec §3.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub event: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl OutboundEvent {
    pub fn new(event: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            timestamp: timestamp.into(),
            session_id: None,
            step_id: None,
            content: None,
            metadata: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Apply a namespace prefix to the event name, uniformly; leaves the
    /// semantics of the event untouched (spec §4.2).
    pub fn namespaced(mut self, namespace: Option<&str>) -> Self {
        if let Some(ns) = namespace {
            self.event = format!("{ns}.{}", self.event);
        }
        self
    }
}

/// Build the current UTC timestamp in ISO-8601, the format every emitted
/// event uses.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn create_event(event: impl Into<String>) -> OutboundEvent {
    OutboundEvent::new(event, now_iso())
}

/// `plan.*` namespace.
pub mod plan_events {
    pub const START: &str = "plan.start";
    pub const COMPLETED: &str = "plan.completed";
    pub const CANCELLED: &str = "plan.cancelled";
    pub const COERCION_ERROR: &str = "plan.coercion_error";
}

/// `solver.*` namespace.
pub mod solver_events {
    pub const START: &str = "solver.start";
    pub const COMPLETED: &str = "solver.completed";
    pub const CANCELLED: &str = "solver.cancelled";
    pub const RESTARTED: &str = "solver.restarted";
}

/// `aggregate.*` namespace.
pub mod aggregate_events {
    pub const START: &str = "aggregate.start";
    pub const COMPLETED: &str = "aggregate.completed";
}

/// `pipeline.*` namespace.
pub mod pipeline_events {
    pub const COMPLETED: &str = "pipeline.completed";
}

/// `agent.*` namespace.
pub mod agent_events {
    pub const USER_CONFIRM: &str = "agent.user_confirm";
    pub const FINAL_ANSWER: &str = "agent.final_answer";
    pub const PARTIAL_ANSWER: &str = "agent.partial_answer";
    pub const LLM_MESSAGE: &str = "agent.llm_message";
    pub const ERROR: &str = "agent.error";
    pub const SESSION_CREATED: &str = "agent.session_created";
    pub const SESSION_END: &str = "agent.session_end";
    pub const INTERRUPTED: &str = "agent.interrupted";
}

/// `system.*` namespace.
pub mod system_events {
    pub const CONNECTED: &str = "system.connected";
    pub const HEARTBEAT: &str = "system.heartbeat";
    pub const ERROR: &str = "system.error";
}

/// `user.*` namespace — inbound only.
pub mod user_events {
    pub const CREATE_SESSION: &str = "user.create_session";
    pub const MESSAGE: &str = "user.message";
    pub const RESPONSE: &str = "user.response";
    pub const CANCEL: &str = "user.cancel";
}

/// Default high-frequency event types eligible for outbound coalescing.
/// Resolved from the original source's literal defaults
/// (`agent.partial_answer`, `agent.llm_message`).
pub fn default_coalesce_events() -> std::collections::HashSet<String> {
    [agent_events::PARTIAL_ANSWER, agent_events::LLM_MESSAGE]
        .into_iter()
        .map(String::from)
        .collect()
}

/// An inbound client message, tagged by `event` per spec §6.1.
#[derive(Clone, Debug, Deserialize)]
pub struct InboundMessage {
    pub event: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
}

/// The payload of a `user.response` message (spec §3, PendingConfirmation).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConfirmationResponse {
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub tasks: Option<Vec<Value>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ConfirmationResponse {
    pub fn declined(reason: impl Into<String>) -> Self {
        Self {
            confirmed: false,
            tasks: None,
            reason: Some(reason.into()),
        }
    }
}

/// Recursively coerce an arbitrary JSON-ish value into a JSON-safe `Value`.
/// `serde_json::Value` is already JSON-safe by construction, so this exists
/// to document and centralize the sanitization step spec §4.4 describes
/// (dataclass/pydantic-like objects flattened to their public fields,
/// everything else passed through); callers building payloads from
/// `Serialize` types should go through `serde_json::to_value` first.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .map(|(k, v)| (k, sanitize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_prefixes_event_name_only_when_given() {
        let event = create_event("started").namespaced(Some("plan"));
        assert_eq!(event.event, "plan.started");
        let event = create_event("started").namespaced(None);
        assert_eq!(event.event, "started");
    }

    #[test]
    fn builder_skips_absent_optional_fields_when_serialized() {
        let event = create_event(agent_events::ERROR).with_content(serde_json::json!({"x": 1}));
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("session_id").is_none());
        assert!(value.get("step_id").is_none());
        assert_eq!(value["content"]["x"], 1);
    }

    #[test]
    fn default_coalesce_events_matches_high_frequency_namespace() {
        let set = default_coalesce_events();
        assert!(set.contains(agent_events::PARTIAL_ANSWER));
        assert!(set.contains(agent_events::LLM_MESSAGE));
        assert!(!set.contains(agent_events::FINAL_ANSWER));
    }

    #[test]
    fn sanitize_drops_underscore_prefixed_keys_recursively() {
        let value = serde_json::json!({
            "keep": 1,
            "_drop": 2,
            "nested": { "_private": 3, "public": 4 },
            "list": [{ "_hidden": 5, "visible": 6 }],
        });
        let cleaned = sanitize(value);
        assert_eq!(cleaned["keep"], 1);
        assert!(cleaned.get("_drop").is_none());
        assert!(cleaned["nested"].get("_private").is_none());
        assert_eq!(cleaned["nested"]["public"], 4);
        assert!(cleaned["list"][0].get("_hidden").is_none());
        assert_eq!(cleaned["list"][0]["visible"], 6);
    }

    #[test]
    fn inbound_message_defaults_optional_fields() {
        let msg: InboundMessage = serde_json::from_str(r#"{"event":"user.cancel"}"#).unwrap();
        assert_eq!(msg.event, "user.cancel");
        assert!(msg.session_id.is_none());
        assert!(msg.content.is_none());
    }
}
