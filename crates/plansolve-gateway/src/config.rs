//! Gateway server configuration: bind address, heartbeat cadence, and the
//! outbound channel limits every connection's sessions inherit.
//!
//! Defaults mirror `myagent/ws/server.py`'s `websockets.serve(...)` call
//! (`max_size`, the 60s `_heartbeat_loop` cadence) and `outbound.py`'s
//! queue/coalescing defaults. `event_namespace`/`broadcast_tasks` mirror
//! `myagent/ws/plan_solver.py`'s `PlanSolverSessionAgent` constructor
//! options (spec §4.4, §6.4).

use plansolve_core::BindMode;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind: BindMode,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub session_idle_timeout_secs: u64,
    pub max_message_bytes: usize,
    pub outbound_queue_size: usize,
    pub coalesce_window_ms: u64,
    /// Prefix applied to every emitted event name (e.g. `"agent1"` turns
    /// `plan.start` into `agent1.plan.start`). `None` leaves events
    /// un-namespaced.
    pub event_namespace: Option<String>,
    /// Whether `plan.completed` payloads include the full `tasks` list.
    /// Disable on deployments where the task list is large or sensitive.
    pub broadcast_tasks: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: BindMode::Loopback,
            port: 8765,
            heartbeat_interval_secs: 60,
            session_idle_timeout_secs: 1800,
            max_message_bytes: 1024 * 1024,
            outbound_queue_size: 1000,
            coalesce_window_ms: 75,
            event_namespace: None,
            broadcast_tasks: true,
        }
    }
}
