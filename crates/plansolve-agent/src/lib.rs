//! Orchestration layer: outbound event delivery, runtime statistics, solver
//! bookkeeping, the plan→solve pipeline, and the session-facing adapter
//! that drives it through a confirm/replan conversation.

pub mod outbound;
pub mod pipeline;
pub mod registry;
pub mod session_agent;
pub mod stats;

#[cfg(test)]
mod test_support;

pub use outbound::{OutboundChannel, OutboundChannelConfig, Transport};
pub use pipeline::{
    AgentHandle, Aggregator, PlanAgent, PlanContext, PlanSolveResult, PlanSolverPipeline,
    ProgressCallback, SolverAgent, SolverRunResult, Task,
};
pub use registry::ActiveSolverRegistry;
pub use session_agent::{PlanSolverSessionAgent, SessionMode, SessionState};
pub use stats::StatsAggregator;
