//! Error types for the plan/solve orchestration core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("pending confirmation step not found: {0}")]
    StepNotFound(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("planner '{planner}' produced no tasks for question: {question}")]
    EmptyTaskList { planner: String, question: String },

    #[error("duplicate task id in plan context: {0}")]
    DuplicateTaskId(String),

    #[error("planning failed: {0}")]
    PlanningFailed(String),

    #[error("failed to coerce edited tasks: {0}")]
    CoercionFailed(String),

    #[error("solver task failed: {0}")]
    SolverFailed(String),

    #[error("aggregator failed: {0}")]
    AggregatorFailed(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }

    pub fn empty_task_list(planner: impl Into<String>, question: impl Into<String>) -> Self {
        Self::EmptyTaskList {
            planner: planner.into(),
            question: question.into(),
        }
    }
}
