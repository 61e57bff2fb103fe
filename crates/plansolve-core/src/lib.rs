//! Core types, error taxonomy, and wire protocol for the plan/solve
//! orchestration server.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;
