use thiserror::Error;

use crate::inference::{EngineError, NoCompatibleEngine};
use crate::types::RequestId;

/// Errors returned by [`Runner`](super::Runner) operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RunnerError {
    #[error(transparent)]
    NoCompatibleEngine(#[from] NoCompatibleEngine),

    /// Rejected because another transition is in flight; retry later
    #[error("{operation} rejected: runner is {state}")]
    Busy {
        operation: &'static str,
        state: &'static str,
    },

    #[error("no model is loaded")]
    NotReady,

    #[error("unknown request '{0}'")]
    NotFound(RequestId),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("runner failure: {0}")]
    Fatal(String),
}

impl RunnerError {
    pub fn is_busy(&self) -> bool {
        matches!(self, RunnerError::Busy { .. })
    }
}
