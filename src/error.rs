use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the synchronization and verification engine.
///
/// Per-host failures inside a sync run are recorded on the detail row and never
/// abort the run; only registration and submission errors reach the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Network, auth or decoding failure talking to an external data source.
    #[error("data source error: {0}")]
    AdapterTransient(String),

    /// Inventory or history write/read failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Malformed trigger expression or otherwise unschedulable task.
    #[error("registration error: {0}")]
    Registration(String),

    /// The remote execution service refused a verification request.
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    /// A verification batch never reached a terminal state.
    #[error("verification '{execution_task_id}' not terminal after {ceiling:?}")]
    PollTimeout {
        execution_task_id: String,
        ceiling: Duration,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::AdapterTransient(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("JSON encoding failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
