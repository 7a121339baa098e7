use thiserror::Error;

use crate::task::TaskType;

#[derive(Debug, Error)]
pub enum OpenmuxError {
    #[error("no model available for task type: {0}")]
    UnsupportedTask(TaskType),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("executor saturated: {limit} jobs already outstanding")]
    Overloaded { limit: usize },

    #[error("executor is closed")]
    PoolClosed,

    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("version bump failed: {0}")]
    Release(String),
}

/// Failures surfaced by an inference backend. Classified by the backend,
/// passed through the adapter untouched.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },

    #[error("rate limited")]
    RateLimited,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("client setup failed: {0}")]
    Client(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}
