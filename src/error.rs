use thiserror::Error;

/// Custom Result type for this crate.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that abort a whole call (construction, submission, worker plumbing).
///
/// Per-item failures never surface here; they are folded into a
/// `ProcessingResult` through [`TaskError`].
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization/Deserialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<serde_yaml::Error> for ExecutorError {
    fn from(err: serde_yaml::Error) -> Self {
        ExecutorError::ConfigError(err.to_string())
    }
}

/// Failure of a single work item. The `Display` output is what ends up in
/// `ProcessingResult::error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("worker crashed ({worker_id}): {detail}")]
    WorkerCrash { worker_id: String, detail: String },

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("read failed: {0}")]
    Io(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }

    /// Builds a `Panicked` error from the payload returned by `catch_unwind`
    /// or a `JoinError`.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        TaskError::Panicked(msg)
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TaskError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            TaskError::from_panic(err.into_panic())
        } else {
            TaskError::Cancelled
        }
    }
}
