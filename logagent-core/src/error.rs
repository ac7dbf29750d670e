//! Domain error taxonomy: transient I/O, permanent delivery,
//! resource exhaustion, source errors, invariant violations, and config
//! errors all map onto one `AgentError`, so callers in the dispatcher can
//! pattern-match to decide retry vs. DLQ vs. fatal.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transient sink error ({sink}): {message}")]
    SinkTransient { sink: String, message: String },

    #[error("permanent sink error ({sink}): {message}")]
    SinkPermanent { sink: String, message: String },

    #[error("circuit breaker open for sink {sink}")]
    BreakerOpen { sink: String },

    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("enqueue timed out after {0:?}")]
    EnqueueTimeout(std::time::Duration),

    #[error("disk buffer exhausted: {0}")]
    BufferExhausted(String),

    #[error("source error ({source_id}): {message}")]
    Source { source_id: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Transient I/O errors are retryable; permanent delivery failures
    /// and malformed payloads are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::SinkTransient { .. }
                | AgentError::BreakerOpen { .. }
                | AgentError::Io(_)
                | AgentError::QueueFull { .. }
                | AgentError::EnqueueTimeout(_)
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AgentError::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
