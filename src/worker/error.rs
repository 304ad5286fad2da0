//! Worker Error Types

use thiserror::Error;

use crate::error::StoreError;

/// Queue backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid queue configuration: {0}")]
    Config(String),

    #[error("Internal queue error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Redis(_) => "QUEUE_UNAVAILABLE",
            QueueError::Serialization(_) => "QUEUE_SERIALIZATION",
            QueueError::TaskNotFound(_) => "TASK_NOT_FOUND",
            QueueError::Config(_) => "QUEUE_CONFIG",
            QueueError::Internal(_) => "QUEUE_INTERNAL",
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Redis(e.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

/// Handler outcome classification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Retrying can never succeed; archive after this attempt
    #[error("permanent task failure: {0}")]
    Permanent(String),

    /// May succeed later; reschedule with backoff while retries remain
    #[error("retryable task failure: {0}")]
    Retryable(String),
}

impl TaskError {
    #[inline]
    pub fn is_permanent(&self) -> bool {
        matches!(self, TaskError::Permanent(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            TaskError::Permanent(_) => "PERMANENT_TASK_FAILURE",
            TaskError::Retryable(_) => "RETRYABLE_TASK_FAILURE",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            TaskError::Permanent(reason) | TaskError::Retryable(reason) => reason,
        }
    }

    /// Classify a store failure met while handling a task
    ///
    /// A missing referent or invalid input cannot fix itself, everything
    /// else is treated as transient.
    pub fn from_store(context: &str, e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) | StoreError::Validation(_) => {
                TaskError::Permanent(format!("{context}: {e}"))
            }
            _ => TaskError::Retryable(format!("{context}: {e}")),
        }
    }
}
