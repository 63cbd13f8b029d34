use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    WorkFailure(String),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Group is closed to new tasks")]
    GroupClosed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task not found: {0}")]
    NotFound(String),
}

pub type TaskResult<T> = Result<T, TaskError>;
