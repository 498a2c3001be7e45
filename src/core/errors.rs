use crate::core::model::{TaskId, TaskState};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("corrupt row {id}: {detail}")]
    Corrupt { id: TaskId, detail: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
