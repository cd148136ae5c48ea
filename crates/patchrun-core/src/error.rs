//! Core domain errors.

use thiserror::Error;

use crate::TaskId;

/// Core domain errors for patchrun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task not found in the dataset.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Two dataset entries share the same id.
    #[error("Duplicate task id in dataset: {0}")]
    DuplicateTask(TaskId),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading a dataset or submissions file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
