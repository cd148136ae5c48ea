//! Error types for the evaluation harness.
//!
//! Everything here is an infrastructure failure. Verdicts about a
//! submission (PASS, FAIL, PATCH FAILED, TIMED OUT) are ordinary
//! [`SubmissionResult`](patchrun_core::SubmissionResult) values.

use std::path::PathBuf;
use std::time::Duration;

use patchrun_core::{CoreError, TaskId};
use thiserror::Error;

/// Errors that can occur while driving external tools.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The external program could not be started.
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The external program ran and reported failure.
    #[error("Command '{command}' exited with code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The external program exceeded its deadline and was killed.
    #[error("Command '{command}' timed out after {after:?}")]
    CommandTimedOut { command: String, after: Duration },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Environment store contents could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The environment manager could not produce a usable environment.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// A directory expected to hold a clone is not a repository.
    #[error("Not a valid repository: {}", .0.display())]
    InvalidRepository(PathBuf),

    /// No branch contains the given commit.
    #[error("No branch contains commit {0}")]
    BranchNotFound(String),

    /// Task id cannot be used as a working directory name.
    #[error("Task id is not usable as a directory name: {0:?}")]
    UnsafeTaskId(TaskId),

    /// Submission and task ids disagree.
    #[error("Submission id {submission} does not match task id {task}")]
    IdMismatch { submission: TaskId, task: TaskId },

    /// Dataset lookups and other domain errors.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An evaluation task panicked or was aborted.
    #[error("Evaluation worker failed: {0}")]
    Worker(String),
}

impl HarnessError {
    /// Whether retrying the same submission could plausibly succeed.
    ///
    /// Tool failures and timeouts are transient from the harness' point of
    /// view; bad ids and missing tasks will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnsafeTaskId(_) | Self::IdMismatch { .. } | Self::Core(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let timed_out = HarnessError::CommandTimedOut {
            command: "git clone".to_string(),
            after: Duration::from_secs(1),
        };
        assert!(timed_out.is_retryable());

        let missing = HarnessError::Core(CoreError::TaskNotFound(TaskId::new("x")));
        assert!(!missing.is_retryable());
        assert_eq!(missing.to_string(), "Task not found: x");
    }
}
