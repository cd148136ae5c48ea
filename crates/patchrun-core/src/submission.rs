//! Submissions and their evaluation results.

use crate::TaskId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A candidate patch for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Id of the task this patch targets.
    pub id: TaskId,

    /// Unified diff produced by the patch author.
    pub patch: String,
}

impl Submission {
    /// Create a new Submission.
    pub fn new(id: impl Into<TaskId>, patch: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            patch: patch.into(),
        }
    }

    /// True when there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.patch.trim().is_empty()
    }
}

/// Short classification of an evaluation.
///
/// The first four variants are task outcomes. `Error` marks a submission
/// the harness could not evaluate because of an infrastructure failure
/// (clone, provisioning, missing task) and is never produced by a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvalMessage {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "PATCH FAILED")]
    PatchFailed,
    #[serde(rename = "TIMED OUT")]
    TimedOut,
    #[serde(rename = "ERROR")]
    Error,
}

impl EvalMessage {
    /// Wire representation, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::PatchFailed => "PATCH FAILED",
            Self::TimedOut => "TIMED OUT",
            Self::Error => "ERROR",
        }
    }

    /// True for verdicts about the submission itself.
    pub fn is_task_outcome(&self) -> bool {
        !matches!(self, Self::Error)
    }
}

impl fmt::Display for EvalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating one submission. Produced exactly once per evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    /// Task id of the evaluated submission.
    pub id: TaskId,

    /// True only for `PASS`.
    pub success: bool,

    /// Verdict.
    pub message: EvalMessage,

    /// Captured test output or patch diagnostics; empty on PASS and TIMED OUT.
    pub test_suite_feedback: String,
}

impl SubmissionResult {
    pub fn pass(id: TaskId) -> Self {
        Self {
            id,
            success: true,
            message: EvalMessage::Pass,
            test_suite_feedback: String::new(),
        }
    }

    pub fn fail(id: TaskId, feedback: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            message: EvalMessage::Fail,
            test_suite_feedback: feedback.into(),
        }
    }

    pub fn patch_failed(id: TaskId, diagnostic: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            message: EvalMessage::PatchFailed,
            test_suite_feedback: diagnostic.into(),
        }
    }

    pub fn timed_out(id: TaskId) -> Self {
        Self {
            id,
            success: false,
            message: EvalMessage::TimedOut,
            test_suite_feedback: String::new(),
        }
    }

    /// Record an infrastructure failure for a submission.
    pub fn infra_error(id: TaskId, error: impl fmt::Display) -> Self {
        Self {
            id,
            success: false,
            message: EvalMessage::Error,
            test_suite_feedback: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_json_shape() {
        let result = SubmissionResult::patch_failed(TaskId::new("3_2"), "Empty patch");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": "3_2",
                "success": false,
                "message": "PATCH FAILED",
                "test_suite_feedback": "Empty patch"
            })
        );
    }

    #[test]
    fn test_message_round_trips_through_wire_names() {
        let parsed: EvalMessage = serde_json::from_str("\"TIMED OUT\"").unwrap();
        assert_eq!(parsed, EvalMessage::TimedOut);
        assert_eq!(parsed.to_string(), "TIMED OUT");
        assert!(!EvalMessage::Error.is_task_outcome());
    }

    #[test]
    fn test_submissions_parse_from_array() {
        let json = r#"[{"id": "a", "patch": ""}, {"id": "b", "patch": "diff --git a/x b/x"}]"#;
        let subs: Vec<Submission> = serde_json::from_str(json).unwrap();
        assert_eq!(subs.len(), 2);
        assert!(subs[0].is_empty());
        assert!(!subs[1].is_empty());
    }
}
