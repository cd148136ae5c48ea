//! patchrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Subprocesses or external tools
//! - Async runtimes
//!
//! Tasks describe benchmark problems, submissions carry candidate patches,
//! and results carry the verdict of one evaluation.

pub mod dataset;
pub mod error;
pub mod ids;
pub mod submission;
pub mod task;

// Re-export commonly used types
pub use dataset::Dataset;
pub use error::CoreError;
pub use ids::TaskId;
pub use submission::{EvalMessage, Submission, SubmissionResult};
pub use task::Task;
