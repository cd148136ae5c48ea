//! Patch evaluation harness for patchrun
//!
//! This crate evaluates untrusted patches against benchmark tasks: it
//! clones the task repository into a locked working directory, applies the
//! patch, runs the hidden test inside an isolated environment and turns
//! the outcome into a [`SubmissionResult`](patchrun_core::SubmissionResult).
//! Version control and environment management are delegated to external
//! tools behind the [`Vcs`] and [`EnvManager`] traits.
//!
//! # Example
//!
//! ```rust,no_run
//! use patchrun_core::{Dataset, Submission};
//! use patchrun_harness::{HarnessConfig, SubmissionEnv};
//!
//! async fn evaluate() -> Result<(), Box<dyn std::error::Error>> {
//!     let dataset = Dataset::from_json_file("dataset.json")?;
//!     let config = HarnessConfig::new("/tmp/patchrun").with_persist(true);
//!     let env = SubmissionEnv::new(dataset, &config);
//!
//!     let submissions = vec![Submission::new("task-1", "diff --git ...")];
//!     for result in env.run(submissions, 4).await {
//!         println!("{}: {}", result.id, result.message);
//!     }
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod instance;
mod lock;
mod process;
mod store;
mod submission_env;
mod workdir;

pub mod env;
pub mod patch;
pub mod repository;
pub mod testbed;
pub mod vcs;

#[cfg(test)]
mod testing;

pub use config::{HarnessConfig, WORKSPACE_DIR};
pub use env::{CondaEnvManager, EnvHandle, EnvManager};
pub use error::HarnessError;
pub use instance::{classify, EvalContext, TaskInstance, EMPTY_PATCH, TASKS_DIR};
pub use lock::{get_lock, LockRegistry, ResourceLock};
pub use patch::{extract_modified_files, filter_binary_patch, format_patch};
pub use process::{CommandOutput, ToolCommand};
pub use repository::{RepoFile, Repository};
pub use store::LockedKvStore;
pub use submission_env::{BatchEvent, SubmissionEnv};
pub use testbed::{CheckOutput, ScriptDialect, Testbed, TestbedState, ENV_STORE, TIMED_OUT};
pub use vcs::{GitCli, Vcs};
pub use workdir::LockedWorkDir;
