//! Evaluation of one submission against one task.
//!
//! Pipeline: lock the task's working directory, materialize the repository
//! at the base commit, apply the patch, run the hidden test in a testbed,
//! classify. Every resource acquired along the way is released before
//! `execute` returns, whichever branch it leaves through.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use patchrun_core::{Submission, SubmissionResult, Task, TaskId};
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::env::EnvManager;
use crate::error::HarnessError;
use crate::patch::format_patch;
use crate::repository::Repository;
use crate::store::LockedKvStore;
use crate::testbed::{CheckOutput, Testbed, ENV_STORE};
use crate::vcs::Vcs;
use crate::workdir::LockedWorkDir;

/// Feedback reported for a submission without a patch.
pub const EMPTY_PATCH: &str = "Empty patch";

/// Subdirectory of the workspace holding per-task working directories,
/// kept apart from the environment store files.
pub const TASKS_DIR: &str = "tasks";

/// Collaborators and settings shared by every evaluation.
#[derive(Clone)]
pub struct EvalContext {
    pub workspace: PathBuf,
    pub persist: bool,
    pub test_timeout: Option<Duration>,
    pub vcs: Arc<dyn Vcs>,
    pub env_manager: Arc<dyn EnvManager>,
    pub env_store: LockedKvStore,
}

impl EvalContext {
    pub fn new(config: &HarnessConfig, vcs: Arc<dyn Vcs>, env_manager: Arc<dyn EnvManager>) -> Self {
        let workspace = config.workspace_dir();
        Self {
            env_store: LockedKvStore::new(&workspace, ENV_STORE),
            workspace,
            persist: config.persist,
            test_timeout: config.test_timeout,
            vcs,
            env_manager,
        }
    }

    /// Working directory of a task.
    pub fn task_dir(&self, id: &TaskId) -> PathBuf {
        self.workspace.join(TASKS_DIR).join(id.as_str())
    }
}

impl std::fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalContext")
            .field("workspace", &self.workspace)
            .field("persist", &self.persist)
            .field("test_timeout", &self.test_timeout)
            .finish()
    }
}

/// One submission paired with its task.
#[derive(Debug)]
pub struct TaskInstance<'a> {
    submission: &'a Submission,
    task: &'a Task,
    ctx: &'a EvalContext,
}

impl<'a> TaskInstance<'a> {
    pub fn new(submission: &'a Submission, task: &'a Task, ctx: &'a EvalContext) -> Self {
        Self {
            submission,
            task,
            ctx,
        }
    }

    /// Evaluate the submission.
    ///
    /// Task outcomes (PASS, FAIL, PATCH FAILED, TIMED OUT) are `Ok`; an
    /// `Err` means the harness could not reach a verdict.
    pub async fn execute(&self) -> Result<SubmissionResult, HarnessError> {
        let id = &self.submission.id;
        if *id != self.task.id {
            return Err(HarnessError::IdMismatch {
                submission: id.clone(),
                task: self.task.id.clone(),
            });
        }
        if !id.is_path_safe() {
            return Err(HarnessError::UnsafeTaskId(id.clone()));
        }
        if self.submission.is_empty() {
            info!(task_id = %id, "Empty patch, skipping evaluation");
            return Ok(SubmissionResult::patch_failed(id.clone(), EMPTY_PATCH));
        }

        let start = Instant::now();
        let workdir = LockedWorkDir::acquire(self.ctx.task_dir(id), self.ctx.persist).await?;
        let outcome = self.in_workdir(workdir.path()).await;
        if let Err(e) = workdir.release().await {
            warn!(task_id = %id, error = %e, "Failed to release working directory");
        }

        if let Ok(result) = &outcome {
            info!(
                task_id = %id,
                message = %result.message,
                duration_ms = start.elapsed().as_millis() as u64,
                "Evaluation finished"
            );
        }
        outcome
    }

    async fn in_workdir(&self, dir: &Path) -> Result<SubmissionResult, HarnessError> {
        let repo = Repository::open(
            &self.task.repo_url,
            dir,
            self.ctx.persist,
            self.ctx.vcs.clone(),
        )
        .await?;
        let outcome = self.with_repository(&repo).await;
        if let Err(e) = repo.close().await {
            warn!(task_id = %self.task.id, error = %e, "Failed to remove clone");
        }
        outcome
    }

    async fn with_repository(&self, repo: &Repository) -> Result<SubmissionResult, HarnessError> {
        let id = &self.submission.id;
        repo.reset(&self.task.base_commit).await?;

        let (applied, diagnostic) = repo.apply_patch(&format_patch(&self.submission.patch)).await?;
        if !applied {
            info!(task_id = %id, "Patch did not apply");
            debug!(task_id = %id, diagnostic = %diagnostic, "Patch diagnostics");
            return Ok(SubmissionResult::patch_failed(id.clone(), diagnostic));
        }

        let mut testbed = Testbed::provision(
            self.task,
            repo.path(),
            &self.ctx.env_store,
            self.ctx.env_manager.clone(),
            self.ctx.persist,
        )
        .await?;
        let check = testbed
            .check(&self.task.test_script, self.ctx.test_timeout)
            .await;
        if let Err(e) = testbed.close().await {
            warn!(task_id = %id, error = %e, "Failed to tear down testbed");
        }

        Ok(classify(id.clone(), check?))
    }
}

/// Map a test run onto a verdict.
pub fn classify(id: TaskId, check: CheckOutput) -> SubmissionResult {
    if check.success {
        SubmissionResult::pass(id)
    } else if check.timed_out {
        SubmissionResult::timed_out(id)
    } else {
        SubmissionResult::fail(id, format!("{}{}", check.stdout, check.stderr))
    }
}
