//! Batch evaluation with a fixed-size worker pool.
//!
//! Submissions are fed through a bounded channel to exactly `n_workers`
//! long-lived workers. Each worker evaluates one submission at a time, so
//! no more than `n_workers` working directories, environments and test
//! processes are ever in use at once. Closing the channel is the shutdown
//! signal. Results are collected in completion order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use patchrun_core::{Dataset, EvalMessage, Submission, SubmissionResult, TaskId};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::env::{CondaEnvManager, EnvManager};
use crate::error::HarnessError;
use crate::instance::{EvalContext, TaskInstance};
use crate::repository::{RepoFile, Repository};
use crate::vcs::{GitCli, Vcs};

/// Progress notifications emitted by [`SubmissionEnv::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Started {
        total: usize,
        at: DateTime<Utc>,
    },
    Completed {
        id: TaskId,
        message: EvalMessage,
        done: usize,
        total: usize,
    },
    Finished {
        total: usize,
        at: DateTime<Utc>,
    },
}

type JobQueue = Arc<Mutex<mpsc::Receiver<Submission>>>;

/// Evaluates submissions against a dataset.
#[derive(Clone)]
pub struct SubmissionEnv {
    dataset: Arc<Dataset>,
    ctx: Arc<EvalContext>,
    infra_retries: u32,
    progress: Option<mpsc::Sender<BatchEvent>>,
}

impl SubmissionEnv {
    /// Environment driving `git` and `conda` as configured.
    pub fn new(dataset: Dataset, config: &HarnessConfig) -> Self {
        let vcs = GitCli::new(&config.git_program).with_timeout(config.command_timeout);
        let env_manager =
            CondaEnvManager::new(&config.conda_program).with_timeout(config.command_timeout);
        Self::with_collaborators(dataset, config, Arc::new(vcs), Arc::new(env_manager))
    }

    /// Environment with explicit collaborators.
    pub fn with_collaborators(
        dataset: Dataset,
        config: &HarnessConfig,
        vcs: Arc<dyn Vcs>,
        env_manager: Arc<dyn EnvManager>,
    ) -> Self {
        Self {
            dataset: Arc::new(dataset),
            ctx: Arc::new(EvalContext::new(config, vcs, env_manager)),
            infra_retries: config.infra_retries,
            progress: None,
        }
    }

    /// Send [`BatchEvent`]s to `tx` during [`run`](Self::run).
    pub fn with_progress(mut self, tx: mpsc::Sender<BatchEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn context(&self) -> &EvalContext {
        &self.ctx
    }

    /// Text files of a task's repository at its base commit.
    ///
    /// Clones into a scratch directory that is removed before returning,
    /// so nothing here touches the task's working directory or its lock.
    pub async fn get_context(&self, id: &TaskId) -> Result<Vec<RepoFile>, HarnessError> {
        let task = self.dataset.get(id)?;
        let scratch = tempfile::tempdir()?;
        let repo = Repository::open(&task.repo_url, scratch.path(), false, self.ctx.vcs.clone()).await?;

        let files = match repo.reset(&task.base_commit).await {
            Ok(()) => Ok(repo.files().collect::<Vec<_>>()),
            Err(e) => Err(e),
        };
        if let Err(e) = repo.close().await {
            warn!(task_id = %id, error = %e, "Failed to remove context clone");
        }
        let files = files?;
        debug!(task_id = %id, files = files.len(), "Collected repository context");
        Ok(files)
    }

    /// Evaluate a single submission.
    pub async fn step(&self, submission: &Submission) -> Result<SubmissionResult, HarnessError> {
        let task = self.dataset.get(&submission.id)?;
        TaskInstance::new(submission, task, &self.ctx).execute().await
    }

    /// Evaluate a batch with `n_workers` concurrent workers (at least one).
    ///
    /// Every submission yields exactly one result. Infrastructure errors
    /// are retried up to the configured count and then reported as
    /// [`EvalMessage::Error`]; they never abort the batch.
    pub async fn run(&self, submissions: Vec<Submission>, n_workers: usize) -> Vec<SubmissionResult> {
        let total = submissions.len();
        let n_workers = n_workers.max(1);
        let start = Instant::now();
        info!(total, n_workers, "Starting batch");
        self.emit(BatchEvent::Started {
            total,
            at: Utc::now(),
        })
        .await;

        let mut pending: HashMap<TaskId, usize> = HashMap::new();
        for submission in &submissions {
            *pending.entry(submission.id.clone()).or_default() += 1;
        }

        let (job_tx, job_rx) = mpsc::channel::<Submission>(n_workers);
        let jobs: JobQueue = Arc::new(Mutex::new(job_rx));
        let producer = tokio::spawn(async move {
            for submission in submissions {
                if job_tx.send(submission).await.is_err() {
                    break;
                }
            }
            // job_tx dropped here: workers drain the queue and exit.
        });

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<SubmissionResult>();
        let mut workers = JoinSet::new();
        for worker_id in 0..n_workers {
            let env = self.clone();
            let jobs = jobs.clone();
            let results = result_tx.clone();
            workers.spawn(env.worker(worker_id, jobs, results));
        }
        drop(result_tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            if let Some(count) = pending.get_mut(&result.id) {
                *count = count.saturating_sub(1);
            }
            results.push(result);
            let last = &results[results.len() - 1];
            self.emit(BatchEvent::Completed {
                id: last.id.clone(),
                message: last.message,
                done: results.len(),
                total,
            })
            .await;
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker terminated abnormally");
            }
        }
        if let Err(e) = producer.await {
            error!(error = %e, "Submission producer failed");
        }

        for (id, missing) in pending {
            for _ in 0..missing {
                warn!(task_id = %id, "No result recorded, reporting as error");
                let lost = HarnessError::Worker("evaluation produced no result".to_string());
                results.push(SubmissionResult::infra_error(id.clone(), lost));
            }
        }

        info!(
            total,
            passed = results.iter().filter(|r| r.success).count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch finished"
        );
        self.emit(BatchEvent::Finished {
            total,
            at: Utc::now(),
        })
        .await;
        results
    }

    async fn worker(
        self,
        worker_id: usize,
        jobs: JobQueue,
        results: mpsc::UnboundedSender<SubmissionResult>,
    ) {
        debug!(worker_id, "Worker started");
        loop {
            let next = jobs.lock().await.recv().await;
            let Some(submission) = next else {
                break;
            };

            let id = submission.id.clone();
            debug!(worker_id, task_id = %id, "Worker picked up submission");

            // Separate task so a panic is contained to this submission.
            let env = self.clone();
            let mut evaluation =
                AbortOnDrop(tokio::spawn(async move { env.evaluate(&submission).await }));
            let result = match (&mut evaluation.0).await {
                Ok(result) => result,
                Err(e) => {
                    error!(worker_id, task_id = %id, error = %e, "Evaluation panicked");
                    SubmissionResult::infra_error(id, HarnessError::Worker(e.to_string()))
                }
            };

            if results.send(result).is_err() {
                break;
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn evaluate(&self, submission: &Submission) -> SubmissionResult {
        let mut attempt: u32 = 0;
        loop {
            match self.step(submission).await {
                Ok(result) => return result,
                Err(e) if e.is_retryable() && attempt < self.infra_retries => {
                    attempt += 1;
                    warn!(
                        task_id = %submission.id,
                        attempt,
                        max_retries = self.infra_retries,
                        error = %e,
                        "Infrastructure error, retrying"
                    );
                }
                Err(e) => {
                    error!(task_id = %submission.id, error = %e, "Evaluation failed");
                    return SubmissionResult::infra_error(submission.id.clone(), e);
                }
            }
        }
    }

    async fn emit(&self, event: BatchEvent) {
        if let Some(tx) = &self.progress {
            if tx.send(event).await.is_err() {
                debug!("Progress receiver dropped");
            }
        }
    }
}

/// Aborts the wrapped task when dropped, so cancelling a worker also
/// cancels the evaluation it is waiting on.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl std::fmt::Debug for SubmissionEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionEnv")
            .field("tasks", &self.dataset.len())
            .field("ctx", &self.ctx)
            .field("infra_retries", &self.infra_retries)
            .finish()
    }
}
