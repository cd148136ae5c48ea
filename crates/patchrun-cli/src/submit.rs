//! `patchrun submit`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Args;
use patchrun_core::{Dataset, Submission, SubmissionResult};
use patchrun_harness::{BatchEvent, HarnessConfig, SubmissionEnv};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Args)]
pub struct SubmitArgs {
    /// JSON array of {"id", "patch"} objects
    #[arg(long)]
    submissions: PathBuf,

    /// Dataset JSON file
    #[arg(long)]
    dataset: PathBuf,

    /// Where working directories and the environment store live
    #[arg(long)]
    work_dir: PathBuf,

    /// Output file
    #[arg(long, default_value = "results.json")]
    results: PathBuf,

    /// Concurrent evaluations
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Keep clones and environments for later runs
    #[arg(long)]
    persist: bool,

    /// Test script deadline in seconds (0 disables it)
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Retries for submissions that hit an infrastructure error
    #[arg(long, default_value_t = 0)]
    retries: u32,
}

pub async fn run(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let submissions = load_submissions(&args.submissions).await?;
    let dataset = Dataset::from_json_file(&args.dataset)?;
    info!(
        submissions = submissions.len(),
        tasks = dataset.len(),
        "Loaded submissions and dataset"
    );

    if tokio::fs::try_exists(&args.work_dir).await? {
        info!(path = %args.work_dir.display(), "Reusing existing work directory");
    } else {
        info!(path = %args.work_dir.display(), "Creating work directory");
        tokio::fs::create_dir_all(&args.work_dir).await?;
    }

    let test_timeout = (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs));
    let config = HarnessConfig::new(&args.work_dir)
        .with_persist(args.persist)
        .with_test_timeout(test_timeout)
        .with_infra_retries(args.retries);

    let (tx, rx) = mpsc::channel(64);
    let env = SubmissionEnv::new(dataset, &config).with_progress(tx);
    let reporter = tokio::spawn(report_progress(rx));

    let start = Instant::now();
    let count = submissions.len();
    let results = env.run(submissions, args.workers).await;
    drop(env);
    reporter.await?;

    tokio::fs::write(&args.results, serde_json::to_string_pretty(&results)?).await?;

    for (message, n) in summarize(&results) {
        println!("  {message:<14} {n}");
    }
    println!(
        "Processed {} submissions in {:.2} seconds",
        count,
        start.elapsed().as_secs_f64()
    );
    println!("Results written to {}", args.results.display());

    Ok(())
}

async fn load_submissions(path: &Path) -> Result<Vec<Submission>, Box<dyn std::error::Error>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

async fn report_progress(mut rx: mpsc::Receiver<BatchEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            BatchEvent::Started { total, at } => {
                info!(total, started_at = %at, "Evaluating submissions");
            }
            BatchEvent::Completed {
                id,
                message,
                done,
                total,
            } => {
                info!(task_id = %id, %message, "[{done}/{total}] Submission evaluated");
            }
            BatchEvent::Finished { total, at } => {
                info!(total, finished_at = %at, "All submissions evaluated");
            }
        }
    }
}

/// Result counts per message, sorted by message.
fn summarize(results: &[SubmissionResult]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for result in results {
        *counts.entry(result.message.as_str()).or_default() += 1;
    }
    counts
}
