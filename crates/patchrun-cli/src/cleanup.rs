//! `patchrun cleanup`

use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use patchrun_harness::{
    CondaEnvManager, EnvHandle, EnvManager, LockedKvStore, ENV_STORE, WORKSPACE_DIR,
};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Work directory {} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("Work directory has no environment store at {}", .0.display())]
    NoStore(PathBuf),

    #[error("Work directory contains unexpected file {}", .0.display())]
    UnexpectedFile(PathBuf),
}

pub async fn run(
    work_dir: Option<PathBuf>,
    yes: bool,
    workers: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let env_manager: Arc<dyn EnvManager> = Arc::new(CondaEnvManager::default());

    let envs = match &work_dir {
        Some(dir) => {
            validate_work_dir(dir)?;
            let absolute = std::path::absolute(dir)?;
            if !yes && !confirm(&format!(
                "Are you sure you want to delete the files in {} (yes/no): ",
                absolute.display()
            ))? {
                println!("Operation cancelled by user.");
                return Ok(());
            }
            stored_envs(dir).await?
        }
        None => env_manager
            .list()
            .await?
            .into_iter()
            .filter(EnvHandle::is_harness_env)
            .collect(),
    };

    info!(count = envs.len(), "Removing environments");
    let failed = remove_all(env_manager, envs, workers).await;
    if failed > 0 {
        warn!(failed, "Some environments could not be removed");
    }

    if let Some(dir) = work_dir {
        tokio::fs::remove_dir_all(&dir).await?;
        info!(path = %dir.display(), "Work directory removed");
    }
    Ok(())
}

/// A work directory holds `workspace/<store>.json` and directories only.
fn validate_work_dir(dir: &Path) -> Result<(), CleanupError> {
    if !dir.exists() {
        return Err(CleanupError::Missing(dir.to_path_buf()));
    }
    let workspace = dir.join(WORKSPACE_DIR);
    let store_file = workspace.join(format!("{ENV_STORE}.json"));
    if !store_file.is_file() {
        return Err(CleanupError::NoStore(store_file));
    }

    let entries = std::fs::read_dir(&workspace).map_err(|_| CleanupError::NoStore(store_file.clone()))?;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path != store_file && !path.is_dir() {
            return Err(CleanupError::UnexpectedFile(path));
        }
    }
    Ok(())
}

async fn stored_envs(dir: &Path) -> Result<Vec<EnvHandle>, Box<dyn std::error::Error>> {
    let store = LockedKvStore::new(dir.join(WORKSPACE_DIR), ENV_STORE);
    let names: BTreeSet<String> = store.entries().await?.into_values().collect();
    Ok(names.into_iter().map(EnvHandle::new).collect())
}

fn confirm(prompt: &str) -> std::io::Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

/// Remove `envs` with at most `workers` removals in flight; returns the failure count.
async fn remove_all(env_manager: Arc<dyn EnvManager>, envs: Vec<EnvHandle>, workers: usize) -> usize {
    let workers = workers.max(1);
    let total = envs.len();
    let mut running = JoinSet::new();
    let mut done = 0;
    let mut failed = 0;

    let mut tally = |joined: Result<Result<(), String>, tokio::task::JoinError>| {
        done += 1;
        match joined {
            Ok(Ok(())) => info!("[{done}/{total}] Environment removed"),
            Ok(Err(e)) => {
                failed += 1;
                warn!(error = %e, "[{done}/{total}] Failed to remove environment");
            }
            Err(e) => {
                failed += 1;
                warn!(error = %e, "[{done}/{total}] Removal task failed");
            }
        }
    };

    for env in envs {
        if running.len() >= workers {
            if let Some(joined) = running.join_next().await {
                tally(joined);
            }
        }
        let manager = env_manager.clone();
        running.spawn(async move {
            manager
                .remove(&env)
                .await
                .map_err(|e| format!("{env}: {e}"))
        });
    }
    while let Some(joined) = running.join_next().await {
        tally(joined);
    }
    failed
}
