//! Scoped handle on a local clone.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::HarnessError;
use crate::process::CommandOutput;
use crate::vcs::Vcs;

/// A text file read from the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    /// Base name.
    pub filename: String,
    /// Absolute path.
    pub filepath: PathBuf,
    /// Path relative to the repository root.
    pub rel_filepath: PathBuf,
    /// UTF-8 content.
    pub content: String,
}

/// A clone of a repository on local disk.
///
/// Created with [`open`](Self::open) (clones if needed) or
/// [`from_path`](Self::from_path) (adopts an existing clone). Call
/// [`close`](Self::close) when done; a non-persistent handle deletes the
/// clone on close.
pub struct Repository {
    url: String,
    path: PathBuf,
    persist: bool,
    vcs: Arc<dyn Vcs>,
    default_branch: OnceCell<String>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("url", &self.url)
            .field("path", &self.path)
            .field("persist", &self.persist)
            .finish()
    }
}

impl Repository {
    /// Clone `url` into `<parent_dir>/<repo name>` unless that clone exists.
    pub async fn open(
        url: &str,
        parent_dir: &Path,
        persist: bool,
        vcs: Arc<dyn Vcs>,
    ) -> Result<Self, HarnessError> {
        let path = std::path::absolute(parent_dir.join(repo_name(url)))?;

        if tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "Reusing existing clone");
        } else {
            info!(url, path = %path.display(), "Cloning repository");
            vcs.clone_repo(url, &path).await?;
        }

        Ok(Self {
            url: url.to_string(),
            path,
            persist,
            vcs,
            default_branch: OnceCell::new(),
        })
    }

    /// Adopt an existing clone. The handle never deletes it.
    pub async fn from_path(path: impl AsRef<Path>, vcs: Arc<dyn Vcs>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await? || vcs.status(path).await?.is_none() {
            return Err(HarnessError::InvalidRepository(path.to_path_buf()));
        }
        Ok(Self {
            url: String::new(),
            path: std::path::absolute(path)?,
            persist: true,
            vcs,
            default_branch: OnceCell::new(),
        })
    }

    /// Root of the working tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Release the handle, deleting the clone unless persisting.
    pub async fn close(self) -> Result<(), HarnessError> {
        if self.persist {
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Clone removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Hard-reset to `commit` and drop untracked files.
    pub async fn reset(&self, commit: &str) -> Result<(), HarnessError> {
        self.vcs.checkout_hard(&self.path, commit).await?;
        self.vcs.clean(&self.path).await?;
        debug!(path = %self.path.display(), commit, "Repository reset");
        Ok(())
    }

    /// Apply a unified diff to the working tree.
    ///
    /// Returns `(false, diagnostics)` when the tool rejects the patch;
    /// only failures to run the tool at all are errors.
    pub async fn apply_patch(&self, patch: &str) -> Result<(bool, String), HarnessError> {
        let patch_file = self.sibling_path(&format!("{}.patch", Uuid::new_v4()));
        tokio::fs::write(&patch_file, patch).await?;

        let applied = self.vcs.apply(&self.path, &patch_file).await;

        if let Err(e) = tokio::fs::remove_file(&patch_file).await {
            warn!(path = %patch_file.display(), error = %e, "Failed to remove patch file");
        }

        let output = applied?;
        debug!(success = output.success(), "Patch applied");
        Ok((output.success(), output.stderr))
    }

    /// Diff between `commit` and the working tree.
    pub async fn get_repo_diff(&self, commit: &str) -> Result<String, HarnessError> {
        self.vcs.diff(&self.path, commit, None).await
    }

    /// Diff between two commits.
    pub async fn get_diff(&self, parent: &str, child: &str) -> Result<String, HarnessError> {
        self.vcs.diff(&self.path, parent, Some(child)).await
    }

    /// Branch on which `commit` was made.
    pub async fn get_branch_name(&self, commit: &str) -> Result<Option<String>, HarnessError> {
        self.vcs.branch_containing(&self.path, commit).await
    }

    /// Commit that follows `parent` on its branch.
    pub async fn get_next_commit(&self, parent: &str) -> Result<Option<String>, HarnessError> {
        let branch = self
            .get_branch_name(parent)
            .await?
            .ok_or_else(|| HarnessError::BranchNotFound(parent.to_string()))?;

        let commits = self
            .vcs
            .log_ancestry(&self.path, &format!("{parent}^"), &branch)
            .await?;
        Ok(next_after(&commits, parent))
    }

    /// `origin/<default branch>`, resolved once.
    pub async fn default_branch(&self) -> Result<&str, HarnessError> {
        self.default_branch
            .get_or_try_init(|| async {
                let name = self
                    .vcs
                    .remote_head_branch(&self.path)
                    .await?
                    .ok_or_else(|| HarnessError::BranchNotFound("origin/HEAD".to_string()))?;
                Ok::<_, HarnessError>(format!("origin/{name}"))
            })
            .await
            .map(String::as_str)
    }

    /// Run an arbitrary VCS subcommand in the clone.
    pub async fn run(&self, args: &[String]) -> Result<CommandOutput, HarnessError> {
        self.vcs.run(&self.path, args).await
    }

    /// Every UTF-8 file in the working tree. VCS metadata and files that
    /// are not valid text are skipped.
    pub fn files(&self) -> impl Iterator<Item = RepoFile> + '_ {
        WalkDir::new(&self.path)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != ".git")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(move |entry| {
                let content = std::fs::read_to_string(entry.path()).ok()?;
                let rel = entry.path().strip_prefix(&self.path).ok()?.to_path_buf();
                Some(RepoFile {
                    filename: entry.file_name().to_string_lossy().into_owned(),
                    filepath: entry.path().to_path_buf(),
                    rel_filepath: rel,
                    content,
                })
            })
    }

    /// Content of a file relative to the root; `None` if missing or not text.
    pub fn get_file(&self, relative_path: impl AsRef<Path>) -> Option<String> {
        std::fs::read_to_string(self.path.join(relative_path)).ok()
    }

    fn sibling_path(&self, name: &str) -> PathBuf {
        match self.path.parent() {
            Some(parent) => parent.join(name),
            None => self.path.join(name),
        }
    }
}

/// Directory name used for a clone of `url`.
pub fn repo_name(url: &str) -> &str {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("repo")
}

fn next_after(commits: &[String], parent: &str) -> Option<String> {
    match commits.iter().position(|c| parent.starts_with(c.as_str()) || c.starts_with(parent)) {
        Some(pos) => commits.get(pos + 1).cloned(),
        None => commits.get(1).cloned(),
    }
}
