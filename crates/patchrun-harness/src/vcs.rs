//! Version control collaborator.
//!
//! The harness never manipulates history itself; it asks an external tool.
//! [`Vcs`] is the seam, [`GitCli`] drives the `git` binary.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::HarnessError;
use crate::process::{CommandOutput, ToolCommand};

/// Paths excluded from every diff.
const DIFF_EXCLUDES: &[&str] = &[":(exclude)__pycache__/*", ":(exclude)*/__pycache__/*"];

/// Operations the harness needs from a version control tool.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clone `url` into `dir` (which must not exist yet).
    async fn clone_repo(&self, url: &str, dir: &Path) -> Result<(), HarnessError>;

    /// Hard-reset the working tree to `commit`.
    async fn checkout_hard(&self, dir: &Path, commit: &str) -> Result<(), HarnessError>;

    /// Remove untracked and ignored files.
    async fn clean(&self, dir: &Path) -> Result<(), HarnessError>;

    /// Diff `from` against `to`, or against the working tree when `to` is `None`.
    async fn diff(&self, dir: &Path, from: &str, to: Option<&str>) -> Result<String, HarnessError>;

    /// Apply the patch stored in `patch_file`. A rejected patch is not an
    /// error: inspect the returned exit code and stderr.
    async fn apply(&self, dir: &Path, patch_file: &Path) -> Result<CommandOutput, HarnessError>;

    /// Status text, or `None` when `dir` is not a repository.
    async fn status(&self, dir: &Path) -> Result<Option<String>, HarnessError>;

    /// First branch containing `commit`.
    async fn branch_containing(&self, dir: &Path, commit: &str)
        -> Result<Option<String>, HarnessError>;

    /// Commits on the ancestry path `from..to`, oldest first.
    async fn log_ancestry(&self, dir: &Path, from: &str, to: &str)
        -> Result<Vec<String>, HarnessError>;

    /// Name of the remote's default branch.
    async fn remote_head_branch(&self, dir: &Path) -> Result<Option<String>, HarnessError>;

    /// Run an arbitrary subcommand inside `dir`.
    async fn run(&self, dir: &Path, args: &[String]) -> Result<CommandOutput, HarnessError>;
}

/// [`Vcs`] implementation backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    timeout: Option<Duration>,
}

impl GitCli {
    /// Create a driver for the given git executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    /// Deadline applied to every git invocation.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn in_repo(&self, dir: &Path) -> ToolCommand {
        ToolCommand::new(&self.program)
            .arg("-C")
            .arg(dir.to_string_lossy())
            .timeout(self.timeout)
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn clone_repo(&self, url: &str, dir: &Path) -> Result<(), HarnessError> {
        ToolCommand::new(&self.program)
            .args(["clone", url])
            .arg(dir.to_string_lossy())
            .timeout(self.timeout)
            .run()
            .await?;
        Ok(())
    }

    async fn checkout_hard(&self, dir: &Path, commit: &str) -> Result<(), HarnessError> {
        self.in_repo(dir).args(["reset", "--hard", commit]).run().await?;
        Ok(())
    }

    async fn clean(&self, dir: &Path) -> Result<(), HarnessError> {
        self.in_repo(dir).args(["clean", "-fdx"]).run().await?;
        Ok(())
    }

    async fn diff(&self, dir: &Path, from: &str, to: Option<&str>) -> Result<String, HarnessError> {
        let output = self
            .in_repo(dir)
            .args(["diff", from])
            .args(to)
            .args(["--", "."])
            .args(DIFF_EXCLUDES.iter().copied())
            .run()
            .await?;
        Ok(strip_index_lines(&output.stdout))
    }

    async fn apply(&self, dir: &Path, patch_file: &Path) -> Result<CommandOutput, HarnessError> {
        self.in_repo(dir)
            .args(["apply", "--reject", "--whitespace=fix", "-v"])
            .arg(patch_file.to_string_lossy())
            .output()
            .await
    }

    async fn status(&self, dir: &Path) -> Result<Option<String>, HarnessError> {
        let output = self.in_repo(dir).arg("status").output().await?;
        Ok(output.success().then_some(output.stdout))
    }

    async fn branch_containing(
        &self,
        dir: &Path,
        commit: &str,
    ) -> Result<Option<String>, HarnessError> {
        let output = self
            .in_repo(dir)
            .args(["branch", "--contains", commit])
            .run()
            .await?;
        Ok(parse_branch_list(&output.stdout, commit))
    }

    async fn log_ancestry(
        &self,
        dir: &Path,
        from: &str,
        to: &str,
    ) -> Result<Vec<String>, HarnessError> {
        let output = self
            .in_repo(dir)
            .args(["log", "--reverse", "--ancestry-path", "--oneline"])
            .arg(format!("{from}..{to}"))
            .run()
            .await?;
        Ok(parse_oneline_log(&output.stdout))
    }

    async fn remote_head_branch(&self, dir: &Path) -> Result<Option<String>, HarnessError> {
        self.in_repo(dir).arg("fetch").run().await?;
        let output = self
            .in_repo(dir)
            .args(["remote", "show", "origin"])
            .run()
            .await?;
        Ok(parse_remote_head(&output.stdout))
    }

    async fn run(&self, dir: &Path, args: &[String]) -> Result<CommandOutput, HarnessError> {
        self.in_repo(dir).args(args.iter().cloned()).output().await
    }
}

/// Drop `index <sha>..<sha>` lines so diffs compare equal across clones.
pub fn strip_index_lines(diff: &str) -> String {
    diff.split('\n')
        .filter(|line| !line.starts_with("index "))
        .collect::<Vec<_>>()
        .join("\n")
}

/// First branch in `git branch --contains` output, ignoring detached HEAD.
pub fn parse_branch_list(stdout: &str, commit: &str) -> Option<String> {
    let detached = format!("(HEAD detached at {commit})");
    stdout
        .lines()
        .map(|line| line.replace('*', "").trim().to_string())
        .filter(|branch| !branch.is_empty())
        .find(|branch| *branch != detached && !branch.starts_with("(HEAD detached at "))
}

/// Commit ids from `git log --oneline` output.
pub fn parse_oneline_log(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// `HEAD branch: <name>` from `git remote show`.
pub fn parse_remote_head(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find(|line| line.contains("HEAD branch"))
        .and_then(|line| line.split_once(": "))
        .map(|(_, name)| name.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_index_lines() {
        let diff = "diff --git a/x b/x\nindex 123..456 100644\n--- a/x\n+++ b/x\n";
        assert_eq!(strip_index_lines(diff), "diff --git a/x b/x\n--- a/x\n+++ b/x\n");
    }

    #[test]
    fn test_parse_branch_list() {
        let out = "* (HEAD detached at abc123)\n  main\n  feature\n";
        assert_eq!(parse_branch_list(out, "abc123").as_deref(), Some("main"));

        let out = "* main\n";
        assert_eq!(parse_branch_list(out, "abc123").as_deref(), Some("main"));

        assert_eq!(parse_branch_list("", "abc123"), None);
    }

    #[test]
    fn test_parse_oneline_log() {
        let out = "aaa111 first\nbbb222 second commit\n\n";
        assert_eq!(parse_oneline_log(out), vec!["aaa111", "bbb222"]);
    }

    #[test]
    fn test_parse_remote_head() {
        let out = "* remote origin\n  Fetch URL: x\n  HEAD branch: main\n  Remote branches:\n";
        assert_eq!(parse_remote_head(out).as_deref(), Some("main"));
        assert_eq!(parse_remote_head("nothing"), None);
    }
}
