//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::env::{EnvHandle, EnvManager};
use crate::error::HarnessError;
use crate::process::CommandOutput;
use crate::vcs::Vcs;

/// Patches containing this marker are rejected by [`FakeVcs::apply`].
pub const CONFLICT_MARKER: &str = "CONFLICT";

/// VCS that "clones" a fixed file set and accepts any well-formed patch.
#[derive(Default)]
pub struct FakeVcs {
    pub files: BTreeMap<String, String>,
    pub commits: HashSet<String>,
    pub clones: AtomicUsize,
    pub applies: AtomicUsize,
    /// Number of upcoming clones that fail.
    pub failing_clones: AtomicUsize,
}

impl FakeVcs {
    pub fn new() -> Self {
        let mut vcs = Self::default();
        vcs.files.insert("app.py".to_string(), "x = 1\n".to_string());
        vcs.commits.insert("base".to_string());
        vcs
    }

    pub fn with_failing_clones(self, n: usize) -> Self {
        self.failing_clones.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn clone_repo(&self, url: &str, dir: &Path) -> Result<(), HarnessError> {
        let failing = self
            .failing_clones
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(HarnessError::CommandFailed {
                command: format!("git clone {url}"),
                code: Some(128),
                stderr: "fatal: could not read from remote repository".to_string(),
            });
        }
        self.clones.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(dir).await?;
        for (name, content) in &self.files {
            tokio::fs::write(dir.join(name), content).await?;
        }
        Ok(())
    }

    async fn checkout_hard(&self, _dir: &Path, commit: &str) -> Result<(), HarnessError> {
        if self.commits.contains(commit) {
            Ok(())
        } else {
            Err(HarnessError::CommandFailed {
                command: format!("git reset --hard {commit}"),
                code: Some(128),
                stderr: format!("fatal: ambiguous argument '{commit}'"),
            })
        }
    }

    async fn clean(&self, _dir: &Path) -> Result<(), HarnessError> {
        Ok(())
    }

    async fn diff(&self, _dir: &Path, _from: &str, _to: Option<&str>) -> Result<String, HarnessError> {
        Ok(String::new())
    }

    async fn apply(&self, _dir: &Path, patch_file: &Path) -> Result<CommandOutput, HarnessError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let patch = tokio::fs::read_to_string(patch_file).await?;
        if patch.starts_with("diff --git") && !patch.contains(CONFLICT_MARKER) {
            Ok(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: "Applied patch cleanly.\n".to_string(),
            })
        } else {
            Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "error: patch failed: app.py:1\n".to_string(),
            })
        }
    }

    async fn status(&self, _dir: &Path) -> Result<Option<String>, HarnessError> {
        Ok(Some("nothing to commit".to_string()))
    }

    async fn branch_containing(
        &self,
        _dir: &Path,
        _commit: &str,
    ) -> Result<Option<String>, HarnessError> {
        Ok(Some("main".to_string()))
    }

    async fn log_ancestry(
        &self,
        _dir: &Path,
        _from: &str,
        _to: &str,
    ) -> Result<Vec<String>, HarnessError> {
        Ok(Vec::new())
    }

    async fn remote_head_branch(&self, _dir: &Path) -> Result<Option<String>, HarnessError> {
        Ok(Some("main".to_string()))
    }

    async fn run(&self, _dir: &Path, _args: &[String]) -> Result<CommandOutput, HarnessError> {
        Ok(CommandOutput::default())
    }
}

/// Environment manager that interprets a tiny subset of Python.
///
/// `print("x")` writes `x`, `sys.exit(n)` / `os._exit(n)` stop with code n,
/// `while True:` runs until the deadline. Everything else is ignored.
#[derive(Default)]
pub struct FakeEnvManager {
    pub created: AtomicUsize,
    pub installed: AtomicUsize,
    pub removed: Mutex<Vec<EnvHandle>>,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    /// Artificial latency of every run.
    pub run_delay: Duration,
}

impl FakeEnvManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn removed(&self) -> Vec<EnvHandle> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnvManager for FakeEnvManager {
    async fn create(&self, _runtime_version: &str) -> Result<EnvHandle, HarnessError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(EnvHandle::generate())
    }

    async fn remove(&self, env: &EnvHandle) -> Result<(), HarnessError> {
        self.removed.lock().unwrap().push(env.clone());
        Ok(())
    }

    async fn install(
        &self,
        _env: &EnvHandle,
        _requirements: &str,
        _cwd: &Path,
    ) -> Result<(), HarnessError> {
        self.installed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(
        &self,
        _env: &EnvHandle,
        command: &[String],
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, HarnessError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let script = match command.get(1) {
            Some(file) => tokio::fs::read_to_string(cwd.join(file)).await,
            None => Ok(String::new()),
        };
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        let result = match script {
            Ok(script) => interpret(&script, command.join(" "), timeout).await,
            Err(e) => Err(e.into()),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn list(&self) -> Result<Vec<EnvHandle>, HarnessError> {
        Ok(Vec::new())
    }
}

async fn interpret(
    script: &str,
    command: String,
    timeout: Option<Duration>,
) -> Result<CommandOutput, HarnessError> {
    let mut stdout = String::new();
    for line in script.lines().map(str::trim) {
        if let Some(text) = line
            .strip_prefix("print(\"")
            .and_then(|rest| rest.strip_suffix("\")"))
        {
            stdout.push_str(text);
            stdout.push('\n');
        } else if let Some(code) = exit_code(line) {
            return Ok(CommandOutput {
                code: Some(code),
                stdout,
                stderr: String::new(),
            });
        } else if line == "while True:" {
            let after = timeout.unwrap_or(Duration::from_secs(3600));
            tokio::time::sleep(after).await;
            return Err(HarnessError::CommandTimedOut { command, after });
        } else if line.starts_with("raise") {
            return Ok(CommandOutput {
                code: Some(1),
                stdout,
                stderr: format!("Traceback (most recent call last):\n{line}\n"),
            });
        }
    }
    Ok(CommandOutput {
        code: Some(0),
        stdout,
        stderr: String::new(),
    })
}

fn exit_code(line: &str) -> Option<i32> {
    let arg = line
        .strip_prefix("sys.exit(")
        .or_else(|| line.strip_prefix("os._exit("))?
        .strip_suffix(')')?;
    Some(arg.parse().unwrap_or(0))
}
