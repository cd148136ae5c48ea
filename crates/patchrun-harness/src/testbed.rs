//! Isolated execution environment for a task's hidden test.
//!
//! A [`Testbed`] is provisioned for one task id, reusing a cached
//! environment when the store has one, and runs test scripts through
//! [`Testbed::check`]. Scripts are rewritten so that every exit point first
//! prints a per-run random token; a run only passes when it exits with 0
//! *and* the token shows up in stdout. A patch that makes the process exit
//! early with status 0 therefore cannot fake a pass.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use patchrun_core::{Task, TaskId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::env::{EnvHandle, EnvManager};
use crate::error::HarnessError;
use crate::store::LockedKvStore;

/// Name of the store mapping task ids to environments.
pub const ENV_STORE: &str = "conda_envs";

/// Stdout reported for a run that hit its deadline.
pub const TIMED_OUT: &str = "TIMED OUT";

/// Language-specific bits of a test script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptDialect {
    Python,
    JavaScript,
}

impl ScriptDialect {
    /// Dialect for a task's language tag; unknown tags are Python.
    pub fn for_language(language: &str) -> Self {
        match language.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" | "node" | "typescript" | "ts" => Self::JavaScript,
            _ => Self::Python,
        }
    }

    pub fn interpreter(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "node",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::JavaScript => "js",
        }
    }

    /// Exit statements that get a token print in front of them.
    fn exit_statements(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["sys.exit(0)", "sys.exit(exit_code)"],
            Self::JavaScript => &["process.exit(0)", "process.exit(exitCode)"],
        }
    }

    fn print_statement(self, token: &str) -> String {
        match self {
            Self::Python => format!("print(\"{token}\")"),
            Self::JavaScript => format!("console.log(\"{token}\");"),
        }
    }

    /// Only Python testbeds have a dependency step.
    fn installs_requirements(self) -> bool {
        self == Self::Python
    }
}

/// Rewrite `script` so it prints `token` right before every exit statement.
///
/// The print keeps the indentation of the exit line. A script without any
/// recognised exit statement gets the print appended at top level, so a
/// plain run to completion still reports the token.
///
/// Matching is textual and line based. An exit statement inside a comment
/// or string literal also gets a print. On a one-line conditional such as
/// `if ok: sys.exit(0)` the print lands before the `if` and runs whatever
/// the condition is. Test scripts are expected to put each exit on its own
/// line.
pub fn insert_token(script: &str, token: &str, dialect: ScriptDialect) -> String {
    let print = dialect.print_statement(token);
    let exits = dialect.exit_statements();

    let mut out: Vec<String> = Vec::new();
    let mut inserted = false;
    for line in script.split('\n') {
        if exits.iter().any(|exit| line.contains(exit)) {
            let indent = &line[..line.len() - line.trim_start().len()];
            out.push(format!("{indent}{print}"));
            inserted = true;
        }
        out.push(line.to_string());
    }

    if !inserted {
        if out.last().is_some_and(|line| line.is_empty()) {
            out.pop();
        }
        out.push(print);
        out.push(String::new());
    }
    out.join("\n")
}

/// Lifecycle of a testbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestbedState {
    Provisioning,
    Ready,
    Executing,
    TornDown,
}

/// Result of one [`Testbed::check`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutput {
    /// Exit code was 0 and the token was printed.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CheckOutput {
    fn timed_out() -> Self {
        Self {
            success: false,
            stdout: TIMED_OUT.to_string(),
            stderr: String::new(),
            timed_out: true,
        }
    }
}

/// Provisioned environment bound to one task id and one repository.
pub struct Testbed {
    task_id: TaskId,
    repo_dir: PathBuf,
    dialect: ScriptDialect,
    env: EnvHandle,
    created: bool,
    persist: bool,
    state: TestbedState,
    env_manager: Arc<dyn EnvManager>,
}

impl std::fmt::Debug for Testbed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Testbed")
            .field("task_id", &self.task_id)
            .field("env", &self.env)
            .field("created", &self.created)
            .field("state", &self.state)
            .finish()
    }
}

impl Testbed {
    /// Adopt the cached environment for `task` or create a new one.
    ///
    /// The caller must hold the task's working-directory lock, which is what
    /// keeps two evaluations of the same task from provisioning twice.
    pub async fn provision(
        task: &Task,
        repo_dir: &Path,
        store: &LockedKvStore,
        env_manager: Arc<dyn EnvManager>,
        persist: bool,
    ) -> Result<Self, HarnessError> {
        let dialect = ScriptDialect::for_language(&task.language);
        let mut state = TestbedState::Provisioning;
        debug!(task_id = %task.id, ?state, "Provisioning testbed");

        let (env, created) = match store.get(task.id.as_str()).await? {
            Some(name) => {
                let env = EnvHandle::new(name);
                info!(task_id = %task.id, env = %env, "Environment cache hit");
                (env, false)
            }
            None => {
                info!(task_id = %task.id, runtime = task.runtime_version(), "Environment cache miss");
                let env = env_manager.create(task.runtime_version()).await?;
                if dialect.installs_requirements() && task.has_requirements() {
                    if let Err(e) = env_manager.install(&env, &task.requirements_txt, repo_dir).await {
                        discard(env_manager.as_ref(), &env).await;
                        return Err(e);
                    }
                }
                (env, true)
            }
        };

        if persist {
            if let Err(e) = store.put(task.id.as_str(), env.as_str()).await {
                if created {
                    discard(env_manager.as_ref(), &env).await;
                }
                return Err(e);
            }
        }

        state = TestbedState::Ready;
        debug!(task_id = %task.id, env = %env, ?state, "Testbed ready");

        Ok(Self {
            task_id: task.id.clone(),
            repo_dir: repo_dir.to_path_buf(),
            dialect,
            env,
            created,
            persist,
            state,
            env_manager,
        })
    }

    pub fn env(&self) -> &EnvHandle {
        &self.env
    }

    pub fn state(&self) -> TestbedState {
        self.state
    }

    /// True when this testbed created its environment rather than reusing one.
    pub fn created_env(&self) -> bool {
        self.created
    }

    /// Run `script` in the repository under the environment.
    ///
    /// A deadline overrun is a normal outcome (`timed_out`), not an error;
    /// errors are reserved for failures to run the script at all.
    pub async fn check(
        &mut self,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<CheckOutput, HarnessError> {
        let token = Uuid::new_v4().simple().to_string();
        let file_name = format!("{}.{}", Uuid::new_v4(), self.dialect.extension());
        let script_path = self.repo_dir.join(&file_name);

        tokio::fs::write(&script_path, insert_token(script, &token, self.dialect)).await?;

        self.state = TestbedState::Executing;
        let command = vec![self.dialect.interpreter().to_string(), file_name];
        let result = self
            .env_manager
            .run(&self.env, &command, &self.repo_dir, timeout)
            .await;
        self.state = TestbedState::Ready;

        if let Err(e) = tokio::fs::remove_file(&script_path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %script_path.display(), error = %e, "Failed to remove test script");
            }
        }

        match result {
            Ok(output) => {
                let token_seen = output.stdout.contains(&token);
                if output.success() && !token_seen {
                    warn!(task_id = %self.task_id, "Test exited 0 without printing the token");
                }
                let check = CheckOutput {
                    success: output.success() && token_seen,
                    stdout: strip_token(&output.stdout, &token),
                    stderr: output.stderr,
                    timed_out: false,
                };
                debug!(task_id = %self.task_id, success = check.success, exit_code = ?output.code, "Test finished");
                Ok(check)
            }
            Err(HarnessError::CommandTimedOut { after, .. }) => {
                info!(task_id = %self.task_id, ?after, "Test timed out");
                Ok(CheckOutput::timed_out())
            }
            Err(e) => Err(e),
        }
    }

    /// Tear down the environment unless persisting.
    ///
    /// Only an environment this testbed created is removed; one adopted from
    /// the store belongs to the cache.
    pub async fn close(mut self) -> Result<(), HarnessError> {
        let remove = !self.persist && self.created;
        self.state = TestbedState::TornDown;
        if !remove {
            debug!(task_id = %self.task_id, env = %self.env, "Environment kept");
            return Ok(());
        }
        info!(task_id = %self.task_id, env = %self.env, state = ?self.state, "Removing environment");
        self.env_manager.remove(&self.env).await
    }
}

async fn discard(env_manager: &dyn EnvManager, env: &EnvHandle) {
    if let Err(e) = env_manager.remove(env).await {
        warn!(env = %env, error = %e, "Failed to remove half-provisioned environment");
    }
}

fn strip_token(stdout: &str, token: &str) -> String {
    stdout
        .split_inclusive('\n')
        .filter(|line| line.trim_end() != token)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEnvManager;
    use std::sync::atomic::Ordering;

    fn task(id: &str) -> Task {
        Task::new(id, "https://example.com/org/repo", "base", "", "python3.10")
            .with_requirements("requests==2.31.0\n")
    }

    #[test]
    fn test_insert_token_before_every_exit() {
        let script = "\
import sys
def main():
    if failed:
        sys.exit(1)
    sys.exit(0)

if __name__ == '__main__':
    exit_code = run()
    sys.exit(exit_code)";
        let out = insert_token(script, "TOK", ScriptDialect::Python);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(out.matches("print(\"TOK\")").count(), 2);
        let exit0 = lines.iter().position(|l| l.trim() == "sys.exit(0)").unwrap();
        assert_eq!(lines[exit0 - 1], "    print(\"TOK\")");
        let exit_code = lines.iter().position(|l| l.trim() == "sys.exit(exit_code)").unwrap();
        assert_eq!(lines[exit_code - 1], "    print(\"TOK\")");
        // Failure exits are left alone.
        let exit1 = lines.iter().position(|l| l.trim() == "sys.exit(1)").unwrap();
        assert_eq!(lines[exit1 - 1].trim(), "if failed:");
    }

    #[test]
    fn test_insert_token_appends_without_exit() {
        let out = insert_token("assert 1 + 1 == 2\n", "TOK", ScriptDialect::Python);
        assert_eq!(out, "assert 1 + 1 == 2\nprint(\"TOK\")\n");
    }

    #[test]
    fn test_insert_token_one_line_conditional() {
        let out = insert_token("if ok: sys.exit(0)\n", "TOK", ScriptDialect::Python);
        assert_eq!(out, "print(\"TOK\")\nif ok: sys.exit(0)\n");
    }

    #[test]
    fn test_insert_token_javascript() {
        let out = insert_token("run();\nprocess.exit(0);", "TOK", ScriptDialect::JavaScript);
        assert_eq!(out, "run();\nconsole.log(\"TOK\");\nprocess.exit(0);");
    }

    #[test]
    fn test_dialect_for_language() {
        assert_eq!(ScriptDialect::for_language("python"), ScriptDialect::Python);
        assert_eq!(ScriptDialect::for_language("JavaScript"), ScriptDialect::JavaScript);
        assert_eq!(ScriptDialect::for_language(""), ScriptDialect::Python);
    }

    #[tokio::test]
    async fn test_check_passes_and_removes_script() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockedKvStore::new(dir.path(), ENV_STORE);
        let envs = Arc::new(FakeEnvManager::new());

        let mut testbed = Testbed::provision(&task("t1"), dir.path(), &store, envs.clone(), false)
            .await
            .unwrap();
        let out = testbed
            .check("print(\"running\")\nsys.exit(0)\n", None)
            .await
            .unwrap();

        assert!(out.success);
        assert_eq!(out.stdout, "running\n");
        assert!(!out.timed_out);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        testbed.close().await.unwrap();
        assert_eq!(envs.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_early_exit_without_token_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockedKvStore::new(dir.path(), ENV_STORE);
        let envs = Arc::new(FakeEnvManager::new());

        let mut testbed = Testbed::provision(&task("t1"), dir.path(), &store, envs, false)
            .await
            .unwrap();
        // The patched code exits 0 before the real assertions run.
        let script = "os._exit(0)\nraise AssertionError\nsys.exit(0)\n";
        let out = testbed.check(script, None).await.unwrap();

        assert!(!out.success);
        assert!(!out.timed_out);
        testbed.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_reports_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockedKvStore::new(dir.path(), ENV_STORE);
        let envs = Arc::new(FakeEnvManager::new());

        let mut testbed = Testbed::provision(&task("t1"), dir.path(), &store, envs, false)
            .await
            .unwrap();
        let out = testbed
            .check("while True:\n    pass\n", Some(Duration::from_millis(20)))
            .await
            .unwrap();

        assert_eq!(out, CheckOutput::timed_out());
        assert_eq!(testbed.state(), TestbedState::Ready);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        testbed.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_reuses_cached_environment() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockedKvStore::new(dir.path(), ENV_STORE);
        let envs = Arc::new(FakeEnvManager::new());

        let first = Testbed::provision(&task("t1"), dir.path(), &store, envs.clone(), true)
            .await
            .unwrap();
        assert!(first.created_env());
        let env = first.env().clone();
        first.close().await.unwrap();

        let second = Testbed::provision(&task("t1"), dir.path(), &store, envs.clone(), true)
            .await
            .unwrap();
        assert!(!second.created_env());
        assert_eq!(second.env(), &env);
        second.close().await.unwrap();

        assert_eq!(envs.created.load(Ordering::SeqCst), 1);
        assert_eq!(envs.installed.load(Ordering::SeqCst), 1);
        assert!(envs.removed().is_empty());
        assert_eq!(store.get("t1").await.unwrap().as_deref(), Some(env.as_str()));
    }

    #[tokio::test]
    async fn test_non_persistent_run_leaves_cached_environment() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockedKvStore::new(dir.path(), ENV_STORE);
        store.put("t1", "test_env_cached").await.unwrap();
        let envs = Arc::new(FakeEnvManager::new());

        let testbed = Testbed::provision(&task("t1"), dir.path(), &store, envs.clone(), false)
            .await
            .unwrap();
        assert_eq!(testbed.env().as_str(), "test_env_cached");
        testbed.close().await.unwrap();

        assert!(envs.removed().is_empty());
        assert_eq!(envs.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_javascript_skips_requirements() {
        let dir = tempfile::tempdir().unwrap();
        let store = LockedKvStore::new(dir.path(), ENV_STORE);
        let envs = Arc::new(FakeEnvManager::new());

        let js = task("t1").with_language("javascript");
        let testbed = Testbed::provision(&js, dir.path(), &store, envs.clone(), false)
            .await
            .unwrap();
        testbed.close().await.unwrap();

        assert_eq!(envs.installed.load(Ordering::SeqCst), 0);
    }
}
