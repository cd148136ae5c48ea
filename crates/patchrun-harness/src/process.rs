//! Subprocess execution for external tools.
//!
//! Every interaction with git and the environment manager goes through
//! [`ToolCommand`], which captures stdout/stderr, enforces an optional
//! deadline and makes sure a timed-out child (and anything it spawned) is
//! killed rather than left running. Processes still in the child's group
//! once it exits are killed as well.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::HarnessError;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,

    /// Captured stdout, lossily decoded as UTF-8.
    pub stdout: String,

    /// Captured stderr, lossily decoded as UTF-8.
    pub stderr: String,
}

impl CommandOutput {
    /// True when the process exited with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Builder for a single external command invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
    env_vars: Vec<(String, String)>,
}

impl ToolCommand {
    /// Create a command for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
            env_vars: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run in the given directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Kill the process if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Human readable command line, used in logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion and return the captured output regardless of exit code.
    pub async fn output(&self) -> Result<CommandOutput, HarnessError> {
        let command_line = self.display();
        debug!(
            command = %command_line,
            cwd = ?self.cwd,
            timeout = ?self.timeout,
            "Running command"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        // Own process group, so a timeout kill also reaches grandchildren
        // (e.g. the interpreter started by `conda run`).
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        // Captured before the leader is reaped; `Child::id` is gone after.
        let pgid = child.id();
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());
        let stdout_abort = stdout_reader.abort_handle();
        let stderr_abort = stderr_reader.abort_handle();

        // The deadline covers draining the pipes too: a background child
        // holding stdout open must not outlive it.
        let finish = async {
            let status = child.wait().await;
            kill_group(pgid);
            let stdout = collect_reader(stdout_reader).await;
            let stderr = collect_reader(stderr_reader).await;
            status.map(|status| (status, stdout, stderr))
        };
        let finished = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, finish).await.ok(),
            None => Some(finish.await),
        };

        let (status, stdout, stderr) = match finished {
            Some(done) => done?,
            None => {
                let after = self.timeout.unwrap_or_default();
                warn!(
                    command = %command_line,
                    ?after,
                    "Command timed out, killing process group"
                );
                kill_process_tree(&mut child, pgid).await;
                stdout_abort.abort();
                stderr_abort.abort();
                return Err(HarnessError::CommandTimedOut {
                    command: command_line,
                    after,
                });
            }
        };

        let output = CommandOutput {
            code: status.code(),
            stdout,
            stderr,
        };

        debug!(
            command = %command_line,
            exit_code = ?output.code,
            duration_ms = start.elapsed().as_millis() as u64,
            "Command finished"
        );
        trace!(stdout = %output.stdout, stderr = %output.stderr, "Command output");

        Ok(output)
    }

    /// Run to completion, turning a non-zero exit code into an error.
    pub async fn run(&self) -> Result<CommandOutput, HarnessError> {
        let output = self.output().await?;
        if output.success() {
            Ok(output)
        } else {
            Err(HarnessError::CommandFailed {
                command: self.display(),
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}

fn spawn_reader<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.read_to_end(&mut buf).await {
                warn!(error = %e, "Error reading command output");
            }
        }
        buf
    })
}

async fn collect_reader(handle: JoinHandle<Vec<u8>>) -> String {
    match handle.await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
    }
}

/// SIGKILL every process left in the group led by `pgid`.
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pgid {
        // Negative pid addresses the whole process group.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            trace!(pid, error = %std::io::Error::last_os_error(), "No process group left to kill");
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

async fn kill_process_tree(child: &mut Child, pgid: Option<u32>) {
    kill_group(pgid);
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Child already exited before kill");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let output = ToolCommand::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .output()
            .await
            .unwrap();

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_run_maps_failure_to_error() {
        let result = ToolCommand::new("sh").args(["-c", "exit 1"]).run().await;
        assert!(matches!(
            result,
            Err(HarnessError::CommandFailed { code: Some(1), .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let start = Instant::now();
        let result = ToolCommand::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .timeout(Some(Duration::from_millis(200)))
            .output()
            .await;

        assert!(matches!(result, Err(HarnessError::CommandTimedOut { .. })));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_background_child_cannot_outlive_deadline() {
        let start = Instant::now();
        let result = ToolCommand::new("sh")
            .args(["-c", "sleep 6 & echo started"])
            .timeout(Some(Duration::from_millis(300)))
            .output()
            .await;

        assert!(start.elapsed() < Duration::from_secs(2));
        if let Ok(output) = result {
            assert_eq!(output.stdout, "started\n");
        }
    }

    #[tokio::test]
    async fn test_leftover_group_is_killed_after_exit() {
        let start = Instant::now();
        let output = ToolCommand::new("sh")
            .args(["-c", "sleep 6 & echo started"])
            .output()
            .await
            .unwrap();

        assert_eq!(output.stdout, "started\n");
        assert!(output.success());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_current_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let output = ToolCommand::new("sh")
            .args(["-c", "pwd; echo $PATCHRUN_TEST_VAR"])
            .current_dir(dir.path())
            .env("PATCHRUN_TEST_VAR", "hello")
            .run()
            .await
            .unwrap();

        let canonical = dir.path().canonicalize().unwrap();
        let mut lines = output.stdout.lines();
        assert_eq!(
            PathBuf::from(lines.next().unwrap()).canonicalize().unwrap(),
            canonical
        );
        assert_eq!(lines.next(), Some("hello"));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let result = ToolCommand::new("definitely-not-a-real-binary-patchrun")
            .output()
            .await;
        assert!(matches!(result, Err(HarnessError::Spawn { .. })));
    }

    #[test]
    fn test_display() {
        let cmd = ToolCommand::new("git").args(["-C", "/repo", "status"]);
        assert_eq!(cmd.display(), "git -C /repo status");
    }
}
