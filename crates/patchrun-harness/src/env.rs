//! Isolated runtime environments.
//!
//! [`EnvManager`] is the seam between the testbed and the tool that
//! provisions interpreters; [`CondaEnvManager`] drives `conda`.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HarnessError;
use crate::process::{CommandOutput, ToolCommand};

/// Prefix of every environment this harness creates.
pub const ENV_PREFIX: &str = "test_env_";

static HARNESS_ENV_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^test_env_[0-9a-fA-F-]{36}$").expect("valid env name regex")
});

/// Name of a provisioned environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvHandle(String);

impl EnvHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Fresh, unique handle.
    pub fn generate() -> Self {
        Self(format!("{ENV_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for names produced by [`generate`](Self::generate).
    pub fn is_harness_env(&self) -> bool {
        HARNESS_ENV_NAME.is_match(&self.0)
    }
}

impl fmt::Display for EnvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations the testbed needs from an environment manager.
#[async_trait]
pub trait EnvManager: Send + Sync {
    /// Create an environment with the given interpreter version.
    async fn create(&self, runtime_version: &str) -> Result<EnvHandle, HarnessError>;

    /// Delete an environment.
    async fn remove(&self, env: &EnvHandle) -> Result<(), HarnessError>;

    /// Install a requirements list (file content, not a path).
    async fn install(
        &self,
        env: &EnvHandle,
        requirements: &str,
        cwd: &Path,
    ) -> Result<(), HarnessError>;

    /// Run a command inside the environment.
    ///
    /// A non-zero exit is returned as output, a deadline overrun as
    /// [`HarnessError::CommandTimedOut`].
    async fn run(
        &self,
        env: &EnvHandle,
        command: &[String],
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, HarnessError>;

    /// Every environment known to the manager.
    async fn list(&self) -> Result<Vec<EnvHandle>, HarnessError>;
}

/// [`EnvManager`] backed by the `conda` command line.
#[derive(Debug, Clone)]
pub struct CondaEnvManager {
    program: String,
    timeout: Option<Duration>,
}

impl CondaEnvManager {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    /// Deadline for create/remove/install/list invocations.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> ToolCommand {
        ToolCommand::new(&self.program).timeout(self.timeout)
    }
}

impl Default for CondaEnvManager {
    fn default() -> Self {
        Self::new("conda")
    }
}

#[async_trait]
impl EnvManager for CondaEnvManager {
    async fn create(&self, runtime_version: &str) -> Result<EnvHandle, HarnessError> {
        let env = EnvHandle::generate();
        info!(env = %env, runtime_version, "Creating environment");

        let output = self
            .command()
            .args(["create", "--name", env.as_str()])
            .arg(format!("python={runtime_version}"))
            .arg("-y")
            .output()
            .await?;
        if !output.success() {
            return Err(HarnessError::Provisioning(format!(
                "failed to create {env}: {}",
                output.stderr.trim()
            )));
        }
        Ok(env)
    }

    async fn remove(&self, env: &EnvHandle) -> Result<(), HarnessError> {
        debug!(env = %env, "Removing environment");
        self.command()
            .args(["env", "remove", "--name", env.as_str(), "-y"])
            .run()
            .await?;
        Ok(())
    }

    async fn install(
        &self,
        env: &EnvHandle,
        requirements: &str,
        cwd: &Path,
    ) -> Result<(), HarnessError> {
        let file = tempfile::Builder::new()
            .prefix("requirements-")
            .suffix(".txt")
            .tempfile()?;
        tokio::fs::write(file.path(), requirements).await?;

        info!(env = %env, "Installing requirements");
        let output = self
            .command()
            .args(["run", "--name", env.as_str(), "pip", "install", "-r"])
            .arg(file.path().to_string_lossy())
            .current_dir(cwd)
            .output()
            .await?;

        if let Err(e) = file.close() {
            warn!(error = %e, "Failed to remove requirements file");
        }

        if output.success() {
            Ok(())
        } else {
            Err(HarnessError::Provisioning(format!(
                "failed to install requirements into {env}: {}",
                output.stderr.trim()
            )))
        }
    }

    async fn run(
        &self,
        env: &EnvHandle,
        command: &[String],
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, HarnessError> {
        ToolCommand::new(&self.program)
            .args(["run", "-n", env.as_str()])
            .args(command.iter().cloned())
            .current_dir(cwd)
            .timeout(timeout)
            .output()
            .await
    }

    async fn list(&self) -> Result<Vec<EnvHandle>, HarnessError> {
        let output = self.command().args(["env", "list"]).run().await?;
        Ok(parse_env_list(&output.stdout))
    }
}

/// Environment names from `conda env list` output.
pub fn parse_env_list(stdout: &str) -> Vec<EnvHandle> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .map(EnvHandle::new)
        .collect()
}
