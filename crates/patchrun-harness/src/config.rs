//! Harness configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the directory created under the work root.
pub const WORKSPACE_DIR: &str = "workspace";

/// Harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Root of all scratch state; evaluations happen in `<work_root>/workspace`.
    pub work_root: PathBuf,

    /// Deadline for a single test-script run.
    pub test_timeout: Option<Duration>,

    /// Deadline for every VCS and environment-manager command.
    pub command_timeout: Option<Duration>,

    /// Keep working directories and environments for reuse.
    pub persist: bool,

    /// Extra attempts for a submission that hit an infrastructure error.
    pub infra_retries: u32,

    /// Version control executable.
    pub git_program: String,

    /// Environment manager executable.
    pub conda_program: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("patchrun"),
            test_timeout: Some(Duration::from_secs(60)),
            command_timeout: Some(Duration::from_secs(30 * 60)),
            persist: false,
            infra_retries: 0,
            git_program: "git".to_string(),
            conda_program: "conda".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Create a config rooted at `work_root` with default settings.
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            ..Self::default()
        }
    }

    /// Set the test-script deadline (`None` disables it).
    pub fn with_test_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Set the deadline for clone/checkout/provisioning commands.
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Keep working directories and environments after evaluation.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Set the infrastructure retry budget.
    pub fn with_infra_retries(mut self, retries: u32) -> Self {
        self.infra_retries = retries;
        self
    }

    /// Set the version control executable.
    pub fn with_git_program(mut self, program: impl Into<String>) -> Self {
        self.git_program = program.into();
        self
    }

    /// Set the environment manager executable.
    pub fn with_conda_program(mut self, program: impl Into<String>) -> Self {
        self.conda_program = program.into();
        self
    }

    /// Directory holding per-task working directories and the env store.
    pub fn workspace_dir(&self) -> PathBuf {
        self.work_root.join(WORKSPACE_DIR)
    }
}
