//! Benchmark task definition.

use crate::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One benchmark problem: a repository at a base commit plus a hidden test.
///
/// Tasks are loaded once with the dataset and never mutated afterwards.
/// The evaluation pipeline only reads `repo_url`, `base_commit`,
/// `test_script`, `testbed_environment` and `requirements_txt`; the
/// remaining fields are carried for agents and oracle baselines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Clone URL of the repository under test.
    pub repo_url: String,

    /// Natural-language instruction given to the patch author.
    #[serde(default)]
    pub instruction: String,

    /// Commit the submission patch is applied on top of.
    pub base_commit: String,

    /// Hidden test script executed inside the provisioned environment.
    pub test_script: String,

    /// Environment specification, e.g. `python3.9`.
    pub testbed_environment: String,

    /// Dependency list installed into freshly provisioned environments.
    #[serde(default)]
    pub requirements_txt: String,

    /// Commit holding the reference solution.
    #[serde(default)]
    pub solution_commit: String,

    /// Reference solution as a unified diff.
    #[serde(default)]
    pub solution_patch: String,

    /// Files touched by the reference solution, path to post-solution content.
    #[serde(default)]
    pub modified_files: BTreeMap<String, String>,

    /// Primary language of the repository.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "python".to_string()
}

impl Task {
    /// Create a task with the fields the evaluation pipeline consumes.
    pub fn new(
        id: impl Into<TaskId>,
        repo_url: impl Into<String>,
        base_commit: impl Into<String>,
        test_script: impl Into<String>,
        testbed_environment: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            repo_url: repo_url.into(),
            instruction: String::new(),
            base_commit: base_commit.into(),
            test_script: test_script.into(),
            testbed_environment: testbed_environment.into(),
            requirements_txt: String::new(),
            solution_commit: String::new(),
            solution_patch: String::new(),
            modified_files: BTreeMap::new(),
            language: default_language(),
        }
    }

    /// Builder method to set the dependency installation script.
    pub fn with_requirements(mut self, requirements: impl Into<String>) -> Self {
        self.requirements_txt = requirements.into();
        self
    }

    /// Builder method to set the instruction text.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Builder method to set the language tag.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Runtime version requested by `testbed_environment`.
    ///
    /// `python3.9`, `python 3.9` and `3.9` all yield `3.9`.
    pub fn runtime_version(&self) -> &str {
        self.testbed_environment
            .trim()
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .trim()
    }

    /// Whether a dependency installation step is declared.
    pub fn has_requirements(&self) -> bool {
        !self.requirements_txt.trim().is_empty()
    }
}
