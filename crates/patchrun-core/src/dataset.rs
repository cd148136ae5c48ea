//! In-memory index of benchmark tasks.

use std::collections::HashMap;
use std::path::Path;

use crate::{CoreError, Task, TaskId};

/// Collection of tasks addressable by id, preserving file order.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
}

impl Dataset {
    /// Build a dataset from already parsed tasks.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, CoreError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (pos, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), pos).is_some() {
                return Err(CoreError::DuplicateTask(task.id.clone()));
            }
        }
        Ok(Self { tasks, index })
    }

    /// Parse a JSON array of tasks.
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let tasks: Vec<Task> = serde_json::from_str(json)?;
        Self::from_tasks(tasks)
    }

    /// Load a JSON dataset file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Look up a task by id.
    pub fn get(&self, id: &TaskId) -> Result<&Task, CoreError> {
        self.index
            .get(id)
            .map(|&pos| &self.tasks[pos])
            .ok_or_else(|| CoreError::TaskNotFound(id.clone()))
    }

    /// Files edited by the reference solution of a task.
    pub fn oracle_context(
        &self,
        id: &TaskId,
    ) -> Result<&std::collections::BTreeMap<String, String>, CoreError> {
        self.get(id).map(|task| &task.modified_files)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Task;
    type IntoIter = std::slice::Iter<'a, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn task(id: &str) -> Task {
        Task::new(id, "https://example.com/org/repo", "abc123", "print('ok')", "python3.9")
    }

    #[test]
    fn test_lookup_and_missing() {
        let dataset = Dataset::from_tasks(vec![task("a"), task("b")]).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(&TaskId::new("b")).unwrap().id.as_str(), "b");
        assert!(matches!(
            dataset.get(&TaskId::new("zzz")),
            Err(CoreError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = Dataset::from_tasks(vec![task("a"), task("a")]);
        assert!(matches!(result, Err(CoreError::DuplicateTask(_))));
    }

    #[test]
    fn test_load_from_file_keeps_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&vec![task("x"), task("y")]).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let dataset = Dataset::from_json_file(file.path()).unwrap();
        let ids: Vec<&str> = dataset.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
    }

    #[test]
    fn test_oracle_context() {
        let mut t = task("a");
        t.modified_files
            .insert("src/lib.py".to_string(), "x = 1\n".to_string());
        let dataset = Dataset::from_tasks(vec![t]).unwrap();
        let files = dataset.oracle_context(&TaskId::new("a")).unwrap();
        assert_eq!(files.get("src/lib.py").map(String::as_str), Some("x = 1\n"));
    }
}
