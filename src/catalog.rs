//! Task catalog: validated [`TaskDescriptor`]s built from `[[task]]` entries.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::error::HarnessError;
use crate::model::types::{Domain, GraderVariant, TaskDescriptor, TaskId, TaskRefs};

/// One raw `[[task]]` entry as written in `patchgate.toml`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEntry {
    /// Task id.
    pub id: String,
    /// Code domain.
    pub domain: Domain,
    /// Repository locator.
    pub repo: String,
    /// Prefix for the conventional ref names. Defaults to the id with
    /// hyphens replaced by underscores.
    pub ref_stem: Option<String>,
    /// Explicit buggy ref.
    pub baseline: Option<String>,
    /// Explicit reference-fix ref.
    pub golden: Option<String>,
    /// Explicit hidden-test ref.
    pub test: Option<String>,
    /// Grader variant; defaults from the domain.
    pub grader: Option<GraderVariant>,
    /// Hidden test files.
    #[serde(default)]
    pub test_files: Vec<String>,
    /// Command overriding the grader's template.
    pub test_command: Option<String>,
    /// Directory name for materialized trees. Defaults to `repo`.
    pub checkout_dir: Option<String>,
    /// Environment files to upsert into every tree.
    #[serde(default)]
    pub env_files: BTreeMap<String, BTreeMap<String, String>>,
    /// Free-form description.
    pub description: Option<String>,
}

impl TaskEntry {
    fn into_descriptor(self) -> Result<TaskDescriptor, HarnessError> {
        let id = TaskId::new(&self.id).map_err(|e| HarnessError::Catalog {
            detail: e.to_string(),
        })?;
        let catalog_err = |detail: String| HarnessError::Catalog {
            detail: format!("task '{id}': {detail}"),
        };

        if self.repo.trim().is_empty() {
            return Err(catalog_err("repo must not be empty".to_owned()));
        }

        let stem = self.ref_stem.unwrap_or_else(|| id.default_ref_stem());
        let mut refs = TaskRefs::from_stem(&stem);
        if let Some(r) = self.baseline {
            refs.buggy = r;
        }
        if let Some(r) = self.golden {
            refs.reference_fix = r;
        }
        if let Some(r) = self.test {
            refs.hidden_test = r;
        }
        for name in [&refs.buggy, &refs.reference_fix, &refs.hidden_test] {
            if name.is_empty() || name.starts_with('-') || name.contains("..") {
                return Err(catalog_err(format!("invalid ref name '{name}'")));
            }
        }

        let checkout_dir = self.checkout_dir.unwrap_or_else(|| "repo".to_owned());
        if checkout_dir.is_empty()
            || checkout_dir.contains(['/', '\\'])
            || checkout_dir == "."
            || checkout_dir == ".."
        {
            return Err(catalog_err(format!(
                "checkout_dir '{checkout_dir}' must be a single directory name"
            )));
        }

        for path in self.test_files.iter().chain(self.env_files.keys()) {
            if path.is_empty() || path.starts_with('/') || path.split('/').any(|c| c == "..") {
                return Err(catalog_err(format!(
                    "path '{path}' must be relative to the tree root"
                )));
            }
        }

        Ok(TaskDescriptor {
            grader: self
                .grader
                .unwrap_or_else(|| GraderVariant::default_for(self.domain)),
            id,
            domain: self.domain,
            repo: self.repo,
            refs,
            test_files: self.test_files,
            test_command: self.test_command,
            checkout_dir,
            env_files: self.env_files,
            description: self.description,
        })
    }
}

/// The ordered set of tasks the harness knows about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskCatalog {
    tasks: Vec<TaskDescriptor>,
}

impl TaskCatalog {
    /// Build a catalog from config entries, preserving order.
    ///
    /// # Errors
    /// [`HarnessError::Catalog`] for an invalid entry or a duplicate id.
    pub fn from_entries(entries: Vec<TaskEntry>) -> Result<Self, HarnessError> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            let task = entry.into_descriptor()?;
            if !seen.insert(task.id.clone()) {
                return Err(HarnessError::Catalog {
                    detail: format!("duplicate task id '{}'", task.id),
                });
            }
            tasks.push(task);
        }
        Ok(Self { tasks })
    }

    /// Look up a task by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.id.as_str() == id)
    }

    /// Look up a task by id, failing with [`HarnessError::UnknownTask`].
    ///
    /// # Errors
    /// When no task has this id.
    pub fn require(&self, id: &str) -> Result<&TaskDescriptor, HarnessError> {
        self.get(id).ok_or_else(|| HarnessError::UnknownTask { id: id.to_owned() })
    }

    /// The tasks named by `ids` in the order given, or every task when
    /// `ids` is empty.
    ///
    /// # Errors
    /// When any id is unknown.
    pub fn select(&self, ids: &[String]) -> Result<Vec<&TaskDescriptor>, HarnessError> {
        if ids.is_empty() {
            return Ok(self.tasks.iter().collect());
        }
        ids.iter().map(|id| self.require(id)).collect()
    }

    /// All tasks in catalog order.
    #[must_use]
    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the catalog has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
