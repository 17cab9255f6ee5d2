//! Harness error types for patchgate.
//!
//! Defines [`HarnessError`], the unified error type for fixture, patch and
//! grading operations. Every variant carries enough context to act on
//! without the surrounding logs, plus a "To fix:" hint.
//!
//! Failures that are part of the grading protocol (a conflicting hidden-test
//! patch, a runner that never finishes) have their own variants so callers
//! can tell "the agent got it wrong" apart from "the harness broke".

use std::fmt;
use std::path::PathBuf;

use patchgate_git::GitError;
use serde::Serialize;

use crate::model::types::TaskId;

// ---------------------------------------------------------------------------
// HarnessError
// ---------------------------------------------------------------------------

/// Unified error type for harness operations.
#[derive(Debug)]
pub enum HarnessError {
    /// The task's repository or one of its refs could not be reached.
    FixtureUnavailable {
        /// Task whose fixture was requested.
        task: TaskId,
        /// Repository locator or ref name that is missing.
        reference: String,
        /// Underlying cause.
        detail: String,
    },

    /// A patch did not apply cleanly to the target tree.
    PatchConflict {
        /// Which patch (e.g. `fix_profile_404_baseline..fix_profile_404_test`).
        label: String,
        /// `git apply` diagnostics.
        stderr: String,
    },

    /// A test runner could not be started or waited on.
    GraderExecution {
        /// The command that was run.
        command: String,
        /// What went wrong.
        detail: String,
    },

    /// An agent or subprocess exceeded its time budget and was torn down.
    Timeout {
        /// Which step timed out.
        phase: TimeoutPhase,
        /// The budget that was exceeded.
        seconds: u64,
    },

    /// No task with this id exists in the catalog.
    UnknownTask {
        /// The requested id.
        id: String,
    },

    /// The task catalog is invalid.
    Catalog {
        /// What is wrong with it.
        detail: String,
    },

    /// A configuration file could not be loaded or parsed.
    Config {
        /// Path to the configuration file.
        path: PathBuf,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// A git operation failed outside the cases above.
    Git(GitError),

    /// An I/O error occurred.
    Io(std::io::Error),
}

/// Step of an evaluation that can time out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutPhase {
    /// Waiting for the agent to finish editing.
    Agent,
    /// Waiting for a test runner.
    Grader,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Grader => write!(f, "grader"),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Stable tag for a [`HarnessError`], used in reports and records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Repository or ref missing.
    FixtureUnavailable,
    /// Patch did not apply.
    PatchConflict,
    /// Runner could not start or be waited on.
    GraderExecution,
    /// Time budget exceeded.
    Timeout,
    /// Catalog or configuration problem.
    Configuration,
    /// Git or filesystem failure.
    Infrastructure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FixtureUnavailable => "fixture-unavailable",
            Self::PatchConflict => "patch-conflict",
            Self::GraderExecution => "grader-execution",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

impl HarnessError {
    /// The stable tag of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::FixtureUnavailable { .. } => ErrorKind::FixtureUnavailable,
            Self::PatchConflict { .. } => ErrorKind::PatchConflict,
            Self::GraderExecution { .. } => ErrorKind::GraderExecution,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UnknownTask { .. } | Self::Catalog { .. } | Self::Config { .. } => {
                ErrorKind::Configuration
            }
            Self::Git(_) | Self::Io(_) => ErrorKind::Infrastructure,
        }
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixtureUnavailable {
                task,
                reference,
                detail,
            } => {
                write!(
                    f,
                    "fixture for task '{task}' is unavailable: '{reference}': {detail}\n  To fix: check that the repository is reachable and the ref exists:\n    git ls-remote <repo> {reference}"
                )
            }
            Self::PatchConflict { label, stderr } => {
                write!(f, "patch {label} does not apply cleanly")?;
                if !stderr.is_empty() {
                    write!(f, "\n  git apply: {stderr}")?;
                }
                write!(
                    f,
                    "\n  To fix: re-prepare a fresh tree; the partially patched tree must be discarded."
                )
            }
            Self::GraderExecution { command, detail } => {
                write!(
                    f,
                    "test runner could not be executed: {command}: {detail}\n  To fix: check that the runner is installed in the sandbox and on PATH."
                )
            }
            Self::Timeout { phase, seconds } => {
                write!(
                    f,
                    "{phase} timed out after {seconds}s; its process group was killed\n  To fix: raise the {phase} timeout in patchgate.toml if the run is legitimately slow."
                )
            }
            Self::UnknownTask { id } => {
                write!(
                    f,
                    "task '{id}' not found in the catalog.\n  To fix: list available tasks:\n    patchgate tasks"
                )
            }
            Self::Catalog { detail } => {
                write!(
                    f,
                    "invalid task catalog: {detail}\n  To fix: correct the [[task]] entries in patchgate.toml."
                )
            }
            Self::Config { path, detail } => {
                write!(
                    f,
                    "configuration error in '{}': {}\n  To fix: edit the config file and correct the issue.",
                    path.display(),
                    detail
                )
            }
            Self::Git(err) => {
                write!(
                    f,
                    "git operation failed: {err}\n  To fix: check the repository cache and retry; delete the cache directory to force a fresh clone."
                )
            }
            Self::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}\n  To fix: check file permissions and disk space."
                )
            }
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Git(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<GitError> for HarnessError {
    fn from(err: GitError) -> Self {
        Self::Git(err)
    }
}

impl From<crate::config::ConfigError> for HarnessError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config {
            path: err.path.unwrap_or_default(),
            detail: err.message,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
