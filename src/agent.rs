//! The agent boundary.
//!
//! An agent receives exclusive write access to a prepared buggy tree and is
//! expected to edit it in place. The harness treats it as untrusted: it gets
//! a hard deadline, and whatever it leaves behind is captured as a patch.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use patchgate_git::{GitCli, GitRepo as _};

use crate::model::patch::PatchArtifact;
use crate::model::types::TaskDescriptor;
use crate::process;

/// What an agent is handed.
#[derive(Clone, Copy, Debug)]
pub struct AgentSession<'a> {
    /// The task being solved.
    pub task: &'a TaskDescriptor,
    /// Root of the tree to edit.
    pub tree: &'a Path,
    /// When the agent must be done.
    pub deadline: Instant,
}

impl AgentSession<'_> {
    /// Time left before the deadline (zero once it has passed).
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// How an agent run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentExit {
    /// The agent signalled completion.
    Completed,
    /// The deadline passed and the agent was stopped.
    TimedOut,
}

/// The agent itself broke (as opposed to producing a wrong fix).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentError {
    /// What went wrong.
    pub message: String,
}

impl AgentError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent failed: {}", self.message)
    }
}

impl std::error::Error for AgentError {}

/// Something that edits a working tree to solve a task.
pub trait Agent: Send + Sync {
    /// Short name for logs and records.
    fn name(&self) -> &str;

    /// Work on `session.tree` until done or until `session.deadline`.
    ///
    /// # Errors
    /// [`AgentError`] when the agent cannot run at all.
    fn run(&self, session: &AgentSession<'_>) -> Result<AgentExit, AgentError>;
}

// ---------------------------------------------------------------------------
// CommandAgent
// ---------------------------------------------------------------------------

/// Runs a shell command inside the tree.
///
/// The command leads its own process group; when the deadline passes the
/// whole group is killed and reaped before `run` returns. The task id and
/// tree path are exported as `PATCHGATE_TASK_ID` and `PATCHGATE_TREE`.
#[derive(Clone, Debug)]
pub struct CommandAgent {
    command: String,
}

impl CommandAgent {
    /// An agent running `command` via `sh -c`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.command
    }

    fn run(&self, session: &AgentSession<'_>) -> Result<AgentExit, AgentError> {
        let budget = session.remaining();
        if budget.is_zero() {
            return Ok(AgentExit::TimedOut);
        }

        let mut cmd = process::shell(&self.command, session.tree);
        cmd.env("PATCHGATE_TASK_ID", session.task.id.as_str())
            .env("PATCHGATE_TREE", session.tree);
        let run = process::run_with_timeout(cmd, budget)
            .map_err(|e| AgentError::new(format!("cannot start `{}`: {e}", self.command)))?;

        if run.timed_out {
            tracing::warn!(seconds = budget.as_secs(), "agent killed at deadline");
            return Ok(AgentExit::TimedOut);
        }
        if !run.success() {
            // Whatever the agent managed to change is still graded.
            tracing::warn!(
                exit_code = ?run.exit_code,
                stderr = %process::truncate_log(&run.stderr, 2048),
                "agent command exited unsuccessfully"
            );
        }
        tracing::debug!(duration_ms = run.duration_ms(), "agent command finished");
        Ok(AgentExit::Completed)
    }
}

// ---------------------------------------------------------------------------
// ReplayAgent / NoopAgent
// ---------------------------------------------------------------------------

/// Applies a stored patch, e.g. the golden patch, as its work.
#[derive(Clone, Debug)]
pub struct ReplayAgent {
    name: String,
    patch: PatchArtifact,
}

impl ReplayAgent {
    /// Replay `patch` under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, patch: PatchArtifact) -> Self {
        Self {
            name: name.into(),
            patch,
        }
    }

    /// Replay a patch read from `path`.
    ///
    /// # Errors
    /// I/O errors reading the file.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let label = path.display().to_string();
        Ok(Self::new(label.clone(), PatchArtifact::new(label, bytes)))
    }

    /// The patch being replayed.
    #[must_use]
    pub const fn patch(&self) -> &PatchArtifact {
        &self.patch
    }
}

impl Agent for ReplayAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, session: &AgentSession<'_>) -> Result<AgentExit, AgentError> {
        if self.patch.is_empty() {
            return Ok(AgentExit::Completed);
        }
        GitCli::open(session.tree)
            .apply_patch(self.patch.bytes(), false)
            .map_err(|e| AgentError::new(format!("replaying {}: {e}", self.patch.label())))?;
        Ok(AgentExit::Completed)
    }
}

/// Leaves the tree untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAgent;

impl Agent for NoopAgent {
    fn name(&self) -> &str {
        "noop"
    }

    fn run(&self, _session: &AgentSession<'_>) -> Result<AgentExit, AgentError> {
        Ok(AgentExit::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{Domain, GraderVariant, TaskId, TaskRefs};
    use patchgate_git::Identity;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn task() -> TaskDescriptor {
        TaskDescriptor {
            id: TaskId::new("fix-profile-404").unwrap(),
            domain: Domain::WebApp,
            repo: "/r".to_owned(),
            refs: TaskRefs::from_stem("fix_profile_404"),
            grader: GraderVariant::ExitStatus,
            test_files: Vec::new(),
            test_command: None,
            checkout_dir: "repo".to_owned(),
            env_files: BTreeMap::new(),
            description: None,
        }
    }

    fn session<'a>(task: &'a TaskDescriptor, tree: &'a Path, budget: Duration) -> AgentSession<'a> {
        AgentSession {
            task,
            tree,
            deadline: Instant::now() + budget,
        }
    }

    #[test]
    fn command_agent_edits_the_tree_with_task_env() {
        let dir = TempDir::new().unwrap();
        let t = task();
        let agent = CommandAgent::new("printf '%s %s' \"$PATCHGATE_TASK_ID\" \"$PATCHGATE_TREE\" > out.txt");
        let exit = agent.run(&session(&t, dir.path(), Duration::from_secs(10))).unwrap();
        assert_eq!(exit, AgentExit::Completed);
        let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(written, format!("fix-profile-404 {}", dir.path().display()));
    }

    #[test]
    fn failing_command_still_completes() {
        let dir = TempDir::new().unwrap();
        let t = task();
        let exit = CommandAgent::new("exit 7")
            .run(&session(&t, dir.path(), Duration::from_secs(10)))
            .unwrap();
        assert_eq!(exit, AgentExit::Completed);
    }

    #[test]
    fn command_agent_times_out() {
        let dir = TempDir::new().unwrap();
        let t = task();
        let start = Instant::now();
        let exit = CommandAgent::new("sleep 30")
            .run(&session(&t, dir.path(), Duration::from_millis(300)))
            .unwrap();
        assert_eq!(exit, AgentExit::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn expired_deadline_does_not_start_the_command() {
        let dir = TempDir::new().unwrap();
        let t = task();
        let s = AgentSession {
            task: &t,
            tree: dir.path(),
            deadline: Instant::now(),
        };
        let exit = CommandAgent::new("touch ran").run(&s).unwrap();
        assert_eq!(exit, AgentExit::TimedOut);
        assert!(!dir.path().join("ran").exists());
    }

    #[test]
    fn replay_agent_applies_its_patch() {
        let dir = TempDir::new().unwrap();
        let repo = GitCli::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("views.py"), "return 500\n").unwrap();
        let base = repo.snapshot("base", &Identity::default()).unwrap();
        std::fs::write(dir.path().join("views.py"), "return 404\n").unwrap();
        let patch = PatchArtifact::new("fix", repo.diff_worktree(base).unwrap());
        std::fs::write(dir.path().join("views.py"), "return 500\n").unwrap();

        let t = task();
        let agent = ReplayAgent::new("golden", patch);
        agent.run(&session(&t, dir.path(), Duration::from_secs(10))).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("views.py")).unwrap(), "return 404\n");

        // Replaying onto the already fixed tree is rejected.
        let err = agent.run(&session(&t, dir.path(), Duration::from_secs(10))).unwrap_err();
        assert!(err.message.contains("replaying fix"), "{err}");
    }

    #[test]
    fn noop_agent_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let t = task();
        assert_eq!(
            NoopAgent.run(&session(&t, dir.path(), Duration::from_secs(1))).unwrap(),
            AgentExit::Completed
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
