//! Evaluation runner: one task, one agent, one reward.
//!
//! ```text
//! Initialized → FixturePrepared → AgentActive → PatchCollected
//!             → HiddenTestApplied → Graded → Scored
//! ```
//!
//! Any step may end in `Failed(reason)` instead. Every failure carries a
//! [`FailureKind`] so "the agent got it wrong" (a graded 0.0, or a hidden-test
//! conflict under the `score-zero` policy) stays distinguishable from "the
//! harness or task infrastructure broke" (no reward at all).

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::instrument;

use crate::agent::{Agent, AgentExit, AgentSession};
use crate::config::{ConflictPolicy, GradersConfig};
use crate::error::{ErrorKind, HarnessError, TimeoutPhase};
use crate::fixture::{FixtureManager, WorkingTree};
use crate::grader;
use crate::model::outcome::{Grade, GradingOutcome, Reward};
use crate::model::patch::PatchArtifact;
use crate::model::types::{TaskDescriptor, TaskId};
use crate::patch_engine;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Failure category recorded in an [`EvalRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Repository or ref missing.
    FixtureUnavailable,
    /// The hidden-test patch clashed with the agent's edits.
    PatchConflict,
    /// The test runner could not run.
    GraderExecution,
    /// The agent or the test runner exceeded its budget.
    Timeout,
    /// The agent could not run.
    AgentError,
    /// Filesystem, git or configuration fault.
    Infrastructure,
}

impl FailureKind {
    const fn from_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::FixtureUnavailable => Self::FixtureUnavailable,
            ErrorKind::PatchConflict => Self::PatchConflict,
            ErrorKind::GraderExecution => Self::GraderExecution,
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::Configuration | ErrorKind::Infrastructure => Self::Infrastructure,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FixtureUnavailable => "fixture-unavailable",
            Self::PatchConflict => "patch-conflict",
            Self::GraderExecution => "grader-execution",
            Self::Timeout => "timeout",
            Self::AgentError => "agent-error",
            Self::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// Why an evaluation ended in `Failed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureReason {
    /// Category.
    pub kind: FailureKind,
    /// Rendered cause.
    pub message: String,
}

impl From<&HarnessError> for FailureReason {
    fn from(err: &HarnessError) -> Self {
        Self {
            kind: FailureKind::from_error_kind(err.kind()),
            message: err.to_string(),
        }
    }
}

/// Evaluation state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EvalState {
    /// Nothing done yet.
    Initialized,
    /// The buggy tree exists.
    FixturePrepared,
    /// The agent owns the tree.
    AgentActive,
    /// The agent's edits were captured as a patch.
    PatchCollected,
    /// The hidden tests were layered onto the agent's tree.
    HiddenTestApplied,
    /// The grader produced an outcome.
    Graded,
    /// A reward was assigned.
    Scored,
    /// Terminal failure.
    Failed(FailureReason),
}

impl EvalState {
    /// `Scored` or `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Scored | Self::Failed(_))
    }
}

impl fmt::Display for EvalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => f.write_str("initialized"),
            Self::FixturePrepared => f.write_str("fixture_prepared"),
            Self::AgentActive => f.write_str("agent_active"),
            Self::PatchCollected => f.write_str("patch_collected"),
            Self::HiddenTestApplied => f.write_str("hidden_test_applied"),
            Self::Graded => f.write_str("graded"),
            Self::Scored => f.write_str("scored"),
            Self::Failed(reason) => write!(f, "failed({})", reason.kind),
        }
    }
}

// ---------------------------------------------------------------------------
// EvalRecord
// ---------------------------------------------------------------------------

/// Everything that happened during one evaluation.
#[derive(Clone, Debug, Serialize)]
pub struct EvalRecord {
    /// Task evaluated.
    pub task_id: TaskId,
    /// Agent name.
    pub agent: String,
    /// Every state entered, in order; the last one is terminal.
    pub states: Vec<EvalState>,
    /// Present only when the agent's work was judged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward: Option<Reward>,
    /// Weighted breakdown behind the reward, when a grading run completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<Grade>,
    /// The grading run, when one completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<GradingOutcome>,
    /// The agent's edits, when collected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_patch: Option<PatchArtifact>,
    /// Failure tag when the evaluation did not reach `Scored`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Wall-clock time of the whole evaluation.
    pub duration_ms: u64,
}

impl EvalRecord {
    fn new(task_id: TaskId, agent: &str) -> Self {
        Self {
            task_id,
            agent: agent.to_owned(),
            states: vec![EvalState::Initialized],
            reward: None,
            grade: None,
            outcome: None,
            agent_patch: None,
            failure: None,
            duration_ms: 0,
        }
    }

    /// The final state.
    #[must_use]
    pub fn terminal(&self) -> &EvalState {
        self.states.last().unwrap_or(&EvalState::Initialized)
    }

    /// Reached `Scored`.
    #[must_use]
    pub fn scored(&self) -> bool {
        matches!(self.terminal(), EvalState::Scored)
    }

    fn enter(&mut self, state: EvalState) {
        tracing::debug!(task = %self.task_id, %state, "transition");
        self.states.push(state);
    }

    fn fail(&mut self, reason: FailureReason) {
        tracing::warn!(task = %self.task_id, kind = %reason.kind, message = %reason.message, "evaluation failed");
        self.failure = Some(reason.kind);
        self.states.push(EvalState::Failed(reason));
    }
}

impl fmt::Display for EvalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "task:   {}", self.task_id.as_str())?;
        writeln!(f, "agent:  {}", self.agent)?;
        let path: Vec<String> = self.states.iter().map(ToString::to_string).collect();
        writeln!(f, "states: {}", path.join(" -> "))?;
        if let Some(patch) = &self.agent_patch {
            writeln!(f, "patch:  {patch}")?;
        }
        if let EvalState::Failed(reason) = self.terminal() {
            writeln!(f, "failure: {}", reason.message)?;
        }
        if let Some(outcome) = &self.outcome {
            writeln!(f, "{}", outcome.diagnostics())?;
        }
        match self.reward {
            Some(r) => write!(f, "reward: {r}"),
            None => write!(f, "reward: none"),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Control flow out of a step: stop with a reason, optionally still scoring.
struct Stop {
    reason: FailureReason,
    reward: Option<Reward>,
}

impl From<HarnessError> for Stop {
    fn from(err: HarnessError) -> Self {
        Self {
            reason: FailureReason::from(&err),
            reward: None,
        }
    }
}

/// Drives single-task evaluations.
#[derive(Debug)]
pub struct EvaluationRunner<'a> {
    fixtures: &'a FixtureManager,
    graders: &'a GradersConfig,
    agent_timeout: Duration,
    conflict_policy: ConflictPolicy,
}

impl<'a> EvaluationRunner<'a> {
    /// A runner with the given agent budget and hidden-test conflict policy.
    #[must_use]
    pub const fn new(
        fixtures: &'a FixtureManager,
        graders: &'a GradersConfig,
        agent_timeout: Duration,
        conflict_policy: ConflictPolicy,
    ) -> Self {
        Self {
            fixtures,
            graders,
            agent_timeout,
            conflict_policy,
        }
    }

    /// Evaluate `agent` on `task`. Never fails: every outcome, including
    /// infrastructure faults, is a terminal state in the record.
    #[instrument(skip_all, fields(task = %task.id, agent = agent.name()))]
    pub fn evaluate(&self, task: &TaskDescriptor, agent: &dyn Agent) -> EvalRecord {
        let start = Instant::now();
        let mut record = EvalRecord::new(task.id.clone(), agent.name());

        if let Err(stop) = self.drive(task, agent, &mut record) {
            record.reward = stop.reward;
            record.fail(stop.reason);
        }
        record.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match record.reward {
            Some(reward) => tracing::info!(%reward, terminal = %record.terminal(), "evaluation finished"),
            None => tracing::info!(terminal = %record.terminal(), "evaluation finished without reward"),
        }
        record
    }

    fn drive(
        &self,
        task: &TaskDescriptor,
        agent: &dyn Agent,
        record: &mut EvalRecord,
    ) -> Result<(), Stop> {
        // Initialized → FixturePrepared. The hidden-test patch is computed up
        // front so a broken task fails before any agent time is spent.
        let revs = self.fixtures.revisions(task)?;
        let test_patch = patch_engine::diff(self.fixtures, task, &revs.buggy, &revs.hidden_test)?;
        let tree = self.fixtures.materialize(task, &revs.buggy)?;
        record.enter(EvalState::FixturePrepared);

        // FixturePrepared → AgentActive.
        record.enter(EvalState::AgentActive);
        self.run_agent(task, agent, tree)
            .and_then(|tree| self.grade(task, &tree, &test_patch, record))
    }

    /// Hand the tree to the agent. On timeout the tree is torn down.
    fn run_agent(
        &self,
        task: &TaskDescriptor,
        agent: &dyn Agent,
        tree: WorkingTree,
    ) -> Result<WorkingTree, Stop> {
        let deadline = Instant::now() + self.agent_timeout;
        let session = AgentSession {
            task,
            tree: tree.root(),
            deadline,
        };
        let exit = agent.run(&session);
        let late = Instant::now() > deadline;

        let timeout = || Stop::from(HarnessError::Timeout {
            phase: TimeoutPhase::Agent,
            seconds: self.agent_timeout.as_secs(),
        });
        match exit {
            Ok(AgentExit::TimedOut) => {
                discard(tree);
                Err(timeout())
            }
            Ok(AgentExit::Completed) if late => {
                discard(tree);
                Err(timeout())
            }
            Ok(AgentExit::Completed) => Ok(tree),
            Err(e) => {
                discard(tree);
                Err(Stop {
                    reason: FailureReason {
                        kind: FailureKind::AgentError,
                        message: e.to_string(),
                    },
                    reward: None,
                })
            }
        }
    }

    fn grade(
        &self,
        task: &TaskDescriptor,
        tree: &WorkingTree,
        test_patch: &PatchArtifact,
        record: &mut EvalRecord,
    ) -> Result<(), Stop> {
        // AgentActive → PatchCollected.
        let agent_patch = patch_engine::diff_tree(tree)?;
        tracing::info!(files = agent_patch.files().len(), digest = %agent_patch.digest(), "agent patch collected");
        record.agent_patch = Some(agent_patch);
        record.enter(EvalState::PatchCollected);

        // PatchCollected → HiddenTestApplied.
        match patch_engine::apply(tree, test_patch) {
            Ok(()) => record.enter(EvalState::HiddenTestApplied),
            Err(err @ HarnessError::PatchConflict { .. }) => {
                let reward = match self.conflict_policy {
                    ConflictPolicy::ScoreZero => Some(Reward::Zero),
                    ConflictPolicy::Infrastructure => None,
                };
                return Err(Stop {
                    reason: FailureReason::from(&err),
                    reward,
                });
            }
            Err(err) => return Err(err.into()),
        }

        // HiddenTestApplied → Graded → Scored.
        let outcome = grader::for_task(task, self.graders).run(tree)?;
        let reward = Reward::from_outcome(&outcome);
        record.grade = Some(Grade::pass_fail(&outcome));
        record.outcome = Some(outcome);
        record.enter(EvalState::Graded);
        record.reward = Some(reward);
        record.enter(EvalState::Scored);
        Ok(())
    }
}

fn discard(tree: WorkingTree) {
    let root = tree.root().to_path_buf();
    if let Err(e) = tree.discard() {
        tracing::warn!(root = %root.display(), error = %e, "failed to remove working tree");
    }
}
