//! Dual validation: the quality gate a task catalog must pass before its
//! rewards can be trusted.
//!
//! For every task two independent checks run, each on its own fresh tree
//! with the hidden-test patch (buggy → hidden-test) applied:
//!
//! - `baseline_fail`: the buggy tree must **fail** the hidden tests;
//! - `golden_pass`: the reference-fix tree must **pass** them.
//!
//! A task is well-formed iff both hold. A hidden-test patch that does not
//! apply counts as a violation (the task is malformed), while a grader that
//! cannot run or times out is recorded as an error with its [`ErrorKind`].

use std::fmt::{self, Write as _};

use serde::Serialize;
use tracing::instrument;

use crate::config::GradersConfig;
use crate::error::{ErrorKind, HarnessError};
use crate::fixture::{FixtureManager, ResolvedRef};
use crate::grader;
use crate::model::outcome::{GradingOutcome, Reward, ValidateMode};
use crate::model::patch::PatchArtifact;
use crate::model::types::{RefKind, TaskDescriptor, TaskId};
use crate::patch_engine;
use crate::pool;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Result of one check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckStatus {
    /// The expectation held.
    Held,
    /// The expectation was contradicted: the task is malformed.
    Violated {
        /// What went wrong.
        reason: String,
    },
    /// The check could not be carried out.
    Errored {
        /// Error category.
        kind: ErrorKind,
        /// Rendered error.
        message: String,
    },
}

/// One check of one task.
#[derive(Clone, Debug, Serialize)]
pub struct CheckResult {
    /// Which check.
    pub mode: ValidateMode,
    /// Outcome of the check.
    #[serde(flatten)]
    pub status: CheckStatus,
    /// Scenario reward under this mode (inverted for `baseline_fail`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward: Option<Reward>,
    /// The grading run, when one completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<GradingOutcome>,
}

impl CheckResult {
    /// Whether the expectation held.
    #[must_use]
    pub const fn ok(&self) -> bool {
        matches!(self.status, CheckStatus::Held)
    }

    fn errored(mode: ValidateMode, err: &HarnessError) -> Self {
        Self {
            mode,
            status: CheckStatus::Errored {
                kind: err.kind(),
                message: err.to_string(),
            },
            reward: None,
            outcome: None,
        }
    }

    /// Text explaining a failed check: the reason plus grader diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> Option<String> {
        let head = match &self.status {
            CheckStatus::Held => return None,
            CheckStatus::Violated { reason } => reason.clone(),
            CheckStatus::Errored { kind, message } => format!("[{kind}] {message}"),
        };
        Some(match &self.outcome {
            Some(outcome) => format!("{head}\n{}", outcome.diagnostics()),
            None => head,
        })
    }
}

/// Both checks for one task.
#[derive(Clone, Debug, Serialize)]
pub struct TaskValidation {
    /// Task id.
    pub task_id: TaskId,
    /// The buggy tree failed the hidden tests.
    pub baseline_fail_ok: bool,
    /// The reference-fix tree passed the hidden tests.
    pub golden_pass_ok: bool,
    /// Detail of the `baseline_fail` check.
    pub baseline_fail: CheckResult,
    /// Detail of the `golden_pass` check.
    pub golden_pass: CheckResult,
}

impl TaskValidation {
    fn new(task_id: TaskId, baseline_fail: CheckResult, golden_pass: CheckResult) -> Self {
        Self {
            task_id,
            baseline_fail_ok: baseline_fail.ok(),
            golden_pass_ok: golden_pass.ok(),
            baseline_fail,
            golden_pass,
        }
    }

    /// Both checks held.
    #[must_use]
    pub const fn well_formed(&self) -> bool {
        self.baseline_fail_ok && self.golden_pass_ok
    }

    /// Either check could not be carried out.
    #[must_use]
    pub const fn errored(&self) -> bool {
        matches!(self.baseline_fail.status, CheckStatus::Errored { .. })
            || matches!(self.golden_pass.status, CheckStatus::Errored { .. })
    }
}

/// Catalog-wide counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    /// Tasks for which both checks held.
    pub well_formed: usize,
    /// Tasks validated.
    pub total: usize,
    /// Ids of tasks that are not well-formed, in catalog order.
    pub malformed: Vec<TaskId>,
    /// How many of those could not be checked at all.
    pub errored: usize,
}

/// Result of one pipeline run. Regenerated every run, never persisted.
#[derive(Clone, Debug, Serialize)]
pub struct ValidationReport {
    /// Per-task results in catalog order.
    pub tasks: Vec<TaskValidation>,
    /// Aggregate counts.
    pub summary: ValidationSummary,
}

impl ValidationReport {
    /// Build the summary over `tasks`.
    #[must_use]
    pub fn new(tasks: Vec<TaskValidation>) -> Self {
        let mut summary = ValidationSummary {
            total: tasks.len(),
            ..ValidationSummary::default()
        };
        for t in &tasks {
            if t.well_formed() {
                summary.well_formed += 1;
            } else {
                summary.malformed.push(t.task_id.clone());
                if t.errored() {
                    summary.errored += 1;
                }
            }
        }
        Self { tasks, summary }
    }

    /// Every task is well-formed.
    #[must_use]
    pub fn all_well_formed(&self) -> bool {
        self.summary.malformed.is_empty()
    }

    /// Result for one task.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&TaskValidation> {
        self.tasks.iter().find(|t| t.task_id.as_str() == id)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |ok: bool| if ok { "ok" } else { "FAILED" };
        for t in &self.tasks {
            writeln!(
                f,
                "{:<32} baseline_fail={:<6} golden_pass={}",
                t.task_id.as_str(),
                mark(t.baseline_fail_ok),
                mark(t.golden_pass_ok)
            )?;
            for check in [&t.baseline_fail, &t.golden_pass] {
                if let Some(diag) = check.diagnostics() {
                    let mut block = String::new();
                    for line in diag.lines() {
                        let _ = writeln!(block, "    {line}");
                    }
                    write!(f, "  {}:\n{block}", check.mode)?;
                }
            }
        }
        write!(
            f,
            "\n{}/{} tasks well-formed",
            self.summary.well_formed, self.summary.total
        )?;
        if self.summary.errored > 0 {
            write!(f, " ({} could not be checked)", self.summary.errored)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Runs the dual-validation protocol over a set of tasks.
#[derive(Debug)]
pub struct ValidationPipeline<'a> {
    fixtures: &'a FixtureManager,
    graders: &'a GradersConfig,
    max_parallel: usize,
}

impl<'a> ValidationPipeline<'a> {
    /// A pipeline validating up to `max_parallel` tasks at once.
    #[must_use]
    pub const fn new(
        fixtures: &'a FixtureManager,
        graders: &'a GradersConfig,
        max_parallel: usize,
    ) -> Self {
        Self {
            fixtures,
            graders,
            max_parallel,
        }
    }

    /// Validate every task in `tasks`, preserving their order.
    ///
    /// Failures are recorded in the report; this never aborts early.
    #[instrument(skip_all, fields(tasks = tasks.len(), max_parallel = self.max_parallel))]
    pub fn run(&self, tasks: &[&TaskDescriptor]) -> ValidationReport {
        let results = pool::run_bounded(tasks, self.max_parallel, |task| self.validate_task(task));
        let report = ValidationReport::new(results);
        tracing::info!(
            well_formed = report.summary.well_formed,
            total = report.summary.total,
            "validation finished"
        );
        report
    }

    /// Run both checks for one task.
    #[instrument(skip_all, fields(task = %task.id))]
    pub fn validate_task(&self, task: &TaskDescriptor) -> TaskValidation {
        let prepared = self.fixtures.revisions(task).and_then(|revs| {
            let test_patch =
                patch_engine::diff(self.fixtures, task, &revs.buggy, &revs.hidden_test)?;
            Ok((revs, test_patch))
        });
        let (revs, test_patch) = match prepared {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "task could not be prepared");
                return TaskValidation::new(
                    task.id.clone(),
                    CheckResult::errored(ValidateMode::BaselineFail, &e),
                    CheckResult::errored(ValidateMode::GoldenPass, &e),
                );
            }
        };

        let baseline = self.check(task, ValidateMode::BaselineFail, revs.get(RefKind::Buggy), &test_patch);
        let golden = self.check(
            task,
            ValidateMode::GoldenPass,
            revs.get(RefKind::ReferenceFix),
            &test_patch,
        );
        let result = TaskValidation::new(task.id.clone(), baseline, golden);
        tracing::info!(
            baseline_fail_ok = result.baseline_fail_ok,
            golden_pass_ok = result.golden_pass_ok,
            "task validated"
        );
        result
    }

    fn check(
        &self,
        task: &TaskDescriptor,
        mode: ValidateMode,
        rev: &ResolvedRef,
        test_patch: &PatchArtifact,
    ) -> CheckResult {
        let tree = match self.fixtures.materialize(task, rev) {
            Ok(tree) => tree,
            Err(e) => return CheckResult::errored(mode, &e),
        };
        match patch_engine::apply(&tree, test_patch) {
            Ok(()) => {}
            Err(HarnessError::PatchConflict { label, stderr }) => {
                return CheckResult {
                    mode,
                    status: CheckStatus::Violated {
                        reason: format!(
                            "hidden-test patch {label} does not apply to {} ({}): {}",
                            rev.kind,
                            rev.name,
                            stderr.trim()
                        ),
                    },
                    reward: None,
                    outcome: None,
                };
            }
            Err(e) => return CheckResult::errored(mode, &e),
        }

        let outcome = match grader::for_task(task, self.graders).run(&tree) {
            Ok(outcome) => outcome,
            Err(e) => return CheckResult::errored(mode, &e),
        };
        let status = if outcome.passed == mode.expected_pass() {
            CheckStatus::Held
        } else if outcome.passed {
            CheckStatus::Violated {
                reason: format!("hidden tests pass on the {} ref ({})", rev.kind, rev.name),
            }
        } else {
            CheckStatus::Violated {
                reason: format!("hidden tests fail on the {} ref ({})", rev.kind, rev.name),
            }
        };
        CheckResult {
            mode,
            status,
            reward: Some(Reward::from_outcome(&outcome).for_mode(Some(mode))),
            outcome: Some(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::outcome::{TestCase, TestStatus};
    use crate::model::types::GraderVariant;

    fn check(mode: ValidateMode, status: CheckStatus) -> CheckResult {
        CheckResult {
            mode,
            status,
            reward: None,
            outcome: None,
        }
    }

    fn id(s: &str) -> TaskId {
        TaskId::new(s).unwrap()
    }

    #[test]
    fn summary_counts_malformed_and_errored() {
        let report = ValidationReport::new(vec![
            TaskValidation::new(
                id("good"),
                check(ValidateMode::BaselineFail, CheckStatus::Held),
                check(ValidateMode::GoldenPass, CheckStatus::Held),
            ),
            TaskValidation::new(
                id("weak-tests"),
                check(
                    ValidateMode::BaselineFail,
                    CheckStatus::Violated {
                        reason: "hidden tests pass on the buggy ref".to_owned(),
                    },
                ),
                check(ValidateMode::GoldenPass, CheckStatus::Held),
            ),
            TaskValidation::new(
                id("gone"),
                check(
                    ValidateMode::BaselineFail,
                    CheckStatus::Errored {
                        kind: ErrorKind::FixtureUnavailable,
                        message: "missing".to_owned(),
                    },
                ),
                check(
                    ValidateMode::GoldenPass,
                    CheckStatus::Errored {
                        kind: ErrorKind::FixtureUnavailable,
                        message: "missing".to_owned(),
                    },
                ),
            ),
        ]);

        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.well_formed, 1);
        assert_eq!(report.summary.malformed, [id("weak-tests"), id("gone")]);
        assert_eq!(report.summary.errored, 1);
        assert!(!report.all_well_formed());

        let weak = report.get("weak-tests").unwrap();
        assert!(!weak.baseline_fail_ok);
        assert!(weak.golden_pass_ok);

        let text = report.to_string();
        assert!(text.contains("1/3 tasks well-formed (1 could not be checked)"), "{text}");
        assert!(text.contains("hidden tests pass on the buggy ref"));
    }

    #[test]
    fn report_json_has_boolean_pair_per_task() {
        let report = ValidationReport::new(vec![TaskValidation::new(
            id("fix-profile-404"),
            check(ValidateMode::BaselineFail, CheckStatus::Held),
            check(ValidateMode::GoldenPass, CheckStatus::Held),
        )]);
        let json = serde_json::to_value(&report).unwrap();
        let task = &json["tasks"][0];
        assert_eq!(task["task_id"], "fix-profile-404");
        assert_eq!(task["baseline_fail_ok"], true);
        assert_eq!(task["golden_pass_ok"], true);
        assert_eq!(task["baseline_fail"]["status"], "held");
        assert_eq!(json["summary"]["well_formed"], 1);
    }

    #[test]
    fn diagnostics_include_grader_failures() {
        let outcome = GradingOutcome {
            variant: GraderVariant::Django,
            command: "python manage.py test".to_owned(),
            exit_code: Some(1),
            cases: vec![TestCase {
                name: "tests.T.test_404".to_owned(),
                status: TestStatus::Failed,
                detail: Some("AssertionError: 500 != 404".to_owned()),
            }],
            passed: false,
            duration_ms: 10,
            stdout: String::new(),
            stderr: String::new(),
        };
        let c = CheckResult {
            mode: ValidateMode::GoldenPass,
            status: CheckStatus::Violated {
                reason: "hidden tests fail on the reference-fix ref".to_owned(),
            },
            reward: Some(Reward::Zero),
            outcome: Some(outcome),
        };
        let diag = c.diagnostics().unwrap();
        assert!(diag.starts_with("hidden tests fail"));
        assert!(diag.contains("AssertionError: 500 != 404"), "{diag}");
        assert!(check(ValidateMode::GoldenPass, CheckStatus::Held).diagnostics().is_none());
    }
}
