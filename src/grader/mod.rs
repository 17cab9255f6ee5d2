//! Graders: one adapter per test-runner ecosystem.
//!
//! Every adapter implements [`Grader`] and normalizes its runner's native
//! output into the same [`GradingOutcome`], so nothing downstream of grading
//! knows which ecosystem a task belongs to.
//!
//! | Variant        | Runner                         | Parsed from                 |
//! |----------------|--------------------------------|-----------------------------|
//! | `django`       | `python manage.py test -v 2`   | per-test progress lines     |
//! | `forge`        | `forge test -vvv`              | `[PASS]` / `[FAIL]` lines   |
//! | `exit-status`  | any command                    | exit status only            |
//!
//! A failing test run is a valid outcome. Only a runner that cannot be
//! started ([`HarnessError::GraderExecution`]) or does not finish in time
//! ([`HarnessError::Timeout`]) is an error.

pub mod django;
pub mod forge;

use std::process::Command;

use tracing::instrument;

use crate::config::{GraderSettings, GradersConfig};
use crate::error::{HarnessError, TimeoutPhase};
use crate::fixture::WorkingTree;
use crate::model::outcome::{GradingOutcome, TestCase};
use crate::model::types::{GraderVariant, TaskDescriptor};
use crate::process::{self, LOG_LIMIT};

pub use django::DjangoGrader;
pub use forge::ForgeGrader;

/// Exit codes `sh` uses when the command itself could not be run.
const SHELL_NOT_RUNNABLE: [i32; 2] = [126, 127];

// ---------------------------------------------------------------------------
// Grader trait
// ---------------------------------------------------------------------------

/// A test-runner adapter bound to one task.
pub trait Grader: Send + Sync {
    /// Which adapter this is.
    fn variant(&self) -> GraderVariant;

    /// The invocation (rendered command and budget).
    fn invocation(&self) -> &Invocation;

    /// Runner-specific environment and path setup.
    fn configure(&self, _cmd: &mut Command, _tree: &WorkingTree) {}

    /// Extract test cases from the runner's output. Must never panic on
    /// arbitrary input.
    fn parse(&self, stdout: &str, stderr: &str) -> Vec<TestCase>;

    /// Run the tests inside `tree` and normalize the result.
    ///
    /// # Errors
    /// [`HarnessError::GraderExecution`] if the runner cannot be started;
    /// [`HarnessError::Timeout`] if it exceeds its budget (its process group
    /// is killed first).
    fn run(&self, tree: &WorkingTree) -> Result<GradingOutcome, HarnessError> {
        execute(self, tree)
    }
}

#[instrument(
    skip_all,
    fields(task = %tree.task(), variant = %grader.variant(), command = %grader.invocation().command)
)]
fn execute<G: Grader + ?Sized>(grader: &G, tree: &WorkingTree) -> Result<GradingOutcome, HarnessError> {
    let inv = grader.invocation();
    let mut cmd = process::shell(&inv.command, tree.root());
    cmd.env("PATCHGATE_TASK_ID", tree.task().as_str());
    grader.configure(&mut cmd, tree);

    let run = process::run_with_timeout(cmd, inv.settings.timeout).map_err(|e| {
        HarnessError::GraderExecution {
            command: inv.command.clone(),
            detail: e.to_string(),
        }
    })?;

    if run.timed_out {
        tracing::warn!(seconds = inv.settings.timeout.as_secs(), "test runner timed out");
        return Err(HarnessError::Timeout {
            phase: TimeoutPhase::Grader,
            seconds: inv.settings.timeout.as_secs(),
        });
    }
    if let Some(code) = run.exit_code
        && SHELL_NOT_RUNNABLE.contains(&code)
    {
        return Err(HarnessError::GraderExecution {
            command: inv.command.clone(),
            detail: format!(
                "exit {code}: {}",
                run.stderr.lines().last().unwrap_or("command not runnable")
            ),
        });
    }

    let cases = grader.parse(&run.stdout, &run.stderr);
    let passed = GradingOutcome::aggregate(run.exit_code, &cases, inv.settings.require_tests);
    let outcome = GradingOutcome {
        variant: grader.variant(),
        command: inv.command.clone(),
        exit_code: run.exit_code,
        cases,
        passed,
        duration_ms: run.duration_ms(),
        stdout: process::truncate_log(&run.stdout, LOG_LIMIT),
        stderr: process::truncate_log(&run.stderr, LOG_LIMIT),
    };
    tracing::info!(
        passed,
        exit_code = ?outcome.exit_code,
        tests = outcome.cases.len(),
        duration_ms = outcome.duration_ms,
        "graded"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// A grader's command for one task, with placeholders expanded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    /// Resolved settings for the variant.
    pub settings: GraderSettings,
    /// Shell command to run in the tree root.
    pub command: String,
}

impl Invocation {
    /// Expand the task's command (or the variant template) for `task`.
    #[must_use]
    pub fn for_task(task: &TaskDescriptor, settings: GraderSettings) -> Self {
        let template = task.test_command.as_deref().unwrap_or(&settings.command);
        let command = render(template, &task.test_files);
        Self { settings, command }
    }
}

/// Expand `{test_files}` and `{test_labels}` in `template`.
///
/// The rest of the template is kept byte for byte. An empty expansion takes
/// one adjacent space with it so no double gap is left behind.
fn render(template: &str, test_files: &[String]) -> String {
    let files: Vec<String> = test_files.iter().map(|f| shell_escape(f)).collect();
    let labels: Vec<String> = test_files
        .iter()
        .map(|f| shell_escape(&module_label(f)))
        .collect();
    let rendered = expand(template, "{test_files}", &files.join(" "));
    expand(&rendered, "{test_labels}", &labels.join(" "))
}

fn expand(template: &str, placeholder: &str, value: &str) -> String {
    if !value.is_empty() {
        return template.replace(placeholder, value);
    }
    template
        .replace(&format!(" {placeholder}"), "")
        .replace(&format!("{placeholder} "), "")
        .replace(placeholder, "")
}

/// `tests/test_result_crud.py` → `tests.test_result_crud`.
fn module_label(path: &str) -> String {
    path.strip_suffix(".py").unwrap_or(path).replace('/', ".")
}

/// Single-quote `s` unless it is made only of shell-safe characters.
fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_owned();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'))
    {
        return s.to_owned();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

// ---------------------------------------------------------------------------
// Exit-status grader
// ---------------------------------------------------------------------------

/// Grades on the runner's exit status alone.
#[derive(Clone, Debug)]
pub struct ExitStatusGrader {
    invocation: Invocation,
}

impl ExitStatusGrader {
    /// Build for `task`.
    #[must_use]
    pub fn new(task: &TaskDescriptor, settings: GraderSettings) -> Self {
        Self {
            invocation: Invocation::for_task(task, settings),
        }
    }
}

impl Grader for ExitStatusGrader {
    fn variant(&self) -> GraderVariant {
        GraderVariant::ExitStatus
    }

    fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    fn parse(&self, _stdout: &str, _stderr: &str) -> Vec<TestCase> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// The grader selected by `task.grader`, configured from `graders`.
#[must_use]
pub fn for_task(task: &TaskDescriptor, graders: &GradersConfig) -> Box<dyn Grader> {
    let settings = graders.settings(task.grader);
    match task.grader {
        GraderVariant::Django => Box::new(DjangoGrader::new(task, settings)),
        GraderVariant::Forge => Box::new(ForgeGrader::new(task, settings)),
        GraderVariant::ExitStatus => Box::new(ExitStatusGrader::new(task, settings)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
