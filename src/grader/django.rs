//! Django test-runner adapter.
//!
//! Reads the per-test progress lines `manage.py test --verbosity=2` writes to
//! stderr:
//!
//! ```text
//! test_delete (tests.test_result_crud.ResultCrudTests.test_delete) ... FAIL
//! ```
//!
//! and the `FAIL:` / `ERROR:` blocks that follow, whose last line (usually
//! the assertion message) becomes the case detail.

use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;

use super::{Grader, Invocation};
use crate::config::GraderSettings;
use crate::fixture::WorkingTree;
use crate::model::outcome::{TestCase, TestStatus};
use crate::model::types::{GraderVariant, TaskDescriptor};

static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+) \(([\w.]+)\)(?: \.\.\. (.*))?$").expect("valid regex")
});

/// Status tail of a progress line whose name was printed on an earlier line
/// (tests with docstrings).
static DEFERRED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" \.\.\. (ok|FAIL|ERROR|skipped.*|expected failure|unexpected success)$").expect("valid regex"));

static BLOCK_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(FAIL|ERROR): (\w+) \(([\w.]+)\)").expect("valid regex"));

static RAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Ran (\d+) tests? in ").expect("valid regex"));

/// Grader for Django projects.
#[derive(Clone, Debug)]
pub struct DjangoGrader {
    invocation: Invocation,
}

impl DjangoGrader {
    /// Build for `task`.
    #[must_use]
    pub fn new(task: &TaskDescriptor, settings: GraderSettings) -> Self {
        Self {
            invocation: Invocation::for_task(task, settings),
        }
    }
}

impl Grader for DjangoGrader {
    fn variant(&self) -> GraderVariant {
        GraderVariant::Django
    }

    fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    /// Both the project root and the task scope go on `PYTHONPATH`, so the
    /// project imports whether its package lives at the root or one level up.
    fn configure(&self, cmd: &mut Command, tree: &WorkingTree) {
        let mut paths = vec![tree.root().to_path_buf(), tree.scope().to_path_buf()];
        if let Some(existing) = std::env::var_os("PYTHONPATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        if let Ok(joined) = std::env::join_paths(paths) {
            cmd.env("PYTHONPATH", joined);
        }
        cmd.env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1");
    }

    fn parse(&self, stdout: &str, stderr: &str) -> Vec<TestCase> {
        parse_output(&format!("{stderr}\n{stdout}"))
    }
}

/// Extract test cases from unittest verbose output.
#[must_use]
pub fn parse_output(output: &str) -> Vec<TestCase> {
    let mut cases: Vec<TestCase> = Vec::new();
    let mut pending: Option<String> = None;
    let mut ran: Option<(u64, bool)> = None;
    let mut lines = output.lines().peekable();

    while let Some(line) = lines.next() {
        let line = line.trim_end();

        if let Some(caps) = BLOCK_HEADER.captures(line) {
            let status = if &caps[1] == "FAIL" {
                TestStatus::Failed
            } else {
                TestStatus::Errored
            };
            let name = qualified_name(&caps[2], &caps[3]);
            let detail = block_detail(&mut lines);
            match cases.iter_mut().find(|c| c.name == name) {
                Some(case) => case.detail = detail,
                None => cases.push(TestCase {
                    name,
                    status,
                    detail,
                }),
            }
            continue;
        }

        if let Some(caps) = PROGRESS.captures(line) {
            let name = qualified_name(&caps[1], &caps[2]);
            match caps.get(3).and_then(|m| status_of(m.as_str())) {
                Some(status) => push_unique(&mut cases, name, status),
                None => pending = Some(name),
            }
            continue;
        }

        if let Some(caps) = DEFERRED.captures(line)
            && let Some(name) = pending.take()
            && let Some(status) = status_of(&caps[1])
        {
            push_unique(&mut cases, name, status);
            continue;
        }

        if let Some(caps) = RAN.captures(line) {
            let count = caps[1].parse().unwrap_or(0);
            let ok = lines
                .by_ref()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .is_some_and(|l| l.starts_with("OK"));
            ran = Some((count, ok));
        }
    }

    // Nothing per-test was printed (verbosity 1): fall back to the summary.
    if cases.is_empty()
        && let Some((count, ok)) = ran
        && count > 0
    {
        let status = if ok { TestStatus::Passed } else { TestStatus::Failed };
        cases.push(TestCase {
            name: "django::suite".to_owned(),
            status,
            detail: Some(format!("Ran {count} tests")),
        });
    }
    cases
}

/// `test_x` + `app.tests.Cls.test_x` → `app.tests.Cls.test_x`;
/// `test_x` + `app.tests.Cls` → `app.tests.Cls.test_x`.
fn qualified_name(method: &str, owner: &str) -> String {
    if owner
        .strip_suffix(method)
        .is_some_and(|prefix| prefix.ends_with('.'))
    {
        owner.to_owned()
    } else {
        format!("{owner}.{method}")
    }
}

fn status_of(tail: &str) -> Option<TestStatus> {
    let tail = tail.trim();
    match tail {
        "ok" | "expected failure" => Some(TestStatus::Passed),
        "FAIL" | "unexpected success" => Some(TestStatus::Failed),
        "ERROR" => Some(TestStatus::Errored),
        _ if tail.starts_with("skipped") => Some(TestStatus::Skipped),
        _ => None,
    }
}

fn push_unique(cases: &mut Vec<TestCase>, name: String, status: TestStatus) {
    if !cases.iter().any(|c| c.name == name) {
        cases.push(TestCase::new(name, status));
    }
}

/// Consume a failure block up to its closing separator and return its last
/// non-empty line.
fn block_detail<'a>(lines: &mut std::iter::Peekable<impl Iterator<Item = &'a str>>) -> Option<String> {
    // The dashed rule right under the header.
    if lines.peek().is_some_and(|l| l.starts_with("---")) {
        lines.next();
    }
    let mut last = None;
    while let Some(line) = lines.peek() {
        if line.starts_with("=====") || line.starts_with("-----") {
            break;
        }
        if !line.trim().is_empty() {
            last = Some(line.trim().to_owned());
        }
        lines.next();
    }
    last
}
