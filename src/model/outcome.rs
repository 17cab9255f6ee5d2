//! Grading outcomes and rewards.
//!
//! A [`GradingOutcome`] is the normalized result of one test run, whatever
//! the runner. A [`Reward`] is derived from its aggregate boolean and nothing
//! else. A [`Grade`] combines weighted [`SubGrade`]s into one score; a plain
//! evaluation has a single 0/1 subgrade.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use super::types::GraderVariant;

// ---------------------------------------------------------------------------
// Test cases
// ---------------------------------------------------------------------------

/// Result of one discovered test case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// The case passed.
    Passed,
    /// An assertion failed.
    Failed,
    /// The case raised or reverted outside an assertion.
    Errored,
    /// The case was not run.
    Skipped,
}

impl TestStatus {
    /// Failed or errored.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Errored)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Errored => write!(f, "errored"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// One test case as reported by a runner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TestCase {
    /// Fully-qualified name (`module.Class.test_x`, `Contract::test_x()`).
    pub name: String,
    /// Result.
    pub status: TestStatus,
    /// Runner-provided reason, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TestCase {
    /// A case without detail.
    #[must_use]
    pub fn new(name: impl Into<String>, status: TestStatus) -> Self {
        Self {
            name: name.into(),
            status,
            detail: None,
        }
    }
}

/// Per-status counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TestCounts {
    /// Passed cases.
    pub passed: usize,
    /// Failed cases.
    pub failed: usize,
    /// Errored cases.
    pub errored: usize,
    /// Skipped cases.
    pub skipped: usize,
}

impl TestCounts {
    /// Count `cases` by status.
    #[must_use]
    pub fn of(cases: &[TestCase]) -> Self {
        let mut counts = Self::default();
        for case in cases {
            match case.status {
                TestStatus::Passed => counts.passed += 1,
                TestStatus::Failed => counts.failed += 1,
                TestStatus::Errored => counts.errored += 1,
                TestStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Cases that actually ran.
    #[must_use]
    pub const fn executed(&self) -> usize {
        self.passed + self.failed + self.errored
    }
}

impl fmt::Display for TestCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} errored, {} skipped",
            self.passed, self.failed, self.errored, self.skipped
        )
    }
}

// ---------------------------------------------------------------------------
// GradingOutcome
// ---------------------------------------------------------------------------

/// Result of one test-execution attempt.
///
/// A failing test run is a perfectly valid outcome with `passed == false`;
/// runs that could not start or did not finish never produce one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GradingOutcome {
    /// Adapter that produced this outcome.
    pub variant: GraderVariant,
    /// The shell command that was run.
    pub command: String,
    /// Exit code of the runner (`None` if killed by a signal).
    pub exit_code: Option<i32>,
    /// Discovered test cases, in runner order.
    pub cases: Vec<TestCase>,
    /// Aggregate verdict.
    pub passed: bool,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    /// Captured stdout (possibly truncated).
    pub stdout: String,
    /// Captured stderr (possibly truncated).
    pub stderr: String,
}

impl GradingOutcome {
    /// Compute the aggregate verdict.
    ///
    /// A run passes when the runner exited 0, no case failed or errored and,
    /// if `require_tests` is set, at least one case actually ran.
    #[must_use]
    pub fn aggregate(exit_code: Option<i32>, cases: &[TestCase], require_tests: bool) -> bool {
        let counts = TestCounts::of(cases);
        exit_code == Some(0)
            && counts.failed == 0
            && counts.errored == 0
            && (!require_tests || counts.executed() > 0)
    }

    /// Per-status counts.
    #[must_use]
    pub fn counts(&self) -> TestCounts {
        TestCounts::of(&self.cases)
    }

    /// Failed and errored cases.
    pub fn failures(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter().filter(|c| c.status.is_failure())
    }

    /// One-paragraph diagnostic: verdict, counts, failing cases and the
    /// tail of the logs.
    #[must_use]
    pub fn diagnostics(&self) -> String {
        let mut out = format!(
            "{} via `{}`: exit {}, {}",
            if self.passed { "PASS" } else { "FAIL" },
            self.command,
            self.exit_code
                .map_or_else(|| "signal".to_owned(), |c| c.to_string()),
            self.counts()
        );
        for case in self.failures() {
            out.push_str(&format!("\n  {} {}", case.status, case.name));
            if let Some(detail) = &case.detail {
                out.push_str(&format!(": {detail}"));
            }
        }
        for (name, log) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            let tail = tail_lines(log, 20);
            if !tail.is_empty() {
                out.push_str(&format!("\n--- {name} (tail) ---\n{tail}"));
            }
        }
        out
    }
}

fn tail_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.trim_end().lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

// ---------------------------------------------------------------------------
// Reward
// ---------------------------------------------------------------------------

/// Validation modes used when a fixture is graded directly, without an agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidateMode {
    /// Buggy tree plus hidden tests; the tests are expected to fail.
    BaselineFail,
    /// Reference-fix tree plus hidden tests; the tests are expected to pass.
    GoldenPass,
}

impl ValidateMode {
    /// Aggregate verdict this mode expects from the grader.
    #[must_use]
    pub const fn expected_pass(self) -> bool {
        matches!(self, Self::GoldenPass)
    }
}

impl fmt::Display for ValidateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BaselineFail => write!(f, "baseline_fail"),
            Self::GoldenPass => write!(f, "golden_pass"),
        }
    }
}

/// Binary reward. Serializes as `0.0` / `1.0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reward {
    /// 0.0
    Zero,
    /// 1.0
    One,
}

impl Reward {
    /// Reward derived from an outcome's aggregate boolean.
    #[must_use]
    pub const fn from_outcome(outcome: &GradingOutcome) -> Self {
        Self::from_passed(outcome.passed)
    }

    /// 1.0 for a pass, 0.0 otherwise.
    #[must_use]
    pub const fn from_passed(passed: bool) -> Self {
        if passed { Self::One } else { Self::Zero }
    }

    /// Reward as seen by a validation mode: inverted for `baseline_fail`,
    /// where a failing grade is the desired result.
    #[must_use]
    pub const fn for_mode(self, mode: Option<ValidateMode>) -> Self {
        match (mode, self) {
            (Some(ValidateMode::BaselineFail), Self::Zero) => Self::One,
            (Some(ValidateMode::BaselineFail), Self::One) => Self::Zero,
            (_, r) => r,
        }
    }

    /// Numeric value.
    #[must_use]
    pub const fn as_f64(self) -> f64 {
        match self {
            Self::Zero => 0.0,
            Self::One => 1.0,
        }
    }
}

impl fmt::Display for Reward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.as_f64())
    }
}

impl Serialize for Reward {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(self.as_f64())
    }
}

// ---------------------------------------------------------------------------
// Weighted grades
// ---------------------------------------------------------------------------

/// Subgrade name the runner gives its single hidden-test verdict.
pub const HIDDEN_TESTS_SUBGRADE: &str = "hidden_tests";

/// Slack allowed when checking that weights sum to one.
const WEIGHT_TOLERANCE: f64 = 1e-6;

/// One named, weighted score in `[0, 1]`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubGrade {
    /// Identifier-style name (`[A-Za-z_][A-Za-z0-9_]*`).
    pub name: String,
    /// Score in `[0, 1]`.
    pub score: f64,
    /// Share of the final grade.
    pub weight: f64,
    /// Free-form detail carried into the record.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl SubGrade {
    /// Build a subgrade, checking the name, the score range and the weight.
    ///
    /// # Errors
    /// Returns [`GradeError`] when any of the three is out of bounds.
    pub fn new(name: &str, score: f64, weight: f64) -> Result<Self, GradeError> {
        validate_subgrade_name(name)?;
        if !(0.0..=1.0).contains(&score) {
            return Err(GradeError::ScoreOutOfRange {
                name: name.to_owned(),
                score,
            });
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(GradeError::InvalidWeight {
                name: name.to_owned(),
                weight,
            });
        }
        Ok(Self {
            name: name.to_owned(),
            score,
            weight,
            metadata: Map::new(),
        })
    }

    /// A 0/1 subgrade from a binary reward.
    ///
    /// # Errors
    /// See [`SubGrade::new`].
    pub fn from_reward(name: &str, reward: Reward, weight: f64) -> Result<Self, GradeError> {
        Self::new(name, reward.as_f64(), weight)
    }

    /// Attach one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    /// `{name}_any`: passes when any part passes (best score wins).
    ///
    /// # Errors
    /// [`GradeError::Empty`] when `parts` is empty.
    pub fn any(name: &str, weight: f64, parts: &[Self]) -> Result<Self, GradeError> {
        Self::combine(name, "any", weight, parts, f64::max)
    }

    /// `{name}_all`: passes only when every part passes (worst score wins).
    ///
    /// # Errors
    /// [`GradeError::Empty`] when `parts` is empty.
    pub fn all(name: &str, weight: f64, parts: &[Self]) -> Result<Self, GradeError> {
        Self::combine(name, "all", weight, parts, f64::min)
    }

    fn combine(
        name: &str,
        suffix: &str,
        weight: f64,
        parts: &[Self],
        pick: fn(f64, f64) -> f64,
    ) -> Result<Self, GradeError> {
        let Some((first, rest)) = parts.split_first() else {
            return Err(GradeError::Empty);
        };
        let score = rest.iter().fold(first.score, |acc, sg| pick(acc, sg.score));
        let names: Vec<Value> = parts.iter().map(|sg| Value::from(sg.name.as_str())).collect();
        let nested: Map<String, Value> = parts
            .iter()
            .filter(|sg| !sg.metadata.is_empty())
            .map(|sg| (sg.name.clone(), Value::Object(sg.metadata.clone())))
            .collect();
        Ok(Self::new(&format!("{name}_{suffix}"), score, weight)?
            .with_metadata("subgrades", names)
            .with_metadata("subgrade_metadata", nested))
    }
}

fn validate_subgrade_name(name: &str) -> Result<(), GradeError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(GradeError::InvalidName {
            name: name.to_owned(),
        })
    }
}

/// Weighted combination of subgrades. The score is fixed at construction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Grade {
    score: f64,
    subgrades: Vec<SubGrade>,
}

impl Grade {
    /// Combine subgrades into one grade.
    ///
    /// Repeated names become `name-1`, `name-2`, ... in order; unique names
    /// are kept as they are. Weights must sum to one.
    ///
    /// # Errors
    /// [`GradeError::Empty`] for no subgrades,
    /// [`GradeError::WeightsDoNotSumToOne`] for a bad weighting and
    /// [`GradeError::DuplicateName`] when a suffixed name collides with
    /// another subgrade.
    pub fn from_subgrades(subgrades: Vec<SubGrade>) -> Result<Self, GradeError> {
        if subgrades.is_empty() {
            return Err(GradeError::Empty);
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for sg in &subgrades {
            *counts.entry(sg.name.clone()).or_default() += 1;
        }
        let mut used: HashMap<String, usize> = HashMap::new();
        let subgrades: Vec<SubGrade> = subgrades
            .into_iter()
            .map(|mut sg| {
                if counts.get(&sg.name).copied().unwrap_or(0) > 1 {
                    let n = used.entry(sg.name.clone()).or_default();
                    *n += 1;
                    sg.name = format!("{}-{n}", sg.name);
                }
                sg
            })
            .collect();

        let mut seen = HashSet::new();
        if let Some(dup) = subgrades.iter().find(|sg| !seen.insert(sg.name.as_str())) {
            return Err(GradeError::DuplicateName {
                name: dup.name.clone(),
            });
        }

        let total: f64 = subgrades.iter().map(|sg| sg.weight).sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(GradeError::WeightsDoNotSumToOne { total });
        }

        let score = subgrades
            .iter()
            .map(|sg| sg.score * sg.weight)
            .sum::<f64>()
            .clamp(0.0, 1.0);
        Ok(Self { score, subgrades })
    }

    /// The grade of a single pass/fail grading run.
    #[must_use]
    pub fn pass_fail(outcome: &GradingOutcome) -> Self {
        let reward = Reward::from_outcome(outcome);
        let sg = SubGrade {
            name: HIDDEN_TESTS_SUBGRADE.to_owned(),
            score: reward.as_f64(),
            weight: 1.0,
            metadata: Map::new(),
        }
        .with_metadata("variant", outcome.variant.to_string())
        .with_metadata("exit_code", serde_json::json!(outcome.exit_code));
        Self {
            score: sg.score,
            subgrades: vec![sg],
        }
    }

    /// Weighted score in `[0, 1]`.
    #[must_use]
    pub const fn score(&self) -> f64 {
        self.score
    }

    /// Subgrades with their final names.
    #[must_use]
    pub fn subgrades(&self) -> &[SubGrade] {
        &self.subgrades
    }
}

/// Why a subgrade or grade could not be built.
#[derive(Clone, Debug, PartialEq)]
pub enum GradeError {
    /// Name is not identifier-like.
    InvalidName {
        /// The rejected name.
        name: String,
    },
    /// Score outside `[0, 1]` (or NaN).
    ScoreOutOfRange {
        /// Subgrade name.
        name: String,
        /// The rejected score.
        score: f64,
    },
    /// Negative or non-finite weight.
    InvalidWeight {
        /// Subgrade name.
        name: String,
        /// The rejected weight.
        weight: f64,
    },
    /// Weights did not add up to one.
    WeightsDoNotSumToOne {
        /// Their actual sum.
        total: f64,
    },
    /// Two subgrades ended up with the same name.
    DuplicateName {
        /// The clashing name.
        name: String,
    },
    /// Nothing to combine.
    Empty,
}

impl fmt::Display for GradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName { name } => write!(
                f,
                "invalid subgrade name {name:?}: use letters, digits and underscores, not starting with a digit"
            ),
            Self::ScoreOutOfRange { name, score } => {
                write!(f, "subgrade {name} has score {score}, expected a value in [0, 1]")
            }
            Self::InvalidWeight { name, weight } => {
                write!(f, "subgrade {name} has weight {weight}, expected a finite value >= 0")
            }
            Self::WeightsDoNotSumToOne { total } => {
                write!(f, "subgrade weights sum to {total}, expected 1")
            }
            Self::DuplicateName { name } => write!(f, "more than one subgrade is named {name}"),
            Self::Empty => write!(f, "a grade needs at least one subgrade"),
        }
    }
}

impl std::error::Error for GradeError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
