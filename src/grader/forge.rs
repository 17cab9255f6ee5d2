//! Foundry (`forge test`) adapter.
//!
//! Forge prints one bracketed result per test under a per-contract header:
//!
//! ```text
//! Ran 2 tests for test/Token.t.sol:TokenTest
//! [PASS] test_OwnerCanMint() (gas: 54321)
//! [FAIL: revert: caller is not the owner] test_NonOwnerCannotMint() (gas: 12000)
//! ```
//!
//! Older releases write `[FAIL. Reason: ...]`; both forms are accepted.

use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;

use super::{Grader, Invocation};
use crate::config::GraderSettings;
use crate::fixture::WorkingTree;
use crate::model::outcome::{TestCase, TestStatus};
use crate::model::types::{GraderVariant, TaskDescriptor};

static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));

static SUITE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Ran \d+ tests? for (?:.+):([A-Za-z_]\w*)\s*$").expect("valid regex")
});

static RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[(PASS|FAIL|SKIP)(.*?)\]\s+([A-Za-z_]\w*\([^)]*\))").expect("valid regex")
});

static SUITE_RESULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Suite result: (ok|FAILED)\. (\d+) passed; (\d+) failed; (\d+) skipped")
        .expect("valid regex")
});

/// Grader for Foundry projects.
#[derive(Clone, Debug)]
pub struct ForgeGrader {
    invocation: Invocation,
}

impl ForgeGrader {
    /// Build for `task`.
    #[must_use]
    pub fn new(task: &TaskDescriptor, settings: GraderSettings) -> Self {
        Self {
            invocation: Invocation::for_task(task, settings),
        }
    }
}

impl Grader for ForgeGrader {
    fn variant(&self) -> GraderVariant {
        GraderVariant::Forge
    }

    fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    fn configure(&self, cmd: &mut Command, _tree: &WorkingTree) {
        cmd.env("NO_COLOR", "1")
            .env("FOUNDRY_DISABLE_NIGHTLY_WARNING", "1");
    }

    fn parse(&self, stdout: &str, stderr: &str) -> Vec<TestCase> {
        parse_output(&format!("{stdout}\n{stderr}"))
    }
}

/// Extract test cases from `forge test` output.
#[must_use]
pub fn parse_output(output: &str) -> Vec<TestCase> {
    let clean = ANSI.replace_all(output, "");
    let mut cases: Vec<TestCase> = Vec::new();
    let mut contract: Option<String> = None;
    let mut summary: Option<(bool, u64, u64)> = None;
    let mut lines = clean.lines();

    while let Some(line) = lines.next() {
        let line = line.trim_end();

        // The trailing recap repeats every failure.
        if line.starts_with("Failing tests:") {
            break;
        }

        if line.contains("Compiler run failed") {
            let detail = lines
                .by_ref()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_owned);
            cases.push(TestCase {
                name: "forge::compile".to_owned(),
                status: TestStatus::Errored,
                detail,
            });
            break;
        }

        if let Some(caps) = SUITE.captures(line) {
            contract = Some(caps[1].to_owned());
            continue;
        }

        if let Some(caps) = RESULT.captures(line) {
            let status = match &caps[1] {
                "PASS" => TestStatus::Passed,
                "FAIL" => TestStatus::Failed,
                _ => TestStatus::Skipped,
            };
            let name = match &contract {
                Some(c) => format!("{c}::{}", &caps[3]),
                None => caps[3].to_owned(),
            };
            if cases.iter().any(|c| c.name == name) {
                continue;
            }
            cases.push(TestCase {
                name,
                status,
                detail: reason(&caps[2]),
            });
            continue;
        }

        if let Some(caps) = SUITE_RESULT.captures(line) {
            let (ok, passed, failed) = summary.unwrap_or((true, 0, 0));
            summary = Some((
                ok && &caps[1] == "ok",
                passed + caps[2].parse::<u64>().unwrap_or(0),
                failed + caps[3].parse::<u64>().unwrap_or(0),
            ));
        }
    }

    // Results were filtered out (e.g. `--silent`): fall back to the summary.
    if cases.is_empty()
        && let Some((ok, passed, failed)) = summary
        && passed + failed > 0
    {
        let status = if ok && failed == 0 {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };
        cases.push(TestCase {
            name: "forge::suite".to_owned(),
            status,
            detail: Some(format!("{passed} passed; {failed} failed")),
        });
    }
    cases
}

/// `. Reason: x` or `: x` → `x`.
fn reason(raw: &str) -> Option<String> {
    let r = raw
        .strip_prefix(". Reason: ")
        .or_else(|| raw.strip_prefix(": "))
        .unwrap_or(raw)
        .trim();
    (!r.is_empty()).then(|| r.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIXED: &str = "\
[\u{280a}] Compiling...
[\u{2812}] Compiling 25 files with Solc 0.8.20
Compiler run successful!

Ran 3 tests for test/Token.t.sol:TokenTest
[PASS] test_OwnerCanMint() (gas: 54321)
[FAIL: revert: caller is not the owner] test_NonOwnerCannotMint() (gas: 12000)
\x1b[32m[PASS]\x1b[0m testFuzz_Transfer(uint256) (runs: 256, \u{3bc}: 3456, ~: 3456)
Traces:
  [12000] TokenTest::test_NonOwnerCannotMint()
    \u{2514}\u{2500} \u{2190} [Revert] caller is not the owner

Suite result: FAILED. 2 passed; 1 failed; 0 skipped; finished in 2.31ms

Ran 1 test for test/Vault.t.sol:VaultTest
[FAIL. Reason: Ownable: caller is not the owner] test_Withdraw() (gas: 8000)
Suite result: FAILED. 0 passed; 1 failed; 0 skipped; finished in 1.00ms

Ran 2 test suites in 4ms: 2 tests passed, 2 failed, 0 skipped (4 total tests)

Failing tests:
Encountered 1 failing test in test/Token.t.sol:TokenTest
[FAIL: revert: caller is not the owner] test_NonOwnerCannotMint() (gas: 12000)
";

    #[test]
    fn parses_results_per_contract() {
        let cases = parse_output(MIXED);
        let names: Vec<&str> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "TokenTest::test_OwnerCanMint()",
                "TokenTest::test_NonOwnerCannotMint()",
                "TokenTest::testFuzz_Transfer(uint256)",
                "VaultTest::test_Withdraw()",
            ]
        );
        assert_eq!(cases[0].status, TestStatus::Passed);
        assert_eq!(cases[1].status, TestStatus::Failed);
        assert_eq!(cases[1].detail.as_deref(), Some("revert: caller is not the owner"));
        assert_eq!(cases[2].status, TestStatus::Passed);
        assert_eq!(cases[3].detail.as_deref(), Some("Ownable: caller is not the owner"));
    }

    #[test]
    fn compile_failure_is_an_errored_case() {
        let out = "\
Compiling 3 files with Solc 0.8.20
Error: Compiler run failed:
Error (7576): Undeclared identifier.
  --> src/Token.sol:12:9:
";
        let cases = parse_output(out);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].name, "forge::compile");
        assert_eq!(cases[0].status, TestStatus::Errored);
        assert_eq!(cases[0].detail.as_deref(), Some("Error (7576): Undeclared identifier."));
    }

    #[test]
    fn summary_only_output_synthesizes_a_suite_case() {
        let out = "Suite result: ok. 4 passed; 0 failed; 0 skipped; finished in 1ms\n";
        let cases = parse_output(out);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].status, TestStatus::Passed);
    }

    #[test]
    fn no_tests_found_yields_no_cases() {
        assert!(parse_output("No tests found in project! Forge looks for functions that starts with `test`.\n").is_empty());
    }

    #[test]
    fn skipped_results_are_skipped() {
        let cases = parse_output("Ran 1 test for t.sol:T\n[SKIP] test_later() (gas: 0)\n");
        assert_eq!(cases[0].status, TestStatus::Skipped);
        assert_eq!(cases[0].detail, None);
    }

    proptest! {
        #[test]
        fn never_panics_on_arbitrary_output(s in "\\PC*") {
            let _ = parse_output(&s);
        }

        #[test]
        fn never_panics_on_bracket_soup(s in "[\\[\\]()A-Za-z:. \n]{0,200}") {
            let _ = parse_output(&s);
        }
    }
}
