//! Dual validation over a fixture catalog with both domains.

mod common;

use common::{Harness, fixture_repo};
use patchgate::error::ErrorKind;
use patchgate::model::outcome::{Reward, TestStatus};
use patchgate::validation::{CheckStatus, ValidationPipeline};

#[test]
fn both_domains_are_well_formed() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let tasks = h.catalog.select(&[]).unwrap();

    let report = ValidationPipeline::new(&h.fixtures, &h.config.graders, 2).run(&tasks);

    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.well_formed, 2, "{report}");
    assert!(report.all_well_formed());

    let web = report.get("fix-profile-404").unwrap();
    assert!(web.baseline_fail_ok);
    assert!(web.golden_pass_ok);
    assert_eq!(web.baseline_fail.reward, Some(Reward::One));
    let baseline = web.baseline_fail.outcome.as_ref().unwrap();
    assert!(!baseline.passed);
    let failing: Vec<_> = baseline.failures().collect();
    assert_eq!(failing.len(), 1);
    assert_eq!(
        failing[0].name,
        "tests.test_profile.ProfileViewTests.test_unknown_profile_returns_404"
    );
    assert_eq!(failing[0].detail.as_deref(), Some("AssertionError: 500 != 404"));

    let erc20 = report.get("fix-erc20-mint-access").unwrap();
    assert!(erc20.baseline_fail_ok && erc20.golden_pass_ok);
    let golden = erc20.golden_pass.outcome.as_ref().unwrap();
    assert!(golden.passed);
    assert_eq!(golden.cases.len(), 2);
    assert!(golden.cases.iter().all(|c| c.status == TestStatus::Passed));
    assert_eq!(erc20.golden_pass.reward, Some(Reward::One));
}

#[test]
fn golden_identical_to_baseline_is_malformed() {
    let repo = fixture_repo();
    let h = Harness::new(
        repo.path(),
        r#"
[[task]]
id = "no-real-fix"
domain = "web-app"
repo = 'REPO'
ref_stem = "fix_profile_404"
golden = "fix_profile_404_baseline"
test_files = ["tests/test_profile.py"]
test_command = "sh manage.sh test {test_labels}"
"#
        .replace("REPO", &repo.path().display().to_string())
        .as_str(),
    );
    let tasks = h.catalog.select(&["no-real-fix".to_owned()]).unwrap();
    let report = ValidationPipeline::new(&h.fixtures, &h.config.graders, 1).run(&tasks);

    let t = &report.tasks[0];
    assert!(t.baseline_fail_ok);
    assert!(!t.golden_pass_ok);
    match &t.golden_pass.status {
        CheckStatus::Violated { reason } => assert!(reason.contains("fail on the reference-fix ref"), "{reason}"),
        other => panic!("expected violation, got {other:?}"),
    }
    assert_eq!(report.summary.malformed.len(), 1);
    assert!(report.to_string().contains("AssertionError: 500 != 404"));
}

#[test]
fn clashing_hidden_tests_are_a_violation_not_an_error() {
    let repo = fixture_repo();
    let h = Harness::new(
        repo.path(),
        r#"
[[task]]
id = "clashing"
domain = "web-app"
repo = 'REPO'
ref_stem = "fix_profile_404"
test = "clashing_test"
test_files = ["tests/test_profile.py"]
test_command = "sh manage.sh test {test_labels}"
"#
        .replace("REPO", &repo.path().display().to_string())
        .as_str(),
    );
    let tasks = h.catalog.select(&["clashing".to_owned()]).unwrap();
    let report = ValidationPipeline::new(&h.fixtures, &h.config.graders, 1).run(&tasks);

    let t = &report.tasks[0];
    assert!(t.baseline_fail_ok, "{report}");
    match &t.golden_pass.status {
        CheckStatus::Violated { reason } => assert!(reason.contains("does not apply"), "{reason}"),
        other => panic!("expected violation, got {other:?}"),
    }
    assert_eq!(report.summary.errored, 0);
}

#[test]
fn unreachable_repository_is_recorded_per_task() {
    let repo = fixture_repo();
    let missing = repo.path().join("does-not-exist");
    let h = Harness::new(
        repo.path(),
        &format!(
            "[[task]]\nid = \"gone\"\ndomain = \"web-app\"\nrepo = '{}'\n",
            missing.display()
        ),
    );
    let tasks = h.catalog.select(&[]).unwrap();
    let report = ValidationPipeline::new(&h.fixtures, &h.config.graders, 3).run(&tasks);

    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.well_formed, 2);
    assert_eq!(report.summary.errored, 1);
    let gone = report.get("gone").unwrap();
    assert!(matches!(
        gone.baseline_fail.status,
        CheckStatus::Errored {
            kind: ErrorKind::FixtureUnavailable,
            ..
        }
    ));
    // Report order follows the catalog.
    let ids: Vec<&str> = report.tasks.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, ["fix-profile-404", "fix-erc20-mint-access", "gone"]);
}

#[test]
fn validation_leaves_no_trees_behind() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let tasks = h.catalog.select(&[]).unwrap();
    let _ = ValidationPipeline::new(&h.fixtures, &h.config.graders, 2).run(&tasks);
    assert!(h.live_trees().is_empty(), "{:?}", h.live_trees());
}
