//! End-to-end evaluations through the runner state machine.

mod common;

use std::time::{Duration, Instant};

use common::{Harness, fixture_repo};
use patchgate::agent::{CommandAgent, NoopAgent, ReplayAgent};
use patchgate::config::ConflictPolicy;
use patchgate::model::outcome::{HIDDEN_TESTS_SUBGRADE, Reward};
use patchgate::model::patch::PatchArtifact;
use patchgate::model::types::RefKind;
use patchgate::patch_engine;
use patchgate::runner::{EvalRecord, EvalState, EvaluationRunner, FailureKind};

fn runner(h: &Harness, timeout: Duration, policy: ConflictPolicy) -> EvaluationRunner<'_> {
    EvaluationRunner::new(&h.fixtures, &h.config.graders, timeout, policy)
}

fn state_names(record: &EvalRecord) -> Vec<String> {
    record.states.iter().map(ToString::to_string).collect()
}

#[test]
fn golden_agent_scores_one_on_both_domains() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let r = runner(&h, Duration::from_secs(60), ConflictPolicy::ScoreZero);

    for id in ["fix-profile-404", "fix-erc20-mint-access"] {
        let task = h.task(id);
        let golden =
            patch_engine::diff_refs(&h.fixtures, task, RefKind::Buggy, RefKind::ReferenceFix).unwrap();
        let record = r.evaluate(task, &ReplayAgent::new("golden", golden));

        assert_eq!(
            state_names(&record),
            [
                "initialized",
                "fixture_prepared",
                "agent_active",
                "patch_collected",
                "hidden_test_applied",
                "graded",
                "scored"
            ],
            "{record}"
        );
        assert_eq!(record.reward, Some(Reward::One), "{record}");
        assert!(record.failure.is_none());
        assert!(record.outcome.as_ref().unwrap().passed);
        let grade = record.grade.as_ref().unwrap();
        assert!((grade.score() - 1.0).abs() < f64::EPSILON);
        assert_eq!(grade.subgrades()[0].name, HIDDEN_TESTS_SUBGRADE);
    }
    assert!(h.live_trees().is_empty());
}

#[test]
fn noop_agent_reproduces_baseline_failure() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let r = runner(&h, Duration::from_secs(60), ConflictPolicy::ScoreZero);

    for id in ["fix-profile-404", "fix-erc20-mint-access"] {
        let record = r.evaluate(h.task(id), &NoopAgent);
        assert!(record.scored(), "{record}");
        assert_eq!(record.reward, Some(Reward::Zero));
        assert!(record.grade.as_ref().unwrap().score().abs() < f64::EPSILON);
        assert!(record.agent_patch.as_ref().unwrap().is_empty());
        assert!(!record.outcome.as_ref().unwrap().passed);
    }
}

#[test]
fn command_agent_fix_is_collected_without_hidden_tests() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let r = runner(&h, Duration::from_secs(60), ConflictPolicy::ScoreZero);
    let agent = CommandAgent::new(
        "test \"$PATCHGATE_TASK_ID\" = fix-profile-404 && \
         sed 's/unknown_profile_status=500/unknown_profile_status=404/' profiles/views.txt > v.tmp && \
         mv v.tmp profiles/views.txt",
    );

    let record = r.evaluate(h.task("fix-profile-404"), &agent);

    assert_eq!(record.reward, Some(Reward::One), "{record}");
    let patch = record.agent_patch.as_ref().unwrap();
    assert!(patch.touches("profiles/views.txt"));
    assert!(!patch.touches("tests/test_profile.py"));
    assert!(!patch.touches(".env"));
    assert_eq!(patch.files().len(), 1);
}

#[test]
fn agent_cannot_break_patch_collection_from_inside_the_tree() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let r = runner(&h, Duration::from_secs(60), ConflictPolicy::ScoreZero);
    let agent = CommandAgent::new(
        "rm -rf .git && mkdir .git && echo junk > .git/HEAD && \
         sed 's/unknown_profile_status=500/unknown_profile_status=404/' profiles/views.txt > v.tmp && \
         mv v.tmp profiles/views.txt",
    );

    let record = r.evaluate(h.task("fix-profile-404"), &agent);

    assert!(record.failure.is_none(), "{record}");
    assert_eq!(record.reward, Some(Reward::One), "{record}");
    let patch = record.agent_patch.as_ref().unwrap();
    assert_eq!(patch.files().len(), 1, "{patch}");
    assert!(patch.touches("profiles/views.txt"));
}

#[test]
fn partial_fix_scores_zero() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let r = runner(&h, Duration::from_secs(60), ConflictPolicy::ScoreZero);
    // Touches the contract but leaves minting unguarded.
    let agent = CommandAgent::new("echo 'decimals=18' >> src/Token.txt");

    let record = r.evaluate(h.task("fix-erc20-mint-access"), &agent);
    assert!(record.scored());
    assert_eq!(record.reward, Some(Reward::Zero));
    let failing: Vec<_> = record.outcome.as_ref().unwrap().failures().collect();
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].name, "TokenTest::test_RevertWhen_NonOwnerMints()");
    assert_eq!(
        failing[0].detail.as_deref(),
        Some("next call did not revert as expected")
    );
}

#[test]
#[cfg(target_os = "linux")]
fn agent_timeout_tears_everything_down() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let r = runner(&h, Duration::from_secs(1), ConflictPolicy::ScoreZero);
    let pidfile = h.dir.path().join("agent.pid");
    let agent = CommandAgent::new(format!(
        "sleep 60 & echo $! > '{}'; wait",
        pidfile.display()
    ));

    let start = Instant::now();
    let record = r.evaluate(h.task("fix-profile-404"), &agent);
    assert!(start.elapsed() < Duration::from_secs(30));

    assert_eq!(record.failure, Some(FailureKind::Timeout), "{record}");
    assert_eq!(record.reward, None);
    assert!(matches!(record.terminal(), EvalState::Failed(_)));
    assert!(record.agent_patch.is_none());

    let pid = std::fs::read_to_string(&pidfile).unwrap();
    let pid = pid.trim();
    let deadline = Instant::now() + Duration::from_secs(2);
    while common::is_running(pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!common::is_running(pid), "agent child {pid} survived");
    assert!(common::processes_under(&h.scratch()).is_empty());
    assert!(h.live_trees().is_empty(), "{:?}", h.live_trees());
}

#[test]
fn in_process_agent_returning_late_is_a_timeout() {
    struct Slow;
    impl patchgate::agent::Agent for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn run(
            &self,
            _session: &patchgate::agent::AgentSession<'_>,
        ) -> Result<patchgate::agent::AgentExit, patchgate::agent::AgentError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(patchgate::agent::AgentExit::Completed)
        }
    }

    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let r = runner(&h, Duration::from_millis(50), ConflictPolicy::ScoreZero);
    let record = r.evaluate(h.task("fix-profile-404"), &Slow);
    assert_eq!(record.failure, Some(FailureKind::Timeout));
    assert_eq!(record.reward, None);
}

#[test]
fn hidden_test_conflict_follows_policy() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    // The agent writes its own file where the hidden tests go.
    let agent = CommandAgent::new("mkdir -p tests && echo 'exit 0' > tests/test_profile.py");

    let scored = runner(&h, Duration::from_secs(60), ConflictPolicy::ScoreZero)
        .evaluate(h.task("fix-profile-404"), &agent);
    assert_eq!(scored.failure, Some(FailureKind::PatchConflict), "{scored}");
    assert_eq!(scored.reward, Some(Reward::Zero));
    // No grading run, so no breakdown.
    assert!(scored.grade.is_none());
    assert!(scored.agent_patch.as_ref().unwrap().touches("tests/test_profile.py"));
    assert_eq!(
        state_names(&scored).last().map(String::as_str),
        Some("failed(patch-conflict)")
    );

    let infra = runner(&h, Duration::from_secs(60), ConflictPolicy::Infrastructure)
        .evaluate(h.task("fix-profile-404"), &agent);
    assert_eq!(infra.failure, Some(FailureKind::PatchConflict));
    assert_eq!(infra.reward, None);
}

#[test]
fn unusable_agent_patch_is_an_agent_error() {
    let repo = fixture_repo();
    let h = Harness::new(repo.path(), "");
    let bogus = PatchArtifact::new(
        "bogus",
        b"diff --git a/nope.txt b/nope.txt\n--- a/nope.txt\n+++ b/nope.txt\n@@ -1 +1 @@\n-a\n+b\n".to_vec(),
    );
    let record = runner(&h, Duration::from_secs(60), ConflictPolicy::ScoreZero)
        .evaluate(h.task("fix-profile-404"), &ReplayAgent::new("bogus", bogus));
    assert_eq!(record.failure, Some(FailureKind::AgentError), "{record}");
    assert_eq!(record.reward, None);
}

#[test]
fn missing_runner_is_a_grader_execution_failure() {
    let repo = fixture_repo();
    let h = Harness::new(
        repo.path(),
        &format!(
            "[[task]]\nid = \"no-runner\"\ndomain = \"web-app\"\nrepo = '{}'\nref_stem = \"fix_profile_404\"\ntest_command = \"patchgate-no-such-runner\"\n",
            repo.path().display()
        ),
    );
    let record = runner(&h, Duration::from_secs(60), ConflictPolicy::ScoreZero)
        .evaluate(h.task("no-runner"), &NoopAgent);
    assert_eq!(record.failure, Some(FailureKind::GraderExecution), "{record}");
    assert_eq!(record.reward, None);
}

#[test]
fn missing_ref_is_fixture_unavailable() {
    let repo = fixture_repo();
    let h = Harness::new(
        repo.path(),
        &format!(
            "[[task]]\nid = \"no-refs\"\ndomain = \"web-app\"\nrepo = '{}'\n",
            repo.path().display()
        ),
    );
    let record = runner(&h, Duration::from_secs(60), ConflictPolicy::ScoreZero)
        .evaluate(h.task("no-refs"), &NoopAgent);
    assert_eq!(record.failure, Some(FailureKind::FixtureUnavailable));
    assert_eq!(state_names(&record), ["initialized", "failed(fixture-unavailable)"]);
}
