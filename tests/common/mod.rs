//! Shared test helpers for patchgate integration tests.
//!
//! All tests use temp directories: a throwaway fixture repository built with
//! the git CLI, plus a private cache and scratch root per harness. The web
//! and contract test runners are shell-script stand-ins that print Django
//! and Foundry output, so no Python or Foundry toolchain is needed.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use patchgate::catalog::TaskCatalog;
use patchgate::config::PatchgateConfig;
use patchgate::fixture::FixtureManager;
use patchgate::model::types::TaskDescriptor;
use tempfile::TempDir;

pub fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (path, contents) in files {
        let p = dir.join(path);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, contents).unwrap();
    }
}

/// Start an unrelated history named `branch` containing exactly `files`.
fn orphan(dir: &Path, branch: &str, files: &[(&str, &str)]) {
    git(dir, &["checkout", "--quiet", "--orphan", branch]);
    git(dir, &["rm", "-r", "-f", "--quiet", "--ignore-unmatch", "."]);
    write_files(dir, files);
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "--quiet", "-m", branch]);
}

/// Branch `name` off `base` with `files` written on top.
fn branch(dir: &Path, name: &str, base: &str, files: &[(&str, &str)]) {
    git(dir, &["checkout", "--quiet", "-B", name, base]);
    write_files(dir, files);
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "--quiet", "--allow-empty", "-m", name]);
}

// ---------------------------------------------------------------------------
// Web app: fix-profile-404
// ---------------------------------------------------------------------------

/// Stand-in for `python manage.py test`: each label names a test module
/// (`tests.test_profile` → `tests/test_profile.py`) run with `sh`.
const MANAGE_SH: &str = r#"status=0
for arg in "$@"; do
  case "$arg" in test|--*) continue ;; esac
  module="$(echo "$arg" | tr . /).py"
  if [ ! -f "$module" ]; then
    echo "ERROR: $arg (unittest.loader._FailedTest.$arg)" >&2
    echo "ImportError: Failed to import test module: $arg" >&2
    status=1
    continue
  fi
  sh "$module" || status=1
done
exit $status
"#;

/// Hidden test: an unknown profile id must be a 404.
const TEST_PROFILE: &str = r#"name="test_unknown_profile_returns_404 (tests.test_profile.ProfileViewTests.test_unknown_profile_returns_404)"
echo "test_known_profile (tests.test_profile.ProfileViewTests.test_known_profile) ... ok" >&2
if grep -q "unknown_profile_status=404" profiles/views.txt; then
  echo "$name ... ok" >&2
  printf '%s\n' "" "----------------------------------------------------------------------" "Ran 2 tests in 0.004s" "" "OK" >&2
  exit 0
fi
echo "$name ... FAIL" >&2
printf '%s\n' "" "======================================================================" "FAIL: $name" "----------------------------------------------------------------------" "Traceback (most recent call last):" "AssertionError: 500 != 404" "" "----------------------------------------------------------------------" "Ran 2 tests in 0.004s" "" "FAILED (failures=1)" >&2
exit 1
"#;

// ---------------------------------------------------------------------------
// Smart contract: ERC-20 mint access
// ---------------------------------------------------------------------------

/// Stand-in for `forge test`: runs every `test/*.t.sh` suite.
const FORGE_SH: &str = r#"echo "Compiling 2 files with Solc 0.8.20"
echo "Compiler run successful!"
status=0
for suite in test/*.t.sh; do
  [ -f "$suite" ] || continue
  echo
  sh "$suite" || status=1
done
exit $status
"#;

/// Hidden test: a non-owner mint must revert.
const TOKEN_TEST: &str = r#"echo "Ran 2 tests for test/Token.t.sol:TokenTest"
echo "[PASS] test_OwnerCanMint() (gas: 51234)"
if grep -q "mint_guard=onlyOwner" src/Token.txt; then
  echo "[PASS] test_RevertWhen_NonOwnerMints() (gas: 10321)"
  echo "Suite result: ok. 2 passed; 0 failed; 0 skipped; finished in 1.20ms"
  exit 0
fi
echo "[FAIL: next call did not revert as expected] test_RevertWhen_NonOwnerMints() (gas: 10321)"
echo "Suite result: FAILED. 1 passed; 1 failed; 0 skipped; finished in 1.20ms"
exit 1
"#;

/// A repository laid out like a benchmark fixture repo: the web app and the
/// contracts live on unrelated histories, each task with three refs.
pub fn fixture_repo() -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    let p = dir.path();
    git(p, &["init", "--quiet", "-b", "web_root"]);
    git(p, &["config", "user.email", "fixtures@example.com"]);
    git(p, &["config", "user.name", "fixtures"]);
    git(p, &["config", "commit.gpgsign", "false"]);

    write_files(
        p,
        &[
            ("manage.sh", MANAGE_SH),
            ("profiles/views.txt", "known_profile_status=200\nunknown_profile_status=500\n"),
        ],
    );
    git(p, &["add", "-A"]);
    git(p, &["commit", "--quiet", "-m", "web_root"]);
    branch(p, "fix_profile_404_baseline", "web_root", &[]);
    branch(
        p,
        "fix_profile_404_golden",
        "web_root",
        &[("profiles/views.txt", "known_profile_status=200\nunknown_profile_status=404\n")],
    );
    branch(
        p,
        "fix_profile_404_test",
        "web_root",
        &[("tests/test_profile.py", TEST_PROFILE)],
    );
    // Hidden tests that also rewrite the line the golden fix touches.
    branch(
        p,
        "clashing_test",
        "web_root",
        &[
            ("tests/test_profile.py", TEST_PROFILE),
            ("profiles/views.txt", "known_profile_status=200\nunknown_profile_status=410\n"),
        ],
    );

    orphan(
        p,
        "contracts_root",
        &[
            ("forge.sh", FORGE_SH),
            ("src/Token.txt", "name=Token\nmint_guard=none\n"),
        ],
    );
    branch(p, "erc20_mint_baseline", "contracts_root", &[]);
    branch(
        p,
        "erc20_mint_golden",
        "contracts_root",
        &[("src/Token.txt", "name=Token\nmint_guard=onlyOwner\n")],
    );
    branch(
        p,
        "erc20_mint_test",
        "contracts_root",
        &[("test/Token.t.sh", TOKEN_TEST)],
    );

    dir
}

/// The catalog entries for the fixture repo at `repo`.
pub fn catalog_toml(repo: &Path) -> String {
    format!(
        r#"
[[task]]
id = "fix-profile-404"
domain = "web-app"
repo = '{repo}'
test_files = ["tests/test_profile.py"]
test_command = "sh manage.sh test {{test_labels}} --verbosity=2"
checkout_dir = "webapp"
description = "Unknown profile ids must return 404"

[task.env_files.".env"]
DEBUG = "0"

[[task]]
id = "fix-erc20-mint-access"
domain = "smart-contract"
repo = '{repo}'
ref_stem = "erc20_mint"
test_command = "sh forge.sh"
"#,
        repo = repo.display()
    )
}

/// A configured harness rooted in its own temp directory.
pub struct Harness {
    pub dir: TempDir,
    pub config: PatchgateConfig,
    pub catalog: TaskCatalog,
    pub fixtures: FixtureManager,
}

impl Harness {
    /// Harness over the fixture catalog for `repo` plus `extra` TOML.
    pub fn new(repo: &Path, extra: &str) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let toml = format!(
            "[harness]\ncache_dir = '{}'\nscratch_dir = '{}'\nmax_parallel = 2\n\n[graders.django]\ntimeout_seconds = 30\n\n[graders.forge]\ntimeout_seconds = 30\n{}\n{extra}",
            dir.path().join("cache").display(),
            dir.path().join("scratch").display(),
            catalog_toml(repo),
        );
        let config = PatchgateConfig::parse(&toml).expect("valid config");
        let catalog = TaskCatalog::from_entries(config.tasks.clone()).expect("valid catalog");
        let fixtures = FixtureManager::from_config(&config.harness);
        Self {
            dir,
            config,
            catalog,
            fixtures,
        }
    }

    pub fn task(&self, id: &str) -> &TaskDescriptor {
        self.catalog.require(id).expect("task in catalog")
    }

    pub fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    /// Working-tree scope directories currently under the scratch root.
    pub fn live_trees(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.scratch())
            .map(|rd| rd.filter_map(Result::ok).map(|e| e.path()).collect())
            .unwrap_or_default()
    }
}

/// Processes whose working directory lies under `root`.
#[cfg(target_os = "linux")]
pub fn processes_under(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().chars().all(|c| c.is_ascii_digit()))
        .filter(|e| {
            std::fs::read_link(e.path().join("cwd")).is_ok_and(|cwd| cwd.starts_with(root))
        })
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

/// Whether `pid` is alive (zombies awaiting their reaper count as gone).
#[cfg(target_os = "linux")]
pub fn is_running(pid: &str) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
        stat.rsplit(')')
            .next()
            .and_then(|rest| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X')
    })
}
