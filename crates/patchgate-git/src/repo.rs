//! The [`GitRepo`] trait: the single abstraction boundary between patchgate and git.
//!
//! Two kinds of repository go through this trait:
//!
//! | Repository   | Operations used                                                        |
//! |--------------|------------------------------------------------------------------------|
//! | Mirror cache | `fetch`, `rev_parse_opt`, `diff_commits`, `archive_into`, `submodules` |
//! | Working tree | `snapshot`, `diff_worktree`, `apply_patch`                             |

use std::path::Path;

use crate::error::GitError;
use crate::types::{GitOid, Identity, Submodule};

/// The git abstraction trait used by the harness.
///
/// # Object safety
///
/// This trait is object-safe: callers may hold `&dyn GitRepo` or
/// `Box<dyn GitRepo>` (test doubles included).
pub trait GitRepo {
    /// Directory git runs in (the bare mirror, or the working tree root).
    fn path(&self) -> &Path;

    // -----------------------------------------------------------------------
    // Refs
    // -----------------------------------------------------------------------

    /// Resolve a revision spec to a commit OID, returning `None` if it does
    /// not name a commit.
    ///
    /// Replaces: `git rev-parse --verify --quiet <spec>^{commit}`.
    fn rev_parse_opt(&self, spec: &str) -> Result<Option<GitOid>, GitError>;

    /// Like [`rev_parse_opt`](Self::rev_parse_opt) but a missing commit is
    /// [`GitError::NotFound`].
    fn rev_parse(&self, spec: &str) -> Result<GitOid, GitError> {
        self.rev_parse_opt(spec)?.ok_or_else(|| GitError::NotFound {
            message: format!("revision `{spec}` does not name a commit"),
        })
    }

    // -----------------------------------------------------------------------
    // Remote sync
    // -----------------------------------------------------------------------

    /// Update every ref from the repository's `origin` remote, pruning refs
    /// that disappeared upstream.
    ///
    /// Replaces: `git fetch --prune origin`.
    fn fetch(&self) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Diff / apply
    // -----------------------------------------------------------------------

    /// Portable binary-safe diff between two commits.
    ///
    /// Output is byte-for-byte stable for the same pair of commits: user
    /// diff configuration (external drivers, textconv, prefixes, rename
    /// detection) is disabled on the command line.
    ///
    /// Replaces: `git diff --binary --full-index <from> <to>`.
    fn diff_commits(&self, from: GitOid, to: GitOid) -> Result<Vec<u8>, GitError>;

    /// Diff of the working tree (tracked and untracked files) against `base`.
    ///
    /// Stages everything first so new files are included; the index of the
    /// working tree is updated as a side effect.
    ///
    /// Replaces: `git add -A && git diff --cached --binary <base>`.
    fn diff_worktree(&self, base: GitOid) -> Result<Vec<u8>, GitError>;

    /// Apply a patch to the working tree.
    ///
    /// `git apply` is all-or-nothing: when any hunk is rejected nothing is
    /// written and [`GitError::ApplyRejected`] is returned. With
    /// `check_only` the tree is never touched.
    ///
    /// Replaces: `git apply [--check] -`.
    fn apply_patch(&self, patch: &[u8], check_only: bool) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Materialization
    // -----------------------------------------------------------------------

    /// Extract the tree of commit `oid` into `dest` (created if needed).
    ///
    /// Reads objects only; safe to run concurrently with other reads.
    ///
    /// Replaces: `git archive <oid> | tar -x -C <dest>`.
    fn archive_into(&self, oid: GitOid, dest: &Path) -> Result<(), GitError>;

    /// Gitlinks anywhere in the tree of commit `oid`, with their URLs taken
    /// from that commit's `.gitmodules`.
    ///
    /// [`archive_into`](Self::archive_into) leaves gitlinks as empty
    /// directories; callers fill them from the submodule's own repository.
    ///
    /// Replaces: `git ls-tree -r <oid>` + `git config --blob <oid>:.gitmodules`.
    fn submodules(&self, oid: GitOid) -> Result<Vec<Submodule>, GitError>;

    /// Record every file under the working tree as a single commit on a
    /// fresh history and return its OID.
    ///
    /// Replaces: `git add -A && git commit --allow-empty`.
    fn snapshot(&self, message: &str, identity: &Identity) -> Result<GitOid, GitError>;
}
