//! Patch engine: compute diffs between task refs and apply them to trees.
//!
//! The round-trip law holds for any two refs `A` and `B` of a task:
//! materializing `A` and applying `diff(A, B)` yields a tree whose contents
//! equal a fresh materialization of `B` (modulo injected env files, which
//! are identical on both sides).
//!
//! Applying is all-or-nothing: `git apply` checks every hunk before touching
//! the tree, so a rejected patch leaves the tree exactly as it was.

use patchgate_git::{GitError, GitRepo as _};
use tracing::instrument;

use crate::error::HarnessError;
use crate::fixture::{FixtureManager, ResolvedRef, WorkingTree};
use crate::model::patch::PatchArtifact;
use crate::model::types::{RefKind, TaskDescriptor};

/// Diff two resolved refs of `task`.
///
/// The refs must come from [`FixtureManager::revisions`] or
/// [`FixtureManager::resolve`], which sync the mirror.
///
/// # Errors
/// [`HarnessError::FixtureUnavailable`] if the mirror cannot produce the
/// diff.
#[instrument(skip_all, fields(task = %task.id, from = %from.name, to = %to.name))]
pub fn diff(
    fixtures: &FixtureManager,
    task: &TaskDescriptor,
    from: &ResolvedRef,
    to: &ResolvedRef,
) -> Result<PatchArtifact, HarnessError> {
    let bytes = fixtures
        .mirror(task)
        .diff_commits(from.oid, to.oid)
        .map_err(|e| HarnessError::FixtureUnavailable {
            task: task.id.clone(),
            reference: format!("{}..{}", from.name, to.name),
            detail: e.to_string(),
        })?;
    let patch = PatchArtifact::new(format!("{}..{}", from.name, to.name), bytes);
    tracing::debug!(files = patch.files().len(), digest = %patch.digest(), "diff computed");
    Ok(patch)
}

/// Resolve two refs of `task` and diff them.
///
/// # Errors
/// [`HarnessError::FixtureUnavailable`] for an unreachable repository or a
/// missing ref.
pub fn diff_refs(
    fixtures: &FixtureManager,
    task: &TaskDescriptor,
    from: RefKind,
    to: RefKind,
) -> Result<PatchArtifact, HarnessError> {
    let revs = fixtures.revisions(task)?;
    diff(fixtures, task, revs.get(from), revs.get(to))
}

/// Everything changed in `tree` since it was materialized, including new
/// untracked files.
///
/// # Errors
/// Git errors while staging or diffing.
pub fn diff_tree(tree: &WorkingTree) -> Result<PatchArtifact, HarnessError> {
    let bytes = tree.repo().diff_worktree(tree.snapshot_oid())?;
    Ok(PatchArtifact::new(format!("{}@{}", tree.task(), tree.kind()), bytes))
}

/// Apply `patch` to `tree` atomically.
///
/// An empty patch is a no-op.
///
/// # Errors
/// [`HarnessError::PatchConflict`] if any hunk does not apply; the tree is
/// left unchanged.
#[instrument(skip_all, fields(task = %tree.task(), patch = %patch.label()))]
pub fn apply(tree: &WorkingTree, patch: &PatchArtifact) -> Result<(), HarnessError> {
    if patch.is_empty() {
        tracing::debug!("empty patch, nothing to apply");
        return Ok(());
    }
    match tree.repo().apply_patch(patch.bytes(), false) {
        Ok(()) => {
            tracing::info!(
                files = ?patch.files().iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
                "patch applied"
            );
            Ok(())
        }
        Err(GitError::ApplyRejected { stderr }) => {
            tracing::warn!(%stderr, "patch rejected");
            Err(HarnessError::PatchConflict {
                label: patch.label().to_owned(),
                stderr,
            })
        }
        Err(e) => Err(e.into()),
    }
}
