//! Fixture manager: isolated working trees for a task's refs.
//!
//! Trees are materialized from the shared mirror cache into a fresh,
//! uniquely named directory under the scratch root:
//!
//! ```text
//! <scratch>/
//! └── <task>-<kind>-XXXXXX/      ← task scope (removed on drop)
//!     ├── .snapshot.git/         ← git dir of the tree's one-commit repo
//!     └── <checkout_dir>/        ← tree root, handed to agents and runners
//! ```
//!
//! The snapshot repository's single commit records the materialized ref
//! (submodules included) plus any injected env files. Agent edits are later
//! diffed against that commit, and patches are applied with `git apply`
//! through it. Its git dir sits beside the tree root, not inside it, so
//! nothing done in the tree can corrupt it or reach the task's other refs.

pub mod cache;
pub mod env_file;

use std::path::{Path, PathBuf};

use patchgate_git::{GitCli, GitError, GitOid, GitRepo as _, Identity};
use serde::Serialize;
use tempfile::TempDir;
use tracing::instrument;

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::model::types::{RefKind, TaskDescriptor, TaskId};

pub use cache::RepoCache;

/// Untracked build artifacts kept out of snapshots and agent patches.
const LOCAL_EXCLUDES: &str = "__pycache__/\n*.pyc\n.pytest_cache/\n/out/\n/cache/\n";

/// Git dir of the snapshot repository, relative to the task scope.
const SNAPSHOT_GIT_DIR: &str = ".snapshot.git";

/// Submodules nested deeper than this are refused.
const MAX_SUBMODULE_DEPTH: usize = 4;

// ---------------------------------------------------------------------------
// Resolved refs
// ---------------------------------------------------------------------------

/// A task ref pinned to a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedRef {
    /// Which of the task's refs.
    pub kind: RefKind,
    /// The ref name from the task descriptor.
    pub name: String,
    /// Commit it pointed at when resolved.
    #[serde(serialize_with = "serialize_oid")]
    pub oid: GitOid,
}

fn serialize_oid<S: serde::Serializer>(oid: &GitOid, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(oid)
}

/// All three refs of a task, resolved under one cache lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskRevisions {
    /// Buggy ref.
    pub buggy: ResolvedRef,
    /// Reference-fix ref.
    pub reference_fix: ResolvedRef,
    /// Hidden-test ref.
    pub hidden_test: ResolvedRef,
}

impl TaskRevisions {
    /// The resolved ref for `kind`.
    #[must_use]
    pub const fn get(&self, kind: RefKind) -> &ResolvedRef {
        match kind {
            RefKind::Buggy => &self.buggy,
            RefKind::ReferenceFix => &self.reference_fix,
            RefKind::HiddenTest => &self.hidden_test,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkingTree
// ---------------------------------------------------------------------------

/// A materialized, exclusively owned copy of one task ref.
///
/// Dropping the tree deletes its whole task scope directory.
#[derive(Debug)]
pub struct WorkingTree {
    scope: Option<TempDir>,
    scope_path: PathBuf,
    root: PathBuf,
    task: TaskId,
    kind: RefKind,
    source: GitOid,
    snapshot: GitOid,
    repo: GitCli,
}

impl WorkingTree {
    /// Root of the checked-out files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The task-scoped directory that contains [`root`](Self::root).
    #[must_use]
    pub fn scope(&self) -> &Path {
        &self.scope_path
    }

    /// Task this tree belongs to.
    #[must_use]
    pub const fn task(&self) -> &TaskId {
        &self.task
    }

    /// Ref kind the tree was materialized from.
    #[must_use]
    pub const fn kind(&self) -> RefKind {
        self.kind
    }

    /// Commit of the fixture repository the tree was materialized from.
    #[must_use]
    pub const fn source_oid(&self) -> GitOid {
        self.source
    }

    /// The tree-local commit recording the pristine materialized state.
    #[must_use]
    pub const fn snapshot_oid(&self) -> GitOid {
        self.snapshot
    }

    /// Git handle on the tree.
    #[must_use]
    pub const fn repo(&self) -> &GitCli {
        &self.repo
    }

    /// Stop managing the scope directory and return the tree root; the
    /// files outlive this value.
    #[must_use]
    pub fn keep(mut self) -> PathBuf {
        if let Some(scope) = self.scope.take() {
            let _ = scope.keep();
        }
        self.root.clone()
    }

    /// Delete the tree now, reporting any error instead of ignoring it.
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be removed.
    pub fn discard(mut self) -> std::io::Result<()> {
        self.scope.take().map_or(Ok(()), TempDir::close)
    }
}

// ---------------------------------------------------------------------------
// FixtureManager
// ---------------------------------------------------------------------------

/// Materializes isolated working trees for task refs.
///
/// `FixtureManager` is `Sync`: concurrent `prepare` calls share the mirror
/// cache (serialized per repository) and extract in parallel.
#[derive(Debug)]
pub struct FixtureManager {
    cache: RepoCache,
    scratch_root: PathBuf,
    identity: Identity,
}

impl FixtureManager {
    /// A manager over `cache` creating trees under `scratch_root`.
    #[must_use]
    pub fn new(cache: RepoCache, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            cache,
            scratch_root: scratch_root.into(),
            identity: Identity::default(),
        }
    }

    /// A manager configured from `[harness]`.
    #[must_use]
    pub fn from_config(harness: &HarnessConfig) -> Self {
        Self::new(
            RepoCache::new(&harness.cache_dir, harness.fetch),
            harness.scratch_root(),
        )
    }

    /// The mirror cache.
    #[must_use]
    pub const fn cache(&self) -> &RepoCache {
        &self.cache
    }

    /// Sync the task's repository and resolve all three of its refs.
    ///
    /// # Errors
    /// [`HarnessError::FixtureUnavailable`] if the repository is unreachable
    /// or any ref is missing.
    #[instrument(skip(self, task), fields(task = %task.id))]
    pub fn revisions(&self, task: &TaskDescriptor) -> Result<TaskRevisions, HarnessError> {
        self.with_mirror(task, |mirror| {
            Ok(TaskRevisions {
                buggy: resolve_in(mirror, task, RefKind::Buggy)?,
                reference_fix: resolve_in(mirror, task, RefKind::ReferenceFix)?,
                hidden_test: resolve_in(mirror, task, RefKind::HiddenTest)?,
            })
        })
    }

    /// Sync the task's repository and resolve one ref.
    ///
    /// # Errors
    /// [`HarnessError::FixtureUnavailable`] if the repository is unreachable
    /// or the ref is missing.
    pub fn resolve(
        &self,
        task: &TaskDescriptor,
        kind: RefKind,
    ) -> Result<ResolvedRef, HarnessError> {
        self.with_mirror(task, |mirror| resolve_in(mirror, task, kind))
    }

    /// Materialize a fresh tree of `kind` for `task`.
    ///
    /// Every call yields a new directory; no tree is ever reused.
    ///
    /// # Errors
    /// [`HarnessError::FixtureUnavailable`] for a missing repository or ref;
    /// I/O or git errors while extracting.
    pub fn prepare(
        &self,
        task: &TaskDescriptor,
        kind: RefKind,
    ) -> Result<WorkingTree, HarnessError> {
        let rev = self.resolve(task, kind)?;
        self.materialize(task, &rev)
    }

    /// Materialize a tree for an already resolved ref.
    ///
    /// Only reads objects from the task's mirror, so it runs without that
    /// mirror's lock. Submodule mirrors are synced under their own locks.
    ///
    /// # Errors
    /// [`HarnessError::FixtureUnavailable`] when a submodule cannot be
    /// resolved; I/O or git errors while extracting or snapshotting.
    #[instrument(skip(self, task, rev), fields(task = %task.id, kind = %rev.kind, oid = %rev.oid.short()))]
    pub fn materialize(
        &self,
        task: &TaskDescriptor,
        rev: &ResolvedRef,
    ) -> Result<WorkingTree, HarnessError> {
        std::fs::create_dir_all(&self.scratch_root)?;
        let scope = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", task.id, rev.kind))
            .tempdir_in(&self.scratch_root)?;
        let scope_path = scope.path().to_path_buf();
        let root = scope_path.join(&task.checkout_dir);

        let mirror = self.mirror(task);
        mirror.archive_into(rev.oid, &root)?;
        self.materialize_submodules(task, &task.repo, &mirror, rev.oid, &root, 0)?;

        for (rel, vars) in &task.env_files {
            env_file::upsert(&root.join(rel), vars)?;
        }

        let git_dir = scope_path.join(SNAPSHOT_GIT_DIR);
        let repo = GitCli::init_detached(&git_dir, &root)?;
        std::fs::create_dir_all(git_dir.join("info"))?;
        std::fs::write(git_dir.join("info/exclude"), LOCAL_EXCLUDES)?;
        let snapshot = repo.snapshot(
            &format!("{} {} ({})", task.id, rev.kind, rev.name),
            &self.identity,
        )?;

        tracing::debug!(root = %root.display(), snapshot = %snapshot.short(), "tree ready");
        Ok(WorkingTree {
            scope: Some(scope),
            scope_path,
            root,
            task: task.id.clone(),
            kind: rev.kind,
            source: rev.oid,
            snapshot,
            repo,
        })
    }

    /// Fill the gitlinks of `oid` (extracted at `dest`) from the submodules'
    /// own mirrors, recursively.
    fn materialize_submodules(
        &self,
        task: &TaskDescriptor,
        locator: &str,
        source: &GitCli,
        oid: GitOid,
        dest: &Path,
        depth: usize,
    ) -> Result<(), HarnessError> {
        let submodules = source.submodules(oid)?;
        let unavailable = |path: &str, detail: String| HarnessError::FixtureUnavailable {
            task: task.id.clone(),
            reference: format!("submodule {path}"),
            detail,
        };

        for sm in submodules {
            if depth >= MAX_SUBMODULE_DEPTH {
                return Err(unavailable(
                    &sm.path,
                    format!("submodules nested deeper than {MAX_SUBMODULE_DEPTH} levels"),
                ));
            }
            let Some(url) = sm.url.as_deref() else {
                return Err(unavailable(&sm.path, "no url in .gitmodules".to_owned()));
            };
            let url = submodule_locator(locator, url);

            let found = self
                .cache
                .with_mirror(&url, |m| m.rev_parse_opt(&sm.oid.to_string()))
                .map_err(|e: GitError| unavailable(&sm.path, e.to_string()))?;
            if found.is_none() {
                return Err(unavailable(
                    &sm.path,
                    format!("commit {} not found in {url}", sm.oid.short()),
                ));
            }

            let mirror = GitCli::open(self.cache.mirror_path(&url));
            let target = dest.join(&sm.path);
            mirror.archive_into(sm.oid, &target)?;
            tracing::debug!(path = %sm.path, url, oid = %sm.oid.short(), "submodule materialized");
            self.materialize_submodules(task, &url, &mirror, sm.oid, &target, depth + 1)?;
        }
        Ok(())
    }

    /// Read-only handle on the task's mirror for object access by OID.
    ///
    /// Only valid after the mirror has been synced by
    /// [`revisions`](Self::revisions) or [`resolve`](Self::resolve).
    #[must_use]
    pub fn mirror(&self, task: &TaskDescriptor) -> GitCli {
        GitCli::open(self.cache.mirror_path(&task.repo))
    }

    fn with_mirror<T>(
        &self,
        task: &TaskDescriptor,
        f: impl FnOnce(&GitCli) -> Result<T, HarnessError>,
    ) -> Result<T, HarnessError> {
        self.cache
            .with_mirror(&task.repo, f)
            .map_err(|e| match e {
                HarnessError::Git(git) => HarnessError::FixtureUnavailable {
                    task: task.id.clone(),
                    reference: task.repo.clone(),
                    detail: git.to_string(),
                },
                other => other,
            })
    }
}

/// Resolve a task ref inside a synced mirror: branches first, then tags,
/// then the name as given (which also admits raw commit ids).
fn resolve_in(
    mirror: &GitCli,
    task: &TaskDescriptor,
    kind: RefKind,
) -> Result<ResolvedRef, HarnessError> {
    let name = task.ref_name(kind);
    let unavailable = |detail: String| HarnessError::FixtureUnavailable {
        task: task.id.clone(),
        reference: name.to_owned(),
        detail,
    };

    for candidate in [
        format!("refs/heads/{name}"),
        format!("refs/tags/{name}"),
        name.to_owned(),
    ] {
        match mirror.rev_parse_opt(&candidate) {
            Ok(Some(oid)) => {
                return Ok(ResolvedRef {
                    kind,
                    name: name.to_owned(),
                    oid,
                });
            }
            Ok(None) => {}
            Err(e @ GitError::CommandFailed { .. }) => {
                tracing::debug!(candidate, error = %e, "rev-parse failed");
            }
            Err(e) => return Err(unavailable(e.to_string())),
        }
    }
    Err(unavailable(format!("{kind} ref not found in {}", task.repo)))
}

/// Resolve a `.gitmodules` URL the way git does: `./` and `../` prefixes
/// are relative to the superproject's own locator.
fn submodule_locator(superproject: &str, url: &str) -> String {
    if !(url.starts_with("./") || url.starts_with("../")) {
        return url.to_owned();
    }
    let mut base = superproject.trim_end_matches('/').to_owned();
    let mut rest = url;
    loop {
        if let Some(r) = rest.strip_prefix("./") {
            rest = r;
        } else if let Some(r) = rest.strip_prefix("../") {
            let cut = base.rfind(['/', ':']).unwrap_or(0);
            base.truncate(cut);
            rest = r;
        } else {
            break;
        }
    }
    format!("{base}/{rest}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
