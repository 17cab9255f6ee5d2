//! Shared mirror cache keyed by repository locator.
//!
//! Each locator maps to one bare mirror under the cache directory. Clone and
//! fetch for a locator are serialized by an in-process mutex plus an
//! exclusive file lock (for concurrent harness processes sharing a cache);
//! different locators proceed in parallel. Readers never see a half-written
//! mirror: the clone happens under the lock and a failed clone is removed.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fs4::fs_std::FileExt as _;
use patchgate_git::{GitCli, GitError, GitRepo as _};
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::config::FetchPolicy;

#[derive(Debug, Default)]
struct Slot {
    /// Whether this process has already cloned or fetched the mirror.
    synced: bool,
}

/// Cache of bare mirrors, one per repository locator.
#[derive(Debug)]
pub struct RepoCache {
    root: PathBuf,
    policy: FetchPolicy,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl RepoCache {
    /// A cache rooted at `root` (created lazily).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, policy: FetchPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Cache directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the mirror for `locator` lives.
    #[must_use]
    pub fn mirror_path(&self, locator: &str) -> PathBuf {
        self.root.join(format!("{}.git", cache_key(locator)))
    }

    /// Bring the mirror for `locator` up to date per the fetch policy, then
    /// run `f` on it while still holding the locator's lock.
    ///
    /// Ref resolution belongs inside `f` so that a concurrent fetch cannot
    /// move refs between sync and lookup. Object reads (archive, diff) by
    /// OID are safe outside the lock.
    ///
    /// # Errors
    /// Propagates clone/fetch failures and whatever `f` returns.
    #[instrument(skip(self, f), fields(policy = %self.policy))]
    pub fn with_mirror<T, E>(
        &self,
        locator: &str,
        f: impl FnOnce(&GitCli) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<GitError>,
    {
        let slot = self.slot(locator);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let _file_lock = self.lock_file(locator).map_err(GitError::from)?;

        let dest = self.mirror_path(locator);
        let mirror = if dest.join("HEAD").exists() {
            let mirror = GitCli::open(&dest);
            if self.policy == FetchPolicy::Always || !state.synced {
                tracing::debug!(locator, "fetching mirror");
                mirror.fetch()?;
            }
            mirror
        } else {
            // A directory without HEAD is debris from an interrupted clone.
            if dest.exists() {
                std::fs::remove_dir_all(&dest).map_err(GitError::from)?;
            }
            tracing::info!(locator, dest = %dest.display(), "cloning mirror");
            GitCli::clone_mirror(locator, &dest)?
        };
        state.synced = true;

        f(&mirror)
    }

    fn slot(&self, locator: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(locator.to_owned()).or_default())
    }

    fn lock_file(&self, locator: &str) -> std::io::Result<File> {
        std::fs::create_dir_all(&self.root)?;
        let file = File::create(self.root.join(format!("{}.lock", cache_key(locator))))?;
        file.lock_exclusive()?;
        Ok(file)
    }
}

/// Readable, collision-free directory name for a locator: the last path
/// component plus a short hash of the full locator.
fn cache_key(locator: &str) -> String {
    let trimmed = locator.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed)
        .trim_end_matches(".git");
    let name: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(40)
        .collect();
    let digest = format!("{:x}", Sha256::digest(locator.as_bytes()));
    let name = if name.is_empty() { "repo" } else { name.as_str() };
    format!("{name}-{}", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_readable_and_distinct() {
        let a = cache_key("https://github.com/org/fullstack.git");
        let b = cache_key("https://gitlab.com/org/fullstack.git");
        assert!(a.starts_with("fullstack-"), "{a}");
        assert_ne!(a, b);
        assert_eq!(a, cache_key("https://github.com/org/fullstack.git"));
    }

    #[test]
    fn cache_key_sanitizes_odd_locators() {
        assert!(cache_key("git@host:Org/My Repo.git").starts_with("my_repo-"));
        assert!(cache_key("/").starts_with("repo-"));
    }

    #[test]
    fn missing_repository_is_an_error_and_leaves_no_mirror() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = RepoCache::new(dir.path().join("cache"), FetchPolicy::Once);
        let locator = dir.path().join("absent").display().to_string();
        let err = cache
            .with_mirror(&locator, |_| Ok::<_, GitError>(()))
            .unwrap_err();
        assert!(matches!(err, GitError::Unreachable { .. }), "got {err}");
        assert!(!cache.mirror_path(&locator).exists());
    }
}
