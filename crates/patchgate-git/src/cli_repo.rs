//! [`GitCli`]: [`GitRepo`] implemented by driving the `git` executable.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{GitOid, Identity, Submodule};

/// Flags that pin `git diff` output independently of user configuration.
const DIFF_FLAGS: &[&str] = &[
    "--binary",
    "--full-index",
    "--no-color",
    "--no-ext-diff",
    "--no-textconv",
    "--no-renames",
    "--src-prefix=a/",
    "--dst-prefix=b/",
];

/// A repository (bare mirror or working tree) operated through the git CLI.
///
/// A working tree may keep its git directory elsewhere (see
/// [`init_detached`](Self::init_detached)); every command then passes
/// `--git-dir` and `--work-tree` explicitly.
#[derive(Clone, Debug)]
pub struct GitCli {
    dir: PathBuf,
    work_tree: Option<PathBuf>,
}

impl GitCli {
    /// Wrap an existing repository directory. No I/O is performed.
    ///
    /// Repository discovery never climbs above `dir`: a `dir` that is not
    /// itself a repository is treated as a plain directory (`git apply`
    /// then patches files relative to it).
    #[must_use]
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            work_tree: None,
        }
    }

    /// Wrap a working tree whose git directory lives at `git_dir`.
    #[must_use]
    pub fn open_detached(git_dir: impl Into<PathBuf>, work_tree: impl Into<PathBuf>) -> Self {
        Self {
            dir: git_dir.into(),
            work_tree: Some(work_tree.into()),
        }
    }

    /// Create a bare mirror of `locator` at `dest`.
    ///
    /// A failed clone leaves nothing behind at `dest`.
    ///
    /// # Errors
    /// [`GitError::Unreachable`] when the remote cannot be read.
    pub fn clone_mirror(locator: &str, dest: &Path) -> Result<Self, GitError> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let output = base_command(parent)
            .args(["clone", "--mirror", "--quiet", "--", locator])
            .arg(dest)
            .output()?;

        if !output.status.success() {
            let _ = std::fs::remove_dir_all(dest);
            return Err(GitError::Unreachable {
                locator: locator.to_owned(),
                stderr: stderr_of(&output),
            });
        }

        tracing::debug!(locator, dest = %dest.display(), "mirror cloned");
        Ok(Self::open(dest))
    }

    /// Initialize a fresh non-bare repository in `dir` (which must exist).
    ///
    /// # Errors
    /// Returns an error if `git init` fails.
    pub fn init(dir: &Path) -> Result<Self, GitError> {
        let repo = Self::open(dir);
        repo.stdout(&["-c", "init.defaultBranch=main", "init", "--quiet"])?;
        Ok(repo)
    }

    /// Initialize a repository at `git_dir` tracking the files of
    /// `work_tree` (which must exist). Nothing is written inside
    /// `work_tree`, so its contents cannot reach the repository.
    ///
    /// # Errors
    /// Returns an error if `git init` fails.
    pub fn init_detached(git_dir: &Path, work_tree: &Path) -> Result<Self, GitError> {
        let repo = Self::open_detached(git_dir, work_tree);
        repo.stdout(&["-c", "init.defaultBranch=main", "init", "--quiet"])?;
        Ok(repo)
    }

    /// The git directory (or the repository directory for [`open`](Self::open)).
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        &self.dir
    }

    fn command(&self) -> Command {
        match &self.work_tree {
            Some(work_tree) => {
                let mut cmd = base_command(work_tree);
                cmd.arg(format!("--git-dir={}", self.dir.display()))
                    .arg(format!("--work-tree={}", work_tree.display()));
                cmd
            }
            None => base_command(&self.dir),
        }
    }

    fn stdout(&self, args: &[&str]) -> Result<Vec<u8>, GitError> {
        let output = self.command().args(args).output()?;
        check(args, output)
    }

    fn stdout_with_input(&self, args: &[&str], input: &[u8]) -> Result<Output, GitError> {
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // git may exit before draining stdin (e.g. on a malformed patch);
        // its exit status carries the real error.
        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(input)
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e.into());
        }

        Ok(child.wait_with_output()?)
    }
}

impl GitCli {
    /// `path -> url` for every submodule declared in `oid:.gitmodules`.
    fn gitmodule_urls(&self, oid: GitOid) -> Result<BTreeMap<String, String>, GitError> {
        let blob = format!("{oid}:.gitmodules");
        let exists = self.command().args(["cat-file", "-e", &blob]).output()?;
        if !exists.status.success() {
            return Ok(BTreeMap::new());
        }

        let output = self
            .command()
            .args(["config", "--blob", &blob, "-z", "--get-regexp", r"^submodule\."])
            .output()?;
        // Exit 1: the file declares nothing.
        if output.status.code() == Some(1) {
            return Ok(BTreeMap::new());
        }
        let raw = check(&["config", "--blob", &blob], output)?;

        // `key LF value NUL`; the submodule name may itself contain dots.
        let mut paths = BTreeMap::new();
        let mut urls = BTreeMap::new();
        for record in raw.split(|b| *b == 0).filter(|r| !r.is_empty()) {
            let record = String::from_utf8_lossy(record);
            let Some((key, value)) = record.split_once('\n') else {
                continue;
            };
            let Some((name, field)) = key
                .strip_prefix("submodule.")
                .and_then(|k| k.rsplit_once('.'))
            else {
                continue;
            };
            match field {
                "path" => paths.insert(name.to_owned(), value.to_owned()),
                "url" => urls.insert(name.to_owned(), value.to_owned()),
                _ => None,
            };
        }
        Ok(paths
            .into_iter()
            .filter_map(|(name, path)| urls.remove(&name).map(|url| (path, url)))
            .collect())
    }
}

impl GitRepo for GitCli {
    fn path(&self) -> &Path {
        self.work_tree.as_deref().unwrap_or(&self.dir)
    }

    fn rev_parse_opt(&self, spec: &str) -> Result<Option<GitOid>, GitError> {
        let commitish = format!("{spec}^{{commit}}");
        let output = self
            .command()
            .args(["rev-parse", "--verify", "--quiet", &commitish])
            .output()?;

        if !output.status.success() {
            // --quiet: a missing rev exits 1 with no stderr. Anything louder
            // means git itself failed.
            let stderr = stderr_of(&output);
            if stderr.is_empty() {
                return Ok(None);
            }
            return Err(GitError::CommandFailed {
                command: format!("git rev-parse --verify {commitish}"),
                stderr,
                exit_code: output.status.code(),
            });
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        Ok(Some(raw.trim().parse()?))
    }

    fn fetch(&self) -> Result<(), GitError> {
        let output = self
            .command()
            .args(["fetch", "--prune", "--quiet", "origin"])
            .output()?;

        if output.status.success() {
            Ok(())
        } else {
            Err(GitError::Unreachable {
                locator: self.dir.display().to_string(),
                stderr: stderr_of(&output),
            })
        }
    }

    fn diff_commits(&self, from: GitOid, to: GitOid) -> Result<Vec<u8>, GitError> {
        let from = from.to_string();
        let to = to.to_string();
        let mut args = vec!["diff"];
        args.extend_from_slice(DIFF_FLAGS);
        args.extend([from.as_str(), to.as_str(), "--"]);
        self.stdout(&args)
    }

    fn diff_worktree(&self, base: GitOid) -> Result<Vec<u8>, GitError> {
        self.stdout(&["add", "--all", "--", "."])?;

        let base = base.to_string();
        let mut args = vec!["diff", "--cached"];
        args.extend_from_slice(DIFF_FLAGS);
        args.extend([base.as_str(), "--"]);
        self.stdout(&args)
    }

    fn apply_patch(&self, patch: &[u8], check_only: bool) -> Result<(), GitError> {
        let mut args = vec!["apply", "--whitespace=nowarn"];
        if check_only {
            args.push("--check");
        }
        args.push("-");

        let output = self.stdout_with_input(&args, patch)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(GitError::ApplyRejected {
                stderr: stderr_of(&output),
            })
        }
    }

    fn archive_into(&self, oid: GitOid, dest: &Path) -> Result<(), GitError> {
        std::fs::create_dir_all(dest)?;

        // Archiving the tree rather than the commit keeps the pax global
        // header (commit id) out of the stream.
        let treeish = format!("{oid}^{{tree}}");
        let mut archive = self
            .command()
            .args(["archive", "--format=tar", &treeish])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = archive.stdout.take().ok_or_else(|| GitError::CommandFailed {
            command: format!("git archive {treeish}"),
            stderr: "stdout was not captured".to_owned(),
            exit_code: None,
        })?;
        let unpacked = tar::Archive::new(stdout).unpack(dest);
        let output = archive.wait_with_output()?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: format!("git archive {treeish}"),
                stderr: stderr_of(&output),
                exit_code: output.status.code(),
            });
        }
        unpacked?;
        Ok(())
    }

    fn submodules(&self, oid: GitOid) -> Result<Vec<Submodule>, GitError> {
        let treeish = format!("{oid}^{{tree}}");
        let listing = self.stdout(&["ls-tree", "-r", "-z", &treeish])?;

        // `<mode> SP <type> SP <object> TAB <path>`, NUL-terminated.
        let mut links = Vec::new();
        for entry in listing.split(|b| *b == 0).filter(|e| !e.is_empty()) {
            let entry = String::from_utf8_lossy(entry);
            let Some((meta, path)) = entry.split_once('\t') else {
                continue;
            };
            let mut fields = meta.split(' ');
            if fields.next() != Some("160000") {
                continue;
            }
            if let Some(object) = fields.nth(1) {
                links.push((path.to_owned(), object.parse::<GitOid>()?));
            }
        }
        if links.is_empty() {
            return Ok(Vec::new());
        }

        let urls = self.gitmodule_urls(oid)?;
        Ok(links
            .into_iter()
            .map(|(path, oid)| Submodule {
                url: urls.get(&path).cloned(),
                path,
                oid,
            })
            .collect())
    }

    fn snapshot(&self, message: &str, identity: &Identity) -> Result<GitOid, GitError> {
        self.stdout(&["add", "--all", "--", "."])?;

        let user_name = format!("user.name={}", identity.name);
        let user_email = format!("user.email={}", identity.email);
        let output = self
            .command()
            .args(["-c", &user_name, "-c", &user_email, "-c", "commit.gpgsign=false"])
            .args(["commit", "--quiet", "--no-verify", "--allow-empty", "-m", message])
            .env("GIT_AUTHOR_DATE", &identity.date)
            .env("GIT_COMMITTER_DATE", &identity.date)
            .output()?;
        check(&["commit"], output)?;

        self.rev_parse("HEAD")
    }
}

/// A `git` command rooted at `dir` with environment overrides stripped so
/// an outer repository (hooks, `GIT_DIR` exports, an enclosing checkout)
/// never leaks in.
fn base_command(dir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(dir)
        .env_remove("GIT_DIR")
        .env_remove("GIT_WORK_TREE")
        .env_remove("GIT_INDEX_FILE")
        .env_remove("GIT_OBJECT_DIRECTORY")
        .env("GIT_TERMINAL_PROMPT", "0")
        .args(["-c", "core.autocrlf=false"]);
    if let Some(parent) = dir.parent()
        && let Ok(parent) = std::path::absolute(parent)
    {
        cmd.env("GIT_CEILING_DIRECTORIES", parent);
    }
    cmd
}

fn check(args: &[&str], output: Output) -> Result<Vec<u8>, GitError> {
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(GitError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            stderr: stderr_of(&output),
            exit_code: output.status.code(),
        })
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_owned()
}
