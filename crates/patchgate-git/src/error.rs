//! Error types for git operations.
//!
//! [`GitError`] is the single error type returned by all [`GitRepo`](crate::GitRepo) trait
//! methods. Variants separate the failure modes the harness must tell apart
//! (missing refs, unreachable remotes, patches that do not apply) so callers
//! never have to parse stderr.

use thiserror::Error;

/// Errors returned by [`GitRepo`](crate::GitRepo) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// A requested object, ref, or path was not found.
    #[error("not found: {message}")]
    NotFound {
        /// Human-readable description of what was missing.
        message: String,
    },

    /// A remote repository could not be cloned or fetched.
    #[error("repository `{locator}` is unreachable: {stderr}")]
    Unreachable {
        /// The URL or path that was contacted.
        locator: String,
        /// Captured stderr from git.
        stderr: String,
    },

    /// `git apply` refused a patch (a hunk did not match, a file to create
    /// already exists, a file to modify is missing, ...).
    #[error("patch does not apply: {stderr}")]
    ApplyRejected {
        /// Captured stderr from `git apply`, naming the offending paths.
        stderr: String,
    },

    /// An OID string could not be parsed or was otherwise invalid.
    #[error("invalid OID `{value}`: {reason}")]
    InvalidOid {
        /// The raw value that failed validation.
        value: String,
        /// Why validation failed.
        reason: String,
    },

    /// A git command exited unsuccessfully for a reason not covered above.
    #[error("`{command}` failed{}: {stderr}", exit_suffix(.exit_code))]
    CommandFailed {
        /// The git command line (e.g. `"git archive <oid>"`).
        command: String,
        /// Captured stderr.
        stderr: String,
        /// Process exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// An I/O error occurred (file system, process spawn, etc.).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[allow(clippy::ref_option)]
fn exit_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" (exit code {c})")).unwrap_or_default()
}

impl GitError {
    /// Returns `true` if the error means "the thing asked for does not exist"
    /// rather than "git broke".
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
