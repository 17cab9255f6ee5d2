//! Patch artifacts: portable diffs between two trees.
//!
//! A [`PatchArtifact`] is the raw output of `git diff --binary` plus an index
//! of the files it touches. The bytes are the source of truth; the file list
//! and digest are derived once at construction and never change.

use std::borrow::Cow;
use std::fmt;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// FileChange
// ---------------------------------------------------------------------------

/// How a patch changes one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// The file is created.
    Added,
    /// The file is removed.
    Deleted,
    /// The file's content or mode changes.
    Modified,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "A"),
            Self::Deleted => write!(f, "D"),
            Self::Modified => write!(f, "M"),
        }
    }
}

/// One file section of a patch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileChange {
    /// Path relative to the tree root.
    pub path: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Whether the section carries a binary payload.
    pub binary: bool,
}

// ---------------------------------------------------------------------------
// PatchArtifact
// ---------------------------------------------------------------------------

/// An ordered set of file changes between two trees.
///
/// Applying an artifact to the exact tree it was computed against always
/// succeeds and reproduces the target tree; applying it anywhere else may
/// be rejected as a conflict.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct PatchArtifact {
    label: String,
    digest: String,
    files: Vec<FileChange>,
    #[serde(rename = "patch", serialize_with = "serialize_lossy")]
    bytes: Vec<u8>,
}

impl PatchArtifact {
    /// Wrap raw `git diff` output.
    #[must_use]
    pub fn new(label: impl Into<String>, bytes: Vec<u8>) -> Self {
        let files = parse_file_changes(&bytes);
        let digest = format!("{:x}", Sha256::digest(&bytes));
        Self {
            label: label.into(),
            digest,
            files,
            bytes,
        }
    }

    /// A patch that changes nothing.
    #[must_use]
    pub fn empty(label: impl Into<String>) -> Self {
        Self::new(label, Vec::new())
    }

    /// Human-readable origin, e.g. `fix_profile_404_baseline..fix_profile_404_test`.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// SHA-256 of the patch bytes, lowercase hex.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Files touched, in patch order.
    #[must_use]
    pub fn files(&self) -> &[FileChange] {
        &self.files
    }

    /// Raw patch bytes, suitable for `git apply`.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Patch text, with invalid UTF-8 replaced.
    #[must_use]
    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// True when the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.bytes.iter().all(u8::is_ascii_whitespace)
    }

    /// Whether the patch touches `path`.
    #[must_use]
    pub fn touches(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }
}

impl fmt::Debug for PatchArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchArtifact")
            .field("label", &self.label)
            .field("digest", &self.digest)
            .field("files", &self.files.len())
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl fmt::Display for PatchArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} file(s), sha256 {})",
            self.label,
            self.files.len(),
            &self.digest[..self.digest.len().min(12)]
        )
    }
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

// ---------------------------------------------------------------------------
// Header parsing
// ---------------------------------------------------------------------------

/// Index the `diff --git` sections of `git diff` output.
///
/// Only extended header lines (between `diff --git` and the first hunk or
/// binary payload) are inspected, so file content can never be mistaken for
/// a header.
fn parse_file_changes(bytes: &[u8]) -> Vec<FileChange> {
    let text = String::from_utf8_lossy(bytes);
    let mut files: Vec<FileChange> = Vec::new();
    let mut in_header = false;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            files.push(FileChange {
                path: header_path(rest),
                kind: ChangeKind::Modified,
                binary: false,
            });
            in_header = true;
            continue;
        }
        let Some(current) = files.last_mut() else {
            continue;
        };
        if line.starts_with("GIT binary patch") || line.starts_with("Binary files ") {
            current.binary = true;
            in_header = false;
            continue;
        }
        if !in_header {
            continue;
        }
        if line.starts_with("@@") || line.starts_with("--- ") {
            in_header = false;
        } else if line.starts_with("new file mode") {
            current.kind = ChangeKind::Added;
        } else if line.starts_with("deleted file mode") {
            current.kind = ChangeKind::Deleted;
        }
    }
    files
}

/// Extract the path from `a/<path> b/<path>`.
///
/// Without rename detection both sides name the same path, which makes the
/// split unambiguous even when the path contains spaces.
fn header_path(rest: &str) -> String {
    let unquoted = rest.replace('"', "");
    let rest = unquoted.as_str();
    if rest.len() >= 5 && (rest.len() - 5) % 2 == 0 {
        let n = (rest.len() - 5) / 2;
        if let (Some(a), Some(b)) = (rest.get(2..2 + n), rest.get(2 + n + 3..))
            && rest.starts_with("a/")
            && a == b
        {
            return a.to_owned();
        }
    }
    rest.split_once(" b/").map_or_else(
        || rest.trim_start_matches("a/").to_owned(),
        |(a, _)| a.trim_start_matches("a/").to_owned(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
diff --git a/profiles/views.py b/profiles/views.py
index 1111111111111111111111111111111111111111..2222222222222222222222222222222222222222 100644
--- a/profiles/views.py
+++ b/profiles/views.py
@@ -1,2 +1,2 @@
 def profile(request, pk):
-    return HttpResponseServerError()
+    raise Http404()
diff --git a/tests/test_profile.py b/tests/test_profile.py
new file mode 100644
index 0000000000000000000000000000000000000000..3333333333333333333333333333333333333333
--- /dev/null
+++ b/tests/test_profile.py
@@ -0,0 +1 @@
+diff --git a/not/a/header b/not/a/header
diff --git a/old.txt b/old.txt
deleted file mode 100644
index 4444444444444444444444444444444444444444..0000000000000000000000000000000000000000
--- a/old.txt
+++ /dev/null
@@ -1 +0,0 @@
-gone
";

    #[test]
    fn indexes_every_file_section() {
        let patch = PatchArtifact::new("a..b", SAMPLE.as_bytes().to_vec());
        let files = patch.files();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].path, "profiles/views.py");
        assert_eq!(files[0].kind, ChangeKind::Modified);
        assert_eq!(files[1].path, "tests/test_profile.py");
        assert_eq!(files[1].kind, ChangeKind::Added);
        assert_eq!(files[2].path, "old.txt");
        assert_eq!(files[2].kind, ChangeKind::Deleted);
        assert!(patch.touches("tests/test_profile.py"));
        assert!(!patch.touches("not/a/header"));
    }

    #[test]
    fn digest_is_stable_and_content_addressed() {
        let a = PatchArtifact::new("x", SAMPLE.as_bytes().to_vec());
        let b = PatchArtifact::new("y", SAMPLE.as_bytes().to_vec());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
        let c = PatchArtifact::new("x", b"other".to_vec());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn empty_patch_is_empty() {
        let p = PatchArtifact::empty("noop");
        assert!(p.is_empty());
        assert!(p.files().is_empty());
        assert!(!PatchArtifact::new("x", SAMPLE.as_bytes().to_vec()).is_empty());
    }

    #[test]
    fn path_with_spaces_is_recovered() {
        assert_eq!(header_path("a/my dir/b c.txt b/my dir/b c.txt"), "my dir/b c.txt");
        assert_eq!(header_path("a/x b/x"), "x");
    }

    #[test]
    fn binary_sections_are_flagged() {
        let text = "\
diff --git a/logo.png b/logo.png
new file mode 100644
index 0000000000000000000000000000000000000000..5555555555555555555555555555555555555555
GIT binary patch
literal 3
KcmZ>}00031

literal 0
HcmV?d00001

";
        let patch = PatchArtifact::new("bin", text.as_bytes().to_vec());
        assert_eq!(patch.files().len(), 1);
        assert!(patch.files()[0].binary);
        assert_eq!(patch.files()[0].kind, ChangeKind::Added);
    }

    #[test]
    fn serializes_patch_text_and_files() {
        let patch = PatchArtifact::new("a..b", SAMPLE.as_bytes().to_vec());
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["label"], "a..b");
        assert_eq!(json["files"][1]["kind"], "added");
        assert!(json["patch"].as_str().unwrap().starts_with("diff --git"));
    }
}
