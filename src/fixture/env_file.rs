//! `KEY=VALUE` environment file upserts applied to fresh working trees.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Update or insert `updates` in the env file at `path`.
///
/// Existing `KEY=` lines are replaced in place, keys not yet present are
/// appended in key order, and a missing file (or parent directory) is
/// created. All other lines are kept verbatim.
///
/// # Errors
/// Returns an I/O error if the file cannot be read or written.
pub fn upsert(path: &Path, updates: &BTreeMap<String, String>) -> std::io::Result<()> {
    let original = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let mut replaced = BTreeSet::new();
    let mut lines: Vec<String> = original
        .lines()
        .map(|line| {
            let hit = updates
                .iter()
                .find(|(key, _)| line.strip_prefix(key.as_str()).is_some_and(|r| r.starts_with('=')));
            match hit {
                Some((key, value)) => {
                    replaced.insert(key.as_str());
                    format!("{key}={value}")
                }
                None => line.to_owned(),
            }
        })
        .collect();

    for (key, value) in updates {
        if !replaced.contains(key.as_str()) {
            lines.push(format!("{key}={value}"));
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut contents = lines.join("\n");
    contents.push('\n');
    std::fs::write(path, contents)
}
