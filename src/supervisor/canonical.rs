//! Lexical canonicalization of client working directories.
//!
//! Clients are deduplicated on `(kind, cwd)`, so semantically equal paths
//! must compare equal as strings: `~` expands to the home directory,
//! `.`/`..` segments resolve lexically, and trailing slashes disappear.
//! Symlinks are deliberately left alone — resolution here is about key
//! equality, not filesystem identity, and must work for directories that
//! do not exist yet.

use std::path::{Component, Path, PathBuf};

use crate::models::agent::AgentKind;

/// Canonicalize a working-directory string into a stable key path.
///
/// Relative paths resolve against the supervisor's current directory.
#[must_use]
pub fn canonicalize(raw: &str) -> PathBuf {
    let expanded = expand_home(raw);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        current_dir().join(expanded)
    };
    normalize(&absolute)
}

/// Build the spawn-dedup key for a canonical working directory.
#[must_use]
pub fn spawn_key(kind: AgentKind, canonical_cwd: &Path) -> String {
    format!("{kind}:{}", canonical_cwd.display())
}

/// Expand a leading `~` or `~/` into the home directory.
fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return home_dir();
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    PathBuf::from(raw)
}

/// Resolve `.` and `..` segments without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping the root is a no-op, so `..` at `/` stays at `/`.
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map_or_else(|| PathBuf::from("/"), PathBuf::from)
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}
