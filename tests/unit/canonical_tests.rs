//! Unit tests for working-directory canonicalization.
//!
//! Client reuse keys on the canonical path, so `~`, `$HOME`, `..`, `.`,
//! and trailing slashes must all collapse to the same string.

use std::path::PathBuf;

use serial_test::serial;

use agent_switchboard::models::agent::AgentKind;
use agent_switchboard::supervisor::canonical::{canonicalize, spawn_key};

// ── Home expansion ───────────────────────────────────────────────────────

/// `~/x`, `$HOME/x`, `~/x/`, and `~/x/y/..` all canonicalize identically.
#[test]
#[serial]
fn home_spellings_collapse() {
    std::env::set_var("HOME", "/home/tester");

    let reference = canonicalize("/home/tester/x");
    assert_eq!(canonicalize("~/x"), reference, "~ expansion must match $HOME");
    assert_eq!(
        canonicalize("~/x/"),
        reference,
        "trailing slash must be stripped"
    );
    assert_eq!(
        canonicalize("~/x/y/.."),
        reference,
        ".. must resolve lexically"
    );
}

/// A bare `~` is the home directory itself.
#[test]
#[serial]
fn bare_tilde_is_home() {
    std::env::set_var("HOME", "/home/tester");
    assert_eq!(canonicalize("~"), PathBuf::from("/home/tester"));
}

// ── Lexical resolution ───────────────────────────────────────────────────

/// Interior `.` segments disappear.
#[test]
fn current_dir_segments_disappear() {
    assert_eq!(
        canonicalize("/srv/./work/./proj"),
        PathBuf::from("/srv/work/proj")
    );
}

/// `..` never escapes the root.
#[test]
fn parent_of_root_is_root() {
    assert_eq!(canonicalize("/../.."), PathBuf::from("/"));
}

/// Canonicalization does not require the path to exist.
#[test]
fn nonexistent_paths_canonicalize() {
    assert_eq!(
        canonicalize("/no/such/dir/any/where/.."),
        PathBuf::from("/no/such/dir/any")
    );
}

// ── Spawn keys ───────────────────────────────────────────────────────────

/// The spawn key embeds the kind, so different kinds in the same directory
/// never collide.
#[test]
fn spawn_key_separates_kinds() {
    let cwd = canonicalize("/home/u/proj");
    let a = spawn_key(AgentKind::ClaudeCode, &cwd);
    let b = spawn_key(AgentKind::Gemini, &cwd);
    assert_ne!(a, b, "kinds must produce distinct keys");
    assert!(a.contains("claude-code"), "key must name the kind: {a}");
}
