//! Shared helpers for the integration tests.

use std::path::Path;
use std::process::Command;

/// Initialize a git repository with one commit and an `origin` remote.
///
/// Several resolvers identify the main package by the repository's origin
/// URL and HEAD commit; the remote does not need to be reachable.
pub fn init_git_repo(dir: &Path) {
    let git = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.org")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.org")
            .output()
            .expect("failed to run git");
        assert!(
            status.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&status.stderr)
        );
    };
    git(&["init", "--quiet", "--initial-branch=main"]);
    git(&["add", "-A"]);
    git(&["commit", "--quiet", "--no-gpg-sign", "-m", "initial commit"]);
    git(&[
        "remote",
        "add",
        "origin",
        "https://github.com/testing/sample-repo.git",
    ]);
}

/// The HEAD commit of a repository created by [`init_git_repo`].
pub fn head_commit(dir: &Path) -> String {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
