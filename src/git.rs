//! Working-copy management through the `git` command line.
//!
//! A missing working copy is cloned at the requested branch; an existing one
//! is brought up to date with fetch, checkout and pull. Any failing step is
//! reported as [`ContextError::Fetch`] and not retried.

use std::path::Path;
use std::process::Command;

use crate::error::{ContextError, Result};

/// Ensure `dest` holds an up-to-date checkout of `branch` from `url`.
pub fn clone_or_update(url: &str, branch: &str, dest: &Path) -> Result<()> {
    if branch.is_empty() || branch.starts_with('-') {
        return Err(ContextError::Fetch(format!("invalid branch name '{}'", branch)));
    }
    if dest.join(".git").exists() {
        tracing::info!(repo = %url, branch, "updating working copy");
        git_update(dest, branch)
    } else {
        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        tracing::info!(repo = %url, branch, dest = %dest.display(), "cloning repository");
        git_clone(url, branch, dest)
    }
}

fn git_clone(url: &str, branch: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut cmd = Command::new("git");
    cmd.args(["clone", "--quiet", "--branch", branch, "--"]);
    cmd.arg(url);
    cmd.arg(dest);
    run_git(cmd, "clone")
}

fn git_update(repo_dir: &Path, branch: &str) -> Result<()> {
    let steps: [(&str, Vec<&str>); 3] = [
        ("fetch", vec!["fetch", "--quiet", "origin"]),
        ("checkout", vec!["checkout", "--quiet", branch]),
        ("pull", vec!["pull", "--quiet", "origin", branch]),
    ];

    for (name, args) in steps {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(repo_dir);
        run_git(cmd, name)?;
    }
    Ok(())
}

/// Commit hash of `HEAD` in `repo_dir`, if it can be read.
pub fn head_sha(repo_dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_git(mut cmd: Command, step: &str) -> Result<()> {
    let output = cmd.output().map_err(|e| {
        ContextError::Fetch(format!("failed to execute 'git {}'. Is git installed? {}", step, e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ContextError::Fetch(format!(
            "git {} failed: {}",
            step,
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub(crate) fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args([
                "-c",
                "user.name=Test",
                "-c",
                "user.email=test@example.com",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            status.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&status.stderr)
        );
    }

    /// A repository with one commit on `main`.
    pub(crate) fn init_repo(dir: &Path, files: &[(&str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        git(dir, &["init", "--quiet"]);
        git(dir, &["checkout", "--quiet", "-b", "main"]);
        for (rel, content) in files {
            let path = dir.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        git(dir, &["add", "."]);
        git(dir, &["commit", "--quiet", "-m", "initial"]);
    }

    #[test]
    fn clone_then_update() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let upstream = tmp.path().join("upstream");
        init_repo(&upstream, &[("a.txt", "one\n")]);
        let url = upstream.to_string_lossy().to_string();

        let dest = tmp.path().join("cache/repo_x");
        clone_or_update(&url, "main", &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "one\n");
        let first = head_sha(&dest).unwrap();

        fs::write(upstream.join("b.txt"), "two\n").unwrap();
        git(&upstream, &["add", "."]);
        git(&upstream, &["commit", "--quiet", "-m", "second"]);

        clone_or_update(&url, "main", &dest).unwrap();
        assert!(dest.join("b.txt").exists());
        assert_ne!(head_sha(&dest).unwrap(), first);
    }

    #[test]
    fn unknown_branch_is_fetch_error() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let upstream = tmp.path().join("upstream");
        init_repo(&upstream, &[("a.txt", "one\n")]);

        let err = clone_or_update(
            &upstream.to_string_lossy(),
            "no-such-branch",
            &tmp.path().join("dest"),
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::Fetch(_)));
    }

    #[test]
    fn missing_repository_is_fetch_error() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let err = clone_or_update(
            &tmp.path().join("nowhere").to_string_lossy(),
            "main",
            &tmp.path().join("dest"),
        )
        .unwrap_err();
        assert!(matches!(err, ContextError::Fetch(_)));
    }

    #[test]
    fn option_like_url_is_not_parsed_as_git_option() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("marker");
        let url = format!("--upload-pack=touch {}", marker.display());

        let err = clone_or_update(&url, "main", &tmp.path().join("dest")).unwrap_err();
        assert!(matches!(err, ContextError::Fetch(_)));
        assert!(!marker.exists());
    }

    #[test]
    fn option_like_branch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = clone_or_update("https://example.invalid/r.git", "--help", &tmp.path().join("dest"))
            .unwrap_err();
        assert!(matches!(err, ContextError::Fetch(_)));
        assert!(!tmp.path().join("dest").exists());
    }
}
