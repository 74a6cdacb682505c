//! Git integration: repository materialization and provenance capture.
//!
//! Shells out to the `git` executable; authentication is assumed to be
//! handled by the environment (credential helpers, ssh agent).

use std::path::Path;
use std::process::Command;

use tracing::info;

use crate::error::{Result, SkiffError};

/// Run a git subcommand in `dir`, returning trimmed stdout.
fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| SkiffError::Fetch(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SkiffError::Fetch(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Capture the HEAD commit SHA of the repository containing `dir`, if any.
pub fn head_commit(dir: &Path) -> Option<String> {
    run_git(dir, &["rev-parse", "HEAD"])
        .ok()
        .filter(|sha| !sha.is_empty())
}

/// First remote URL of the repository containing `dir`, if any.
pub fn repo_url(dir: &Path) -> Option<String> {
    run_git(dir, &["remote", "get-url", "origin"])
        .ok()
        .filter(|url| !url.is_empty())
}

/// Whether `version` names a branch in the repository at `dir`. Both local
/// heads and remote-tracking branches count; a detached checkout of a
/// commit SHA does not.
pub fn is_valid_branch(dir: &Path, version: &str) -> bool {
    let verify = |reference: String| {
        run_git(dir, &["rev-parse", "--verify", "--quiet", &reference]).is_ok()
    };
    verify(format!("refs/heads/{version}")) || verify(format!("refs/remotes/origin/{version}"))
}

/// Materialize the repository at `uri` into `dst`, checking out `version`
/// when given, otherwise a branch tracking the remote's default branch.
pub fn fetch_git_repo(uri: &str, version: Option<&str>, dst: &Path) -> Result<()> {
    info!(uri = %uri, dst = %dst.display(), "fetching git project");
    run_git(dst, &["init", "--quiet"])?;
    run_git(dst, &["remote", "add", "origin", uri])?;
    run_git(dst, &["fetch", "--quiet", "origin"])?;

    match version {
        Some(version) => {
            run_git(dst, &["checkout", version]).map_err(|e| {
                SkiffError::Fetch(format!(
                    "unable to checkout version '{version}' of git repo {uri} - please ensure \
                     that the version exists in the repo. Error: {e}"
                ))
            })?;
        }
        None => {
            let branch = default_branch(dst, uri)?;
            run_git(
                dst,
                &["checkout", "-b", &branch, &format!("origin/{branch}")],
            )?;
        }
    }
    Ok(())
}

/// Discover the remote's default branch via its symbolic HEAD.
fn default_branch(dst: &Path, uri: &str) -> Result<String> {
    let listing = run_git(dst, &["ls-remote", "--symref", "origin", "HEAD"])?;
    listing
        .lines()
        .find_map(|line| {
            line.strip_prefix("ref: refs/heads/")
                .and_then(|rest| rest.split_whitespace().next())
                .map(str::to_string)
        })
        .ok_or_else(|| {
            SkiffError::Fetch(format!("could not determine default branch of {uri}"))
        })
}
