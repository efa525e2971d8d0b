//! Git plumbing used by the worktree checkout provider.

use std::path::Path;

use tokio::process::Command;

use crate::domain::error::CheckoutError;

/// stderr fragments that indicate lock contention rather than a real failure.
const TRANSIENT_MARKERS: &[&str] = &[
    "index.lock",
    "could not lock",
    "unable to create",
    "another git process",
    "resource temporarily unavailable",
];

fn classify(stderr: &str, what: &str) -> CheckoutError {
    let lower = stderr.to_ascii_lowercase();
    let message = format!("git {what} failed: {}", stderr.trim());
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        CheckoutError::Transient(message)
    } else {
        CheckoutError::Fatal(message)
    }
}

/// Run `git <args>` in `dir`, returning trimmed stdout.
pub async fn git(dir: &Path, args: &[&str]) -> Result<String, CheckoutError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| CheckoutError::Fatal(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify(&stderr, &args.join(" ")));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Resolve a revision (branch, tag, `HEAD`) to a full commit SHA.
pub async fn resolve_revision(repo_dir: &Path, revision: &str) -> Result<String, CheckoutError> {
    let spec = format!("{revision}^{{commit}}");
    let sha = git(repo_dir, &["rev-parse", "--verify", &spec]).await?;
    if sha.is_empty() {
        return Err(CheckoutError::Fatal(format!(
            "git rev-parse {revision} returned empty output"
        )));
    }
    Ok(sha)
}

/// Check whether a directory is inside a git work tree.
pub async fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Porcelain status of a work tree; empty when clean.
pub async fn status_porcelain(dir: &Path) -> Result<String, CheckoutError> {
    git(dir, &["status", "--porcelain", "--untracked-files=all"]).await
}
