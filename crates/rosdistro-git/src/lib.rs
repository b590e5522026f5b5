// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Thin subprocess wrappers over the system `git` binary.
//!
//! Two operations are needed by the fetcher: resolving a symbolic ref to a
//! commit hash (`git ls-remote`), and reading a single file out of a local
//! checkout at a given revision (`git show`). Both expect `git` on `PATH`.

use thiserror::Error;
use tokio::process::Command;

/// Errors from invoking `git` as a subprocess.
#[derive(Debug, Error)]
pub enum GitError {
    /// The process could not be spawned at all.
    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),

    /// `git ls-remote` produced no output for the requested ref.
    #[error("ref {reference} could not be found in the git remote {url}")]
    RefNotFound {
        /// The remote URL that was queried.
        url: String,
        /// The symbolic ref that was requested.
        reference: String,
    },

    /// `git ls-remote` wrote to stderr, treated as an error per the
    /// upstream tool's convention even when the exit code is zero.
    #[error("unexpected stderr from git ls-remote: {0}")]
    UnexpectedStderr(String),

    /// `git show` (or another subcommand) exited non-zero.
    #[error("git {args:?} failed with exit code {code:?}")]
    NonZeroExit {
        /// Arguments passed to `git`.
        args: Vec<String>,
        /// Process exit code, if available.
        code: Option<i32>,
    },
}

/// Resolve `reference` (a tag, branch, or other symbolic ref) against
/// `url` to a commit hash via `git ls-remote`.
///
/// The first whitespace-delimited token of the first output line is the
/// resolved hash; empty output means the ref does not exist upstream.
pub async fn resolve_version(url: &str, reference: &str) -> Result<String, GitError> {
    tracing::debug!(url, reference, "git ls-remote");
    let output = Command::new("git").args(["ls-remote", url, reference]).output().await?;

    if !output.stderr.is_empty() {
        return Err(GitError::UnexpectedStderr(String::from_utf8_lossy(&output.stderr).into_owned()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let hash = stdout.lines().next().and_then(|line| line.split_whitespace().next());

    match hash {
        Some(h) => Ok(h.to_string()),
        None => Err(GitError::RefNotFound {
            url: url.to_string(),
            reference: reference.to_string(),
        }),
    }
}

/// Read the contents of `path` at `revision` from the local git checkout at
/// `repo_dir`, via `git show <revision>:<path>`.
pub async fn show_file(repo_dir: &std::path::Path, revision: &str, path: &str) -> Result<Vec<u8>, GitError> {
    let spec = format!("{revision}:{path}");
    tracing::debug!(repo_dir = %repo_dir.display(), spec, "git show");
    let output = Command::new("git").arg("show").arg(&spec).current_dir(repo_dir).output().await?;

    if !output.status.success() {
        return Err(GitError::NonZeroExit {
            args: vec!["show".to_string(), spec],
            code: output.status.code(),
        });
    }
    Ok(output.stdout)
}

/// Materialize the tree at `revision` from the local checkout at
/// `repo_dir` into `dest`, optionally limited to `limit_paths`, via
/// `git archive | tar -x`.
pub async fn archive_to(repo_dir: &std::path::Path, revision: &str, dest: &std::path::Path, limit_paths: &[String]) -> Result<(), GitError> {
    tracing::debug!(repo_dir = %repo_dir.display(), revision, dest = %dest.display(), "git archive");
    let mut args = vec!["archive".to_string(), "--format=tar".to_string(), revision.to_string()];
    args.extend(limit_paths.iter().cloned());

    let archive = Command::new("git").args(&args).current_dir(repo_dir).output().await?;
    if !archive.status.success() {
        return Err(GitError::NonZeroExit {
            args,
            code: archive.status.code(),
        });
    }

    tokio::fs::create_dir_all(dest).await?;
    use tokio::io::AsyncWriteExt;
    let mut tar_proc = Command::new("tar").args(["-x"]).current_dir(dest).stdin(std::process::Stdio::piped()).spawn()?;
    tar_proc.stdin.take().expect("tar stdin was piped").write_all(&archive.stdout).await?;
    let status = tar_proc.wait().await?;
    if !status.success() {
        return Err(GitError::NonZeroExit {
            args: vec!["tar".to_string(), "-x".to_string()],
            code: status.code(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &std::path::Path) {
        let run = |args: &[&str]| {
            StdCommand::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@t")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@t")
                .status()
                .unwrap();
        };
        run(&["init", "-q"]);
        std::fs::write(dir.join("package.xml"), "<package/>").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-qm", "initial"]);
    }

    #[tokio::test]
    async fn resolve_version_finds_tag() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        StdCommand::new("git").args(["tag", "v1"]).current_dir(dir.path()).status().unwrap();

        let url = format!("file://{}", dir.path().display());
        let hash = resolve_version(&url, "v1").await.unwrap();
        assert_eq!(hash.len(), 40);
    }

    #[tokio::test]
    async fn resolve_version_missing_ref_errors() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let url = format!("file://{}", dir.path().display());
        let err = resolve_version(&url, "does-not-exist").await.unwrap_err();
        assert!(matches!(err, GitError::RefNotFound { .. }));
    }

    #[tokio::test]
    async fn show_file_reads_blob_at_revision() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let bytes = show_file(dir.path(), "HEAD", "package.xml").await.unwrap();
        assert_eq!(bytes, b"<package/>");
    }
}
