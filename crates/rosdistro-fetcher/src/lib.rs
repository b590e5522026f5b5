// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Backend-polymorphic repository download.
//!
//! A [`Fetcher`] is constructed from a [`RepositoryDescriptor`]'s URL and
//! dispatches to one of four backends: GitHub tarball, Bitbucket tarball,
//! GitLab tarball plus its LFS batch API, or a local git checkout. Hosted
//! backends stream through `curl | tar` subprocess pipelines rather than
//! buffering archives in process memory; the only HTTP call this crate
//! makes directly is the GitLab LFS batch POST.

use regex::Regex;
use rosdistro_descriptors::RepositoryDescriptor;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

mod backend;
mod lfs;
mod scoped;

pub use scoped::Scoped;

/// Errors raised while resolving, downloading, or reading from a backend.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The repository URL did not match any supported backend.
    #[error("unable to determine a download backend for url {0}")]
    UnrecognizedUrl(String),

    /// An HTTP response carried a non-200 status.
    #[error("http {status} fetching {url}")]
    HttpStatus {
        /// The request URL.
        url: String,
        /// The response status code.
        status: u16,
    },

    /// `git ls-remote` (or a hosted equivalent) found no matching ref.
    #[error("ref {reference} could not be found in the git remote")]
    RefNotFound {
        /// The symbolic ref that was requested.
        reference: String,
    },

    /// A subprocess in the download pipeline exited non-zero.
    #[error("{program} exited with code {code:?}")]
    SubprocessFailed {
        /// The program name (`curl`, `tar`, or `git`).
        program: &'static str,
        /// The process exit code, if available.
        code: Option<i32>,
    },

    /// A downloaded LFS object's size did not match its pointer's declared size.
    #[error("lfs object {path} expected size {expected}, got {actual}")]
    LfsSizeMismatch {
        /// Path of the object on disk.
        path: PathBuf,
        /// Size declared by the `.gitattributes`-referenced pointer file.
        expected: u64,
        /// Actual size on disk after download.
        actual: u64,
    },

    /// An LFS pointer file could not be parsed.
    #[error("unable to parse lfs pointer file {0}")]
    MalformedLfsPointer(PathBuf),

    /// The GitLab LFS batch response was missing expected fields.
    #[error("malformed lfs batch response: {0}")]
    MalformedLfsResponse(&'static str),

    /// Underlying git subprocess error.
    #[error(transparent)]
    Git(#[from] rosdistro_git::GitError),

    /// Underlying HTTP client error.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Underlying filesystem/process I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn github_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:https?://github\.com/|git@github\.com:)(?P<owner>[\w.-]+)/(?P<repo>[\w.-]+?)(?:\.git)?/?$").unwrap())
}

fn bitbucket_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://bitbucket\.org/(?P<owner>[\w.-]+)/(?P<repo>[\w.-]+?)(?:\.git)?/?$").unwrap())
}

fn gitlab_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://(?P<server>gitlab\.[\w.-]+)/(?P<path>.+?)(?:\.git)?/?$").unwrap())
}

fn file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^file://(?P<path>/.+)$").unwrap())
}

/// Which backend a [`Fetcher`] was dispatched to, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `github.com` tarball API.
    GitHub,
    /// `bitbucket.org` tarball API, no LFS support.
    Bitbucket,
    /// Self-hosted or `gitlab.com` tarball + LFS batch API.
    GitLab,
    /// Local filesystem checkout, accessed via `git` subprocess.
    LocalGit,
}

/// Downloads a single repository, pinned at a version, from whichever
/// backend its URL identifies.
pub struct Fetcher {
    url: String,
    version: String,
    kind: BackendKind,
}

impl Fetcher {
    /// Construct a fetcher for `url` pinned at `version`, determining the
    /// backend by pattern-matching the URL. Returns
    /// [`DownloadError::UnrecognizedUrl`] if no backend matches.
    pub fn new(url: impl Into<String>, version: impl Into<String>) -> Result<Self, DownloadError> {
        let url = url.into();
        let version = version.into();
        let kind = Self::detect_backend(&url)?;
        Ok(Self { url, version, kind })
    }

    /// Construct a fetcher from a [`RepositoryDescriptor`]. Requires `url`
    /// and `version` to be set.
    pub fn from_descriptor(descriptor: &RepositoryDescriptor) -> Result<Self, DownloadError> {
        let url = descriptor.url.clone().ok_or_else(|| DownloadError::UnrecognizedUrl("<missing url>".to_string()))?;
        let version = descriptor.version.clone().unwrap_or_default();
        Self::new(url, version)
    }

    fn detect_backend(url: &str) -> Result<BackendKind, DownloadError> {
        if github_regex().is_match(url) {
            Ok(BackendKind::GitHub)
        } else if bitbucket_regex().is_match(url) {
            Ok(BackendKind::Bitbucket)
        } else if gitlab_regex().is_match(url) {
            Ok(BackendKind::GitLab)
        } else if file_regex().is_match(url) {
            Ok(BackendKind::LocalGit)
        } else {
            Err(DownloadError::UnrecognizedUrl(url.to_string()))
        }
    }

    /// Which backend this fetcher was dispatched to.
    pub fn backend(&self) -> BackendKind {
        self.kind
    }

    /// Retrieve a single file at the bound version.
    pub async fn get_file(&self, path: &str) -> Result<Vec<u8>, DownloadError> {
        match self.kind {
            BackendKind::GitHub => backend::github::get_file(&self.url, &self.version, path).await,
            BackendKind::Bitbucket => backend::bitbucket::get_file(&self.url, &self.version, path).await,
            BackendKind::GitLab => backend::gitlab::get_file(&self.url, &self.version, path).await,
            BackendKind::LocalGit => backend::local::get_file(&self.url, &self.version, path).await,
        }
    }

    /// Materialize the tree at the bound version into `dest`. When
    /// `limit_paths` is non-empty and does not contain `"."`, only those
    /// subpaths are extracted.
    pub async fn download_all(&self, dest: &Path, limit_paths: &[String]) -> Result<(), DownloadError> {
        match self.kind {
            BackendKind::GitHub => backend::github::download_all(&self.url, &self.version, dest, limit_paths).await,
            BackendKind::Bitbucket => backend::bitbucket::download_all(&self.url, &self.version, dest, limit_paths).await,
            BackendKind::GitLab => backend::gitlab::download_all(&self.url, &self.version, dest, limit_paths).await,
            BackendKind::LocalGit => backend::local::download_all(&self.url, &self.version, dest, limit_paths).await,
        }
    }

    /// Resolve a symbolic ref against this fetcher's URL to a commit hash.
    pub async fn resolve_version(&self, symbolic: &str) -> Result<String, DownloadError> {
        match self.kind {
            BackendKind::LocalGit => {
                let path = backend::local::repo_path(&self.url);
                Ok(rosdistro_git::resolve_version(&format!("file://{}", path.display()), symbolic).await?)
            }
            _ => Ok(rosdistro_git::resolve_version(&self.url, symbolic).await?),
        }
    }

    /// Run `block` with a scoped temporary checkout of this repository,
    /// tearing the directory down on every exit path.
    pub async fn scoped(&self, descriptor: &mut RepositoryDescriptor, limit_paths: &[String]) -> Result<Scoped<'_>, DownloadError> {
        Scoped::new(self, descriptor, limit_paths).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_github() {
        assert_eq!(Fetcher::detect_backend("https://github.com/ros2/rclcpp").unwrap(), BackendKind::GitHub);
        assert_eq!(Fetcher::detect_backend("https://github.com/ros2/rclcpp.git").unwrap(), BackendKind::GitHub);
        assert_eq!(Fetcher::detect_backend("git@github.com:ros2/rclcpp.git").unwrap(), BackendKind::GitHub);
    }

    #[test]
    fn detects_bitbucket() {
        assert_eq!(Fetcher::detect_backend("https://bitbucket.org/owner/repo").unwrap(), BackendKind::Bitbucket);
    }

    #[test]
    fn detects_gitlab() {
        assert_eq!(Fetcher::detect_backend("https://gitlab.com/group/sub/repo").unwrap(), BackendKind::GitLab);
        assert_eq!(Fetcher::detect_backend("https://gitlab.example.org/group/repo").unwrap(), BackendKind::GitLab);
    }

    #[test]
    fn detects_local_file() {
        assert_eq!(Fetcher::detect_backend("file:///var/repos/foo").unwrap(), BackendKind::LocalGit);
    }

    #[test]
    fn unrecognized_url_errors() {
        let err = Fetcher::detect_backend("ssh://example.com/foo").unwrap_err();
        assert!(matches!(err, DownloadError::UnrecognizedUrl(_)));
    }
}
