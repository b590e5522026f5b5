//! Local filesystem backend: `file://<abs-path>`, read through the system
//! `git` binary against a checkout that already exists on disk.

use crate::DownloadError;
use std::path::{Path, PathBuf};

pub fn repo_path(url: &str) -> PathBuf {
    crate::file_regex().captures(url).map(|c| PathBuf::from(&c["path"])).unwrap_or_else(|| PathBuf::from(url))
}

pub async fn get_file(url: &str, version: &str, path: &str) -> Result<Vec<u8>, DownloadError> {
    let repo = repo_path(url);
    Ok(rosdistro_git::show_file(&repo, version, path).await?)
}

pub async fn download_all(url: &str, version: &str, dest: &Path, limit_paths: &[String]) -> Result<(), DownloadError> {
    let repo = repo_path(url);
    let paths: Vec<String> = if limit_paths.iter().any(|p| p == ".") { Vec::new() } else { limit_paths.to_vec() };
    Ok(rosdistro_git::archive_to(&repo, version, dest, &paths).await?)
}
