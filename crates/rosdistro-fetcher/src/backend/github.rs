//! GitHub tarball backend: `https://github.com/<owner>/<repo>[.git]`.

use super::{http_get_bytes, tarball_pipeline};
use crate::DownloadError;
use std::path::Path;

fn parse(url: &str) -> Result<(String, String), DownloadError> {
    let caps = crate::github_regex().captures(url).ok_or_else(|| DownloadError::UnrecognizedUrl(url.to_string()))?;
    Ok((caps["owner"].to_string(), caps["repo"].to_string()))
}

pub async fn get_file(url: &str, version: &str, path: &str) -> Result<Vec<u8>, DownloadError> {
    let (owner, repo) = parse(url)?;
    let raw_url = format!("https://raw.githubusercontent.com/{owner}/{repo}/{version}/{path}");
    http_get_bytes(&raw_url, &[]).await
}

pub async fn download_all(url: &str, version: &str, dest: &Path, limit_paths: &[String]) -> Result<(), DownloadError> {
    let (owner, repo) = parse(url)?;
    let tarball_url = format!("https://github.com/{owner}/{repo}/archive/{version}.tar.gz");
    tarball_pipeline(&tarball_url, &[], dest, limit_paths).await?;
    Ok(())
}
