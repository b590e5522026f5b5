//! GitLab tarball backend, plus its LFS batch API.
//!
//! `server` is the whole host (`gitlab.com`, or a self-hosted instance whose
//! hostname starts with `gitlab.`); `path` is the project path with no
//! leading/trailing slash, URL-encoded as GitLab's API requires.

use super::tarball_pipeline;
use crate::DownloadError;
use std::path::Path;

fn parse(url: &str) -> Result<(String, String), DownloadError> {
    let caps = crate::gitlab_regex().captures(url).ok_or_else(|| DownloadError::UnrecognizedUrl(url.to_string()))?;
    Ok((caps["server"].to_string(), caps["path"].to_string()))
}

fn private_token() -> String {
    std::env::var("GITLAB_PRIVATE_TOKEN").unwrap_or_default()
}

const QUOTE: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

fn project_quoted(path: &str) -> String {
    percent_encoding::utf8_percent_encode(path, QUOTE).to_string()
}

pub async fn get_file(url: &str, version: &str, path: &str) -> Result<Vec<u8>, DownloadError> {
    let (server, project) = parse(url)?;
    let project_quoted = project_quoted(&project);
    let path_quoted = percent_encoding::utf8_percent_encode(path, QUOTE);
    let file_url = format!("https://{server}/api/v4/projects/{project_quoted}/repository/files/{path_quoted}/raw?ref={version}");
    let token = private_token();
    let headers = if token.is_empty() { vec![] } else { vec![("Private-Token".to_string(), token)] };
    super::http_get_bytes(&file_url, &headers).await
}

pub async fn download_all(url: &str, version: &str, dest: &Path, limit_paths: &[String]) -> Result<(), DownloadError> {
    let (server, project) = parse(url)?;
    let project_quoted = project_quoted(&project);
    let tarball_url = format!("https://{server}/api/v4/projects/{project_quoted}/repository/archive.tar.gz?sha={version}");
    let token = private_token();
    let headers = if token.is_empty() { vec![] } else { vec![("Private-Token".to_string(), token)] };

    let file_list = tarball_pipeline(&tarball_url, &headers, dest, limit_paths).await?;

    let objects = crate::lfs::scan(dest, &file_list)?;
    if !objects.is_empty() && !token.is_empty() {
        let batch_url = format!("https://{server}/{project}.git/info/lfs/objects/batch");
        crate::lfs::download_all(&batch_url, version, &token, objects).await?;
    }
    Ok(())
}
