//! Backend implementations. Each backend supplies `get_file` and
//! `download_all`; hosted backends route their archive fetch through
//! [`tarball_pipeline`], a `curl | tar` subprocess pair wired stdout-to-stdin
//! without buffering the archive in process memory.

pub mod bitbucket;
pub mod github;
pub mod gitlab;
pub mod local;

use crate::DownloadError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Run `curl <url>` piped into `tar --extract --gzip --strip-components=1`
/// inside `dest`, honoring `limit_paths` as wildcard filters. Returns the
/// post-extraction file list (tar's verbose stdout, one path per line, with
/// the stripped top component already removed).
pub(crate) async fn tarball_pipeline(url: &str, headers: &[(String, String)], dest: &Path, limit_paths: &[String]) -> Result<Vec<String>, DownloadError> {
    tokio::fs::create_dir_all(dest).await?;

    let mut curl_args: Vec<String> = vec!["-L".into(), "-s".into(), "-f".into()];
    for (k, v) in headers {
        curl_args.push("-H".into());
        curl_args.push(format!("{k}: {v}"));
    }
    curl_args.push(url.to_string());

    let redacted: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
    tracing::debug!(url, headers = ?redacted, "curl tarball fetch");

    let mut tar_args: Vec<String> = vec!["--extract".into(), "--verbose".into(), "--gzip".into(), "--strip-components=1".into()];
    if !limit_paths.is_empty() && !limit_paths.iter().any(|p| p == ".") {
        tar_args.push("--wildcards".into());
        tar_args.push("--no-wildcards-match-slash".into());
        tar_args.extend(limit_paths.iter().map(|p| format!("*/{p}")));
    }

    let mut curl = Command::new("curl").args(&curl_args).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;
    let mut tar = Command::new("tar").args(&tar_args).current_dir(dest).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;

    let mut curl_stdout = curl.stdout.take().expect("curl stdout piped");
    let mut tar_stdin = tar.stdin.take().expect("tar stdin piped");
    let copy = tokio::spawn(async move { tokio::io::copy(&mut curl_stdout, &mut tar_stdin).await });

    let tar_output = tar.wait_with_output().await?;
    let curl_status = curl.wait().await?;
    let _ = copy.await;

    if !curl_status.success() {
        return Err(DownloadError::SubprocessFailed { program: "curl", code: curl_status.code() });
    }
    if !tar_output.status.success() {
        return Err(DownloadError::SubprocessFailed { program: "tar", code: tar_output.status.code() });
    }

    Ok(String::from_utf8_lossy(&tar_output.stdout).lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
}

/// Fetch `url` via a plain GET, returning the body if the response is 200.
pub(crate) async fn http_get_bytes(url: &str, headers: &[(String, String)]) -> Result<Vec<u8>, DownloadError> {
    let client = reqwest::Client::new();
    let mut req = client.get(url);
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }
    let resp = req.send().await?;
    let status = resp.status();
    if status.as_u16() != 200 {
        return Err(DownloadError::HttpStatus { url: url.to_string(), status: status.as_u16() });
    }
    Ok(resp.bytes().await?.to_vec())
}
