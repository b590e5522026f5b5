//! Git LFS pointer scanning and batch download, used by the GitLab backend.

use crate::DownloadError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// An LFS object discovered via `.gitattributes`: its content hash, the
/// on-disk pointer file path it should be materialized at, and its declared
/// size.
#[derive(Debug, Clone)]
pub(crate) struct LfsObject {
    pub oid: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Scan the extracted tree's file list for `.gitattributes` files, and for
/// each `filter=lfs` glob entry, parse every matching pointer file.
pub(crate) fn scan(dest: &Path, file_list: &[String]) -> Result<Vec<LfsObject>, DownloadError> {
    let mut objects = Vec::new();
    for rel in file_list {
        if std::path::Path::new(rel).file_name().and_then(|n| n.to_str()) != Some(".gitattributes") {
            continue;
        }
        let attrs_path = dest.join(rel);
        let attrs_dir = attrs_path.parent().unwrap_or(dest).to_path_buf();
        let contents = match std::fs::read_to_string(&attrs_path) {
            Ok(c) => c,
            Err(_) => continue,
        };
        for line in contents.lines() {
            if line.starts_with('#') {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() || !tokens.iter().any(|t| *t == "filter=lfs") {
                continue;
            }
            let mut glob_pattern = tokens[0].to_string();
            if !glob_pattern.contains('/') {
                glob_pattern = format!("**/{glob_pattern}");
            }
            let glob = globset::Glob::new(&glob_pattern).map_err(|_| DownloadError::MalformedLfsPointer(attrs_path.clone()))?.compile_matcher();

            for candidate in walk_dir(&attrs_dir) {
                let rel_to_attrs = candidate.strip_prefix(&attrs_dir).unwrap_or(&candidate);
                if !glob.is_match(rel_to_attrs) {
                    continue;
                }
                if let Some(obj) = parse_pointer(&candidate)? {
                    objects.push(obj);
                }
            }
        }
    }
    Ok(objects)
}

fn walk_dir(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

fn parse_pointer(path: &Path) -> Result<Option<LfsObject>, DownloadError> {
    let contents = std::fs::read_to_string(path).map_err(|_| DownloadError::MalformedLfsPointer(path.to_path_buf()))?;
    let mut lines = contents.lines();
    if lines.next() != Some("version https://git-lfs.github.com/spec/v1") {
        return Ok(None);
    }
    let mut oid = None;
    let mut size = None;
    for line in lines {
        if let Some(rest) = line.strip_prefix("oid sha256:") {
            oid = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("size ") {
            size = rest.parse::<u64>().ok();
        }
    }
    match (oid, size) {
        (Some(oid), Some(size)) => Ok(Some(LfsObject { oid, path: path.to_path_buf(), size })),
        _ => Err(DownloadError::MalformedLfsPointer(path.to_path_buf())),
    }
}

/// POST the batch download request to `batch_url`, then issue a single
/// `curl --config -` invocation to download every object, verifying final
/// sizes against the pointers.
pub(crate) async fn download_all(batch_url: &str, version: &str, token: &str, objects: Vec<LfsObject>) -> Result<(), DownloadError> {
    if objects.is_empty() {
        return Ok(());
    }

    let object_specs: Vec<serde_json::Value> = objects.iter().map(|o| serde_json::json!({"oid": o.oid, "size": o.size})).collect();
    let body = serde_json::json!({
        "operation": "download",
        "objects": object_specs,
        "transfers": ["lfs-standalone-file", "basic"],
        "ref": {"name": version},
    });

    let client = reqwest::Client::new();
    let response = client.post(batch_url).basic_auth("oauth2", Some(token)).json(&body).send().await?;
    let status = response.status();
    if status.as_u16() != 200 {
        return Err(DownloadError::HttpStatus { url: batch_url.to_string(), status: status.as_u16() });
    }
    let parsed: serde_json::Value = response.json().await?;
    let objs = parsed.get("objects").and_then(|v| v.as_array()).ok_or(DownloadError::MalformedLfsResponse("missing objects array"))?;

    let by_oid: BTreeMap<&str, &LfsObject> = objects.iter().map(|o| (o.oid.as_str(), o)).collect();

    let mut curl_config = String::new();
    let mut expected_sizes = Vec::new();
    for entry in objs {
        let oid = entry.get("oid").and_then(|v| v.as_str()).ok_or(DownloadError::MalformedLfsResponse("object missing oid"))?;
        let local = by_oid.get(oid).ok_or(DownloadError::MalformedLfsResponse("batch response named an unrequested object"))?;
        let download = entry
            .get("actions")
            .and_then(|a| a.get("download"))
            .ok_or(DownloadError::MalformedLfsResponse("object missing download action"))?;
        let href = download.get("href").and_then(|v| v.as_str()).ok_or(DownloadError::MalformedLfsResponse("download action missing href"))?;
        if let Some(headers) = download.get("header").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    curl_config.push_str(&format!("header = \"{k}: {v}\"\n"));
                }
            }
        }
        curl_config.push_str(&format!("output = {}\n", local.path.display()));
        curl_config.push_str(&format!("url = {href}\n"));
        expected_sizes.push((local.path.clone(), local.size));
    }

    use tokio::io::AsyncWriteExt;
    let mut curl = tokio::process::Command::new("curl")
        .args(["-K", "-"])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;
    curl.stdin.take().expect("curl stdin piped").write_all(curl_config.as_bytes()).await?;
    let status = curl.wait().await?;
    if !status.success() {
        return Err(DownloadError::SubprocessFailed { program: "curl", code: status.code() });
    }

    for (path, expected) in expected_sizes {
        let actual = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if actual != expected {
            return Err(DownloadError::LfsSizeMismatch { path, expected, actual });
        }
    }

    Ok(())
}
