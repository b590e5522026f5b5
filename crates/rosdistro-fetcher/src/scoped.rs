//! RAII guard for a scoped, temporary checkout of a repository.

use crate::{DownloadError, Fetcher};
use rosdistro_descriptors::RepositoryDescriptor;
use std::path::{Path, PathBuf};

/// Holds a temporary checkout of a repository for the lifetime of the
/// guard. Sets `descriptor.path` for the guard's lifetime and clears it,
/// deleting the checkout, on drop — including on panics and early returns.
pub struct Scoped<'a> {
    descriptor: &'a mut RepositoryDescriptor,
    dir: PathBuf,
}

impl<'a> Scoped<'a> {
    pub(crate) async fn new(fetcher: &Fetcher, descriptor: &'a mut RepositoryDescriptor, limit_paths: &[String]) -> Result<Scoped<'a>, DownloadError> {
        let tag = sanitize_tag(&fetcher.url);
        let dir = std::env::temp_dir().join(format!("rosdistro-cache--{tag}--{}", uuid::Uuid::new_v4()));
        fetcher.download_all(&dir, limit_paths).await?;
        descriptor.path = Some(dir.clone());
        Ok(Scoped { descriptor, dir })
    }

    /// The temporary checkout's root directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Scoped<'_> {
    fn drop(&mut self) {
        self.descriptor.clear_path();
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.dir.display(), %err, "failed to remove scoped checkout directory");
            }
        }
    }
}

fn sanitize_tag(url: &str) -> String {
    url.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '-' }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_tag_replaces_separators() {
        assert_eq!(sanitize_tag("https://github.com/ros2/rclcpp"), "https---github-com-ros2-rclcpp");
    }
}
