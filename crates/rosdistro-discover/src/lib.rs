// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Ament `package.xml` discovery.
//!
//! [`AmentDiscoverer`] walks an extracted repository tree and produces one
//! [`PackageDescriptor`] per `package.xml` found, skipping VCS and build
//! output directories. Malformed XML in a single file is logged and
//! skipped rather than aborting discovery of the rest of the tree.

use quick_xml::events::Event;
use quick_xml::Reader;
use rosdistro_descriptors::{DependencyKind, PackageDescriptor};
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

const SKIP_DIRS: [&str; 4] = [".git", "build", "install", "log"];

/// Discovers ROS/ament packages by walking a checked-out tree for
/// `package.xml` manifests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmentDiscoverer;

impl AmentDiscoverer {
    /// Walk `root` and return a descriptor for every `package.xml` found.
    /// Paths on returned descriptors are absolute; the caller is
    /// responsible for narrowing them to be relative to the repository
    /// root before persisting.
    pub fn discover(&self, root: &Path) -> Vec<PackageDescriptor> {
        let mut out = Vec::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|e| !is_skipped(e));
        for entry in walker.flatten() {
            if entry.file_name() != "package.xml" {
                continue;
            }
            let pkg_dir = match entry.path().parent() {
                Some(p) => p,
                None => continue,
            };
            match parse_package_xml(entry.path()) {
                Ok(mut pkg) => {
                    pkg.path = pkg_dir.to_path_buf();
                    pkg.package_type = detect_type(pkg_dir);
                    out.push(pkg);
                }
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), %err, "skipping malformed package.xml");
                }
            }
        }
        out
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name().to_str().map(|n| SKIP_DIRS.contains(&n)).unwrap_or(false)
}

fn detect_type(pkg_dir: &Path) -> String {
    if pkg_dir.join("CMakeLists.txt").exists() {
        "cmake".to_string()
    } else if pkg_dir.join("setup.py").exists() {
        "ament_python".to_string()
    } else {
        "unknown".to_string()
    }
}

/// Errors parsing a single `package.xml`.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The underlying XML was not well-formed.
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    /// The document had no `<name>` element under `<package>`.
    #[error("package.xml has no <name> element")]
    MissingName,
}

fn dependency_kinds(tag: &str) -> &'static [DependencyKind] {
    match tag {
        "build_depend" => &[DependencyKind::Build],
        "exec_depend" | "run_depend" => &[DependencyKind::Run],
        "test_depend" => &[DependencyKind::Test],
        "depend" => &[DependencyKind::Build, DependencyKind::Run, DependencyKind::Test],
        _ => &[],
    }
}

fn parse_package_xml(path: &Path) -> Result<PackageDescriptor, ParseError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ParseError::Xml(quick_xml::Error::Io(std::sync::Arc::new(e))))?;
    let mut reader = Reader::from_str(&contents);
    reader.config_mut().trim_text = true;

    let mut pkg = PackageDescriptor::default();
    let mut package_format = "1".to_string();
    let mut current_tag: Option<String> = None;
    let mut name_found = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if tag == "package" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"format" {
                            package_format = String::from_utf8_lossy(&attr.value).into_owned();
                        }
                    }
                }
                current_tag = Some(tag);
            }
            Event::Empty(e) => {
                current_tag = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Event::Text(e) => {
                if let Some(tag) = current_tag.as_deref() {
                    let text = e.unescape()?.into_owned();
                    if tag == "name" && !name_found {
                        pkg.name = text.trim().to_string();
                        name_found = true;
                    } else {
                        for kind in dependency_kinds(tag) {
                            let dep = text.trim();
                            if !dep.is_empty() && dep != pkg.name {
                                pkg.add_dependency(*kind, dep);
                            }
                        }
                    }
                }
            }
            Event::End(_) => {
                current_tag = None;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !name_found {
        return Err(ParseError::MissingName);
    }
    pkg.metadata.insert("package_format".to_string(), serde_json::Value::String(package_format));
    Ok(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn discovers_cmake_package_with_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "pkgs/foo/package.xml",
            r#"<?xml version="1.0"?>
            <package format="3">
              <name>foo</name>
              <build_depend>rclcpp</build_depend>
              <depend>ament_cmake</depend>
              <test_depend>gtest</test_depend>
            </package>"#,
        );
        write(dir.path(), "pkgs/foo/CMakeLists.txt", "");

        let packages = AmentDiscoverer.discover(dir.path());
        assert_eq!(packages.len(), 1);
        let pkg = &packages[0];
        assert_eq!(pkg.name, "foo");
        assert_eq!(pkg.package_type, "cmake");
        assert_eq!(pkg.metadata["package_format"], serde_json::json!("3"));

        let build: Vec<&str> = pkg.dependencies[&DependencyKind::Build].iter().map(|s| s.as_str()).collect();
        assert!(build.contains(&"rclcpp"));
        assert!(build.contains(&"ament_cmake"));
        assert!(pkg.dependencies[&DependencyKind::Run].contains(&"ament_cmake".to_string()));
        assert!(pkg.dependencies[&DependencyKind::Test].contains(&"gtest".to_string()));
    }

    #[test]
    fn detects_python_package_without_cmakelists() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkgs/bar/package.xml", "<package><name>bar</name></package>");
        write(dir.path(), "pkgs/bar/setup.py", "");

        let packages = AmentDiscoverer.discover(dir.path());
        assert_eq!(packages[0].package_type, "ament_python");
    }

    #[test]
    fn unknown_type_without_build_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkgs/baz/package.xml", "<package><name>baz</name></package>");
        let packages = AmentDiscoverer.discover(dir.path());
        assert_eq!(packages[0].package_type, "unknown");
    }

    #[test]
    fn skips_build_and_git_directories() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "build/package.xml", "<package><name>ghost</name></package>");
        write(dir.path(), ".git/package.xml", "<package><name>ghost2</name></package>");
        let packages = AmentDiscoverer.discover(dir.path());
        assert!(packages.is_empty());
    }

    #[test]
    fn malformed_xml_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkgs/good/package.xml", "<package><name>good</name></package>");
        write(dir.path(), "pkgs/bad/package.xml", "<package><name>unterminated");
        let packages = AmentDiscoverer.discover(dir.path());
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "good");
    }

    #[test]
    fn self_dependency_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "pkgs/self/package.xml", "<package><name>self</name><depend>self</depend></package>");
        let packages = AmentDiscoverer.discover(dir.path());
        assert!(packages[0].dependencies.is_empty());
    }
}
