// SPDX-License-Identifier: MIT OR Apache-2.0
//! Value types for package and repository descriptors.
//!
//! [`PackageDescriptor`] and [`RepositoryDescriptor`] are the canonical,
//! content-addressable records this cache produces. Serialization is
//! deliberately hand-rolled rather than derived from `#[derive(Serialize)]`
//! so that dependency lists and package lists can be sorted on the way out,
//! guaranteeing byte-identical output for equal logical content.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The three dependency kinds a [`PackageDescriptor`] may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Needed to build the package.
    Build,
    /// Needed at runtime.
    Run,
    /// Needed only to run the package's tests.
    Test,
}

impl DependencyKind {
    /// All kinds, in the fixed order used by canonical serialization.
    pub const ALL: [DependencyKind; 3] =
        [DependencyKind::Build, DependencyKind::Run, DependencyKind::Test];

    fn as_str(self) -> &'static str {
        match self {
            DependencyKind::Build => "build",
            DependencyKind::Run => "run",
            DependencyKind::Test => "test",
        }
    }
}

/// A single source package discovered inside a repository.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageDescriptor {
    /// Package name, unique within its containing repository.
    pub name: String,
    /// Path to the package, relative to the repository root.
    pub path: PathBuf,
    /// Build-system tag (e.g. `"cmake"`, `"ament_python"`).
    pub package_type: String,
    /// Dependency names per kind, insertion order not significant — sorted
    /// on serialization.
    pub dependencies: BTreeMap<DependencyKind, Vec<String>>,
    /// Small scalar/structured values attached by discovery or augmentation.
    /// Only keys present in the store's metadata allowlist survive
    /// serialization.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PackageDescriptor {
    /// Create a new, empty descriptor for `name` at `path`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, package_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            package_type: package_type.into(),
            dependencies: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a dependency name under `kind`, deduplicating within that kind.
    pub fn add_dependency(&mut self, kind: DependencyKind, name: impl Into<String>) {
        let name = name.into();
        let list = self.dependencies.entry(kind).or_default();
        if !list.contains(&name) {
            list.push(name);
        }
    }

    /// Re-root `path` to be relative to `repo_root`, if it is currently
    /// absolute under it. No-op if `path` is already relative or does not
    /// start with `repo_root`.
    pub fn relativize(&mut self, repo_root: &Path) {
        if let Ok(rel) = self.path.strip_prefix(repo_root) {
            self.path = rel.to_path_buf();
        }
    }

    /// Canonical JSON form: `name`, `path`, `type`, `depends` always
    /// present; `depends[kind]` lists sorted ascending; `metadata` present
    /// only when `metadata_inclusions` is non-empty, restricted to that
    /// allowlist.
    pub fn to_canonical_json(&self, metadata_inclusions: &[String]) -> serde_json::Value {
        let mut depends = serde_json::Map::new();
        for kind in DependencyKind::ALL {
            if let Some(list) = self.dependencies.get(&kind) {
                if list.is_empty() {
                    continue;
                }
                let mut sorted = list.clone();
                sorted.sort();
                depends.insert(
                    kind.as_str().to_string(),
                    serde_json::Value::Array(sorted.into_iter().map(serde_json::Value::String).collect()),
                );
            }
        }

        let mut obj = serde_json::Map::new();
        obj.insert("name".into(), serde_json::Value::String(self.name.clone()));
        obj.insert(
            "path".into(),
            serde_json::Value::String(self.path.to_string_lossy().into_owned()),
        );
        obj.insert("type".into(), serde_json::Value::String(self.package_type.clone()));
        obj.insert("depends".into(), serde_json::Value::Object(depends));

        if !metadata_inclusions.is_empty() {
            let mut meta = serde_json::Map::new();
            for key in metadata_inclusions {
                if let Some(v) = self.metadata.get(key) {
                    meta.insert(key.clone(), v.clone());
                }
            }
            obj.insert("metadata".into(), serde_json::Value::Object(meta));
        }

        serde_json::Value::Object(obj)
    }

    /// Reconstruct a descriptor from its canonical JSON form.
    pub fn from_canonical_json(value: &serde_json::Value) -> Result<Self, DescriptorError> {
        let obj = value.as_object().ok_or(DescriptorError::Malformed("package is not an object"))?;
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or(DescriptorError::Malformed("package missing name"))?
            .to_string();
        let path = obj
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or(DescriptorError::Malformed("package missing path"))?;
        let package_type = obj
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or(DescriptorError::Malformed("package missing type"))?
            .to_string();

        let mut pd = PackageDescriptor::new(name, path, package_type);

        if let Some(depends) = obj.get("depends").and_then(|v| v.as_object()) {
            for (kind_str, list) in depends {
                let kind = match kind_str.as_str() {
                    "build" => DependencyKind::Build,
                    "run" => DependencyKind::Run,
                    "test" => DependencyKind::Test,
                    _ => return Err(DescriptorError::Malformed("unknown dependency kind")),
                };
                for dep in list.as_array().into_iter().flatten() {
                    if let Some(s) = dep.as_str() {
                        pd.add_dependency(kind, s);
                    }
                }
            }
        }

        if let Some(meta) = obj.get("metadata").and_then(|v| v.as_object()) {
            for (k, v) in meta {
                pd.metadata.insert(k.clone(), v.clone());
            }
        }

        Ok(pd)
    }
}

/// Version-control system tag for a [`RepositoryDescriptor`]. Only `git` is
/// currently supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryType {
    /// A Git repository.
    Git,
}

impl RepositoryType {
    fn as_str(self) -> &'static str {
        match self {
            RepositoryType::Git => "git",
        }
    }
}

impl std::str::FromStr for RepositoryType {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(RepositoryType::Git),
            _ => Err(DescriptorError::Malformed("unknown repository type")),
        }
    }
}

/// The identity tuple that determines equality, hashing, and store lookups
/// for a [`RepositoryDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryIdentity {
    /// Repository name as declared in the distribution.
    pub name: String,
    /// VCS kind.
    pub repository_type: RepositoryType,
    /// Clone/fetch URL.
    pub url: String,
    /// Resolved version (immutable commit hash once stored).
    pub version: String,
}

/// A single repository pinned at a version, plus the packages it was
/// discovered to contain.
///
/// The `path` field is only valid while a working copy is checked out under
/// a scoped download (see `rosdistro_fetcher::Fetcher::scoped`); it must be
/// cleared before the descriptor is persisted.
#[derive(Debug, Clone, Default)]
pub struct RepositoryDescriptor {
    /// Repository name as declared in the distribution.
    pub name: Option<String>,
    /// VCS kind.
    pub repository_type: Option<RepositoryType>,
    /// Clone/fetch URL.
    pub url: Option<String>,
    /// Symbolic ref at discovery time, resolved to a commit hash before
    /// storage.
    pub version: Option<String>,
    /// Working-directory path, populated only during a scoped download.
    pub path: Option<PathBuf>,
    /// Packages discovered inside this repository.
    pub packages: Vec<PackageDescriptor>,
    /// Small scalar/structured values, including the store-assigned
    /// `repo_state_id` after persistence.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Errors raised by malformed or incomplete descriptor operations.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    /// A canonical JSON document did not have the expected shape.
    #[error("malformed descriptor: {0}")]
    Malformed(&'static str),

    /// An operation that requires a complete identity (equality, hashing,
    /// store lookup) was attempted on a descriptor missing one or more of
    /// `name`, `type`, `url`, `version`.
    #[error("repository descriptor has incomplete identity")]
    IncompleteIdentity,
}

impl RepositoryDescriptor {
    /// Construct a descriptor from a distribution entry's `name` and
    /// `source` block (`type`, `url`, `version`).
    pub fn from_distro_entry(name: impl Into<String>, repository_type: RepositoryType, url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            repository_type: Some(repository_type),
            url: Some(url.into()),
            version: Some(version.into()),
            path: None,
            packages: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// The identity tuple, or `None` if any required field is unset.
    ///
    /// Per the data model's invariant, callers must treat an incomplete
    /// identity as a programming error rather than attempting recovery.
    pub fn identity(&self) -> Option<RepositoryIdentity> {
        Some(RepositoryIdentity {
            name: self.name.clone()?,
            repository_type: self.repository_type?,
            url: self.url.clone()?,
            version: self.version.clone()?,
        })
    }

    /// `true` if [`Self::identity`] would succeed.
    pub fn has_identity(&self) -> bool {
        self.identity().is_some()
    }

    /// Panics with a descriptive message if the identity is incomplete.
    /// Equality and hashing on an identity-less descriptor are programming
    /// errors per the data model, so this is the fail-loudly path rather
    /// than a recoverable `Result`.
    pub fn require_identity(&self) -> RepositoryIdentity {
        self.identity().expect("repository descriptor identity is required but incomplete")
    }

    /// Clear the transient `path` field. Must be called on release of a
    /// scoped working directory.
    pub fn clear_path(&mut self) {
        self.path = None;
    }

    /// Canonical JSON form: `type`, `url`, `version`, `packages` (sorted by
    /// name) always present; `metadata` present only when
    /// `metadata_inclusions` is non-empty.
    pub fn to_canonical_json(&self, metadata_inclusions: &[String]) -> serde_json::Value {
        let mut packages: Vec<&PackageDescriptor> = self.packages.iter().collect();
        packages.sort_by(|a, b| a.name.cmp(&b.name));

        let mut obj = serde_json::Map::new();
        obj.insert(
            "type".into(),
            serde_json::Value::String(self.repository_type.map(RepositoryType::as_str).unwrap_or_default().to_string()),
        );
        obj.insert("url".into(), serde_json::Value::String(self.url.clone().unwrap_or_default()));
        obj.insert("version".into(), serde_json::Value::String(self.version.clone().unwrap_or_default()));
        obj.insert(
            "packages".into(),
            serde_json::Value::Array(
                packages
                    .into_iter()
                    .map(|p| p.to_canonical_json(metadata_inclusions))
                    .collect(),
            ),
        );

        if !metadata_inclusions.is_empty() {
            let mut meta = serde_json::Map::new();
            for key in metadata_inclusions {
                if let Some(v) = self.metadata.get(key) {
                    meta.insert(key.clone(), v.clone());
                }
            }
            obj.insert("metadata".into(), serde_json::Value::Object(meta));
        }

        serde_json::Value::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_dependencies_and_packages() {
        let mut a = PackageDescriptor::new("a", "pkgs/a", "cmake");
        a.add_dependency(DependencyKind::Build, "z");
        a.add_dependency(DependencyKind::Build, "a");

        let b = PackageDescriptor::new("b", "pkgs/b", "cmake");
        let c = PackageDescriptor::new("c", "pkgs/c", "cmake");

        let mut repo = RepositoryDescriptor::from_distro_entry("r", RepositoryType::Git, "u", "v");
        repo.packages = vec![b, a, c];

        let json = repo.to_canonical_json(&[]);
        let names: Vec<&str> = json["packages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let build_deps = json["packages"][0]["depends"]["build"].as_array().unwrap();
        let build_deps: Vec<&str> = build_deps.iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(build_deps, vec!["a", "z"]);
    }

    #[test]
    fn metadata_dropped_without_allowlist() {
        let mut pd = PackageDescriptor::new("a", "pkgs/a", "cmake");
        pd.metadata.insert("secret".into(), serde_json::json!(42));
        let json = pd.to_canonical_json(&[]);
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn metadata_restricted_to_allowlist() {
        let mut pd = PackageDescriptor::new("a", "pkgs/a", "cmake");
        pd.metadata.insert("keep".into(), serde_json::json!(1));
        pd.metadata.insert("drop".into(), serde_json::json!(2));
        let json = pd.to_canonical_json(&["keep".to_string()]);
        assert_eq!(json["metadata"]["keep"], serde_json::json!(1));
        assert!(json["metadata"].get("drop").is_none());
    }

    #[test]
    fn round_trip_package_json() {
        let mut pd = PackageDescriptor::new("a", "pkgs/a", "cmake");
        pd.add_dependency(DependencyKind::Run, "libfoo");
        let json = pd.to_canonical_json(&[]);
        let back = PackageDescriptor::from_canonical_json(&json).unwrap();
        assert_eq!(back.name, pd.name);
        assert_eq!(back.path, pd.path);
        assert_eq!(back.package_type, pd.package_type);
        assert_eq!(back.dependencies, pd.dependencies);
    }

    #[test]
    fn incomplete_identity_has_no_identity() {
        let rd = RepositoryDescriptor::default();
        assert!(rd.identity().is_none());
        assert!(!rd.has_identity());
    }

    #[test]
    #[should_panic]
    fn require_identity_panics_when_incomplete() {
        let rd = RepositoryDescriptor::default();
        let _ = rd.require_identity();
    }

    #[test]
    fn relativize_strips_repo_root() {
        let mut pd = PackageDescriptor::new("a", "/tmp/work/pkgs/a", "cmake");
        pd.relativize(Path::new("/tmp/work"));
        assert_eq!(pd.path, PathBuf::from("pkgs/a"));
    }
}
