// SPDX-License-Identifier: MIT OR Apache-2.0
//! TOML configuration loading and validation for the rosdistro cache
//! server.
//!
//! This crate provides [`RosdistroConfig`] — the top-level runtime
//! settings — together with a loader that applies field-level defaults
//! for any table the TOML document omits entirely.
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// The distribution this server mirrors: which git repository holds the
/// rosdistro index, which named distributions within it are served, and
/// which branch each falls back to when a ref has no distro entry.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DistroConfig {
    /// Clone URL of the rosdistro index repository.
    pub repository: String,
    /// Distribution names this server will resolve (e.g. `["humble", "jazzy"]`).
    #[serde(default)]
    pub distributions: Vec<String>,
    /// Branch names, parallel to `distributions`, used when no ref is given.
    #[serde(default)]
    pub branches: Vec<String>,
    /// `ROS_PYTHON_VERSION` published into the process environment once at
    /// startup, for discovery/build tooling that reads it.
    pub python_version: u32,
}

/// Durable store location.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// SQLite database file path.
    #[serde(default = "default_store_filename")]
    pub filename: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { filename: default_store_filename() }
    }
}

fn default_store_filename() -> String {
    "distro.db".to_string()
}

/// General engine tuning.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GeneralConfig {
    /// Maximum concurrent repository downloads (the global semaphore width).
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { parallelism: default_parallelism() }
    }
}

fn default_parallelism() -> u32 {
    8
}

/// Canonical-serialization metadata allowlist.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Metadata keys permitted to survive canonical JSON/YAML serialization.
    #[serde(default)]
    pub metadata_inclusions: Vec<String>,
}

/// Top-level runtime configuration for the cache server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RosdistroConfig {
    /// Distribution identity and python version.
    pub distro: DistroConfig,
    /// Durable store location.
    #[serde(default)]
    pub database: StoreConfig,
    /// Engine tuning.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Serialization metadata allowlist.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Load a [`RosdistroConfig`] from a TOML file at `path`.
pub fn load_config(path: &Path) -> Result<RosdistroConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let config = parse_toml(&content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a TOML string into a [`RosdistroConfig`].
pub fn parse_toml(content: &str) -> Result<RosdistroConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })
}

/// Validate semantic constraints not expressible in the type itself.
pub fn validate_config(config: &RosdistroConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.distro.repository.trim().is_empty() {
        errors.push("distro.repository must not be empty".to_string());
    }
    if config.general.parallelism == 0 {
        errors.push("general.parallelism must be at least 1".to_string());
    }
    if config.distro.branches.len() > config.distro.distributions.len() {
        errors.push("distro.branches must not be longer than distro.distributions".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

/// Publish `distro.python_version` into `ROS_PYTHON_VERSION` for downstream
/// build tooling. Called once at startup.
///
/// # Safety
/// Mutating the process environment is inherently racy with respect to
/// other threads reading it; callers must perform this before spawning any
/// worker threads that read environment state.
pub fn publish_python_version(config: &RosdistroConfig) {
    // SAFETY: called once during single-threaded startup, before the
    // tokio runtime or any worker threads are spawned.
    unsafe {
        std::env::set_var("ROS_PYTHON_VERSION", config.distro.python_version.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
            [distro]
            repository = "https://github.com/ros/rosdistro"
            distributions = ["humble"]
            branches = ["master"]
            python_version = 3
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = parse_toml(minimal_toml()).unwrap();
        assert_eq!(cfg.distro.repository, "https://github.com/ros/rosdistro");
        assert_eq!(cfg.database.filename, "distro.db");
        assert_eq!(cfg.general.parallelism, 8);
        assert!(cfg.cache.metadata_inclusions.is_empty());
    }

    #[test]
    fn overrides_defaults_when_present() {
        let toml_str = format!(
            "{}\n[database]\nfilename = \"custom.db\"\n[general]\nparallelism = 2\n[cache]\nmetadata_inclusions = [\"ci\"]\n",
            minimal_toml()
        );
        let cfg = parse_toml(&toml_str).unwrap();
        assert_eq!(cfg.database.filename, "custom.db");
        assert_eq!(cfg.general.parallelism, 2);
        assert_eq!(cfg.cache.metadata_inclusions, vec!["ci".to_string()]);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("this is [not valid toml =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn missing_distro_table_gives_parse_error() {
        let err = parse_toml("").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_zero_parallelism() {
        let mut cfg = parse_toml(minimal_toml()).unwrap();
        cfg.general.parallelism = 0;
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_empty_repository() {
        let mut cfg = parse_toml(minimal_toml()).unwrap();
        cfg.distro.repository = "  ".to_string();
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_branches_longer_than_distributions() {
        let mut cfg = parse_toml(minimal_toml()).unwrap();
        cfg.distro.branches.push("extra".to_string());
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Path::new("/nonexistent/colcon-distro.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colcon-distro.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{}", minimal_toml()).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.distro.python_version, 3);
    }

    #[test]
    fn publish_python_version_sets_env() {
        let cfg = parse_toml(minimal_toml()).unwrap();
        publish_python_version(&cfg);
        assert_eq!(std::env::var("ROS_PYTHON_VERSION").unwrap(), "3");
    }
}
