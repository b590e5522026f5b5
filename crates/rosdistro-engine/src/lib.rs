// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Orchestration of snapshot resolution.
//!
//! [`Engine`] ties together the [`rosdistro_store::Store`], the
//! backend-polymorphic [`rosdistro_fetcher::Fetcher`], the
//! [`rosdistro_discover::AmentDiscoverer`], and a pair of
//! [`rosdistro_coalesce::Coalescer`]s so that concurrent callers asking for
//! the same snapshot or the same repository share one execution instead of
//! racing to violate the store's uniqueness constraints.

use rosdistro_coalesce::Coalescer;
use rosdistro_config::RosdistroConfig;
use rosdistro_descriptors::{PackageDescriptor, RepositoryDescriptor, RepositoryIdentity, RepositoryType};
use rosdistro_fetcher::{DownloadError, Fetcher};
use rosdistro_store::{Store, StoreError};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::Instrument;

const DIST_INDEX_YAML_FILE: &str = "index.yaml";

/// Top-level engine errors. The HTTP front end maps [`EngineError::UnknownDistro`]
/// to 404 and everything else to 500.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No `distribution` entry exists for the requested distro name.
    #[error("unknown distro {dist}")]
    UnknownDistro {
        /// The requested distribution name.
        dist: String,
    },

    /// A download backend failed outside of a scoped materialization
    /// (inside one, failures are caught and logged rather than propagated).
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A YAML document (`index.yaml` or a distribution file) could not be parsed.
    #[error("failed to parse {what} as yaml: {source}")]
    Yaml {
        /// Which document failed to parse.
        what: &'static str,
        /// Underlying parse error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The single-flight map observed a poisoned internal mutex. Fatal,
    /// indicates a prior panic inside coalesced work.
    #[error("single-flight coalescer is in a poisoned state")]
    Coalesce,

    /// A concurrently-coalesced operation this one depended on failed.
    #[error("{0}")]
    Nested(Arc<EngineError>),
}

impl From<Arc<EngineError>> for EngineError {
    fn from(err: Arc<EngineError>) -> Self {
        EngineError::Nested(err)
    }
}

/// Immutable configuration derived once at construction time from
/// [`RosdistroConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Clone URL of the rosdistro index repository.
    pub distro_repository: String,
    /// Metadata keys allowed to survive canonical serialization.
    pub metadata_inclusions: Vec<String>,
    /// Width of the download concurrency semaphore.
    pub parallelism: u32,
}

impl EngineConfig {
    /// Project the fields this crate needs out of the full configuration.
    pub fn from_rosdistro_config(config: &RosdistroConfig) -> Self {
        Self {
            distro_repository: config.distro.repository.clone(),
            metadata_inclusions: config.cache.metadata_inclusions.clone(),
            parallelism: config.general.parallelism,
        }
    }
}

/// Opaque hook invoked after a repository's packages are discovered, before
/// persistence. Spec treats this as an externally supplied collaborator;
/// [`NoopRepositoryAugmentor`] is the default for standalone operation.
#[async_trait::async_trait]
pub trait RepositoryAugmentor: Send + Sync {
    /// Mutate `descriptor`'s metadata (or packages) in place.
    async fn augment(&self, descriptor: &mut RepositoryDescriptor);
}

/// Opaque hook invoked once per discovered package, before persistence.
#[async_trait::async_trait]
pub trait PackageAugmentor: Send + Sync {
    /// Mutate `descriptor`'s metadata in place.
    async fn augment(&self, descriptor: &mut PackageDescriptor);
}

/// A [`RepositoryAugmentor`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRepositoryAugmentor;

#[async_trait::async_trait]
impl RepositoryAugmentor for NoopRepositoryAugmentor {
    async fn augment(&self, _descriptor: &mut RepositoryDescriptor) {}
}

/// A [`PackageAugmentor`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPackageAugmentor;

#[async_trait::async_trait]
impl PackageAugmentor for NoopPackageAugmentor {
    async fn augment(&self, _descriptor: &mut PackageDescriptor) {}
}

struct EngineInner {
    store: Store,
    config: EngineConfig,
    repository_augmentor: Arc<dyn RepositoryAugmentor>,
    package_augmentor: Arc<dyn PackageAugmentor>,
    download_semaphore: Semaphore,
    repo_coalescer: Coalescer<RepositoryIdentity, RepositoryDescriptor, EngineError>,
    set_coalescer: Coalescer<(String, String), Vec<RepositoryDescriptor>, EngineError>,
}

/// Orchestrates `GetSet`/`GetRepoState` across the store, fetcher,
/// discoverer, and coalescer. Cheap to clone — internally `Arc`-backed.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Construct an engine from its configuration, store, and augmentation
    /// hooks. Publishes `ROS_PYTHON_VERSION` into the process environment
    /// exactly once, here, rather than as a module-level side effect.
    pub fn new(config: RosdistroConfig, store: Store, repository_augmentor: Arc<dyn RepositoryAugmentor>, package_augmentor: Arc<dyn PackageAugmentor>) -> Self {
        rosdistro_config::publish_python_version(&config);
        let engine_config = EngineConfig::from_rosdistro_config(&config);
        let parallelism = engine_config.parallelism.max(1) as usize;

        Engine {
            inner: Arc::new(EngineInner {
                store,
                config: engine_config,
                repository_augmentor,
                package_augmentor,
                download_semaphore: Semaphore::new(parallelism),
                repo_coalescer: Coalescer::new(),
                set_coalescer: Coalescer::new(),
            }),
        }
    }

    /// Construct an engine with no-op augmentation hooks, for standalone
    /// operation.
    pub fn with_defaults(config: RosdistroConfig, store: Store) -> Self {
        Self::new(config, store, Arc::new(NoopRepositoryAugmentor), Arc::new(NoopPackageAugmentor))
    }

    /// This engine's derived configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Resolve a snapshot: the set of repository descriptors a
    /// distribution resolves to at `reference`. Single-flighted per
    /// `(dist, stripped-ref)`.
    pub async fn get_set(&self, dist: &str, reference: &str) -> Result<Vec<RepositoryDescriptor>, Arc<EngineError>> {
        let stripped = strip_refs_prefix(reference);
        let key = (dist.to_string(), stripped.clone());
        let span = tracing::info_span!("get_set", dist, reference = %stripped);
        let engine = self.clone();
        let dist_owned = dist.to_string();

        self.inner
            .set_coalescer
            .run(key, async move { engine.resolve_set(dist_owned, stripped).await }.instrument(span))
            .await
    }

    async fn resolve_set(&self, dist: String, stripped_ref: String) -> Result<Vec<RepositoryDescriptor>, EngineError> {
        match self.inner.store.fetch_set(&dist, &stripped_ref).await {
            Ok(descriptors) => {
                tracing::info!(dist = %dist, reference = %stripped_ref, "served snapshot from store");
                return Ok(descriptors);
            }
            Err(StoreError::SetNotFound { .. }) => {}
            Err(e) => return Err(EngineError::Store(e)),
        }

        tracing::info!(dist = %dist, reference = %stripped_ref, "preparing snapshot");

        let fetcher = Fetcher::new(self.inner.config.distro_repository.clone(), stripped_ref.clone())?;
        let resolved_version = fetcher.resolve_version(&stripped_ref).await?;
        let fetcher = Fetcher::new(self.inner.config.distro_repository.clone(), resolved_version)?;

        let index_bytes = fetcher.get_file(DIST_INDEX_YAML_FILE).await?;
        let index: serde_yaml::Value = serde_yaml::from_slice(&index_bytes).map_err(|source| EngineError::Yaml { what: "index", source })?;

        let dist_file_path = index
            .get("distributions")
            .and_then(|d| d.get(dist.as_str()))
            .and_then(|d| d.get("distribution"))
            .and_then(|d| d.as_sequence())
            .and_then(|seq| seq.first())
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::UnknownDistro { dist: dist.clone() })?
            .to_string();

        let dist_bytes = fetcher.get_file(&dist_file_path).await?;
        let dist_doc: serde_yaml::Value = serde_yaml::from_slice(&dist_bytes).map_err(|source| EngineError::Yaml { what: "distribution", source })?;

        let repositories = dist_doc.get("repositories").and_then(|v| v.as_mapping()).cloned().unwrap_or_default();

        let repo_futures = repositories.into_iter().filter_map(|(name, repo)| {
            let name = name.as_str()?.to_string();
            let source = repo.get("source")?;
            let desc = repository_descriptor_from_source(name, source)?;
            Some(self.get_repo_state(desc))
        });

        let results = futures::future::try_join_all(repo_futures).await?;

        let repo_state_ids: Vec<i64> = results
            .iter()
            .map(|d| d.metadata.get("repo_state_id").and_then(|v| v.as_i64()).expect("persisted repo state carries repo_state_id"))
            .collect();

        self.inner.store.insert_set(&dist, &stripped_ref, &repo_state_ids).await?;
        tracing::info!(dist = %dist, reference = %stripped_ref, repo_count = results.len(), "snapshot saved to store");

        Ok(results)
    }

    /// Populate `desc` with its packages and a store-assigned
    /// `repo_state_id`, fetching and discovering it if not already
    /// persisted. `desc` must already carry a complete identity.
    /// Single-flighted per `(name, type, url, version)`.
    pub async fn get_repo_state(&self, desc: RepositoryDescriptor) -> Result<RepositoryDescriptor, Arc<EngineError>> {
        let identity = desc.require_identity();
        let span = tracing::info_span!("get_repo_state", name = %identity.name, version = %identity.version);
        let engine = self.clone();

        self.inner
            .repo_coalescer
            .run(identity, async move { engine.resolve_repo_state(desc).await }.instrument(span))
            .await
    }

    async fn resolve_repo_state(&self, mut desc: RepositoryDescriptor) -> Result<RepositoryDescriptor, EngineError> {
        match self.inner.store.fetch_repo_state(&mut desc).await {
            Ok(()) => {
                tracing::debug!(name = ?desc.name, "served repo state from store");
                return Ok(desc);
            }
            Err(StoreError::RepositoryNotFound(_)) => {}
            Err(e) => return Err(EngineError::Store(e)),
        }

        let permit = self.inner.download_semaphore.acquire().await.expect("download semaphore is never closed");
        let fetcher = Fetcher::from_descriptor(&desc)?;

        match fetcher.scoped(&mut desc, &[]).await {
            Ok(scoped) => {
                let mut packages = rosdistro_discover::AmentDiscoverer.discover(scoped.path());
                for pkg in &mut packages {
                    pkg.relativize(scoped.path());
                    self.inner.package_augmentor.augment(pkg).await;
                }
                desc.packages = packages;
                drop(scoped);
                self.inner.repository_augmentor.augment(&mut desc).await;
            }
            Err(err) => {
                tracing::warn!(name = ?desc.name, url = ?desc.url, %err, "download failed during scoped materialization; persisting empty package list");
                desc.packages = Vec::new();
            }
        }
        drop(permit);

        self.inner.store.insert_repo_state(&mut desc, &self.inner.config.metadata_inclusions).await?;
        Ok(desc)
    }
}

fn strip_refs_prefix(reference: &str) -> String {
    reference.strip_prefix("refs/").unwrap_or(reference).to_string()
}

fn repository_descriptor_from_source(name: String, source: &serde_yaml::Value) -> Option<RepositoryDescriptor> {
    let repo_type = source.get("type").and_then(|v| v.as_str()).unwrap_or("git");
    let repository_type = RepositoryType::from_str(repo_type).ok()?;
    let url = source.get("url").and_then(|v| v.as_str())?.to_string();
    let version = source.get("version").and_then(|v| v.as_str())?.to_string();
    Some(RepositoryDescriptor::from_distro_entry(name, repository_type, url, version))
}
