// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable store mapping repository identity to descriptor, and snapshot
//! identity to a set of repository identities.
//!
//! Backed by a single SQLite file accessed through one `rusqlite::Connection`
//! guarded by a `tokio::sync::Mutex`; SQLite has no useful notion of
//! concurrent writers, so every operation is serialized through this one
//! handle. A background task closes the connection after a sustained idle
//! period and it is reopened lazily on next use — a resource-conservation
//! heuristic, not a correctness requirement.

use rosdistro_descriptors::{PackageDescriptor, RepositoryDescriptor, RepositoryIdentity, RepositoryType};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const SCHEMA: &str = include_str!("schema.sql");

/// Errors raised by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No set row matches `(dist, ref)`.
    #[error("no snapshot found for {dist}:{reference}")]
    SetNotFound {
        /// Distribution name.
        dist: String,
        /// Version-control reference.
        reference: String,
    },

    /// No repo_states row matches the given identity.
    #[error("no repository state found for {0:?}")]
    RepositoryNotFound(RepositoryIdentity),

    /// Insertion violated the `(name, type, url, version)` uniqueness
    /// constraint. This only happens if a caller bypasses the coalescer;
    /// treated as a fatal programming error rather than a recoverable
    /// signal.
    #[error("unique violation inserting repo state {0:?}")]
    UniqueViolation(RepositoryIdentity),

    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored `packages_json`/`metadata_json` column failed to parse.
    #[error("corrupt stored json: {0}")]
    CorruptJson(String),
}

struct ConnState {
    conn: Option<Connection>,
    last_used: Instant,
}

/// The durable store. Cheap to clone — internally `Arc`-backed.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    state: Arc<Mutex<ConnState>>,
}

impl Store {
    /// Open (creating and initializing if necessary) the store at `path`,
    /// and spawn the idle-connection-closing background task.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let existed = path.exists();
        let conn = Connection::open(&path)?;
        if !existed {
            conn.execute_batch(SCHEMA)?;
            info!(path = %path.display(), "initialized new store database");
        }

        let store = Store {
            path,
            state: Arc::new(Mutex::new(ConnState {
                conn: Some(conn),
                last_used: Instant::now(),
            })),
        };
        store.spawn_idle_closer();
        Ok(store)
    }

    fn spawn_idle_closer(&self) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let mut guard = state.lock().await;
                if guard.conn.is_some() && guard.last_used.elapsed() >= IDLE_TIMEOUT {
                    debug!("closing idle store connection");
                    guard.conn = None;
                }
            }
        });
    }

    async fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send) -> Result<T, StoreError>
    where
        T: Send + 'static,
    {
        let mut guard = self.state.lock().await;
        if guard.conn.is_none() {
            debug!(path = %self.path.display(), "reopening idle-closed store connection");
            guard.conn = Some(Connection::open(&self.path)?);
        }
        guard.last_used = Instant::now();
        let conn = guard.conn.as_ref().expect("connection just ensured present");
        Ok(f(conn)?)
    }

    /// Fetch the stored repository descriptors for a snapshot, ordered by
    /// name. Returns [`StoreError::SetNotFound`] on a cache miss.
    pub async fn fetch_set(&self, dist: &str, reference: &str) -> Result<Vec<RepositoryDescriptor>, StoreError> {
        debug!(dist, reference, "fetch_set query");
        let dist_owned = dist.to_string();
        let ref_owned = reference.to_string();
        let rows: Vec<(String, String, String, String, String, String)> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT repo_states.name, repo_states.type, repo_states.url, repo_states.version, repo_states.metadata_json, repo_states.packages_json
                     FROM repo_states
                     JOIN set_repo_states ON repo_states.id = set_repo_states.repo_state_id
                     JOIN sets ON set_repo_states.set_id = sets.id
                     WHERE sets.dist = ?1 AND sets.ref = ?2
                     ORDER BY repo_states.name ASC",
                )?;
                let rows = stmt
                    .query_map([&dist_owned, &ref_owned], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        debug!(dist, reference, row_count = rows.len(), "fetch_set result");

        if rows.is_empty() {
            // A set may legitimately have zero repositories, but we have
            // no way to distinguish that from "never inserted" without an
            // explicit sets-table lookup.
            let exists: Option<i64> = self
                .with_conn({
                    let dist = dist.to_string();
                    let reference = reference.to_string();
                    move |conn| conn.query_row("SELECT id FROM sets WHERE dist = ?1 AND ref = ?2", [&dist, &reference], |r| r.get(0)).optional()
                })
                .await?;
            if exists.is_none() {
                return Err(StoreError::SetNotFound {
                    dist: dist.to_string(),
                    reference: reference.to_string(),
                });
            }
        }

        rows.into_iter()
            .map(|(name, type_str, url, version, metadata_json, packages_json)| {
                let repository_type = RepositoryType::from_str(&type_str).map_err(|_| StoreError::CorruptJson(format!("unknown repository type {type_str}")))?;
                let packages = parse_packages_json(&packages_json)?;
                let metadata = parse_metadata_json(&metadata_json)?;
                Ok(RepositoryDescriptor {
                    name: Some(name),
                    repository_type: Some(repository_type),
                    url: Some(url),
                    version: Some(version),
                    path: None,
                    packages,
                    metadata,
                })
            })
            .collect()
    }

    /// Populate `desc.packages` and merge the stored `metadata_json` and
    /// `repo_state_id` into `desc.metadata` from the row matching `desc`'s
    /// identity. `desc` must already carry a complete identity.
    pub async fn fetch_repo_state(&self, desc: &mut RepositoryDescriptor) -> Result<(), StoreError> {
        let identity = desc.identity().expect("fetch_repo_state requires a complete identity");
        let type_str = repo_type_str(identity.repository_type);
        debug!(name = %identity.name, version = %identity.version, "fetch_repo_state query");

        let row: Option<(i64, String, String)> = self
            .with_conn({
                let identity = identity.clone();
                move |conn| {
                    conn.query_row(
                        "SELECT id, metadata_json, packages_json FROM repo_states WHERE name = ?1 AND type = ?2 AND url = ?3 AND version = ?4",
                        [&identity.name, type_str, &identity.url, &identity.version],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()
                }
            })
            .await?;

        let Some((id, metadata_json, packages_json)) = row else {
            debug!(name = %identity.name, version = %identity.version, "fetch_repo_state miss");
            return Err(StoreError::RepositoryNotFound(identity));
        };
        debug!(name = %identity.name, version = %identity.version, row_id = id, "fetch_repo_state hit");

        desc.packages = parse_packages_json(&packages_json)?;
        for (key, value) in parse_metadata_json(&metadata_json)? {
            desc.metadata.insert(key, value);
        }
        desc.metadata.insert("repo_state_id".to_string(), serde_json::json!(id));
        Ok(())
    }

    /// Insert a new repo state row for `desc`, which must already have its
    /// `packages` populated and a complete identity. `metadata_inclusions`
    /// restricts which keys of `desc.metadata` and each package's metadata
    /// survive into the stored JSON, mirroring the canonical serialization
    /// allowlist. On success, the assigned row id is written into
    /// `desc.metadata["repo_state_id"]`.
    ///
    /// Fails with [`StoreError::UniqueViolation`] if the identity already
    /// exists — the caller (the engine, via the coalescer) is responsible
    /// for ensuring this never happens under normal operation.
    pub async fn insert_repo_state(&self, desc: &mut RepositoryDescriptor, metadata_inclusions: &[String]) -> Result<(), StoreError> {
        let identity = desc.identity().expect("insert_repo_state requires a complete identity");
        let type_str = repo_type_str(identity.repository_type);
        let packages_json = serde_json::to_string(&desc.packages.iter().map(|p| p.to_canonical_json(metadata_inclusions)).collect::<Vec<_>>())
            .map_err(|e| StoreError::CorruptJson(e.to_string()))?;
        let metadata_json = filtered_metadata_json(&desc.metadata, metadata_inclusions);

        let result = self
            .with_conn({
                let identity = identity.clone();
                let packages_json = packages_json.clone();
                let metadata_json = metadata_json.clone();
                move |conn| {
                    conn.execute("PRAGMA foreign_keys=1", [])?;
                    conn.execute(
                        "INSERT INTO repo_states (name, type, url, version, metadata_json, packages_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        rusqlite::params![&identity.name, type_str, &identity.url, &identity.version, &metadata_json, &packages_json],
                    )?;
                    Ok(conn.last_insert_rowid())
                }
            })
            .await;

        let id = match result {
            Ok(id) => id,
            Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                return Err(StoreError::UniqueViolation(identity));
            }
            Err(e) => return Err(e),
        };

        info!(repo = %identity.name, version = %identity.version, row_id = id, "inserted repo state");
        desc.metadata.insert("repo_state_id".to_string(), serde_json::json!(id));
        Ok(())
    }

    /// Insert the set row and its many-to-many children in one transaction.
    pub async fn insert_set(&self, dist: &str, reference: &str, repo_state_ids: &[i64]) -> Result<(), StoreError> {
        let dist = dist.to_string();
        let reference = reference.to_string();
        let ids = repo_state_ids.to_vec();
        let n = ids.len();
        self.with_conn(move |conn| {
            conn.execute("PRAGMA foreign_keys=1", [])?;
            let tx = conn.unchecked_transaction()?;
            tx.execute("INSERT INTO sets (dist, ref, last_updated) VALUES (?1, ?2, NULL)", [&dist, &reference])?;
            let set_id = tx.last_insert_rowid();
            {
                let mut stmt = tx.prepare("INSERT INTO set_repo_states (set_id, repo_state_id) VALUES (?1, ?2)")?;
                for id in &ids {
                    stmt.execute(rusqlite::params![set_id, id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        info!(dist = %dist, reference = %reference, repo_count = n, "inserted set");
        Ok(())
    }
}

fn repo_type_str(t: RepositoryType) -> &'static str {
    match t {
        RepositoryType::Git => "git",
    }
}

fn parse_packages_json(packages_json: &str) -> Result<Vec<PackageDescriptor>, StoreError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(packages_json).map_err(|e| StoreError::CorruptJson(e.to_string()))?;
    values
        .iter()
        .map(|v| PackageDescriptor::from_canonical_json(v).map_err(|e| StoreError::CorruptJson(e.to_string())))
        .collect()
}

fn filtered_metadata_json(metadata: &BTreeMap<String, serde_json::Value>, metadata_inclusions: &[String]) -> String {
    let mut obj = serde_json::Map::new();
    for key in metadata_inclusions {
        if let Some(value) = metadata.get(key) {
            obj.insert(key.clone(), value.clone());
        }
    }
    serde_json::Value::Object(obj).to_string()
}

fn parse_metadata_json(metadata_json: &str) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
    let value: serde_json::Value = serde_json::from_str(metadata_json).map_err(|e| StoreError::CorruptJson(e.to_string()))?;
    let obj = value.as_object().ok_or_else(|| StoreError::CorruptJson("metadata_json is not an object".to_string()))?;
    Ok(obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosdistro_descriptors::DependencyKind;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("distro.db");
        let store = Store::open(&path).unwrap();
        (dir, store)
    }

    fn sample_repo(name: &str, version: &str) -> RepositoryDescriptor {
        let mut pd = PackageDescriptor::new("pkg_a", "pkg_a", "cmake");
        pd.add_dependency(DependencyKind::Build, "libfoo");
        RepositoryDescriptor {
            name: Some(name.to_string()),
            repository_type: Some(RepositoryType::Git),
            url: Some(format!("https://example.com/{name}.git")),
            version: Some(version.to_string()),
            path: None,
            packages: vec![pd],
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn insert_then_fetch_repo_state_round_trips() {
        let (_dir, store) = temp_store();
        let mut desc = sample_repo("repo_a", "abc123");
        store.insert_repo_state(&mut desc, &[]).await.unwrap();
        assert!(desc.metadata.contains_key("repo_state_id"));

        let mut fetched = RepositoryDescriptor::from_distro_entry("repo_a", RepositoryType::Git, "https://example.com/repo_a.git", "abc123");
        store.fetch_repo_state(&mut fetched).await.unwrap();
        assert_eq!(fetched.packages.len(), 1);
        assert_eq!(fetched.packages[0].name, "pkg_a");
    }

    #[tokio::test]
    async fn insert_then_fetch_repo_state_round_trips_allowlisted_metadata() {
        let (_dir, store) = temp_store();
        let mut desc = sample_repo("repo_a", "abc123");
        desc.metadata.insert("ci".to_string(), serde_json::json!("green"));
        desc.metadata.insert("secret".to_string(), serde_json::json!("nope"));
        desc.packages[0].metadata.insert("ci".to_string(), serde_json::json!(true));

        let inclusions = vec!["ci".to_string()];
        store.insert_repo_state(&mut desc, &inclusions).await.unwrap();

        let mut fetched = RepositoryDescriptor::from_distro_entry("repo_a", RepositoryType::Git, "https://example.com/repo_a.git", "abc123");
        store.fetch_repo_state(&mut fetched).await.unwrap();
        assert_eq!(fetched.metadata.get("ci"), Some(&serde_json::json!("green")));
        assert!(!fetched.metadata.contains_key("secret"));
        assert_eq!(fetched.packages[0].metadata.get("ci"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn duplicate_insert_is_unique_violation() {
        let (_dir, store) = temp_store();
        let mut desc = sample_repo("repo_a", "abc123");
        store.insert_repo_state(&mut desc, &[]).await.unwrap();

        let mut dup = sample_repo("repo_a", "abc123");
        let err = store.insert_repo_state(&mut dup, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn fetch_set_roundtrips_and_orders_by_name() {
        let (_dir, store) = temp_store();
        let mut b = sample_repo("repo_b", "v1");
        let mut a = sample_repo("repo_a", "v1");
        store.insert_repo_state(&mut b, &[]).await.unwrap();
        store.insert_repo_state(&mut a, &[]).await.unwrap();

        let id_a = a.metadata["repo_state_id"].as_i64().unwrap();
        let id_b = b.metadata["repo_state_id"].as_i64().unwrap();
        store.insert_set("noetic", "refs/tags/x", &[id_b, id_a]).await.unwrap();

        let fetched = store.fetch_set("noetic", "refs/tags/x").await.unwrap();
        let names: Vec<&str> = fetched.iter().map(|r| r.name.as_deref().unwrap()).collect();
        assert_eq!(names, vec!["repo_a", "repo_b"]);
    }

    #[tokio::test]
    async fn fetch_set_miss_is_not_found() {
        let (_dir, store) = temp_store();
        let err = store.fetch_set("noetic", "refs/tags/x").await.unwrap_err();
        assert!(matches!(err, StoreError::SetNotFound { .. }));
    }

    #[tokio::test]
    async fn fetch_repo_state_miss_is_not_found() {
        let (_dir, store) = temp_store();
        let mut desc = RepositoryDescriptor::from_distro_entry("missing", RepositoryType::Git, "u", "v");
        let err = store.fetch_repo_state(&mut desc).await.unwrap_err();
        assert!(matches!(err, StoreError::RepositoryNotFound(_)));
    }
}
