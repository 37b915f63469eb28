//! Content catalog with append-only repository snapshots.
//!
//! Content units are immutable and shared through `Arc`. Each repository has
//! a history of [`RepositorySnapshot`]s; a commit appends a new snapshot and
//! never touches earlier ones, so readers holding an older snapshot keep a
//! consistent view while writers move the head forward.

use crate::error::{RepoError, Result};
use crate::storage::ContentAddress;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A unit of content managed by the catalog.
///
/// The natural key is globally unique within a catalog (for Python
/// packages it is the artifact filename).
pub trait Content: Send + Sync + 'static {
    /// Content type identifier used for plugin dispatch.
    const TYPE: &'static str;

    /// Globally unique key of this unit.
    fn natural_key(&self) -> &str;

    /// Address of the artifact backing this unit.
    fn artifact(&self) -> &ContentAddress;
}

/// Immutable membership set of one repository version.
///
/// # Examples
///
/// ```
/// use pyrepo_core::catalog::{Catalog, Content};
/// use pyrepo_core::storage::ContentAddress;
/// use std::sync::Arc;
///
/// struct Blob(String, ContentAddress);
///
/// impl Content for Blob {
///     const TYPE: &'static str = "blob";
///     fn natural_key(&self) -> &str { &self.0 }
///     fn artifact(&self) -> &ContentAddress { &self.1 }
/// }
///
/// let catalog = Catalog::new();
/// let unit = Arc::new(Blob("a.bin".into(), ContentAddress::of(b"a")));
/// let snapshot = catalog.commit("repo", None, vec![unit]).unwrap();
///
/// assert_eq!(snapshot.version(), 1);
/// assert!(snapshot.contains("a.bin"));
/// ```
#[derive(Debug)]
pub struct RepositorySnapshot<C> {
    repository: String,
    version: u64,
    content: BTreeMap<String, Arc<C>>,
}

impl<C: Content> RepositorySnapshot<C> {
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Version number, starting at 1 for the first commit.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.content.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Arc<C>> {
        self.content.get(key)
    }

    /// Natural keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.content.keys().map(String::as_str)
    }

    /// Content units in natural-key order.
    pub fn content(&self) -> impl Iterator<Item = &Arc<C>> {
        self.content.values()
    }
}

/// Summary of one snapshot for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub version: u64,
    pub content_count: usize,
}

/// In-process catalog: a content arena plus per-repository histories.
///
/// Writers ([`Catalog::commit`], [`Catalog::prune`] and
/// [`Catalog::remove_orphans`]) serialize on one catalog-wide lock; readers
/// only clone an `Arc` and never wait on a write in progress.
pub struct Catalog<C: Content> {
    units: DashMap<String, Arc<C>>,
    histories: DashMap<String, Vec<Arc<RepositorySnapshot<C>>>>,
    writes: Mutex<()>,
}

impl<C: Content> Default for Catalog<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Content> Catalog<C> {
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            histories: DashMap::new(),
            writes: Mutex::new(()),
        }
    }

    /// The lock guards no data, so a poisoned one is still usable.
    fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current head snapshot of `repository`, if any commit happened.
    pub fn latest(&self, repository: &str) -> Option<Arc<RepositorySnapshot<C>>> {
        self.histories
            .get(repository)
            .and_then(|h| h.last().map(Arc::clone))
    }

    /// Snapshot `version` of `repository`.
    pub fn snapshot(&self, repository: &str, version: u64) -> Option<Arc<RepositorySnapshot<C>>> {
        self.histories.get(repository).and_then(|h| {
            h.iter()
                .find(|s| s.version == version)
                .map(Arc::clone)
        })
    }

    /// All snapshots of `repository`, oldest first.
    pub fn history(&self, repository: &str) -> Vec<Arc<RepositorySnapshot<C>>> {
        self.histories
            .get(repository)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn summaries(&self, repository: &str) -> Vec<SnapshotSummary> {
        self.history(repository)
            .iter()
            .map(|s| SnapshotSummary {
                version: s.version,
                content_count: s.len(),
            })
            .collect()
    }

    /// Repository names, sorted.
    pub fn repositories(&self) -> Vec<String> {
        let mut names: Vec<_> = self.histories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Looks up a content unit by natural key across all repositories.
    pub fn lookup(&self, key: &str) -> Option<Arc<C>> {
        self.units.get(key).map(|u| Arc::clone(u.value()))
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Appends a snapshot containing exactly `content` to `repository`.
    ///
    /// `expected_head` is the version the caller planned against (`None`
    /// for a repository without history). Units whose key is already known
    /// are replaced by the existing `Arc`.
    ///
    /// # Errors
    ///
    /// - [`RepoError::CommitConflict`] if the head moved since planning
    /// - [`RepoError::ContentConflict`] if a key is already bound to a
    ///   different artifact
    ///
    /// Nothing is written when an error is returned.
    pub fn commit(
        &self,
        repository: &str,
        expected_head: Option<u64>,
        content: Vec<Arc<C>>,
    ) -> Result<Arc<RepositorySnapshot<C>>> {
        let _writes = self.write_lock();
        let mut history = self.histories.entry(repository.to_string()).or_default();

        let head = history.last().map(|s| s.version);
        if head != expected_head {
            return Err(RepoError::CommitConflict {
                repository: repository.to_string(),
                expected: expected_head,
                found: head,
            });
        }

        for unit in &content {
            if let Some(existing) = self.units.get(unit.natural_key())
                && existing.artifact() != unit.artifact()
            {
                return Err(RepoError::ContentConflict {
                    key: unit.natural_key().to_string(),
                });
            }
        }

        let mut members = BTreeMap::new();
        for unit in content {
            let key = unit.natural_key().to_string();
            let shared = Arc::clone(self.units.entry(key.clone()).or_insert(unit).value());
            members.insert(key, shared);
        }

        let snapshot = Arc::new(RepositorySnapshot {
            repository: repository.to_string(),
            version: head.map_or(1, |v| v + 1),
            content: members,
        });
        history.push(Arc::clone(&snapshot));

        tracing::info!(
            "committed {} version {} ({} units)",
            repository,
            snapshot.version,
            snapshot.len()
        );
        Ok(snapshot)
    }

    /// Discards all but the newest `keep` snapshots of `repository`.
    ///
    /// Retained snapshots are not modified; returns how many were dropped.
    pub fn prune(&self, repository: &str, keep: usize) -> usize {
        let _writes = self.write_lock();
        let Some(mut history) = self.histories.get_mut(repository) else {
            return 0;
        };
        let excess = history.len().saturating_sub(keep.max(1));
        history.drain(..excess);
        excess
    }

    /// Drops arena units no snapshot references; returns how many.
    ///
    /// Owned child records (classifiers and the like) go with their unit.
    /// The scan and the sweep run under the write lock, so a unit committed
    /// concurrently is never swept.
    pub fn remove_orphans(&self) -> usize {
        let _writes = self.write_lock();
        let referenced: HashSet<String> = self
            .histories
            .iter()
            .flat_map(|h| {
                h.value()
                    .iter()
                    .flat_map(|s| s.keys().map(String::from).collect::<Vec<_>>())
                    .collect::<Vec<_>>()
            })
            .collect();

        let before = self.units.len();
        self.units.retain(|key, _| referenced.contains(key));
        let removed = before - self.units.len();
        if removed > 0 {
            tracing::info!("removed {} orphaned content units", removed);
        }
        removed
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSnapshot {
    version: u64,
    content: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct PersistedCatalog<C> {
    content_type: String,
    units: Vec<C>,
    repositories: BTreeMap<String, Vec<PersistedSnapshot>>,
}

impl<C> Catalog<C>
where
    C: Content + Clone + Serialize + DeserializeOwned,
{
    /// Loads a catalog saved by [`Catalog::save`]; a missing file yields an
    /// empty catalog.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no catalog state at {}", path.display());
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        let persisted: PersistedCatalog<C> = serde_json::from_slice(&data)?;
        if persisted.content_type != C::TYPE {
            return Err(RepoError::UnknownContentType(persisted.content_type));
        }

        let catalog = Self::new();
        for unit in persisted.units {
            catalog
                .units
                .insert(unit.natural_key().to_string(), Arc::new(unit));
        }

        for (repository, snapshots) in persisted.repositories {
            let mut history = Vec::with_capacity(snapshots.len());
            for snapshot in snapshots {
                let mut content = BTreeMap::new();
                for key in snapshot.content {
                    let unit = catalog.lookup(&key).ok_or_else(|| {
                        RepoError::ArtifactNotFound(format!("{} (in {})", key, repository))
                    })?;
                    content.insert(key, unit);
                }
                history.push(Arc::new(RepositorySnapshot {
                    repository: repository.clone(),
                    version: snapshot.version,
                    content,
                }));
            }
            catalog.histories.insert(repository, history);
        }

        Ok(catalog)
    }

    /// Writes the full catalog to `path` atomically.
    ///
    /// Units and histories are captured under the write lock, so the file
    /// never names a key its unit list lacks.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = {
            let _writes = self.write_lock();
            let mut units: Vec<C> = self.units.iter().map(|u| (**u.value()).clone()).collect();
            units.sort_by(|a, b| a.natural_key().cmp(b.natural_key()));

            let repositories = self
                .histories
                .iter()
                .map(|h| {
                    let snapshots = h
                        .value()
                        .iter()
                        .map(|s| PersistedSnapshot {
                            version: s.version,
                            content: s.keys().map(String::from).collect(),
                        })
                        .collect();
                    (h.key().clone(), snapshots)
                })
                .collect();

            let persisted = PersistedCatalog {
                content_type: C::TYPE.to_string(),
                units,
                repositories,
            };
            serde_json::to_vec_pretty(&persisted)?
        };
        crate::fs::write_atomic(path, &data).await?;
        Ok(())
    }
}
