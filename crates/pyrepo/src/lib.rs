//! pyrepo host: runs sync and publish tasks for configured repositories.
//!
//! The host owns the catalog and the artifact store, registers the content
//! type plugins, and dispatches each configured repository to its plugin.
//! The catalog is loaded from and saved to `catalog_path` around every run.
//!
//! # Examples
//!
//! ```no_run
//! use pyrepo::{Host, config::HostConfig};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> pyrepo::error::Result<()> {
//! let config = HostConfig::load(Path::new("/etc/pyrepo/pyrepo.json")).await?;
//! let host = Host::open(config).await?;
//!
//! let report = host.run_sync("django", CancellationToken::new()).await?;
//! println!("added {}, removed {}", report.added, report.removed);
//!
//! host.run_publish("django").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;

use pyrepo_core::{
    ArtifactStore, Catalog, FsArtifactStore, PluginRegistry, PublishReport, SnapshotSummary,
    SyncReport,
};
use pyrepo_python::{PythonPackageContent, PythonPlugin};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::error::{HostError, Result};

/// A configured pyrepo instance.
pub struct Host {
    config: HostConfig,
    catalog: Arc<Catalog<PythonPackageContent>>,
    registry: PluginRegistry,
}

impl Host {
    /// Loads the persisted catalog and registers the plugins.
    pub async fn open(config: HostConfig) -> Result<Self> {
        let catalog = Arc::new(Catalog::load(&config.catalog_path).await?);
        let store: Arc<dyn ArtifactStore> =
            Arc::new(FsArtifactStore::new(config.artifact_root.clone()));

        let registry = PluginRegistry::new();
        registry.register(Arc::new(PythonPlugin::new(Arc::clone(&catalog), store)));

        tracing::info!(
            "catalog {} holds {} units",
            config.catalog_path.display(),
            catalog.unit_count()
        );
        Ok(Self {
            config,
            catalog,
            registry,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Configured repository names, sorted.
    pub fn repositories(&self) -> Vec<&str> {
        self.config.repositories.keys().map(String::as_str).collect()
    }

    /// Runs one sync of `repository` and persists the catalog.
    ///
    /// A failed run is reported through [`SyncReport::state`]; errors are
    /// returned only when the run could not be started or its result could
    /// not be saved.
    pub async fn run_sync(
        &self,
        repository: &str,
        cancel: CancellationToken,
    ) -> Result<SyncReport> {
        let settings = self.config.repository(repository)?;
        let options = settings
            .sync
            .as_ref()
            .ok_or_else(|| HostError::MissingOperation {
                repository: repository.to_string(),
                operation: "sync",
            })?;

        let importer = self.registry.importer(&settings.content_type, options)?;
        let report = importer.sync(repository, cancel).await?;

        if let Some(keep) = self.config.keep_snapshots {
            let pruned = self.catalog.prune(repository, keep);
            let orphans = self.catalog.remove_orphans();
            if pruned > 0 {
                tracing::info!(
                    "{}: pruned {} snapshots, dropped {} orphaned units",
                    repository,
                    pruned,
                    orphans
                );
            }
        }

        self.catalog.save(&self.config.catalog_path).await?;
        Ok(report)
    }

    /// Publishes the head snapshot of `repository`.
    pub async fn run_publish(&self, repository: &str) -> Result<PublishReport> {
        let settings = self.config.repository(repository)?;
        let options = settings
            .publish
            .as_ref()
            .ok_or_else(|| HostError::MissingOperation {
                repository: repository.to_string(),
                operation: "publish",
            })?;

        let publisher = self.registry.publisher(&settings.content_type, options)?;
        Ok(publisher.publish(repository).await?)
    }

    /// Snapshot history of `repository`, oldest first.
    pub fn snapshots(&self, repository: &str) -> Result<Vec<SnapshotSummary>> {
        let settings = self.config.repository(repository)?;
        let plugin = self.registry.get(&settings.content_type)?;
        Ok(plugin.history(repository))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(dir: &std::path::Path, repositories: serde_json::Value) -> HostConfig {
        let mut config: HostConfig =
            serde_json::from_value(json!({ "repositories": repositories })).unwrap();
        config.resolve_paths(dir);
        config
    }

    #[tokio::test]
    async fn test_unknown_repository() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::open(config(dir.path(), json!({}))).await.unwrap();

        let err = host
            .run_sync("missing", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::UnknownRepository(_)));
    }

    #[tokio::test]
    async fn test_missing_operation() {
        let dir = tempfile::tempdir().unwrap();
        let repositories = json!({
            "local": { "publish": { "base_path": dir.path().join("www") } }
        });
        let host = Host::open(config(dir.path(), repositories)).await.unwrap();

        let err = host
            .run_sync("local", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HostError::MissingOperation {
                operation: "sync",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let repositories = json!({
            "rpms": { "content_type": "rpm", "publish": { "base_path": "/srv/rpm" } }
        });
        let host = Host::open(config(dir.path(), repositories)).await.unwrap();

        let err = host.run_publish("rpms").await.unwrap_err();
        assert!(matches!(
            err,
            HostError::Repo(pyrepo_core::RepoError::UnknownContentType(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_empty_repository() {
        let dir = tempfile::tempdir().unwrap();
        let www = dir.path().join("www");
        let repositories = json!({ "local": { "publish": { "base_path": www } } });
        let host = Host::open(config(dir.path(), repositories)).await.unwrap();

        let report = host.run_publish("local").await.unwrap();
        assert!(report.is_success());
        assert!(www.join("simple/index.html").exists());
        assert!(host.snapshots("local").unwrap().is_empty());
        assert_eq!(host.repositories(), vec!["local"]);
    }
}
