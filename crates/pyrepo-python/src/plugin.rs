//! The `python` content-type plugin.
//!
//! Builds [`Synchronizer`]s and [`PythonPublisher`]s from host-supplied JSON
//! options and exposes them through the core plugin traits.

use async_trait::async_trait;
use pyrepo_core::{
    ArtifactStore, Capability, Catalog, Content, ContentPlugin, Importer, PublishReport,
    Publisher, RepoError, Result, SnapshotSummary, SyncReport,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::publish::{PublishConfig, PythonPublisher};
use crate::sync::{SyncConfig, Synchronizer};
use crate::types::PythonPackageContent;

/// Python content plugin sharing one catalog and artifact store.
///
/// # Examples
///
/// ```
/// use pyrepo_core::{Catalog, MemoryArtifactStore, PluginRegistry};
/// use pyrepo_python::PythonPlugin;
/// use std::sync::Arc;
///
/// let plugin = PythonPlugin::new(Arc::new(Catalog::new()), Arc::new(MemoryArtifactStore::new()));
/// let registry = PluginRegistry::new();
/// registry.register(Arc::new(plugin));
///
/// assert_eq!(registry.content_types(), vec!["python"]);
/// ```
pub struct PythonPlugin {
    catalog: Arc<Catalog<PythonPackageContent>>,
    store: Arc<dyn ArtifactStore>,
}

impl PythonPlugin {
    pub fn new(
        catalog: Arc<Catalog<PythonPackageContent>>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self { catalog, store }
    }

    pub fn catalog(&self) -> &Arc<Catalog<PythonPackageContent>> {
        &self.catalog
    }
}

fn options<T: DeserializeOwned>(kind: &str, value: &serde_json::Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| RepoError::InvalidConfig(format!("invalid python {} options: {}", kind, e)))
}

impl ContentPlugin for PythonPlugin {
    fn content_type(&self) -> &'static str {
        PythonPackageContent::TYPE
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Sync, Capability::Publish]
    }

    fn importer(&self, value: &serde_json::Value) -> Result<Box<dyn Importer>> {
        let config: SyncConfig = options("sync", value)?;
        let synchronizer =
            Synchronizer::new(config, Arc::clone(&self.catalog), Arc::clone(&self.store))?;
        Ok(Box::new(synchronizer))
    }

    fn publisher(&self, value: &serde_json::Value) -> Result<Box<dyn Publisher>> {
        let config: PublishConfig = options("publish", value)?;
        Ok(Box::new(PythonPublisher::new(
            config,
            Arc::clone(&self.catalog),
            Arc::clone(&self.store),
        )))
    }

    fn history(&self, repository: &str) -> Vec<SnapshotSummary> {
        self.catalog.summaries(repository)
    }
}

#[async_trait]
impl Importer for Synchronizer {
    async fn sync(&self, repository: &str, cancel: CancellationToken) -> Result<SyncReport> {
        Ok(self.run(repository, &cancel).await)
    }
}

#[async_trait]
impl Publisher for PythonPublisher {
    async fn publish(&self, repository: &str) -> Result<PublishReport> {
        Ok(self.run(repository).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrepo_core::{ContentAddress, MemoryArtifactStore, PluginRegistry, PublishState};
    use serde_json::json;

    fn plugin() -> PythonPlugin {
        PythonPlugin::new(Arc::new(Catalog::new()), Arc::new(MemoryArtifactStore::new()))
    }

    #[test]
    fn test_capabilities() {
        let plugin = plugin();
        assert_eq!(plugin.content_type(), "python");
        assert!(plugin.supports(Capability::Sync));
        assert!(plugin.supports(Capability::Publish));
    }

    #[test]
    fn test_importer_from_options() {
        let plugin = plugin();
        let importer = plugin.importer(&json!({
            "remote_url": "https://pypi.org/simple/",
            "projects": ["requests"],
        }));
        assert!(importer.is_ok());
    }

    #[test]
    fn test_invalid_options() {
        let plugin = plugin();

        let err = plugin.importer(&json!({ "projects": "requests" })).err().unwrap();
        assert!(matches!(err, RepoError::InvalidConfig(_)));

        let err = plugin
            .importer(&json!({
                "remote_url": "https://pypi.org/simple/",
                "download_concurrency": 0,
            }))
            .err()
            .unwrap();
        assert!(err.to_string().contains("download_concurrency"));

        let err = plugin
            .importer(&json!({
                "remote_url": "https://pypi.org/simple/",
                "requirements_filter": ["=="],
            }))
            .err()
            .unwrap();
        assert!(matches!(err, RepoError::InvalidConfig(_)));

        let err = plugin.publisher(&json!({})).err().unwrap();
        assert!(err.to_string().contains("publish"));
    }

    #[tokio::test]
    async fn test_dispatch_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(Catalog::new());
        let unit = PythonPackageContent::new(
            "foo-1.0.tar.gz",
            crate::types::PackageType::Sdist,
            ContentAddress::of(b"foo"),
            crate::types::PackageMetadata {
                metadata_version: "2.1".into(),
                name: "foo".into(),
                version: "1.0".into(),
                ..Default::default()
            },
        );
        catalog.commit("local", None, vec![Arc::new(unit)]).unwrap();

        let registry = PluginRegistry::new();
        registry.register(Arc::new(PythonPlugin::new(
            Arc::clone(&catalog),
            Arc::new(MemoryArtifactStore::new()),
        )));

        let publisher = registry
            .publisher(
                "python",
                &json!({ "base_path": dir.path(), "include_artifacts": false }),
            )
            .unwrap();
        let report = publisher.publish("local").await.unwrap();

        assert_eq!(report.state, PublishState::Done);
        assert_eq!(report.projects, 1);
        assert!(dir.path().join("simple/foo/index.html").exists());

        let history = registry.get("python").unwrap().history("local");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content_count, 1);
    }
}
