use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::catalog::SnapshotSummary;
use crate::error::{RepoError, Result};

/// Operation a content-type plugin may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Sync,
    Publish,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => f.write_str("sync"),
            Self::Publish => f.write_str("publish"),
        }
    }
}

/// Lifecycle of a sync run.
///
/// `Planning → Fetching → Committing → Done`, with `Failed` reachable from
/// every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Planning,
    Fetching,
    Committing,
    Done,
    Failed,
}

/// Lifecycle of a publish run.
///
/// `Collecting → Rendering → Writing → Done`, with `Failed` reachable from
/// every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishState {
    Collecting,
    Rendering,
    Writing,
    Done,
    Failed,
}

/// Something that failed without aborting the run, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub name: String,
    pub reason: String,
}

impl FailedItem {
    pub fn new(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of a sync run.
///
/// A run that reached `Failed` still returns a report; `error` names the
/// fatal cause.
///
/// # Examples
///
/// ```
/// use pyrepo_core::plugin::{SyncReport, SyncState};
///
/// let report = SyncReport::new("pypi-mirror");
/// assert_eq!(report.state, SyncState::Planning);
/// assert_eq!(report.failed_count(), 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub repository: String,
    pub state: SyncState,
    pub added: usize,
    pub removed: usize,
    /// Additions satisfied from content already in the catalog.
    pub reused: usize,
    /// Artifacts that could not be fetched or parsed.
    pub failed: Vec<FailedItem>,
    /// Projects whose release listing failed.
    pub failed_projects: Vec<FailedItem>,
    /// Head version after the run (`None` if the repository is still empty).
    pub snapshot_version: Option<u64>,
    pub error: Option<String>,
}

impl SyncReport {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            state: SyncState::Planning,
            added: 0,
            removed: 0,
            reused: 0,
            failed: Vec::new(),
            failed_projects: Vec::new(),
            snapshot_version: None,
            error: None,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.state == SyncState::Done
    }
}

/// Outcome of a publish run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishReport {
    pub repository: String,
    pub state: PublishState,
    pub snapshot_version: Option<u64>,
    pub projects: usize,
    pub files_written: usize,
    /// Units left out because their name cannot be published safely
    pub skipped: usize,
    pub error: Option<String>,
}

impl PublishReport {
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            state: PublishState::Collecting,
            snapshot_version: None,
            projects: 0,
            files_written: 0,
            skipped: 0,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == PublishState::Done
    }
}

/// Imports content from a remote source into a repository.
#[async_trait]
pub trait Importer: Send + Sync {
    /// Runs one sync of `repository`.
    ///
    /// Raising `cancel` stops new work; the run then ends `Failed` without
    /// committing.
    async fn sync(&self, repository: &str, cancel: CancellationToken) -> Result<SyncReport>;
}

/// Renders a served index from a repository snapshot.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes the head snapshot of `repository`.
    async fn publish(&self, repository: &str) -> Result<PublishReport>;
}

/// A content-type plugin.
///
/// Each plugin declares its `TYPE` and capability set, and builds importers
/// and publishers from plugin-specific JSON options supplied by the host.
///
/// # Examples
///
/// ```
/// use pyrepo_core::plugin::{Capability, ContentPlugin};
/// use pyrepo_core::catalog::SnapshotSummary;
///
/// struct Readonly;
///
/// impl ContentPlugin for Readonly {
///     fn content_type(&self) -> &'static str {
///         "readonly"
///     }
///
///     fn capabilities(&self) -> &'static [Capability] {
///         &[]
///     }
///
///     fn history(&self, _repository: &str) -> Vec<SnapshotSummary> {
///         vec![]
///     }
/// }
///
/// assert!(Readonly.importer(&serde_json::json!({})).is_err());
/// ```
pub trait ContentPlugin: Send + Sync {
    /// Content type identifier (e.g. "python").
    fn content_type(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Builds an importer from plugin options.
    fn importer(&self, options: &serde_json::Value) -> Result<Box<dyn Importer>> {
        let _ = options;
        Err(unsupported(self.content_type(), Capability::Sync))
    }

    /// Builds a publisher from plugin options.
    fn publisher(&self, options: &serde_json::Value) -> Result<Box<dyn Publisher>> {
        let _ = options;
        Err(unsupported(self.content_type(), Capability::Publish))
    }

    /// Snapshot history of `repository`, oldest first.
    fn history(&self, repository: &str) -> Vec<SnapshotSummary>;
}

fn unsupported(content_type: &str, capability: Capability) -> RepoError {
    RepoError::UnsupportedCapability {
        content_type: content_type.to_string(),
        capability: capability.to_string(),
    }
}

/// Dispatch table of content-type plugins keyed by `TYPE`.
///
/// # Examples
///
/// ```no_run
/// use pyrepo_core::PluginRegistry;
///
/// let registry = PluginRegistry::new();
/// // registry.register(Arc::new(PythonPlugin::new(catalog, store)));
///
/// for content_type in registry.content_types() {
///     println!("Registered: {}", content_type);
/// }
/// ```
#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<&'static str, Arc<dyn ContentPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin, replacing any previous one with the same type.
    pub fn register(&self, plugin: Arc<dyn ContentPlugin>) {
        let content_type = plugin.content_type();
        tracing::debug!(
            "registered content type {} with {:?}",
            content_type,
            plugin.capabilities()
        );
        self.plugins.insert(content_type, plugin);
    }

    /// Looks up a plugin.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::UnknownContentType`] if nothing is registered.
    pub fn get(&self, content_type: &str) -> Result<Arc<dyn ContentPlugin>> {
        self.plugins
            .get(content_type)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| RepoError::UnknownContentType(content_type.to_string()))
    }

    /// Builds an importer for `content_type`, checking the capability first.
    pub fn importer(
        &self,
        content_type: &str,
        options: &serde_json::Value,
    ) -> Result<Box<dyn Importer>> {
        let plugin = self.get(content_type)?;
        if !plugin.supports(Capability::Sync) {
            return Err(unsupported(content_type, Capability::Sync));
        }
        plugin.importer(options)
    }

    /// Builds a publisher for `content_type`, checking the capability first.
    pub fn publisher(
        &self,
        content_type: &str,
        options: &serde_json::Value,
    ) -> Result<Box<dyn Publisher>> {
        let plugin = self.get(content_type)?;
        if !plugin.supports(Capability::Publish) {
            return Err(unsupported(content_type, Capability::Publish));
        }
        plugin.publisher(options)
    }

    /// Registered content types, sorted.
    pub fn content_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.plugins.iter().map(|e| *e.key()).collect();
        types.sort_unstable();
        types
    }
}
