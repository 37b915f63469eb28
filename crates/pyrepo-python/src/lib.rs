//! Python package support for pyrepo.
//!
//! This crate implements the `python` content type: it mirrors projects
//! from a PEP 503 / PEP 691 package index into the catalog and publishes
//! repository snapshots as a static simple index.
//!
//! # Features
//!
//! - **Metadata Parsing**: `PKG-INFO` / `METADATA` headers and legacy `setup.cfg`
//! - **Archive Reading**: wheels, eggs and `.tar.gz` / `.tar.bz2` / `.zip` sdists
//! - **Index Client**: HTML and JSON simple API with verified SHA-256 downloads
//! - **Requirement Filters**: PEP 508 strings matched with PEP 440 specifiers
//! - **Sync**: concurrent fetching with partial-failure semantics and snapshot commits
//! - **Publish**: atomic rendering of the simple index and per-project JSON
//!
//! # Architecture
//!
//! pyrepo-python plugs into pyrepo-core:
//! - **Types**: [`PythonPackageContent`] implements [`pyrepo_core::Content`]
//! - **Sync**: [`Synchronizer`] drives [`IndexClient`] and stores into the catalog
//! - **Publish**: [`PythonPublisher`] renders the head snapshot
//! - **Plugin**: [`PythonPlugin`] exposes both through the core plugin traits
//! - **Error Handling**: Typed errors with `thiserror`
//!
//! # Examples
//!
//! ## Parsing metadata
//!
//! ```
//! use pyrepo_python::metadata::parse_metadata;
//!
//! let pkg_info = "Metadata-Version: 2.1\n\
//!                 Name: Foo_Bar\n\
//!                 Version: 1.0\n\
//!                 Classifier: Programming Language :: Python :: 3\n";
//!
//! let metadata = parse_metadata("Foo_Bar-1.0.tar.gz", pkg_info).unwrap();
//! assert_eq!(metadata.name, "Foo_Bar");
//! assert_eq!(metadata.classifiers.len(), 1);
//! ```
//!
//! ## Syncing and publishing
//!
//! ```no_run
//! use pyrepo_core::{Catalog, FsArtifactStore};
//! use pyrepo_python::{PublishConfig, PythonPublisher, SyncConfig, Synchronizer};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let catalog = Arc::new(Catalog::new());
//! let store = Arc::new(FsArtifactStore::new("/var/lib/pyrepo/artifacts"));
//!
//! let config = SyncConfig {
//!     requirements_filter: vec!["django>=4.2,<5".to_string()],
//!     ..SyncConfig::default()
//! };
//! let synchronizer = Synchronizer::new(config, catalog.clone(), store.clone()).unwrap();
//! let report = synchronizer.run("django", &CancellationToken::new()).await;
//! assert!(report.is_success());
//!
//! let publisher = PythonPublisher::new(PublishConfig::new("/srv/pypi"), catalog, store);
//! publisher.run("django").await;
//! # }
//! ```

pub mod artifact;
pub mod error;
pub mod filter;
pub mod index;
pub mod metadata;
pub mod plugin;
pub mod publish;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use error::{PythonError, Result};
pub use filter::{ReleaseFilter, RequirementFilter};
pub use index::{
    FetchedArtifact, IndexClient, is_safe_filename, is_valid_project_name, normalize_package_name,
};
pub use plugin::PythonPlugin;
pub use publish::{OutputLayout, PublishConfig, PythonPublisher};
pub use sync::{SyncConfig, SyncPolicy, Synchronizer};
pub use types::{Classifier, PackageMetadata, PackageType, PythonPackageContent, ReleaseFile};
