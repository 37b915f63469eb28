//! Core abstractions for pyrepo.
//!
//! This crate provides the content-type independent pieces that every
//! plugin builds on.
//!
//! # Architecture
//!
//! pyrepo-core defines:
//! - **Catalog**: append-only repository snapshots over shared, immutable content units
//! - **Storage**: the content-addressable [`ArtifactStore`] and its filesystem implementation
//! - **HTTP**: a shared client with ETag/Last-Modified validation and bounded retries
//! - **Plugins**: [`ContentPlugin`], [`Importer`], [`Publisher`] and the [`PluginRegistry`]
//! - **Error Types**: [`RepoError`] shared by all content types
//!
//! # Examples
//!
//! Committing content to a repository:
//!
//! ```
//! use pyrepo_core::{Catalog, Content, ContentAddress};
//! use std::sync::Arc;
//!
//! struct Archive {
//!     filename: String,
//!     address: ContentAddress,
//! }
//!
//! impl Content for Archive {
//!     const TYPE: &'static str = "archive";
//!
//!     fn natural_key(&self) -> &str {
//!         &self.filename
//!     }
//!
//!     fn artifact(&self) -> &ContentAddress {
//!         &self.address
//!     }
//! }
//!
//! let catalog = Catalog::new();
//! let unit = Arc::new(Archive {
//!     filename: "data-1.0.tar.gz".into(),
//!     address: ContentAddress::of(b"archive bytes"),
//! });
//!
//! let v1 = catalog.commit("archives", None, vec![unit]).unwrap();
//! let v2 = catalog.commit("archives", Some(1), vec![]).unwrap();
//!
//! assert_eq!(v1.len(), 1);
//! assert!(v2.is_empty());
//! assert_eq!(catalog.history("archives").len(), 2);
//! ```

pub mod catalog;
pub mod error;
pub mod fs;
pub mod http;
pub mod plugin;
pub mod retry;
pub mod storage;

// Re-export commonly used types
pub use catalog::{Catalog, Content, RepositorySnapshot, SnapshotSummary};
pub use error::{RepoError, Result};
pub use http::{CachedResponse, HttpClient, HttpSettings};
pub use plugin::{
    Capability, ContentPlugin, FailedItem, Importer, PluginRegistry, PublishReport, PublishState,
    Publisher, SyncReport, SyncState,
};
pub use retry::{RetryPolicy, Transient};
pub use storage::{ArtifactStore, ContentAddress, FsArtifactStore, MemoryArtifactStore};
