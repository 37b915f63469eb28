//! Content-addressable artifact storage.
//!
//! The host owns artifact storage in production; the engine only needs
//! `store` and `retrieve`. Two implementations are provided: a filesystem
//! store with a fan-out directory layout, and an in-memory store for tests.

use crate::error::{RepoError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Address of a stored artifact: `sha256:<hex digest>`.
///
/// # Examples
///
/// ```
/// use pyrepo_core::storage::ContentAddress;
///
/// let addr = ContentAddress::of(b"hello");
/// assert_eq!(
///     addr.to_string(),
///     "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
/// );
/// assert_eq!(addr.to_string().parse::<ContentAddress>().unwrap(), addr);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentAddress {
    sha256: String,
}

impl ContentAddress {
    /// Address of the given bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            sha256: hex::encode(Sha256::digest(bytes)),
        }
    }

    /// Address from an already computed hex digest.
    ///
    /// The digest is lowercased; anything other than 64 hex characters is rejected.
    pub fn from_sha256(hex_digest: &str) -> Result<Self> {
        let digest = hex_digest.to_ascii_lowercase();
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RepoError::InvalidDigest(hex_digest.to_string()));
        }
        Ok(Self { sha256: digest })
    }

    /// Lowercase hex SHA-256 digest.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.sha256)
    }
}

impl FromStr for ContentAddress {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        let digest = s.strip_prefix("sha256:").unwrap_or(s);
        Self::from_sha256(digest)
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = RepoError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ContentAddress> for String {
    fn from(value: ContentAddress) -> Self {
        value.to_string()
    }
}

/// Artifact store used after digest verification.
///
/// Implementations must be idempotent: storing the same bytes twice yields
/// the same address and keeps a single copy.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` and returns their content address.
    async fn store(&self, bytes: &[u8]) -> Result<ContentAddress>;

    /// Retrieves the bytes stored under `address`.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::ArtifactNotFound`] when nothing is stored there.
    async fn retrieve(&self, address: &ContentAddress) -> Result<Arc<Vec<u8>>>;

    /// Whether `address` is present.
    async fn contains(&self, address: &ContentAddress) -> Result<bool>;
}

/// Filesystem artifact store.
///
/// Artifacts live at `<root>/<aa>/<bb>/<full digest>` and are written with
/// [`write_atomic`](crate::fs::write_atomic), so a crashed write never
/// leaves a truncated artifact under its final address.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, address: &ContentAddress) -> PathBuf {
        let digest = address.sha256();
        self.root.join(&digest[..2]).join(&digest[2..4]).join(digest)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(&self, bytes: &[u8]) -> Result<ContentAddress> {
        let address = ContentAddress::of(bytes);
        let path = self.path_for(&address);
        if tokio::fs::try_exists(&path).await? {
            tracing::debug!("artifact {} already stored", address);
            return Ok(address);
        }
        crate::fs::write_atomic(&path, bytes).await?;
        tracing::debug!("stored artifact {} ({} bytes)", address, bytes.len());
        Ok(address)
    }

    async fn retrieve(&self, address: &ContentAddress) -> Result<Arc<Vec<u8>>> {
        match tokio::fs::read(self.path_for(address)).await {
            Ok(bytes) => Ok(Arc::new(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RepoError::ArtifactNotFound(address.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, address: &ContentAddress) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(address)).await?)
    }
}

/// In-memory artifact store.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: DashMap<ContentAddress, Arc<Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn store(&self, bytes: &[u8]) -> Result<ContentAddress> {
        let address = ContentAddress::of(bytes);
        self.artifacts
            .entry(address.clone())
            .or_insert_with(|| Arc::new(bytes.to_vec()));
        Ok(address)
    }

    async fn retrieve(&self, address: &ContentAddress) -> Result<Arc<Vec<u8>>> {
        self.artifacts
            .get(address)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| RepoError::ArtifactNotFound(address.to_string()))
    }

    async fn contains(&self, address: &ContentAddress) -> Result<bool> {
        Ok(self.artifacts.contains_key(address))
    }
}
