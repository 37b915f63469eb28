use pyrepo_python::{PublishConfig, SyncConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{HostError, Result};

/// Root configuration of the pyrepo host, read from a JSON file.
///
/// Relative paths are resolved against the directory holding the file.
///
/// # Examples
///
/// ```
/// use pyrepo::config::HostConfig;
///
/// let json = r#"{
///     "repositories": {
///         "django": {
///             "sync": {
///                 "remote_url": "https://pypi.org/simple/",
///                 "requirements_filter": ["django>=4.2,<5"]
///             },
///             "publish": { "base_path": "/srv/pypi/django" }
///         }
///     }
/// }"#;
///
/// let config: HostConfig = serde_json::from_str(json).unwrap();
/// assert_eq!(config.repositories["django"].content_type, "python");
/// assert_eq!(config.catalog_path.to_str(), Some("catalog.json"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Where the catalog is persisted between runs
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    /// Root of the filesystem artifact store
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    /// Snapshots kept per repository after a sync; `None` keeps all
    #[serde(default)]
    pub keep_snapshots: Option<usize>,
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryConfig>,
}

/// One configured repository.
///
/// `sync` and `publish` are handed verbatim to the content type's plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub sync: Option<serde_json::Value>,
    #[serde(default)]
    pub publish: Option<serde_json::Value>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            catalog_path: default_catalog_path(),
            artifact_root: default_artifact_root(),
            keep_snapshots: None,
            repositories: BTreeMap::new(),
        }
    }
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("catalog.json")
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_content_type() -> String {
    "python".to_string()
}

impl HostConfig {
    /// Reads, resolves and validates the configuration file at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| HostError::config(path, e.to_string()))?;
        let mut config: Self =
            serde_json::from_slice(&data).map_err(|e| HostError::config(path, e.to_string()))?;

        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        config.validate(path)?;

        tracing::debug!(
            "loaded {} repositories from {}",
            config.repositories.len(),
            path.display()
        );
        Ok(config)
    }

    /// Makes relative paths absolute against `dir`.
    pub fn resolve_paths(&mut self, dir: &Path) {
        if self.catalog_path.is_relative() {
            self.catalog_path = dir.join(&self.catalog_path);
        }
        if self.artifact_root.is_relative() {
            self.artifact_root = dir.join(&self.artifact_root);
        }
    }

    /// Rejects configurations no run could succeed with.
    ///
    /// Options of `python` repositories are checked eagerly; options of
    /// other content types are left to their plugin.
    pub fn validate(&self, path: &Path) -> Result<()> {
        if self.keep_snapshots == Some(0) {
            return Err(HostError::config(path, "keep_snapshots must be at least 1"));
        }

        for (name, repository) in &self.repositories {
            if repository.sync.is_none() && repository.publish.is_none() {
                return Err(HostError::config(
                    path,
                    format!("repository '{}' has neither sync nor publish options", name),
                ));
            }
            if repository.content_type != "python" {
                continue;
            }

            if let Some(sync) = &repository.sync {
                let config: SyncConfig = serde_json::from_value(sync.clone())
                    .map_err(|e| HostError::config(path, format!("{}: sync: {}", name, e)))?;
                config
                    .validate()
                    .map_err(|e| HostError::config(path, format!("{}: sync: {}", name, e)))?;
            }
            if let Some(publish) = &repository.publish {
                let config: PublishConfig = serde_json::from_value(publish.clone())
                    .map_err(|e| HostError::config(path, format!("{}: publish: {}", name, e)))?;
                if config.base_path.as_os_str().is_empty() {
                    return Err(HostError::config(
                        path,
                        format!("{}: publish: base_path must not be empty", name),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn repository(&self, name: &str) -> Result<&RepositoryConfig> {
        self.repositories
            .get(name)
            .ok_or_else(|| HostError::UnknownRepository(name.to_string()))
    }
}
