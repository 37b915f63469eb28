//! Synchronization of a repository against a remote package index.
//!
//! A run moves through `Planning → Fetching → Committing → Done`, or ends in
//! `Failed`. Planning lists the remote releases of every target project and
//! diffs them against the repository head. Fetching downloads, verifies and
//! parses the additions concurrently. Committing appends one new snapshot
//! to the catalog.

use crate::artifact::read_artifact;
use crate::error::{PythonError, Result};
use crate::filter::{ReleaseFilter, RequirementFilter};
use crate::index::{IndexClient, is_safe_filename, is_valid_project_name, normalize_package_name};
use crate::types::{PackageType, PythonPackageContent, ReleaseFile};
use futures::stream::{self, StreamExt};
use pyrepo_core::{
    ArtifactStore, Catalog, FailedItem, HttpClient, HttpSettings, RepoError, RepositorySnapshot,
    RetryPolicy, SyncReport, SyncState,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type Snapshot = RepositorySnapshot<PythonPackageContent>;

/// What happens to local content the remote no longer lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Keep it.
    #[default]
    Additive,
    /// Remove it from the new snapshot.
    Mirror,
}

/// Options of a sync run.
///
/// # Examples
///
/// ```
/// use pyrepo_python::sync::{SyncConfig, SyncPolicy};
///
/// let json = r#"{
///     "remote_url": "https://pypi.org/simple/",
///     "requirements_filter": ["django>=4.2"],
///     "policy": "mirror"
/// }"#;
/// let config: SyncConfig = serde_json::from_str(json).unwrap();
///
/// assert_eq!(config.policy, SyncPolicy::Mirror);
/// assert_eq!(config.download_concurrency, 10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root of the remote simple API
    pub remote_url: String,
    #[serde(default)]
    pub projects: Vec<String>,
    /// PEP 508 requirement strings narrowing the remote
    #[serde(default)]
    pub requirements_filter: Vec<String>,
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    #[serde(default)]
    pub policy: SyncPolicy,
    /// Fraction of failed artifacts above which the run fails
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// Empty means every supported type
    #[serde(default)]
    pub package_types: Vec<PackageType>,
    #[serde(default = "default_true")]
    pub prereleases: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub require_https: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: default_remote_url(),
            projects: Vec::new(),
            requirements_filter: Vec::new(),
            download_concurrency: default_download_concurrency(),
            policy: SyncPolicy::default(),
            failure_threshold: default_failure_threshold(),
            package_types: Vec::new(),
            prereleases: true,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            require_https: false,
        }
    }
}

impl SyncConfig {
    /// Checks the options without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`PythonError::Core`] wrapping [`RepoError::InvalidConfig`]
    /// for out-of-range values and [`PythonError::InvalidRequirement`] for
    /// a bad filter entry.
    pub fn validate(&self) -> Result<()> {
        if self.remote_url.trim().is_empty() {
            return Err(invalid_config("remote_url must not be empty"));
        }
        if self.download_concurrency == 0 {
            return Err(invalid_config("download_concurrency must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(invalid_config("failure_threshold must be within [0, 1]"));
        }
        if self.max_retries == 0 {
            return Err(invalid_config("max_retries must be at least 1"));
        }
        RequirementFilter::parse(&self.requirements_filter)?;
        Ok(())
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            retry: RetryPolicy::with_attempts(self.max_retries),
            require_https: self.require_https,
        }
    }
}

fn invalid_config(message: &str) -> PythonError {
    PythonError::Core(RepoError::InvalidConfig(message.to_string()))
}

fn default_remote_url() -> String {
    "https://pypi.org/simple/".to_string()
}

const fn default_download_concurrency() -> usize {
    10
}

const fn default_failure_threshold() -> f64 {
    0.5
}

const fn default_true() -> bool {
    true
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_retries() -> u32 {
    3
}

/// Filtered remote files, keyed by filename.
#[derive(Default)]
struct Listing {
    files: BTreeMap<String, ReleaseFile>,
    failed_projects: HashSet<String>,
    /// Accepted files whose name cannot be stored or published
    rejected: Vec<FailedItem>,
}

/// Outcome of planning: what to reuse, fetch and remove.
#[derive(Default)]
struct Changes {
    reused: Vec<Arc<PythonPackageContent>>,
    fetch: Vec<ReleaseFile>,
    removals: BTreeSet<String>,
    /// Additions that can never be committed
    rejected: Vec<FailedItem>,
}

impl Changes {
    fn planned(&self) -> usize {
        self.reused.len() + self.fetch.len() + self.rejected.len()
    }
}

/// Drives sync runs of repositories against one remote index.
///
/// # Examples
///
/// ```no_run
/// use pyrepo_core::{Catalog, MemoryArtifactStore};
/// use pyrepo_python::sync::{SyncConfig, Synchronizer};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() {
/// let config = SyncConfig {
///     projects: vec!["requests".to_string()],
///     ..SyncConfig::default()
/// };
/// let catalog = Arc::new(Catalog::new());
/// let store = Arc::new(MemoryArtifactStore::new());
/// let synchronizer = Synchronizer::new(config, catalog, store).unwrap();
///
/// let report = synchronizer.run("pypi-mirror", &CancellationToken::new()).await;
/// println!("added {} files", report.added);
/// # }
/// ```
pub struct Synchronizer {
    config: SyncConfig,
    filter: ReleaseFilter,
    index: IndexClient,
    catalog: Arc<Catalog<PythonPackageContent>>,
    store: Arc<dyn ArtifactStore>,
    state: watch::Sender<SyncState>,
}

impl Synchronizer {
    /// Creates a synchronizer with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Fails when `config` does not validate or the HTTP client cannot be
    /// built.
    pub fn new(
        config: SyncConfig,
        catalog: Arc<Catalog<PythonPackageContent>>,
        store: Arc<dyn ArtifactStore>,
    ) -> Result<Self> {
        let http = Arc::new(HttpClient::new(config.http_settings())?);
        Self::with_http(config, catalog, store, http)
    }

    /// Creates a synchronizer sharing an existing HTTP client.
    pub fn with_http(
        config: SyncConfig,
        catalog: Arc<Catalog<PythonPackageContent>>,
        store: Arc<dyn ArtifactStore>,
        http: Arc<HttpClient>,
    ) -> Result<Self> {
        config.validate()?;
        let requirements = RequirementFilter::parse(&config.requirements_filter)?;
        let filter = ReleaseFilter::new(
            requirements,
            config.prereleases,
            config.package_types.iter().copied(),
        );
        let index = IndexClient::new(&config.remote_url, http);
        let (state, _) = watch::channel(SyncState::Planning);

        Ok(Self {
            config,
            filter,
            index,
            catalog,
            store,
            state,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Receiver that observes state transitions of every run.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Syncs `repository` and reports the outcome.
    ///
    /// Per-artifact and per-project failures are recorded in the report.
    /// A run that cannot complete (root listing failed, failure threshold
    /// exceeded, cancelled, commit conflict after retry) ends in
    /// [`SyncState::Failed`] with `error` set and nothing committed.
    pub async fn run(&self, repository: &str, cancel: &CancellationToken) -> SyncReport {
        let mut report = SyncReport::new(repository);
        if let Err(e) = self.execute(repository, cancel, &mut report).await {
            tracing::warn!("sync of {} failed: {}", repository, e);
            report.error = Some(e.to_string());
            self.transition(&mut report, SyncState::Failed);
        }
        report
    }

    fn transition(&self, report: &mut SyncReport, state: SyncState) {
        tracing::info!("{}: {:?} -> {:?}", report.repository, report.state, state);
        report.state = state;
        self.state.send_replace(state);
    }

    async fn execute(
        &self,
        repository: &str,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<()> {
        self.transition(report, SyncState::Planning);
        let head = self.catalog.latest(repository);
        report.snapshot_version = head.as_ref().map(|s| s.version());

        let listing = self.list_remote(report).await?;
        let changes = self.plan(head.as_deref(), listing);
        let planned = changes.planned();
        tracing::info!(
            "{}: {} to fetch, {} to reuse, {} to remove",
            repository,
            changes.fetch.len(),
            changes.reused.len(),
            changes.removals.len()
        );

        if cancel.is_cancelled() {
            return Err(PythonError::Cancelled);
        }

        self.transition(report, SyncState::Fetching);
        report.failed.extend(changes.rejected);
        let fetched = self
            .fetch_all(changes.fetch, planned, cancel, report)
            .await;

        if cancel.is_cancelled() {
            return Err(PythonError::Cancelled);
        }
        if self.exceeds_threshold(report.failed.len(), planned) {
            return Err(PythonError::FailureThreshold {
                failed: report.failed.len(),
                planned,
            });
        }

        self.transition(report, SyncState::Committing);
        let reused = changes.reused.len();
        let mut additions = changes.reused;
        additions.extend(fetched);

        if additions.is_empty() && changes.removals.is_empty() {
            tracing::info!("{}: already up to date", repository);
        } else {
            let snapshot = self.commit(repository, head, &additions, &changes.removals)?;
            report.added = additions.len();
            report.removed = changes.removals.len();
            report.reused = reused;
            report.snapshot_version = Some(snapshot.version());
        }

        self.transition(report, SyncState::Done);
        Ok(())
    }

    /// Normalized names of the projects to list.
    async fn targets(&self) -> Result<BTreeSet<String>> {
        let mut targets: BTreeSet<String> = self
            .config
            .projects
            .iter()
            .map(|p| normalize_package_name(p))
            .collect();
        targets.extend(
            self.filter
                .requirements()
                .project_names()
                .map(str::to_string),
        );

        if targets.is_empty() {
            tracing::info!("no projects configured, enumerating {}", self.index.base_url());
            targets = self
                .index
                .list_projects()
                .await?
                .iter()
                .map(|p| normalize_package_name(p))
                .collect();
        }
        Ok(targets)
    }

    /// Lists and filters remote files.
    ///
    /// Projects whose listing failed are recorded in the report and
    /// returned separately. Accepted files with an unsafe name are set
    /// aside as rejected.
    async fn list_remote(&self, report: &mut SyncReport) -> Result<Listing> {
        let targets = self.targets().await?;

        let listings: Vec<(String, Result<Vec<ReleaseFile>>)> = stream::iter(targets)
            .map(|project| async move {
                let listed = self.index.list_releases(&project).await;
                (project, listed)
            })
            .buffer_unordered(self.config.download_concurrency)
            .collect()
            .await;

        let mut listing = Listing::default();
        for (project, listed) in listings {
            match listed {
                Ok(files) => {
                    for file in files {
                        if !self.filter.accepts(&project, &file) {
                            continue;
                        }
                        if !is_safe_filename(&file.filename) {
                            tracing::warn!("{} lists unsafe file name {:?}", project, file.filename);
                            let e = PythonError::malformed(&file.filename, "unsafe file name");
                            listing.rejected.push(FailedItem::new(file.filename, &e));
                            continue;
                        }
                        listing.files.entry(file.filename.clone()).or_insert(file);
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to list {}: {}", project, e);
                    report.failed_projects.push(FailedItem::new(project.clone(), &e));
                    listing.failed_projects.insert(project);
                }
            }
        }
        report.failed_projects.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(listing)
    }

    fn plan(&self, head: Option<&Snapshot>, listing: Listing) -> Changes {
        let Listing {
            files: remote,
            failed_projects,
            rejected,
        } = listing;
        let mut changes = Changes {
            rejected,
            ..Changes::default()
        };

        if self.config.policy == SyncPolicy::Mirror
            && let Some(head) = head
        {
            changes.removals = head
                .content()
                .filter(|unit| !remote.contains_key(unit.filename()))
                .filter(|unit| !failed_projects.contains(&unit.normalized_name()))
                .map(|unit| unit.filename().to_string())
                .collect();
        }

        for (filename, file) in remote {
            if head.is_some_and(|h| h.contains(&filename)) {
                continue;
            }

            match self.catalog.lookup(&filename) {
                Some(unit) => match file.sha256.as_deref() {
                    Some(digest) if !digest.eq_ignore_ascii_case(unit.sha256()) => {
                        tracing::warn!("{} changed upstream, keeping catalog copy", filename);
                        let conflict = RepoError::ContentConflict {
                            key: filename.clone(),
                        };
                        changes.rejected.push(FailedItem::new(filename, conflict));
                    }
                    _ => changes.reused.push(unit),
                },
                None => changes.fetch.push(file),
            }
        }

        changes
    }

    fn exceeds_threshold(&self, failed: usize, planned: usize) -> bool {
        planned > 0 && failed as f64 / planned as f64 > self.config.failure_threshold
    }

    /// Downloads and parses `files`, recording failures in `report`.
    ///
    /// No new fetch starts once `cancel` is raised or the failure threshold
    /// is exceeded; fetches already in flight run to completion.
    async fn fetch_all(
        &self,
        files: Vec<ReleaseFile>,
        planned: usize,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Vec<Arc<PythonPackageContent>> {
        let halt = cancel.child_token();
        if self.exceeds_threshold(report.failed.len(), planned) {
            halt.cancel();
        }

        let mut fetched = Vec::new();
        let mut outcomes = stream::iter(files)
            .map(|file| {
                let halt = halt.clone();
                async move {
                    if halt.is_cancelled() {
                        return None;
                    }
                    let result = self.fetch_one(&file).await;
                    Some((file, result))
                }
            })
            .buffer_unordered(self.config.download_concurrency);

        while let Some(outcome) = outcomes.next().await {
            let Some((file, result)) = outcome else {
                continue;
            };
            match result {
                Ok(unit) => {
                    tracing::debug!("fetched {}", file.filename);
                    fetched.push(Arc::new(unit));
                }
                Err(e) => {
                    tracing::warn!("failed to sync {}: {}", file.filename, e);
                    report.failed.push(FailedItem::new(file.filename, &e));
                    if !halt.is_cancelled() && self.exceeds_threshold(report.failed.len(), planned)
                    {
                        tracing::warn!("failure threshold exceeded, no further fetches");
                        halt.cancel();
                    }
                }
            }
        }

        fetched
    }

    async fn fetch_one(&self, file: &ReleaseFile) -> Result<PythonPackageContent> {
        let packagetype = file
            .packagetype
            .ok_or_else(|| PythonError::malformed(&file.filename, "unsupported package type"))?;

        let artifact = self
            .index
            .fetch_artifact(&file.url, file.sha256.as_deref())
            .await?;
        let metadata = read_artifact(&file.filename, &artifact.bytes)?;
        if !is_valid_project_name(&normalize_package_name(&metadata.name)) {
            return Err(PythonError::malformed(
                &file.filename,
                format!("invalid project name {:?}", metadata.name),
            ));
        }
        let address = self.store.store(&artifact.bytes).await?;

        Ok(PythonPackageContent::new(
            file.filename.clone(),
            packagetype,
            address,
            metadata,
        ))
    }

    /// Commits head minus `removals` plus `additions`.
    ///
    /// On a conflict the membership is rebuilt against the new head and the
    /// commit is tried once more.
    fn commit(
        &self,
        repository: &str,
        head: Option<Arc<Snapshot>>,
        additions: &[Arc<PythonPackageContent>],
        removals: &BTreeSet<String>,
    ) -> Result<Arc<Snapshot>> {
        let mut planned = Some(head);
        retry_conflict_once(repository, || {
            let head = planned
                .take()
                .unwrap_or_else(|| self.catalog.latest(repository));
            let mut members: BTreeMap<String, Arc<PythonPackageContent>> = head
                .iter()
                .flat_map(|snapshot| snapshot.content())
                .filter(|unit| !removals.contains(unit.filename()))
                .map(|unit| (unit.filename().to_string(), Arc::clone(unit)))
                .collect();
            for unit in additions {
                members.insert(unit.filename().to_string(), Arc::clone(unit));
            }

            let expected = head.as_ref().map(|s| s.version());
            self.catalog
                .commit(repository, expected, members.into_values().collect())
        })
    }
}

/// Runs `attempt`, and once more if it fails with a commit conflict.
fn retry_conflict_once<T>(
    repository: &str,
    mut attempt: impl FnMut() -> pyrepo_core::Result<T>,
) -> Result<T> {
    match attempt() {
        Err(RepoError::CommitConflict { found, .. }) => {
            tracing::warn!(
                "{} moved to version {:?} during sync, retrying commit",
                repository,
                found
            );
            Ok(attempt()?)
        }
        result => Ok(result?),
    }
}
