//! Rendering of a static package index from a repository snapshot.
//!
//! Output under `base_path`:
//!
//! ```text
//! simple/index.html                 root listing
//! simple/<normalized>/index.html    one anchor per file
//! simple/index.json                 PEP 691 (json layout)
//! simple/<normalized>/index.json    PEP 691 (json layout)
//! pypi/<normalized>/json            project metadata (json layout)
//! packages/<filename>               artifact bytes
//! ```
//!
//! Every file is written atomically, so readers of a previous publication
//! never see a partial file.

use crate::error::{PythonError, Result};
use crate::index::{is_safe_filename, is_valid_project_name};
use crate::types::PythonPackageContent;
use pep440_rs::Version;
use pyrepo_core::fs::write_atomic;
use pyrepo_core::{ArtifactStore, Catalog, Content, PublishReport, PublishState};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

const PEP691_API_VERSION: &str = "1.0";

/// Which index formats to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputLayout {
    /// PEP 503 HTML only
    #[default]
    Simple,
    /// PEP 503 HTML plus PEP 691 JSON and per-project metadata
    Json,
}

/// Options of a publish run.
///
/// # Examples
///
/// ```
/// use pyrepo_python::publish::{OutputLayout, PublishConfig};
///
/// let config: PublishConfig =
///     serde_json::from_str(r#"{"base_path": "/srv/pypi", "output_layout": "json"}"#).unwrap();
///
/// assert_eq!(config.output_layout, OutputLayout::Json);
/// assert!(config.include_artifacts);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default)]
    pub output_layout: OutputLayout,
    /// Serving root the index is written under
    pub base_path: PathBuf,
    #[serde(default = "default_true")]
    pub include_artifacts: bool,
}

const fn default_true() -> bool {
    true
}

impl PublishConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            output_layout: OutputLayout::default(),
            base_path: base_path.into(),
            include_artifacts: true,
        }
    }
}

type Projects = BTreeMap<String, Vec<Arc<PythonPackageContent>>>;

/// Publishes repository snapshots as a static index.
pub struct PythonPublisher {
    config: PublishConfig,
    catalog: Arc<Catalog<PythonPackageContent>>,
    store: Arc<dyn ArtifactStore>,
    state: watch::Sender<PublishState>,
}

impl PythonPublisher {
    pub fn new(
        config: PublishConfig,
        catalog: Arc<Catalog<PythonPackageContent>>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let (state, _) = watch::channel(PublishState::Collecting);
        Self {
            config,
            catalog,
            store,
            state,
        }
    }

    pub fn config(&self) -> &PublishConfig {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishState> {
        self.state.subscribe()
    }

    /// Publishes the head snapshot of `repository`.
    ///
    /// A repository without snapshots publishes an empty index. A failed
    /// publish leaves earlier output in place; the next run starts over.
    pub async fn run(&self, repository: &str) -> PublishReport {
        let mut report = PublishReport::new(repository);
        if let Err(e) = self.execute(repository, &mut report).await {
            tracing::warn!("publish of {} failed: {}", repository, e);
            report.error = Some(e.to_string());
            self.transition(&mut report, PublishState::Failed);
        }
        report
    }

    fn transition(&self, report: &mut PublishReport, state: PublishState) {
        tracing::info!("{}: {:?} -> {:?}", report.repository, report.state, state);
        report.state = state;
        self.state.send_replace(state);
    }

    async fn execute(&self, repository: &str, report: &mut PublishReport) -> Result<()> {
        self.transition(report, PublishState::Collecting);
        let snapshot = self.catalog.latest(repository);
        report.snapshot_version = snapshot.as_ref().map(|s| s.version());

        let mut projects: Projects = BTreeMap::new();
        for unit in snapshot.iter().flat_map(|s| s.content()) {
            let name = unit.normalized_name();
            if !is_valid_project_name(&name) || !is_safe_filename(unit.filename()) {
                tracing::warn!(
                    "not publishing {:?} of project {:?}: unsafe path component",
                    unit.filename(),
                    name
                );
                report.skipped += 1;
                continue;
            }
            projects.entry(name).or_default().push(Arc::clone(unit));
        }
        for files in projects.values_mut() {
            files.sort_by(|a, b| a.filename().cmp(b.filename()));
        }
        report.projects = projects.len();

        self.transition(report, PublishState::Rendering);
        let outputs = self.render(&projects);

        self.transition(report, PublishState::Writing);
        let base = &self.config.base_path;
        for (relative, data) in &outputs {
            let path = base.join(relative);
            write_atomic(&path, data)
                .await
                .map_err(|e| PythonError::publish_io(&path, e))?;
            report.files_written += 1;
        }

        if self.config.include_artifacts {
            report.files_written += self.copy_artifacts(&projects).await?;
        }

        let names: BTreeSet<&str> = projects.keys().map(String::as_str).collect();
        remove_stale(&base.join("simple"), &names).await?;
        if self.config.output_layout == OutputLayout::Json {
            remove_stale(&base.join("pypi"), &names).await?;
        }

        tracing::info!(
            "published {} projects of {} to {}",
            report.projects,
            repository,
            base.display()
        );
        self.transition(report, PublishState::Done);
        Ok(())
    }

    /// Index files as `(path relative to base, bytes)`.
    fn render(&self, projects: &Projects) -> Vec<(PathBuf, Vec<u8>)> {
        let names: Vec<&str> = projects.keys().map(String::as_str).collect();
        let json = self.config.output_layout == OutputLayout::Json;

        let mut outputs = vec![(
            PathBuf::from("simple/index.html"),
            render_root_html(&names).into_bytes(),
        )];
        if json {
            outputs.push((
                PathBuf::from("simple/index.json"),
                render_root_json(&names).to_string().into_bytes(),
            ));
        }

        for (name, files) in projects {
            let dir = Path::new("simple").join(name);
            outputs.push((
                dir.join("index.html"),
                render_project_html(name, files).into_bytes(),
            ));
            if json {
                outputs.push((
                    dir.join("index.json"),
                    render_project_json(name, files).to_string().into_bytes(),
                ));
                outputs.push((
                    Path::new("pypi").join(name).join("json"),
                    render_project_metadata(files).to_string().into_bytes(),
                ));
            }
        }

        outputs
    }

    /// Copies artifacts missing under `packages/`; returns how many.
    async fn copy_artifacts(&self, projects: &Projects) -> Result<usize> {
        let packages = self.config.base_path.join("packages");
        let mut written = 0;

        for unit in projects.values().flatten() {
            let path = packages.join(unit.filename());
            let exists = tokio::fs::try_exists(&path)
                .await
                .map_err(|e| PythonError::publish_io(&path, e))?;
            if exists {
                continue;
            }

            let bytes = self.store.retrieve(unit.artifact()).await?;
            write_atomic(&path, &bytes)
                .await
                .map_err(|e| PythonError::publish_io(&path, e))?;
            tracing::debug!("copied {}", unit.filename());
            written += 1;
        }

        Ok(written)
    }
}

/// Removes project directories under `dir` not named in `keep`.
async fn remove_stale(dir: &Path, keep: &BTreeSet<&str>) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PythonError::publish_io(dir, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PythonError::publish_io(dir, e))?
    {
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| PythonError::publish_io(&path, e))?
            .is_dir();
        let name = entry.file_name();
        if is_dir && !keep.contains(name.to_string_lossy().as_ref()) {
            tracing::info!("removing stale project {}", path.display());
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| PythonError::publish_io(&path, e))?;
        }
    }

    Ok(())
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Link from `simple/<project>/` to the artifact, with digest fragment.
fn artifact_href(unit: &PythonPackageContent) -> String {
    format!(
        "../../packages/{}#sha256={}",
        urlencoding::encode(unit.filename()),
        unit.sha256()
    )
}

/// PEP 503 root page.
pub fn render_root_html(projects: &[&str]) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n  <head>\n    \
         <meta name=\"pypi:repository-version\" content=\"1.0\">\n    \
         <title>Simple Index</title>\n  </head>\n  <body>\n",
    );
    for name in projects {
        let name = escape_html(name);
        let _ = writeln!(html, "    <a href=\"{}/\">{}</a>", name, name);
    }
    html.push_str("  </body>\n</html>\n");
    html
}

/// PEP 503 project page; `files` are listed in the given order.
pub fn render_project_html(project: &str, files: &[Arc<PythonPackageContent>]) -> String {
    let title = format!("Links for {}", escape_html(project));
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n  <head>\n    \
         <meta name=\"pypi:repository-version\" content=\"1.0\">\n    \
         <title>{title}</title>\n  </head>\n  <body>\n    <h1>{title}</h1>\n"
    );

    for unit in files {
        let requires_python = unit
            .metadata()
            .requires_python
            .as_deref()
            .map(|spec| format!(" data-requires-python=\"{}\"", escape_html(spec)))
            .unwrap_or_default();
        let _ = writeln!(
            html,
            "    <a href=\"{}\"{}>{}</a><br/>",
            escape_html(&artifact_href(unit)),
            requires_python,
            escape_html(unit.filename())
        );
    }

    html.push_str("  </body>\n</html>\n");
    html
}

/// PEP 691 root listing.
pub fn render_root_json(projects: &[&str]) -> Value {
    json!({
        "meta": { "api-version": PEP691_API_VERSION },
        "projects": projects.iter().map(|name| json!({ "name": name })).collect::<Vec<_>>(),
    })
}

/// PEP 691 project listing.
pub fn render_project_json(project: &str, files: &[Arc<PythonPackageContent>]) -> Value {
    let files: Vec<Value> = files
        .iter()
        .map(|unit| {
            json!({
                "filename": unit.filename(),
                "url": format!("../../packages/{}", urlencoding::encode(unit.filename())),
                "hashes": { "sha256": unit.sha256() },
                "requires-python": unit.metadata().requires_python,
            })
        })
        .collect();

    json!({
        "meta": { "api-version": PEP691_API_VERSION },
        "name": project,
        "files": files,
    })
}

/// Per-project metadata: `info` of the highest version plus `releases`.
pub fn render_project_metadata(files: &[Arc<PythonPackageContent>]) -> Value {
    let mut releases: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for unit in files {
        releases.entry(unit.version()).or_default().push(json!({
            "filename": unit.filename(),
            "packagetype": unit.packagetype().as_str(),
            "url": format!("../../packages/{}", urlencoding::encode(unit.filename())),
            "digests": { "sha256": unit.sha256() },
            "requires_python": unit.metadata().requires_python,
        }));
    }

    let latest = files
        .iter()
        .max_by(|a, b| {
            let key = |u: &PythonPackageContent| Version::from_str(u.version()).ok();
            key(a)
                .cmp(&key(b))
                .then_with(|| a.version().cmp(b.version()))
        });

    let Some(latest) = latest else {
        return json!({ "info": null, "releases": releases, "urls": [] });
    };

    let urls = releases.get(latest.version()).cloned().unwrap_or_default();
    json!({
        "info": info(latest),
        "releases": releases,
        "urls": urls,
    })
}

fn info(unit: &PythonPackageContent) -> Value {
    let metadata = unit.metadata();
    let project_urls: BTreeMap<&str, &str> = metadata.project_url_pairs().collect();
    let keywords: Vec<&str> = metadata.keywords.iter().map(String::as_str).collect();

    json!({
        "name": metadata.name,
        "version": metadata.version,
        "metadata_version": metadata.metadata_version,
        "summary": metadata.summary,
        "description": metadata.description,
        "description_content_type": metadata.description_content_type,
        "keywords": keywords.join(","),
        "home_page": metadata.home_page,
        "download_url": metadata.download_url,
        "author": metadata.author,
        "author_email": metadata.author_email,
        "maintainer": metadata.maintainer,
        "maintainer_email": metadata.maintainer_email,
        "license": metadata.license,
        "requires_python": metadata.requires_python,
        "platform": metadata.platforms,
        "classifiers": metadata.classifiers.iter().map(|c| c.name()).collect::<Vec<_>>(),
        "requires_dist": metadata.requires_dist,
        "project_urls": project_urls,
    })
}
