//! Remote package index client.
//!
//! Speaks the "simple" repository API:
//! - PEP 503 HTML pages (<https://peps.python.org/pep-0503/>)
//! - PEP 691 JSON pages (<https://peps.python.org/pep-0691/>), preferred via
//!   content negotiation
//!
//! Listing pages are cached with ETag/Last-Modified validation by the shared
//! [`HttpClient`]. Artifact downloads are streamed through a SHA-256 hasher
//! and verified before any byte is handed back.

use crate::artifact::version_from_filename;
use crate::error::{PythonError, Result};
use crate::types::{PackageType, ReleaseFile};
use futures::StreamExt;
use once_cell::sync::Lazy;
use pyrepo_core::{HttpClient, RepoError};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Accept header preferring PEP 691 JSON over PEP 503 HTML.
pub const SIMPLE_ACCEPT: &str = "application/vnd.pypi.simple.v1+json, \
     application/vnd.pypi.simple.v1+html;q=0.2, text/html;q=0.01";

/// Largest buffer reserved up front from an advertised `Content-Length`.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());

/// Normalize package name according to PEP 503.
///
/// Lowercases the name and collapses every run of `-`, `_` and `.` into a
/// single `-`, leading and trailing runs included. The function is total
/// and idempotent.
///
/// # Examples
///
/// ```
/// # use pyrepo_python::index::normalize_package_name;
/// assert_eq!(normalize_package_name("Flask"), "flask");
/// assert_eq!(normalize_package_name("My_Package.Name"), "my-package-name");
/// assert_eq!(normalize_package_name("Pillow.Image"), "pillow-image");
/// assert_eq!(normalize_package_name("my__-.package"), "my-package");
/// assert_eq!(normalize_package_name("_private"), "-private");
/// ```
pub fn normalize_package_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            in_separator = false;
            normalized.extend(c.to_lowercase());
        }
    }
    normalized
}

/// Whether a normalized project name can name a directory of the
/// published index: `[a-z0-9-]+` with at least one letter or digit.
///
/// ```
/// # use pyrepo_python::index::is_valid_project_name;
/// assert!(is_valid_project_name("zope-interface"));
/// assert!(!is_valid_project_name("-"));
/// assert!(!is_valid_project_name("/tmp/pwn"));
/// ```
pub fn is_valid_project_name(normalized: &str) -> bool {
    normalized
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && normalized.bytes().any(|b| b.is_ascii_alphanumeric())
}

/// Whether `filename` is a bare file name that stays inside the directory
/// it is joined to.
///
/// Rejects path separators, `..`, a leading `.` and control characters.
pub fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.starts_with('.')
        && !filename.contains("..")
        && !filename
            .chars()
            .any(|c| matches!(c, '/' | '\\') || c.is_control())
}

/// Downloaded artifact whose digest has been checked.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub bytes: Vec<u8>,
    /// Lowercase hex SHA-256 of `bytes`
    pub sha256: String,
}

/// Client for one remote package index.
///
/// `remote_url` is the root of the simple API, e.g.
/// `https://pypi.org/simple/`.
///
/// # Examples
///
/// ```no_run
/// # use pyrepo_python::IndexClient;
/// # use pyrepo_core::{HttpClient, HttpSettings};
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() {
/// let http = Arc::new(HttpClient::new(HttpSettings::default()).unwrap());
/// let index = IndexClient::new("https://pypi.org/simple/", http);
///
/// let releases = index.list_releases("requests").await.unwrap();
/// let newest = releases.last().unwrap();
/// let artifact = index
///     .fetch_artifact(&newest.url, newest.sha256.as_deref())
///     .await
///     .unwrap();
/// assert!(!artifact.bytes.is_empty());
/// # }
/// ```
#[derive(Clone)]
pub struct IndexClient {
    base_url: String,
    http: Arc<HttpClient>,
}

impl IndexClient {
    pub fn new(remote_url: &str, http: Arc<HttpClient>) -> Self {
        Self {
            base_url: remote_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of a project's page: `<remote>/<normalized-name>/`.
    ///
    /// The normalized name is URL-encoded to prevent path traversal.
    pub fn project_url(&self, project: &str) -> String {
        let normalized = normalize_package_name(project);
        format!("{}/{}/", self.base_url, urlencoding::encode(&normalized))
    }

    /// Lists all project names offered by the index root.
    ///
    /// # Errors
    ///
    /// Returns [`PythonError::IndexUnreachable`] on any network or protocol
    /// failure.
    pub async fn list_projects(&self) -> Result<Vec<String>> {
        let url = format!("{}/", self.base_url);
        let page = self
            .http
            .get_cached(&url, SIMPLE_ACCEPT)
            .await
            .map_err(|e| PythonError::index_unreachable(&url, e))?;

        let projects = if is_json(page.content_type.as_deref()) {
            parse_json_projects(&page.body).map_err(|e| PythonError::index_unreachable(&url, e))?
        } else {
            parse_html_projects(&String::from_utf8_lossy(&page.body))
        };

        tracing::debug!("index lists {} projects", projects.len());
        Ok(projects)
    }

    /// Lists every file the index offers for `project`.
    ///
    /// Files are returned in page order. Relative links are resolved
    /// against the final URL after redirects; only `sha256` digests are
    /// kept.
    ///
    /// # Errors
    ///
    /// - [`PythonError::ProjectNotFound`] if the index answers 404
    /// - [`PythonError::IndexUnreachable`] for any other failure
    pub async fn list_releases(&self, project: &str) -> Result<Vec<ReleaseFile>> {
        let url = self.project_url(project);
        let page = self
            .http
            .get_cached(&url, SIMPLE_ACCEPT)
            .await
            .map_err(|e| match e.status() {
                Some(404) => PythonError::ProjectNotFound {
                    project: project.to_string(),
                },
                _ => PythonError::index_unreachable(&url, e),
            })?;

        let base = Url::parse(&page.final_url).map_err(|e| PythonError::index_unreachable(&url, e))?;

        let files = if is_json(page.content_type.as_deref()) {
            parse_json_releases(&base, &page.body)
                .map_err(|e| PythonError::index_unreachable(&url, e))?
        } else {
            parse_html_releases(&base, &String::from_utf8_lossy(&page.body))
        };

        tracing::debug!("{}: {} files listed", project, files.len());
        Ok(files)
    }

    /// Downloads an artifact and verifies its SHA-256 digest.
    ///
    /// The body is streamed through the hasher; on mismatch the partial
    /// download is dropped and nothing is returned. Without
    /// `expected_sha256` the computed digest is returned unverified.
    /// Transient failures restart the whole download; a digest mismatch is
    /// never retried.
    ///
    /// # Errors
    ///
    /// - [`PythonError::DigestMismatch`] if the digests disagree
    /// - [`PythonError::Core`] for HTTP failures
    pub async fn fetch_artifact(
        &self,
        url: &str,
        expected_sha256: Option<&str>,
    ) -> Result<FetchedArtifact> {
        let expected = expected_sha256.map(str::to_ascii_lowercase);
        self.http
            .settings()
            .retry
            .run(url, || self.download(url, expected.as_deref()))
            .await
    }

    async fn download(&self, url: &str, expected: Option<&str>) -> Result<FetchedArtifact> {
        let response = self.http.get_once(url).await?;

        let mut hasher = Sha256::new();
        let capacity = response.content_length().unwrap_or(0).min(MAX_PREALLOCATION);
        let mut bytes = Vec::with_capacity(capacity as usize);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RepoError::Http {
                url: url.to_string(),
                source: e,
            })?;
            hasher.update(&chunk);
            bytes.extend_from_slice(&chunk);
        }

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = expected
            && expected != actual
        {
            tracing::warn!("digest mismatch for {}: expected {}, got {}", url, expected, actual);
            return Err(PythonError::DigestMismatch {
                url: url.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        tracing::debug!("downloaded {} ({} bytes)", url, bytes.len());
        Ok(FetchedArtifact {
            bytes,
            sha256: actual,
        })
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.contains("json"))
}

// PEP 691 JSON response types

#[derive(Debug, Deserialize)]
struct JsonProjectList {
    projects: Vec<JsonProjectEntry>,
}

#[derive(Debug, Deserialize)]
struct JsonProjectEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct JsonProjectPage {
    files: Vec<JsonFile>,
}

#[derive(Debug, Deserialize)]
struct JsonFile {
    filename: String,
    url: String,
    #[serde(default)]
    hashes: std::collections::HashMap<String, String>,
    #[serde(rename = "requires-python")]
    requires_python: Option<String>,
    #[serde(default)]
    yanked: JsonYanked,
}

/// `yanked` is either a boolean or the yank reason.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum JsonYanked {
    #[default]
    No,
    Flag(bool),
    Reason(String),
}

impl JsonYanked {
    fn reason(self) -> Option<String> {
        match self {
            Self::No | Self::Flag(false) => None,
            Self::Flag(true) => Some(String::new()),
            Self::Reason(reason) => Some(reason),
        }
    }
}

fn parse_json_projects(body: &[u8]) -> std::result::Result<Vec<String>, serde_json::Error> {
    let list: JsonProjectList = serde_json::from_slice(body)?;
    Ok(list.projects.into_iter().map(|p| p.name).collect())
}

fn parse_html_projects(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&ANCHOR)
        .map(|a| a.text().collect::<String>().trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn parse_json_releases(
    base: &Url,
    body: &[u8],
) -> std::result::Result<Vec<ReleaseFile>, serde_json::Error> {
    let page: JsonProjectPage = serde_json::from_slice(body)?;
    Ok(page
        .files
        .into_iter()
        .filter_map(|file| {
            let (url, fragment_digest) = resolve_link(base, &file.url)?;
            let sha256 = file
                .hashes
                .get("sha256")
                .map(|d| d.to_ascii_lowercase())
                .or(fragment_digest);
            Some(release_file(
                file.filename,
                url,
                sha256,
                file.requires_python,
                file.yanked.reason(),
            ))
        })
        .collect())
}

fn parse_html_releases(base: &Url, html: &str) -> Vec<ReleaseFile> {
    let document = Html::parse_document(html);
    document
        .select(&ANCHOR)
        .filter_map(|a| {
            let element = a.value();
            let (url, sha256) = resolve_link(base, element.attr("href")?)?;

            let text = a.text().collect::<String>();
            let text = text.trim();
            let filename = if text.is_empty() {
                url.rsplit('/').next()?.to_string()
            } else {
                text.to_string()
            };

            let requires_python = element
                .attr("data-requires-python")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
            let yanked = element.attr("data-yanked").map(String::from);

            Some(release_file(filename, url, sha256, requires_python, yanked))
        })
        .collect()
}

fn release_file(
    filename: String,
    url: String,
    sha256: Option<String>,
    requires_python: Option<String>,
    yanked: Option<String>,
) -> ReleaseFile {
    ReleaseFile {
        packagetype: PackageType::from_filename(&filename),
        version: version_from_filename(&filename),
        filename,
        url,
        sha256,
        requires_python,
        yanked,
    }
}

/// Resolves `href` against `base`, splitting off a `#sha256=` fragment.
///
/// Fragments naming other hash algorithms are dropped.
fn resolve_link(base: &Url, href: &str) -> Option<(String, Option<String>)> {
    let mut url = match base.join(href) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!("skipping unresolvable link {:?}: {}", href, e);
            return None;
        }
    };

    let sha256 = url.fragment().and_then(|fragment| {
        let (algorithm, digest) = fragment.split_once('=')?;
        (algorithm == "sha256").then(|| digest.to_ascii_lowercase())
    });
    url.set_fragment(None);
    Some((url.to_string(), sha256))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrepo_core::{HttpSettings, RetryPolicy};

    fn index(server: &mockito::ServerGuard) -> IndexClient {
        let http = HttpClient::new(HttpSettings {
            retry: RetryPolicy::immediate(3),
            ..HttpSettings::default()
        })
        .unwrap();
        IndexClient::new(&format!("{}/simple/", server.url()), Arc::new(http))
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[test]
    fn test_normalize_package_name() {
        assert_eq!(normalize_package_name("My_Package.Name"), "my-package-name");
        assert_eq!(normalize_package_name("FOO---bar"), "foo-bar");
        assert_eq!(normalize_package_name(""), "");
        assert_eq!(normalize_package_name("__init__"), "-init-");
        assert_eq!(normalize_package_name("."), "-");
        assert_eq!(normalize_package_name("/tmp/pwn"), "/tmp/pwn");
    }

    #[test]
    fn test_is_valid_project_name() {
        assert!(is_valid_project_name("requests"));
        assert!(is_valid_project_name("my-package-2"));
        assert!(!is_valid_project_name(""));
        assert!(!is_valid_project_name("--"));
        assert!(!is_valid_project_name(&normalize_package_name(".")));
        assert!(!is_valid_project_name(&normalize_package_name("/tmp/pwn")));
        assert!(!is_valid_project_name("caf\u{e9}"));
    }

    #[test]
    fn test_is_safe_filename() {
        assert!(is_safe_filename("foo-1.0.tar.gz"));
        assert!(is_safe_filename("foo_bar-2.0-py3-none-any.whl"));
        assert!(!is_safe_filename(""));
        assert!(!is_safe_filename("../../escaped-1.0.tar.gz"));
        assert!(!is_safe_filename("/etc/x.tar.gz"));
        assert!(!is_safe_filename("sub\\foo-1.0.zip"));
        assert!(!is_safe_filename(".hidden-1.0.tar.gz"));
        assert!(!is_safe_filename("foo-1.0\n.tar.gz"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for name in ["My_Package.Name", "a.-_b", "Django", "zope.interface", "__x__"] {
            let once = normalize_package_name(name);
            assert_eq!(normalize_package_name(&once), once);
        }
    }

    #[test]
    fn test_project_url_is_encoded() {
        let http = Arc::new(HttpClient::new(HttpSettings::default()).unwrap());
        let index = IndexClient::new("https://pypi.org/simple", http);
        assert_eq!(index.project_url("Foo_Bar"), "https://pypi.org/simple/foo-bar/");
        assert_eq!(index.project_url("../etc"), "https://pypi.org/simple/%2Fetc/");
    }

    #[test]
    fn test_parse_html_releases() {
        let base = Url::parse("https://pypi.org/simple/foo/").unwrap();
        let html = r#"<!DOCTYPE html>
<html><body>
<a href="../../packages/foo-1.0.tar.gz#sha256=ABCDEF" data-requires-python="&gt;=3.8">foo-1.0.tar.gz</a>
<a href="https://files.example/foo-2.0-py3-none-any.whl#md5=123">foo-2.0-py3-none-any.whl</a>
<a href="foo-0.9.zip" data-yanked="broken build">foo-0.9.zip</a>
</body></html>"#;

        let files = parse_html_releases(&base, html);
        assert_eq!(files.len(), 3);

        assert_eq!(files[0].filename, "foo-1.0.tar.gz");
        assert_eq!(files[0].url, "https://pypi.org/packages/foo-1.0.tar.gz");
        assert_eq!(files[0].sha256.as_deref(), Some("abcdef"));
        assert_eq!(files[0].requires_python.as_deref(), Some(">=3.8"));
        assert_eq!(files[0].packagetype, Some(PackageType::Sdist));
        assert_eq!(files[0].version.as_deref(), Some("1.0"));

        assert_eq!(files[1].sha256, None);
        assert_eq!(files[1].url, "https://files.example/foo-2.0-py3-none-any.whl");

        assert_eq!(files[2].url, "https://pypi.org/simple/foo/foo-0.9.zip");
        assert_eq!(files[2].yanked.as_deref(), Some("broken build"));
    }

    #[test]
    fn test_parse_json_releases() {
        let base = Url::parse("https://pypi.org/simple/foo/").unwrap();
        let json = r#"{
            "meta": {"api-version": "1.0"},
            "name": "foo",
            "files": [
                {"filename": "foo-1.0.tar.gz", "url": "/files/foo-1.0.tar.gz",
                 "hashes": {"sha256": "D1"}, "requires-python": ">=3.7"},
                {"filename": "foo-2.0.tar.gz", "url": "https://cdn.example/foo-2.0.tar.gz",
                 "hashes": {}, "yanked": true}
            ]
        }"#;

        let files = parse_json_releases(&base, json.as_bytes()).unwrap();
        assert_eq!(files[0].url, "https://pypi.org/files/foo-1.0.tar.gz");
        assert_eq!(files[0].sha256.as_deref(), Some("d1"));
        assert_eq!(files[0].requires_python.as_deref(), Some(">=3.7"));
        assert!(!files[0].is_yanked());
        assert!(files[1].is_yanked());
    }

    #[test]
    fn test_parse_projects() {
        let html = "<html><body><a href=\"/simple/foo/\">Foo</a>\n<a href=\"/simple/bar-baz/\">bar_baz</a></body></html>";
        assert_eq!(parse_html_projects(html), vec!["Foo", "bar_baz"]);

        let json = br#"{"meta": {"api-version": "1.0"}, "projects": [{"name": "Foo"}]}"#;
        assert_eq!(parse_json_projects(json).unwrap(), vec!["Foo"]);
    }

    #[tokio::test]
    async fn test_list_releases_html() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/simple/foo-bar/")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(r#"<a href="/files/Foo_Bar-1.0.tar.gz#sha256=d1">Foo_Bar-1.0.tar.gz</a>"#)
            .create_async()
            .await;

        let files = index(&server).list_releases("Foo_Bar").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].url, format!("{}/files/Foo_Bar-1.0.tar.gz", server.url()));
    }

    #[tokio::test]
    async fn test_list_releases_prefers_json() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/simple/foo/")
            .match_header(
                "accept",
                mockito::Matcher::Regex("application/vnd.pypi.simple.v1\\+json".into()),
            )
            .with_status(200)
            .with_header("content-type", "application/vnd.pypi.simple.v1+json")
            .with_body(r#"{"meta": {"api-version": "1.0"}, "name": "foo", "files": []}"#)
            .create_async()
            .await;

        let files = index(&server).list_releases("foo").await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_list_releases_not_found() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/simple/missing/")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let err = index(&server).list_releases("missing").await.unwrap_err();
        assert!(matches!(err, PythonError::ProjectNotFound { .. }));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_releases_server_error_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/simple/foo/")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = index(&server).list_releases("foo").await.unwrap_err();
        assert!(matches!(err, PythonError::IndexUnreachable { .. }));
        assert!(err.is_transient());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_projects() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/simple/")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(r#"<a href="foo/">foo</a><a href="bar/">bar</a>"#)
            .create_async()
            .await;

        let projects = index(&server).list_projects().await.unwrap();
        assert_eq!(projects, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn test_fetch_artifact_verifies_digest() {
        let mut server = mockito::Server::new_async().await;
        let body = b"artifact bytes".to_vec();
        let _m = server
            .mock("GET", "/files/foo-1.0.tar.gz")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let index = index(&server);
        let url = format!("{}/files/foo-1.0.tar.gz", server.url());
        let digest = sha256_hex(&body);

        let fetched = index
            .fetch_artifact(&url, Some(&digest.to_uppercase()))
            .await
            .unwrap();
        assert_eq!(fetched.bytes, body);
        assert_eq!(fetched.sha256, digest);

        let unverified = index.fetch_artifact(&url, None).await.unwrap();
        assert_eq!(unverified.sha256, digest);
    }

    #[tokio::test]
    async fn test_fetch_artifact_digest_mismatch_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/files/foo-2.0.tar.gz")
            .with_status(200)
            .with_body("tampered")
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/files/foo-2.0.tar.gz", server.url());
        let err = index(&server)
            .fetch_artifact(&url, Some(&sha256_hex(b"original")))
            .await
            .unwrap_err();

        assert!(matches!(err, PythonError::DigestMismatch { .. }));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_artifact_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/files/foo-1.0.tar.gz")
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let url = format!("{}/files/foo-1.0.tar.gz", server.url());
        let err = index(&server).fetch_artifact(&url, None).await.unwrap_err();
        assert!(matches!(err, PythonError::Core(RepoError::HttpStatus { status: 502, .. })));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_artifact_client_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/files/gone.tar.gz")
            .with_status(410)
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/files/gone.tar.gz", server.url());
        assert!(index(&server).fetch_artifact(&url, None).await.is_err());
        m.assert_async().await;
    }
}
