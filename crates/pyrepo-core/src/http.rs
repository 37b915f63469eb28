use crate::error::{RepoError, Result};
use crate::retry::RetryPolicy;
use dashmap::DashMap;
use reqwest::{Client, Response, StatusCode, header};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum number of cached entries to prevent unbounded memory growth.
const MAX_CACHE_ENTRIES: usize = 1000;

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("pyrepo/", env!("CARGO_PKG_VERSION"));

/// Settings for [`HttpClient`].
///
/// # Examples
///
/// ```
/// use pyrepo_core::http::HttpSettings;
///
/// let settings = HttpSettings::default();
/// assert_eq!(settings.timeout.as_secs(), 30);
/// assert!(!settings.require_https);
/// ```
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Reject plain `http://` URLs.
    pub require_https: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            require_https: false,
        }
    }
}

/// Cached HTTP response with validation headers.
///
/// Stores response body and cache validation headers (ETag, Last-Modified)
/// for efficient conditional requests. The body is wrapped in `Arc` for
/// zero-cost cloning across multiple consumers.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Arc<Vec<u8>>,
    /// Value of the `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// Final URL after redirects; relative links resolve against it.
    pub final_url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetched_at: Instant,
}

/// Retrying HTTP client with ETag and Last-Modified validation.
///
/// Index pages are fetched through [`HttpClient::get_cached`], which
/// implements RFC 7232 conditional requests: repeated syncs against an
/// unchanged index cost a 304 per page. Artifact downloads go through
/// [`HttpClient::get`], which returns the raw response so callers can
/// stream the body.
///
/// Transient failures (connection errors, timeouts, 5xx, 408, 429) are
/// retried with the configured [`RetryPolicy`]; other 4xx responses are
/// returned immediately as [`RepoError::HttpStatus`].
///
/// # Examples
///
/// ```no_run
/// use pyrepo_core::http::{HttpClient, HttpSettings};
///
/// # async fn example() -> pyrepo_core::error::Result<()> {
/// let client = HttpClient::new(HttpSettings::default())?;
///
/// let page = client.get_cached("https://pypi.org/simple/requests/", "text/html").await?;
/// let again = client.get_cached("https://pypi.org/simple/requests/", "text/html").await?;
///
/// // An unchanged page shares the cached buffer
/// assert!(std::sync::Arc::ptr_eq(&page.body, &again.body));
/// # Ok(())
/// # }
/// ```
pub struct HttpClient {
    entries: DashMap<String, CachedResponse>,
    client: Client,
    settings: HttpSettings,
}

impl HttpClient {
    /// Creates a client with the given settings.
    ///
    /// Redirects are followed (up to reqwest's default limit of 10).
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| RepoError::Http {
                url: String::new(),
                source: e,
            })?;

        Ok(Self {
            entries: DashMap::new(),
            client,
            settings,
        })
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    fn ensure_scheme(&self, url: &str) -> Result<()> {
        if self.settings.require_https && !url.starts_with("https://") {
            return Err(RepoError::InvalidUrl(format!("URL must use HTTPS: {}", url)));
        }
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(RepoError::InvalidUrl(url.to_string()));
        }
        Ok(())
    }

    /// Retrieves `url` with caching and retries.
    ///
    /// On first request, fetches data from the network and caches it.
    /// On subsequent requests, performs a conditional GET using the cached
    /// ETag or Last-Modified headers; a 304 returns the cached entry.
    ///
    /// If the conditional request fails with a transient error after all
    /// retries, the stale cached entry is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::HttpStatus`] for non-success responses and
    /// [`RepoError::Http`] when the network is unavailable and nothing is
    /// cached.
    pub async fn get_cached(&self, url: &str, accept: &str) -> Result<CachedResponse> {
        self.ensure_scheme(url)?;

        if self.entries.len() >= MAX_CACHE_ENTRIES {
            self.evict_entries();
        }

        let key = cache_key(url, accept);
        let cached = self.entries.get(&key).map(|e| e.value().clone());

        if let Some(cached) = cached {
            let result = self
                .settings
                .retry
                .run(url, || self.conditional_request(url, accept, &cached))
                .await;
            return match result {
                Ok(Some(fresh)) => {
                    self.entries.insert(key, fresh.clone());
                    Ok(fresh)
                }
                Ok(None) => Ok(cached),
                Err(e) if e.is_transient() => {
                    tracing::warn!("conditional request failed, using cache: {}", e);
                    Ok(cached)
                }
                Err(e) => Err(e),
            };
        }

        let fresh = self
            .settings
            .retry
            .run(url, || self.fetch(url, accept))
            .await?;
        self.entries.insert(key, fresh.clone());
        Ok(fresh)
    }

    /// Sends a GET request and returns the successful response unread.
    ///
    /// Retries apply to establishing the response only; callers that stream
    /// the body wrap the whole download in their own retry loop.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.ensure_scheme(url)?;
        self.settings.retry.run(url, || self.get_once(url)).await
    }

    /// Sends a single GET request without retrying.
    ///
    /// For callers that retry a larger operation (such as a streamed
    /// download) as one unit.
    pub async fn get_once(&self, url: &str) -> Result<Response> {
        self.ensure_scheme(url)?;
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RepoError::Http {
                url: url.to_string(),
                source: e,
            })?;
        check_status(url, response)
    }

    /// Performs a conditional request using cached validation headers.
    ///
    /// - `Ok(Some(_))` - Server returned 200 OK with new content
    /// - `Ok(None)` - Server returned 304 Not Modified
    async fn conditional_request(
        &self,
        url: &str,
        accept: &str,
        cached: &CachedResponse,
    ) -> Result<Option<CachedResponse>> {
        let mut request = self.client.get(url).header(header::ACCEPT, accept);

        if let Some(etag) = &cached.etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &cached.last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.map_err(|e| RepoError::Http {
            url: url.to_string(),
            source: e,
        })?;

        if response.status() == StatusCode::NOT_MODIFIED {
            tracing::debug!("not modified: {}", url);
            return Ok(None);
        }

        let response = check_status(url, response)?;
        read_response(url, response).await.map(Some)
    }

    async fn fetch(&self, url: &str, accept: &str) -> Result<CachedResponse> {
        tracing::debug!("fetching fresh: {}", url);

        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, accept)
            .send()
            .await
            .map_err(|e| RepoError::Http {
                url: url.to_string(),
                source: e,
            })?;

        let response = check_status(url, response)?;
        read_response(url, response).await
    }

    /// Clears all cached entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache contains no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts the oldest 10% of cache entries.
    fn evict_entries(&self) {
        let target_removals = MAX_CACHE_ENTRIES / 10;

        let mut entries_to_remove: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().fetched_at))
            .collect();

        entries_to_remove.sort_by_key(|(_, time)| *time);

        for (key, _) in entries_to_remove.iter().take(target_removals) {
            self.entries.remove(key);
        }

        tracing::debug!("evicted {} cache entries", target_removals);
    }
}

fn cache_key(url: &str, accept: &str) -> String {
    format!("{} {}", accept, url)
}

fn check_status(url: &str, response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RepoError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        })
    }
}

async fn read_response(url: &str, response: Response) -> Result<CachedResponse> {
    let header_value = |name: header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };

    let etag = header_value(header::ETAG);
    let last_modified = header_value(header::LAST_MODIFIED);
    let content_type = header_value(header::CONTENT_TYPE);
    let final_url = response.url().to_string();

    let body = response.bytes().await.map_err(|e| RepoError::Http {
        url: url.to_string(),
        source: e,
    })?;

    Ok(CachedResponse {
        body: Arc::new(body.to_vec()),
        content_type,
        final_url,
        etag,
        last_modified,
        fetched_at: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpClient {
        HttpClient::new(HttpSettings {
            retry: RetryPolicy::immediate(3),
            ..HttpSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert_eq!(client.len(), 0);
        assert!(client.is_empty());
    }

    #[test]
    fn test_require_https_rejects_plain_http() {
        let client = HttpClient::new(HttpSettings {
            require_https: true,
            ..HttpSettings::default()
        })
        .unwrap();
        assert!(client.ensure_scheme("http://example.com").is_err());
        assert!(client.ensure_scheme("https://example.com").is_ok());
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let client = client();
        assert!(matches!(
            client.ensure_scheme("ftp://example.com"),
            Err(RepoError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_get_cached_fresh_fetch() {
        let mut server = mockito::Server::new_async().await;

        let _m = server
            .mock("GET", "/simple/foo/")
            .with_status(200)
            .with_header("etag", "\"abc123\"")
            .with_header("content-type", "text/html")
            .with_body("<html></html>")
            .create_async()
            .await;

        let client = client();
        let url = format!("{}/simple/foo/", server.url());
        let result = client.get_cached(&url, "text/html").await.unwrap();

        assert_eq!(&**result.body, b"<html></html>");
        assert_eq!(result.content_type.as_deref(), Some("text/html"));
        assert_eq!(result.etag.as_deref(), Some("\"abc123\""));
        assert_eq!(client.len(), 1);
    }

    #[tokio::test]
    async fn test_get_cached_304_not_modified() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/simple/foo/", server.url());

        let client = client();

        let m1 = server
            .mock("GET", "/simple/foo/")
            .with_status(200)
            .with_header("etag", "\"abc123\"")
            .with_body("original")
            .create_async()
            .await;

        let first = client.get_cached(&url, "text/html").await.unwrap();
        assert_eq!(&**first.body, b"original");

        drop(m1);

        let _m2 = server
            .mock("GET", "/simple/foo/")
            .match_header("if-none-match", "\"abc123\"")
            .with_status(304)
            .create_async()
            .await;

        let second = client.get_cached(&url, "text/html").await.unwrap();
        assert!(Arc::ptr_eq(&first.body, &second.body));
    }

    #[tokio::test]
    async fn test_get_cached_last_modified_validation() {
        let mut server = mockito::Server::new_async().await;
        let url = format!("{}/simple/foo/", server.url());

        let client = client();
        client.entries.insert(
            cache_key(&url, "text/html"),
            CachedResponse {
                body: Arc::new(b"cached".to_vec()),
                content_type: None,
                final_url: url.clone(),
                etag: None,
                last_modified: Some("Wed, 21 Oct 2024 07:28:00 GMT".into()),
                fetched_at: Instant::now(),
            },
        );

        let _m = server
            .mock("GET", "/simple/foo/")
            .match_header("if-modified-since", "Wed, 21 Oct 2024 07:28:00 GMT")
            .with_status(304)
            .create_async()
            .await;

        let result = client.get_cached(&url, "text/html").await.unwrap();
        assert_eq!(&**result.body, b"cached");
    }

    #[tokio::test]
    async fn test_get_cached_network_error_fallback() {
        let client = client();
        let url = "http://invalid.localhost.test/simple/";

        client.entries.insert(
            cache_key(url, "text/html"),
            CachedResponse {
                body: Arc::new(b"stale data".to_vec()),
                content_type: None,
                final_url: url.to_string(),
                etag: Some("\"old\"".into()),
                last_modified: None,
                fetched_at: Instant::now(),
            },
        );

        let result = client.get_cached(url, "text/html").await.unwrap();
        assert_eq!(&**result.body, b"stale data");
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let mut server = mockito::Server::new_async().await;

        let m = server
            .mock("GET", "/simple/missing/")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = client();
        let url = format!("{}/simple/missing/", server.url());
        let err = client.get_cached(&url, "text/html").await.unwrap_err();

        assert_eq!(err.status(), Some(404));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let mut server = mockito::Server::new_async().await;

        let m = server
            .mock("GET", "/simple/flaky/")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let client = client();
        let url = format!("{}/simple/flaky/", server.url());
        let err = client.get_cached(&url, "text/html").await.unwrap_err();

        assert_eq!(err.status(), Some(503));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_returns_response() {
        let mut server = mockito::Server::new_async().await;

        let _m = server
            .mock("GET", "/packages/foo-1.0.tar.gz")
            .with_status(200)
            .with_body("artifact")
            .create_async()
            .await;

        let client = client();
        let url = format!("{}/packages/foo-1.0.tar.gz", server.url());
        let response = client.get(&url).await.unwrap();
        assert_eq!(&response.bytes().await.unwrap()[..], b"artifact");
    }
}
