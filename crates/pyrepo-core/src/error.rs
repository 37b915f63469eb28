use thiserror::Error;

/// Core error types for pyrepo.
///
/// Shared by every content-type plugin: HTTP access, artifact storage,
/// catalog commits and plugin dispatch all report through this enum.
///
/// # Examples
///
/// ```
/// use pyrepo_core::error::{RepoError, Result};
///
/// fn lookup(content_type: &str) -> Result<()> {
///     if content_type != "python" {
///         return Err(RepoError::UnknownContentType(content_type.into()));
///     }
///     Ok(())
/// }
///
/// assert!(lookup("rpm").is_err());
/// ```
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("request failed for {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error(
        "commit conflict in repository {repository}: expected head {expected:?}, found {found:?}"
    )]
    CommitConflict {
        repository: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("content {key} already exists with a different artifact")]
    ContentConflict { key: String },

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("unknown content type: {0}")]
    UnknownContentType(String),

    #[error("content type {content_type} does not support {capability}")]
    UnsupportedCapability {
        content_type: String,
        capability: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error raised by a content-type plugin
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl RepoError {
    /// Whether retrying the failed operation could succeed.
    ///
    /// Connection failures, timeouts, 5xx responses, 408 and 429 are transient.
    /// Every other client error is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { source, .. } => {
                source.is_timeout()
                    || source.is_connect()
                    || source.is_request()
                    || source.is_body()
                    || source
                        .status()
                        .is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// HTTP status code carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Http { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Convenience type alias for `Result<T, RepoError>`.
pub type Result<T> = std::result::Result<T, RepoError>;
