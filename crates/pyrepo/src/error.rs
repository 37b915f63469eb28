use pyrepo_core::RepoError;
use thiserror::Error;

/// Error types for the pyrepo host.
///
/// Configuration problems and plugin dispatch failures surface here. A sync
/// or publish run that fails on its own is not an error: it is reported
/// through its run report.
///
/// # Examples
///
/// ```
/// use pyrepo::error::{HostError, Result};
///
/// fn repository(name: &str) -> Result<()> {
///     if name.is_empty() {
///         return Err(HostError::UnknownRepository(name.into()));
///     }
///     Ok(())
/// }
///
/// assert!(repository("").is_err());
/// ```
#[derive(Error, Debug)]
pub enum HostError {
    #[error("invalid configuration {path}: {message}")]
    Config { path: String, message: String },

    #[error("repository '{0}' is not configured")]
    UnknownRepository(String),

    #[error("repository '{repository}' has no {operation} options")]
    MissingOperation {
        repository: String,
        operation: &'static str,
    },

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience type alias for `Result<T, HostError>`.
pub type Result<T> = std::result::Result<T, HostError>;

impl HostError {
    pub fn config(path: &std::path::Path, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HostError::UnknownRepository("mirror".into());
        assert_eq!(error.to_string(), "repository 'mirror' is not configured");

        let error = HostError::MissingOperation {
            repository: "mirror".into(),
            operation: "publish",
        };
        assert_eq!(
            error.to_string(),
            "repository 'mirror' has no publish options"
        );
    }

    #[test]
    fn test_repo_error_is_transparent() {
        let error: HostError = RepoError::UnknownContentType("rpm".into()).into();
        assert_eq!(
            error.to_string(),
            RepoError::UnknownContentType("rpm".into()).to_string()
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: HostError = io_err.into();
        assert!(error.to_string().contains("I/O error"));
    }
}
