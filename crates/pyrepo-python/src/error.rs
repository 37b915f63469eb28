//! Errors specific to the Python content type.
//!
//! These errors cover reading package artifacts, talking to a remote
//! package index, and writing a published index.

use pyrepo_core::RepoError;
use thiserror::Error;

/// Errors specific to the Python content type.
///
/// Per-artifact errors (`MalformedArtifact`, `DigestMismatch`) are recorded
/// in the sync report and never abort a run on their own. Per-project errors
/// (`IndexUnreachable`, `ProjectNotFound`) abort planning for that project
/// only.
#[derive(Error, Debug)]
pub enum PythonError {
    /// Artifact could not be read or carries no usable metadata
    #[error("malformed artifact '{filename}': {reason}")]
    MalformedArtifact { filename: String, reason: String },

    /// Remote index could not be reached or answered garbage
    #[error("package index unreachable at {url}: {source}")]
    IndexUnreachable {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Remote index reports no such project
    #[error("project '{project}' not found on the remote index")]
    ProjectNotFound { project: String },

    /// Downloaded bytes do not hash to the advertised digest
    #[error("digest mismatch for {url}: expected sha256 {expected}, got {actual}")]
    DigestMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    /// Failed to write the published index
    #[error("failed to write {path}: {source}")]
    PublishIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Repository head kept moving while committing
    #[error("repository '{repository}' changed concurrently, commit abandoned")]
    CommitConflict { repository: String },

    /// Requirement filter entry is not valid PEP 508
    #[error("invalid requirement '{requirement}': {message}")]
    InvalidRequirement { requirement: String, message: String },

    /// Too many artifacts failed for the run to be trusted
    #[error("{failed} of {planned} planned artifacts failed, above the failure threshold")]
    FailureThreshold { failed: usize, planned: usize },

    /// Run was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(RepoError),
}

/// Result type alias for Python content operations.
pub type Result<T> = std::result::Result<T, PythonError>;

impl PythonError {
    /// Create a malformed artifact error.
    pub fn malformed(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedArtifact {
            filename: filename.into(),
            reason: reason.into(),
        }
    }

    /// Create an index error from any error type.
    pub fn index_unreachable(
        url: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::IndexUnreachable {
            url: url.into(),
            source: Box::new(error),
        }
    }

    /// Create a publish I/O error.
    pub fn publish_io(path: &std::path::Path, error: std::io::Error) -> Self {
        Self::PublishIo {
            path: path.display().to_string(),
            source: error,
        }
    }

    /// Create an invalid requirement error.
    pub fn invalid_requirement(requirement: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequirement {
            requirement: requirement.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation could succeed.
    ///
    /// Digest mismatches are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::IndexUnreachable { source, .. } => source
                .downcast_ref::<RepoError>()
                .is_some_and(RepoError::is_transient),
            Self::Core(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl pyrepo_core::Transient for PythonError {
    fn is_transient(&self) -> bool {
        PythonError::is_transient(self)
    }
}

/// Convert from pyrepo_core::RepoError, lifting commit conflicts
impl From<RepoError> for PythonError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::CommitConflict { repository, .. } => Self::CommitConflict { repository },
            other => Self::Core(other),
        }
    }
}

/// Convert to pyrepo_core::RepoError for the plugin boundary
impl From<PythonError> for RepoError {
    fn from(err: PythonError) -> Self {
        match err {
            PythonError::Core(e) => e,
            PythonError::InvalidRequirement {
                requirement,
                message,
            } => RepoError::InvalidConfig(format!(
                "invalid requirement '{}': {}",
                requirement, message
            )),
            PythonError::PublishIo { source, .. } => RepoError::Io(source),
            other => RepoError::Other(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PythonError::ProjectNotFound {
            project: "nonexistent".into(),
        };
        assert_eq!(
            err.to_string(),
            "project 'nonexistent' not found on the remote index"
        );

        let err = PythonError::malformed("foo-1.0.tar.gz", "no PKG-INFO");
        assert_eq!(
            err.to_string(),
            "malformed artifact 'foo-1.0.tar.gz': no PKG-INFO"
        );
    }

    #[test]
    fn test_digest_mismatch_is_permanent() {
        let err = PythonError::DigestMismatch {
            url: "https://files.example/foo-2.0.tar.gz".into(),
            expected: "d2".into(),
            actual: "d3".into(),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("expected sha256 d2, got d3"));
    }

    #[test]
    fn test_index_error_transience_follows_source() {
        let transient = PythonError::index_unreachable(
            "https://pypi.org/simple/foo/",
            RepoError::HttpStatus {
                url: "https://pypi.org/simple/foo/".into(),
                status: 503,
            },
        );
        assert!(transient.is_transient());

        let permanent = PythonError::index_unreachable(
            "https://pypi.org/simple/foo/",
            std::io::Error::from(std::io::ErrorKind::InvalidData),
        );
        assert!(!permanent.is_transient());
    }

    #[test]
    fn test_commit_conflict_lifted() {
        let err: PythonError = RepoError::CommitConflict {
            repository: "mirror".into(),
            expected: Some(1),
            found: Some(2),
        }
        .into();
        assert!(matches!(err, PythonError::CommitConflict { .. }));
    }

    #[test]
    fn test_conversion_to_repo_error() {
        let err: RepoError = PythonError::invalid_requirement("foo>>1", "bad operator").into();
        assert!(matches!(err, RepoError::InvalidConfig(_)));

        let err: RepoError = PythonError::Core(RepoError::InvalidUrl("x".into())).into();
        assert!(matches!(err, RepoError::InvalidUrl(_)));

        let err: RepoError = PythonError::Cancelled.into();
        assert_eq!(err.to_string(), "operation cancelled");
    }
}
