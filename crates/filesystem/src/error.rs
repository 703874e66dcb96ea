//! Error types for hashing and output scanning.

use ja_common::{PathError, SummaryStatistics};
use ja_model::ManifestError;
use ja_storage::CacheError;
use thiserror::Error;

/// Errors raised while building manifests from local files.
#[derive(Debug, Error)]
pub enum FileSystemError {
    #[error("IO error at {path}: {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The progress callback asked to stop. Carries what was hashed so far.
    #[error("File hashing cancelled. {summary}")]
    Cancelled { summary: SummaryStatistics },

    /// A blocking hashing task panicked or was aborted.
    #[error("Hashing task failed: {message}")]
    Task { message: String },
}

impl FileSystemError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        FileSystemError::IoError {
            path: path.display().to_string(),
            source,
        }
    }

    /// Statistics attached to a cancellation, if this is one.
    pub fn cancelled_summary(&self) -> Option<&SummaryStatistics> {
        match self {
            FileSystemError::Cancelled { summary } => Some(summary),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for FileSystemError {
    fn from(err: tokio::task::JoinError) -> Self {
        FileSystemError::Task {
            message: err.to_string(),
        }
    }
}
