//! Error types for job-level asset synchronization.

use ja_common::{human_readable_file_size, PathError, SummaryStatistics};
use ja_filesystem::FileSystemError;
use ja_model::ManifestError;
use ja_profiles::PathGroupingError;
use ja_storage::StorageError;
use ja_vfs::VfsError;
use thiserror::Error;

/// Errors raised while syncing job inputs and outputs.
///
/// Cancellations from the storage and file system layers are lifted into
/// [`SyncError::Cancelled`] so callers match a single variant.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    FileSystem(FileSystemError),

    #[error(transparent)]
    Grouping(#[from] PathGroupingError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Vfs(#[from] VfsError),

    #[error(transparent)]
    Path(#[from] PathError),

    /// The progress callback asked to stop. Carries what was done so far.
    #[error("{operation} cancelled. {summary}")]
    Cancelled {
        operation: &'static str,
        summary: SummaryStatistics,
    },

    /// A root belongs to a storage profile location the host has no rule for.
    #[error(
        "Error occurred while attempting to sync {direction} files: \
         No path mapping rule found for the source path {source_path}"
    )]
    NoPathMappingRule {
        direction: &'static str,
        source_path: String,
    },

    #[error(
        "Total file size required for download ({}) is larger than available disk space ({})",
        human_readable_file_size(*.required),
        human_readable_file_size(*.available)
    )]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No os user set - can't clean up vfs session")]
    OsUserNotSet,
}

impl SyncError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Statistics attached to a cancellation, if this is one.
    pub fn cancelled_summary(&self) -> Option<&SummaryStatistics> {
        match self {
            SyncError::Cancelled { summary, .. } => Some(summary),
            _ => None,
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled { operation, summary } => {
                SyncError::Cancelled { operation, summary }
            }
            other => SyncError::Storage(other),
        }
    }
}

impl From<FileSystemError> for SyncError {
    fn from(err: FileSystemError) -> Self {
        match err {
            FileSystemError::Cancelled { summary } => SyncError::Cancelled {
                operation: "File hashing",
                summary,
            },
            other => SyncError::FileSystem(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_cancellation_is_lifted() {
        let summary: SummaryStatistics = SummaryStatistics {
            processed_files: 3,
            ..SummaryStatistics::default()
        };
        let err: SyncError = StorageError::upload_cancelled(summary).into();
        assert!(matches!(err, SyncError::Cancelled { operation: "File upload", .. }));
        assert_eq!(err.cancelled_summary().map(|s| s.processed_files), Some(3));
    }

    #[test]
    fn test_hashing_cancellation_is_lifted() {
        let err: SyncError = FileSystemError::Cancelled {
            summary: SummaryStatistics::default(),
        }
        .into();
        assert!(matches!(err, SyncError::Cancelled { operation: "File hashing", .. }));
    }

    #[test]
    fn test_other_storage_errors_pass_through() {
        let err: SyncError = StorageError::MissingS3Bucket.into();
        assert!(matches!(err, SyncError::Storage(StorageError::MissingS3Bucket)));
        assert!(err.cancelled_summary().is_none());
    }

    #[test]
    fn test_disk_space_message_is_human_readable() {
        let err: SyncError = SyncError::InsufficientDiskSpace {
            required: 2_000_000,
            available: 1_000,
        };
        let message: String = err.to_string();
        assert!(message.starts_with("Total file size required for download ("));
        assert!(message.contains("larger than available disk space"));
    }
}
