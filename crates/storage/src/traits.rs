//! Object storage interface consumed by the uploader and downloader.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use ja_common::{ProgressCallback, ProgressTracker};

use crate::error::StorageError;

/// Information about an object from list/head operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modified timestamp (Unix epoch seconds).
    pub last_modified: Option<i64>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    /// User metadata. Only populated by `head_object`.
    pub metadata: HashMap<String, String>,
}

/// A part accepted by the object store during a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: i32,
    pub etag: String,
}

/// Byte progress for a single transfer.
///
/// Clients report every chunk they move. Cancellation is decided by the
/// caller between files and parts, so clients do not act on the return value.
pub type ByteProgress<'a> = Option<&'a dyn ProgressCallback<u64>>;

/// Forwards byte counts from a transfer into a [`ProgressTracker`].
pub struct TrackerBytes<'a>(pub &'a ProgressTracker);

impl ProgressCallback<u64> for TrackerBytes<'_> {
    fn on_progress(&self, bytes: &u64) -> bool {
        self.0.track_progress_callback(*bytes, false)
    }
}

/// Object storage operations - implemented by each backend.
///
/// Every failure with a status code must surface as
/// [`StorageError::Client`] so callers can classify it.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Object info with user metadata, or `None` on 404.
    async fn head_object(&self, bucket: &str, key: &str)
        -> Result<Option<ObjectInfo>, StorageError>;

    /// Upload bytes.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), StorageError>;

    /// Upload a whole local file in a single request.
    async fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<(), StorageError>;

    /// Download an object into memory.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Stream an object into a local file, creating or truncating it.
    ///
    /// # Returns
    /// Bytes written.
    async fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<u64, StorageError>;

    /// List every object under `prefix`, following pagination.
    async fn list_objects(&self, bucket: &str, prefix: &str)
        -> Result<Vec<ObjectInfo>, StorageError>;

    /// Start a multipart upload.
    ///
    /// # Returns
    /// The upload id.
    async fn create_multipart_upload(&self, bucket: &str, key: &str)
        -> Result<String, StorageError>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError>;

    /// Finish a multipart upload. `parts` must be in part-number order.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError>;
}
