//! In-memory [`StorageClient`] for tests.
//!
//! Objects live in a map keyed by bucket and key. Failures can be injected
//! per action and key, or per multipart part number, and request counters
//! let tests assert which calls were made.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{S3Action, StorageClientError, StorageError};
use crate::traits::{ByteProgress, CompletedPart, ObjectInfo, StorageClient};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    last_modified: i64,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    action: S3Action,
    key_fragment: String,
    status_code: u16,
}

#[derive(Debug, Default)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

/// Request counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryClientStats {
    pub head_requests: u64,
    pub put_requests: u64,
    pub get_requests: u64,
    pub list_requests: u64,
    pub parts_uploaded: u64,
    pub completed_multipart_uploads: u64,
    pub aborted_multipart_uploads: u64,
}

/// Object store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStorageClient {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    failures: Mutex<Vec<InjectedFailure>>,
    failing_parts: Mutex<HashMap<i32, u16>>,
    stats: Mutex<MemoryClientStats>,
    next_upload_id: AtomicU64,
}

impl MemoryStorageClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing counters and failures.
    pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.insert_object_with_metadata(bucket, key, data, HashMap::new());
    }

    pub fn insert_object_with_metadata(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Vec<u8>>,
        metadata: HashMap<String, String>,
    ) {
        self.store(bucket, key, data.into(), None, metadata);
    }

    /// Contents of an object, if present.
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn object_metadata(&self, bucket: &str, key: &str) -> Option<HashMap<String, String>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.metadata.clone())
    }

    pub fn object_content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|o| o.content_type.clone())
    }

    /// All keys in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Fail every `action` on keys containing `key_fragment` with `status_code`.
    pub fn fail_on(&self, action: S3Action, key_fragment: &str, status_code: u16) {
        self.failures.lock().push(InjectedFailure {
            action,
            key_fragment: key_fragment.to_string(),
            status_code,
        });
    }

    /// Fail uploads of part `part_number` of any multipart upload.
    pub fn fail_part(&self, part_number: i32, status_code: u16) {
        self.failing_parts.lock().insert(part_number, status_code);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
        self.failing_parts.lock().clear();
    }

    pub fn stats(&self) -> MemoryClientStats {
        self.stats.lock().clone()
    }

    /// Multipart uploads neither completed nor aborted.
    pub fn pending_multipart_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    fn check_failure(&self, action: S3Action, bucket: &str, key: &str) -> Result<(), StorageError> {
        let failures = self.failures.lock();
        match failures
            .iter()
            .find(|f| f.action == action && key.contains(&f.key_fragment))
        {
            Some(f) => Err(StorageClientError::new(
                action,
                f.status_code,
                bucket,
                key,
                "injected failure",
            )
            .into()),
            None => Ok(()),
        }
    }

    fn store(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) {
        let object: StoredObject = StoredObject {
            data,
            content_type,
            metadata,
            last_modified: chrono::Utc::now().timestamp(),
        };
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), object);
    }

    fn not_found(action: S3Action, bucket: &str, key: &str) -> StorageError {
        StorageClientError::new(action, 404, bucket, key, "NoSuchKey").into()
    }

    fn info(key: &str, object: &StoredObject, with_metadata: bool) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: object.data.len() as u64,
            last_modified: Some(object.last_modified),
            etag: None,
            content_type: object.content_type.clone(),
            metadata: if with_metadata {
                object.metadata.clone()
            } else {
                HashMap::new()
            },
        }
    }
}

#[async_trait]
impl StorageClient for MemoryStorageClient {
    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectInfo>, StorageError> {
        self.stats.lock().head_requests += 1;
        self.check_failure(S3Action::HeadObject, bucket, key)?;
        Ok(self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| Self::info(key, o, true)))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), StorageError> {
        self.stats.lock().put_requests += 1;
        self.check_failure(S3Action::UploadBinary, bucket, key)?;
        self.store(
            bucket,
            key,
            data.to_vec(),
            content_type.map(str::to_string),
            metadata.cloned().unwrap_or_default(),
        );
        Ok(())
    }

    async fn put_object_from_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<(), StorageError> {
        self.stats.lock().put_requests += 1;
        self.check_failure(S3Action::UploadFile, bucket, key)?;
        let data: Vec<u8> = tokio::fs::read(file_path)
            .await
            .map_err(|e| StorageError::io(file_path, e))?;
        if let Some(cb) = progress {
            cb.on_progress(&(data.len() as u64));
        }
        self.store(bucket, key, data, None, HashMap::new());
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.stats.lock().get_requests += 1;
        self.check_failure(S3Action::DownloadBinary, bucket, key)?;
        self.object(bucket, key)
            .ok_or_else(|| Self::not_found(S3Action::DownloadBinary, bucket, key))
    }

    async fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<u64, StorageError> {
        self.stats.lock().get_requests += 1;
        self.check_failure(S3Action::DownloadFile, bucket, key)?;
        let data: Vec<u8> = self
            .object(bucket, key)
            .ok_or_else(|| Self::not_found(S3Action::DownloadFile, bucket, key))?;
        tokio::fs::write(file_path, &data)
            .await
            .map_err(|e| StorageError::io(file_path, e))?;
        if let Some(cb) = progress {
            cb.on_progress(&(data.len() as u64));
        }
        Ok(data.len() as u64)
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        self.stats.lock().list_requests += 1;
        self.check_failure(S3Action::ListObjects, bucket, prefix)?;
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), o)| Self::info(k, o, false))
            .collect())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, StorageError> {
        self.check_failure(S3Action::UploadFile, bucket, key)?;
        let upload_id: String = format!(
            "upload-{}",
            self.next_upload_id.fetch_add(1, Ordering::SeqCst)
        );
        self.uploads.lock().insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError> {
        if let Some(status) = self.failing_parts.lock().get(&part_number).copied() {
            return Err(StorageClientError::new(
                S3Action::UploadFile,
                status,
                bucket,
                key,
                format!("injected failure on part {}", part_number),
            )
            .into());
        }

        let mut uploads = self.uploads.lock();
        let pending: &mut PendingUpload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| Self::not_found(S3Action::UploadFile, bucket, key))?;
        pending.parts.insert(part_number, data);
        self.stats.lock().parts_uploaded += 1;
        Ok(CompletedPart {
            part_number,
            etag: format!("etag-{}", part_number),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let pending: PendingUpload = self
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or_else(|| Self::not_found(S3Action::UploadFile, bucket, key))?;

        let mut data: Vec<u8> = Vec::new();
        for part in &parts {
            let bytes: &Vec<u8> = pending.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::from(StorageClientError::new(
                    S3Action::UploadFile,
                    400,
                    bucket,
                    key,
                    format!("InvalidPart {}", part.part_number),
                ))
            })?;
            data.extend_from_slice(bytes);
        }
        self.store(&pending.bucket, &pending.key, data, None, HashMap::new());
        self.stats.lock().completed_multipart_uploads += 1;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.uploads.lock().remove(upload_id);
        self.stats.lock().aborted_multipart_uploads += 1;
        Ok(())
    }
}
