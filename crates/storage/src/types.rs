//! Settings and shared data structures for storage operations.

use ja_common::{
    DEFAULT_DOWNLOAD_MAX_CONCURRENCY, DEFAULT_LIST_OBJECT_THRESHOLD, DEFAULT_MULTIPART_CHUNK_SIZE,
    DEFAULT_MULTIPART_MAX_WORKERS, DEFAULT_S3_MAX_POOL_CONNECTIONS,
    DEFAULT_SMALL_FILE_THRESHOLD_MULTIPLIER,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

/// Folder under the root prefix holding content-addressed objects.
pub const S3_DATA_FOLDER_NAME: &str = "Data";
/// Folder under the root prefix holding manifests.
pub const S3_MANIFEST_FOLDER_NAME: &str = "Manifests";
/// Folder under `<farm>/<queue>` holding per-submission input manifests.
pub const S3_INPUT_MANIFEST_FOLDER_NAME: &str = "Inputs";

/// Join key segments with `/`, ignoring empty segments and stray slashes.
pub fn join_s3_paths<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| p.as_ref().trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<&str>>()
        .join("/")
}

/// Random identifier for a submission's input manifest folder (32 hex chars).
pub fn generate_random_guid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Queue-level bucket and key prefix for job attachments.
///
/// Every key derived here requires a non-empty `root_prefix`; see
/// [`validate`](Self::validate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAttachmentSettings {
    pub s3_bucket_name: String,
    pub root_prefix: String,
}

impl JobAttachmentSettings {
    pub fn new(s3_bucket_name: impl Into<String>, root_prefix: impl Into<String>) -> Self {
        Self {
            s3_bucket_name: s3_bucket_name.into(),
            root_prefix: root_prefix.into(),
        }
    }

    /// Fail with a configuration error if the bucket or root prefix is empty.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.s3_bucket_name.is_empty() {
            return Err(StorageError::MissingS3Bucket);
        }
        self.validate_root_prefix()
    }

    fn validate_root_prefix(&self) -> Result<(), StorageError> {
        if self.root_prefix.is_empty() {
            return Err(StorageError::MissingS3RootPrefix);
        }
        Ok(())
    }

    /// `<root>/Data`
    pub fn full_cas_prefix(&self) -> Result<String, StorageError> {
        self.validate_root_prefix()?;
        Ok(join_s3_paths(&[self.root_prefix.as_str(), S3_DATA_FOLDER_NAME]))
    }

    /// Key of one CAS object: `<root>/Data/<hash>`.
    pub fn cas_key(&self, hash: &str) -> Result<String, StorageError> {
        Ok(join_s3_paths(&[self.full_cas_prefix()?.as_str(), hash]))
    }

    /// `<root>/Manifests/<farm>/<queue>/<job>`
    pub fn full_job_output_prefix(
        &self,
        farm_id: &str,
        queue_id: &str,
        job_id: &str,
    ) -> Result<String, StorageError> {
        self.manifest_key(&[farm_id, queue_id, job_id])
    }

    /// `<root>/Manifests/<farm>/<queue>/<job>/<step>`
    pub fn full_step_output_prefix(
        &self,
        farm_id: &str,
        queue_id: &str,
        job_id: &str,
        step_id: &str,
    ) -> Result<String, StorageError> {
        self.manifest_key(&[farm_id, queue_id, job_id, step_id])
    }

    /// `<root>/Manifests/<farm>/<queue>/<job>/<step>/<task>`
    pub fn full_task_output_prefix(
        &self,
        farm_id: &str,
        queue_id: &str,
        job_id: &str,
        step_id: &str,
        task_id: &str,
    ) -> Result<String, StorageError> {
        self.manifest_key(&[farm_id, queue_id, job_id, step_id, task_id])
    }

    /// `<root>/Manifests/<farm>/<queue>/<job>/<step>/<task>/<session action folder>`
    pub fn full_output_prefix(
        &self,
        farm_id: &str,
        queue_id: &str,
        job_id: &str,
        step_id: &str,
        task_id: &str,
        session_action_folder: &str,
    ) -> Result<String, StorageError> {
        self.manifest_key(&[
            farm_id,
            queue_id,
            job_id,
            step_id,
            task_id,
            session_action_folder,
        ])
    }

    /// `<farm>/<queue>/Inputs/<guid>`, relative to the manifest folder.
    ///
    /// A fresh guid is drawn on every call.
    pub fn partial_manifest_prefix(&self, farm_id: &str, queue_id: &str) -> String {
        join_s3_paths(&[
            farm_id,
            queue_id,
            S3_INPUT_MANIFEST_FOLDER_NAME,
            generate_random_guid().as_str(),
        ])
    }

    /// Prepend `<root>/Manifests/` to a partial manifest key.
    pub fn add_root_and_manifest_folder_prefix(&self, path: &str) -> Result<String, StorageError> {
        self.manifest_key(&[path])
    }

    fn manifest_key(&self, parts: &[&str]) -> Result<String, StorageError> {
        self.validate_root_prefix()?;
        let mut segments: Vec<&str> = vec![self.root_prefix.as_str(), S3_MANIFEST_FOLDER_NAME];
        segments.extend_from_slice(parts);
        Ok(join_s3_paths(&segments))
    }
}

/// Operator tunables for transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSettings {
    /// Above this many objects the uploader lists the CAS prefix instead of
    /// probing each object.
    pub list_object_threshold: usize,
    /// Bytes per multipart part before part-count adjustment.
    pub multipart_chunk_size: u64,
    /// Parallel part uploads for one large file.
    pub multipart_max_workers: usize,
    /// Files up to `multipart_chunk_size * multiplier` bytes are "small".
    pub small_file_threshold_multiplier: u64,
    pub s3_max_pool_connections: usize,
    pub max_download_concurrency: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            list_object_threshold: DEFAULT_LIST_OBJECT_THRESHOLD,
            multipart_chunk_size: DEFAULT_MULTIPART_CHUNK_SIZE,
            multipart_max_workers: DEFAULT_MULTIPART_MAX_WORKERS,
            small_file_threshold_multiplier: DEFAULT_SMALL_FILE_THRESHOLD_MULTIPLIER,
            s3_max_pool_connections: DEFAULT_S3_MAX_POOL_CONNECTIONS,
            max_download_concurrency: DEFAULT_DOWNLOAD_MAX_CONCURRENCY,
        }
    }
}

impl TransferSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list_object_threshold(mut self, threshold: usize) -> Self {
        self.list_object_threshold = threshold;
        self
    }

    pub fn with_multipart_chunk_size(mut self, chunk_size: u64) -> Self {
        self.multipart_chunk_size = chunk_size;
        self
    }

    pub fn with_multipart_max_workers(mut self, workers: usize) -> Self {
        self.multipart_max_workers = workers;
        self
    }

    pub fn with_small_file_threshold_multiplier(mut self, multiplier: u64) -> Self {
        self.small_file_threshold_multiplier = multiplier;
        self
    }

    pub fn with_s3_max_pool_connections(mut self, connections: usize) -> Self {
        self.s3_max_pool_connections = connections;
        self
    }

    pub fn with_max_download_concurrency(mut self, concurrency: usize) -> Self {
        self.max_download_concurrency = concurrency;
        self
    }

    /// Reject zero-valued tunables.
    pub fn validate(&self) -> Result<(), StorageError> {
        let zero: Option<&str> = if self.small_file_threshold_multiplier == 0 {
            Some("small_file_threshold_multiplier")
        } else if self.s3_max_pool_connections == 0 {
            Some("s3_max_pool_connections")
        } else if self.multipart_chunk_size == 0 {
            Some("multipart_chunk_size")
        } else if self.multipart_max_workers == 0 {
            Some("multipart_max_workers")
        } else if self.max_download_concurrency == 0 {
            Some("max_download_concurrency")
        } else {
            None
        };
        match zero {
            Some(name) => Err(StorageError::InvalidConfig {
                message: format!("{} must be greater than 0", name),
            }),
            None => Ok(()),
        }
    }

    /// Largest size, in bytes, of a file in the small-file queue.
    pub fn small_file_threshold(&self) -> u64 {
        self.multipart_chunk_size
            .saturating_mul(self.small_file_threshold_multiplier)
    }

    /// Concurrent whole-file uploads for the small-file queue.
    pub fn num_upload_workers(&self) -> usize {
        let divisor: usize = (self.small_file_threshold_multiplier.min(10) as usize).max(1);
        (self.s3_max_pool_connections / divisor).max(1)
    }
}

/// Settings for constructing a production storage client.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// AWS region.
    pub region: String,
    /// Static credentials; `None` uses the default provider chain.
    pub credentials: Option<AwsCredentials>,
    /// Sent with every request so a bucket owned by another account is refused.
    pub expected_bucket_owner: Option<String>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds.
    pub read_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            region: "us-west-2".into(),
            credentials: None,
            expected_bucket_owner: None,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
        }
    }
}

/// AWS credentials.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// How to handle conflicts when downloading files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolution {
    /// Keep the existing file and count it as skipped.
    Skip,
    /// Replace the existing file.
    Overwrite,
    /// Write to "file (1).ext", "file (1) (1).ext", ... until unused.
    #[default]
    CreateCopy,
}

/// Group ownership and mode bits applied to downloaded files (POSIX).
///
/// Modes are OR'ed into the existing permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemPermissionSettings {
    /// User the job runs as. Used by the virtual filesystem.
    pub os_user: String,
    pub os_group: String,
    pub dir_mode: u32,
    pub file_mode: u32,
}

/// A permission adjustment that failed after the file was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemPermissionWarning {
    pub path: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> JobAttachmentSettings {
        JobAttachmentSettings::new("test-bucket", "DeadlineCloud")
    }

    #[test]
    fn test_prefixes() {
        let s: JobAttachmentSettings = settings();

        assert_eq!(s.full_cas_prefix().unwrap(), "DeadlineCloud/Data");
        assert_eq!(s.cas_key("abc").unwrap(), "DeadlineCloud/Data/abc");
        assert_eq!(
            s.full_job_output_prefix("farm-1", "queue-1", "job-1").unwrap(),
            "DeadlineCloud/Manifests/farm-1/queue-1/job-1"
        );
        assert_eq!(
            s.full_task_output_prefix("farm-1", "queue-1", "job-1", "step-1", "task-1")
                .unwrap(),
            "DeadlineCloud/Manifests/farm-1/queue-1/job-1/step-1/task-1"
        );
        assert_eq!(
            s.add_root_and_manifest_folder_prefix("farm-1/queue-1/Inputs/abc/x_input")
                .unwrap(),
            "DeadlineCloud/Manifests/farm-1/queue-1/Inputs/abc/x_input"
        );
    }

    #[test]
    fn test_partial_manifest_prefix_is_unique() {
        let s: JobAttachmentSettings = settings();
        let a: String = s.partial_manifest_prefix("farm-1", "queue-1");
        let b: String = s.partial_manifest_prefix("farm-1", "queue-1");

        assert!(a.starts_with("farm-1/queue-1/Inputs/"));
        assert_eq!(a.rsplit('/').next().map(str::len), Some(32));
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_settings_are_errors() {
        let no_prefix: JobAttachmentSettings = JobAttachmentSettings::new("bucket", "");
        assert!(matches!(
            no_prefix.full_cas_prefix(),
            Err(StorageError::MissingS3RootPrefix)
        ));

        let no_bucket: JobAttachmentSettings = JobAttachmentSettings::new("", "Root");
        assert!(matches!(
            no_bucket.validate(),
            Err(StorageError::MissingS3Bucket)
        ));
    }

    #[test]
    fn test_settings_json_uses_service_names() {
        let json: &str = r#"{"s3BucketName": "b", "rootPrefix": "r"}"#;
        let s: JobAttachmentSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s, JobAttachmentSettings::new("b", "r"));
    }

    #[test]
    fn test_transfer_settings_derived_values() {
        let defaults: TransferSettings = TransferSettings::default();
        assert_eq!(defaults.small_file_threshold(), 160 * 1024 * 1024);
        assert_eq!(defaults.num_upload_workers(), 5);

        let custom: TransferSettings = TransferSettings::new()
            .with_small_file_threshold_multiplier(2)
            .with_s3_max_pool_connections(1);
        assert_eq!(custom.num_upload_workers(), 1);

        let zero: TransferSettings = TransferSettings::new().with_s3_max_pool_connections(0);
        assert!(matches!(
            zero.validate(),
            Err(StorageError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_join_s3_paths_skips_empty_segments() {
        assert_eq!(join_s3_paths(&["a/", "", "/b", "c"]), "a/b/c");
    }
}
