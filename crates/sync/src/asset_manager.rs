//! Submission-side asset handling.
//!
//! A submission runs three stages: group the paths by asset root, hash the
//! inputs into one manifest per root, then upload file contents and
//! manifests. The result is the [`Attachments`] record stored with the job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ja_common::{
    ProgressCallback, ProgressReportMetadata, ProgressStatus, ProgressTracker, SummaryStatistics,
};
use ja_filesystem::ManifestBuilder;
use ja_model::{Attachments, ManifestProperties, ManifestVersion, PathFormat};
use ja_profiles::{
    group_asset_paths, AssetRootGroup, AssetRootManifest, AssetUploadGroup, StorageProfile,
};
use ja_storage::{
    HashCache, JobAttachmentSettings, S3CheckCache, StorageClient, TransferSettings,
    UploadOrchestrator,
};

use crate::error::SyncError;

/// Prepares, hashes and uploads the assets of a job submission.
///
/// # Example
///
/// ```ignore
/// let manager = AssetManager::new(&client, "farm-1", "queue-1", settings)?
///     .with_hash_cache(Arc::new(HashCache::open(None)));
/// let group = manager.prepare_paths_for_upload(&inputs, &outputs, &[], None, true)?;
/// let (_, manifests) = manager
///     .hash_assets_and_create_manifest(&group.asset_groups, group.total_input_files, group.total_input_bytes, None)
///     .await?;
/// let (_, attachments) = manager.upload_assets(&manifests, None, None).await?;
/// ```
pub struct AssetManager<'a, C: StorageClient + ?Sized> {
    client: &'a C,
    farm_id: String,
    queue_id: String,
    job_attachment_settings: JobAttachmentSettings,
    transfer_settings: TransferSettings,
    hash_cache: Arc<HashCache>,
    s3_check_cache: Arc<S3CheckCache>,
    manifest_version: ManifestVersion,
}

impl<'a, C: StorageClient + ?Sized> AssetManager<'a, C> {
    /// Create a manager for one queue.
    ///
    /// # Errors
    /// `MissingS3Bucket` or `MissingS3RootPrefix` if the queue's settings
    /// are incomplete.
    pub fn new(
        client: &'a C,
        farm_id: impl Into<String>,
        queue_id: impl Into<String>,
        job_attachment_settings: JobAttachmentSettings,
    ) -> Result<Self, SyncError> {
        job_attachment_settings.validate()?;
        Ok(Self {
            client,
            farm_id: farm_id.into(),
            queue_id: queue_id.into(),
            job_attachment_settings,
            transfer_settings: TransferSettings::default(),
            hash_cache: Arc::new(HashCache::disabled()),
            s3_check_cache: Arc::new(S3CheckCache::disabled()),
            manifest_version: ManifestVersion::V2023_03_03,
        })
    }

    pub fn with_transfer_settings(mut self, settings: TransferSettings) -> Self {
        self.transfer_settings = settings;
        self
    }

    pub fn with_hash_cache(mut self, cache: Arc<HashCache>) -> Self {
        self.hash_cache = cache;
        self
    }

    pub fn with_s3_check_cache(mut self, cache: Arc<S3CheckCache>) -> Self {
        self.s3_check_cache = cache;
        self
    }

    pub fn with_manifest_version(mut self, version: ManifestVersion) -> Self {
        self.manifest_version = version;
        self
    }

    pub fn job_attachment_settings(&self) -> &JobAttachmentSettings {
        &self.job_attachment_settings
    }

    /// Group submission paths by asset root and total up the inputs.
    ///
    /// # Errors
    /// `MisconfiguredInputs` if inputs are directories, or are missing
    /// while `require_paths_exist` is set.
    pub fn prepare_paths_for_upload(
        &self,
        input_paths: &[PathBuf],
        output_paths: &[PathBuf],
        referenced_paths: &[PathBuf],
        storage_profile: Option<&StorageProfile>,
        require_paths_exist: bool,
    ) -> Result<AssetUploadGroup, SyncError> {
        let groups: Vec<AssetRootGroup> = group_asset_paths(
            input_paths,
            output_paths,
            referenced_paths,
            storage_profile,
            require_paths_exist,
        )?;
        Ok(AssetUploadGroup::from_groups(groups))
    }

    /// Hash every input and build one manifest per asset root.
    ///
    /// # Arguments
    /// * `asset_groups` - Groups from [`prepare_paths_for_upload`](Self::prepare_paths_for_upload)
    /// * `total_input_files` - Number of inputs, for progress
    /// * `total_input_bytes` - Size of the inputs, for progress
    /// * `on_preparing` - Optional progress callback; returning `false` cancels
    ///
    /// # Errors
    /// `Cancelled` with the hashing statistics so far, or the first IO or
    /// cache error.
    pub async fn hash_assets_and_create_manifest(
        &self,
        asset_groups: &[AssetRootGroup],
        total_input_files: u64,
        total_input_bytes: u64,
        on_preparing: Option<Arc<dyn ProgressCallback<ProgressReportMetadata>>>,
    ) -> Result<(SummaryStatistics, Vec<AssetRootManifest>), SyncError> {
        let tracker: ProgressTracker =
            ProgressTracker::new(ProgressStatus::PreparingInProgress, on_preparing);
        tracker.set_total_files(total_input_files, total_input_bytes);

        let manifests: Vec<AssetRootManifest> = ManifestBuilder::new(Arc::clone(&self.hash_cache))
            .with_manifest_version(self.manifest_version)
            .hash_asset_groups(asset_groups, &tracker)
            .await?;

        tracker.stop_timer();
        Ok((tracker.get_summary_statistics(), manifests))
    }

    /// Upload each root's files and input manifest.
    ///
    /// Roots without inputs are still recorded so their output directories
    /// are known to workers.
    ///
    /// # Arguments
    /// * `manifests` - Output of [`hash_assets_and_create_manifest`](Self::hash_assets_and_create_manifest)
    /// * `on_uploading` - Optional progress callback; returning `false` cancels
    /// * `manifest_write_dir` - If set, keep local copies of the manifests there
    ///
    /// # Returns
    /// Upload statistics and the attachments record for the job.
    pub async fn upload_assets(
        &self,
        manifests: &[AssetRootManifest],
        on_uploading: Option<Arc<dyn ProgressCallback<ProgressReportMetadata>>>,
        manifest_write_dir: Option<&Path>,
    ) -> Result<(SummaryStatistics, Attachments), SyncError> {
        let tracker: ProgressTracker =
            ProgressTracker::new(ProgressStatus::UploadInProgress, on_uploading);
        let (total_files, total_bytes): (u64, u64) = manifests
            .iter()
            .filter_map(|m| m.asset_manifest.as_ref())
            .fold((0, 0), |(files, bytes), m| {
                (files + m.file_count() as u64, bytes + m.total_size())
            });
        tracker.set_total_files(total_files, total_bytes);

        let uploader: UploadOrchestrator<'_, C> = UploadOrchestrator::new(self.client)
            .with_settings(self.transfer_settings.clone())
            .with_s3_check_cache(Arc::clone(&self.s3_check_cache));

        let mut manifest_properties: Vec<ManifestProperties> = Vec::with_capacity(manifests.len());
        for root_manifest in manifests {
            let root: &Path = Path::new(&root_manifest.root_path);
            let mut properties: ManifestProperties = ManifestProperties {
                root_path: root_manifest.root_path.clone(),
                root_path_format: PathFormat::host(),
                file_system_location_name: root_manifest.file_system_location_name.clone(),
                input_manifest_path: None,
                input_manifest_hash: None,
                output_relative_directories: Some(relative_output_directories(
                    &root_manifest.outputs,
                    root,
                )),
            };

            if let Some(asset_manifest) = &root_manifest.asset_manifest {
                let partial_prefix: String = self
                    .job_attachment_settings
                    .partial_manifest_prefix(&self.farm_id, &self.queue_id);
                let (partial_manifest_key, manifest_hash): (String, String) = uploader
                    .upload_assets(
                        &self.job_attachment_settings,
                        asset_manifest,
                        &partial_prefix,
                        root,
                        root_manifest.file_system_location_name.as_deref(),
                        &tracker,
                        manifest_write_dir,
                    )
                    .await?;
                properties.input_manifest_path = Some(partial_manifest_key);
                properties.input_manifest_hash = Some(manifest_hash);
            }
            manifest_properties.push(properties);
        }

        tracker.stop_timer();
        Ok((
            tracker.get_summary_statistics(),
            Attachments {
                manifests: manifest_properties,
                ..Attachments::default()
            },
        ))
    }
}

/// Output directories relative to `root`, in host path syntax.
fn relative_output_directories(outputs: &[PathBuf], root: &Path) -> Vec<String> {
    outputs
        .iter()
        .map(|output| match output.strip_prefix(root) {
            Ok(relative) => relative.display().to_string(),
            Err(_) => output.display().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ja_common::{hash_bytes, progress_fn};
    use ja_model::{decode_manifest, AssetManifest};
    use ja_profiles::FileSystemLocation;
    use ja_storage::MemoryStorageClient;
    use tempfile::TempDir;

    const BUCKET: &str = "test-bucket";

    fn settings() -> JobAttachmentSettings {
        JobAttachmentSettings::new(BUCKET, "DeadlineCloud")
    }

    fn write(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path: PathBuf = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_new_rejects_incomplete_settings() {
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let result = AssetManager::new(
            &client,
            "farm-1",
            "queue-1",
            JobAttachmentSettings::new("", "DeadlineCloud"),
        );
        assert!(matches!(
            result,
            Err(SyncError::Storage(ja_storage::StorageError::MissingS3Bucket))
        ));

        let result = AssetManager::new(
            &client,
            "farm-1",
            "queue-1",
            JobAttachmentSettings::new(BUCKET, ""),
        );
        assert!(matches!(
            result,
            Err(SyncError::Storage(ja_storage::StorageError::MissingS3RootPrefix))
        ));
    }

    #[test]
    fn test_prepare_paths_groups_by_location() {
        let project: TempDir = TempDir::new().unwrap();
        let other: TempDir = TempDir::new().unwrap();
        let inside: PathBuf = write(project.path(), "scene.blend", b"scene");
        let outside: PathBuf = write(other.path(), "tex.png", b"texture");

        let profile: StorageProfile = StorageProfile::with_locations(vec![FileSystemLocation::local(
            "ProjectFiles",
            project.path().to_str().unwrap(),
        )]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let manager = AssetManager::new(&client, "farm-1", "queue-1", settings()).unwrap();

        let group: AssetUploadGroup = manager
            .prepare_paths_for_upload(&[inside, outside], &[], &[], Some(&profile), true)
            .unwrap();

        assert_eq!(group.total_input_files, 2);
        assert_eq!(group.total_input_bytes, 12);
        let located: Vec<&AssetRootGroup> = group
            .asset_groups
            .iter()
            .filter(|g| g.file_system_location_name.as_deref() == Some("ProjectFiles"))
            .collect();
        assert_eq!(located.len(), 1);
        assert_eq!(located[0].inputs.len(), 1);
        assert_eq!(group.asset_groups.len(), 2);
    }

    #[test]
    fn test_prepare_paths_reports_directories() {
        let dir: TempDir = TempDir::new().unwrap();
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let manager = AssetManager::new(&client, "farm-1", "queue-1", settings()).unwrap();

        let result = manager.prepare_paths_for_upload(&[dir.path().to_path_buf()], &[], &[], None, true);
        assert!(matches!(result, Err(SyncError::Grouping(_))));
    }

    #[tokio::test]
    async fn test_hash_upload_and_record_attachments() {
        let root: TempDir = TempDir::new().unwrap();
        let cache_dir: TempDir = TempDir::new().unwrap();
        let a: PathBuf = write(root.path(), "inputs/a.txt", b"a");
        let b: PathBuf = write(root.path(), "inputs/b.txt", b"b");
        let outputs: PathBuf = root.path().join("renders");

        let client: MemoryStorageClient = MemoryStorageClient::new();
        let manager = AssetManager::new(&client, "farm-1", "queue-1", settings())
            .unwrap()
            .with_hash_cache(Arc::new(HashCache::try_open(Some(cache_dir.path())).unwrap()));

        let group: AssetUploadGroup = manager
            .prepare_paths_for_upload(&[a, b], &[outputs], &[], None, true)
            .unwrap();
        let (hash_stats, manifests): (SummaryStatistics, Vec<AssetRootManifest>) = manager
            .hash_assets_and_create_manifest(
                &group.asset_groups,
                group.total_input_files,
                group.total_input_bytes,
                None,
            )
            .await
            .unwrap();
        assert_eq!(hash_stats.processed_files, 2);
        assert_eq!(hash_stats.skipped_files, 0);

        let (upload_stats, attachments): (SummaryStatistics, Attachments) =
            manager.upload_assets(&manifests, None, None).await.unwrap();
        assert_eq!(upload_stats.processed_files + upload_stats.skipped_files, 2);
        assert_eq!(upload_stats.processed_bytes + upload_stats.skipped_bytes, 2);

        assert!(client
            .object(BUCKET, &format!("DeadlineCloud/Data/{}", hash_bytes(b"a")))
            .is_some());

        assert_eq!(attachments.manifests.len(), 1);
        let properties: &ManifestProperties = &attachments.manifests[0];
        assert_eq!(properties.root_path_format, PathFormat::host());
        let partial_key: &str = properties.input_manifest_path.as_deref().unwrap();
        assert!(partial_key.starts_with("farm-1/queue-1/Inputs/"));
        assert!(partial_key.ends_with("_input"));

        let stored: Vec<u8> = client
            .object(BUCKET, &format!("DeadlineCloud/Manifests/{}", partial_key))
            .unwrap();
        assert_eq!(
            properties.input_manifest_hash.as_deref(),
            Some(hash_bytes(&stored).as_str())
        );
        let manifest: AssetManifest = decode_manifest(std::str::from_utf8(&stored).unwrap()).unwrap();
        assert_eq!(manifest.file_count(), 2);

        let outputs: &[String] = properties.output_relative_directories.as_deref().unwrap();
        assert!(outputs.iter().any(|d| d.ends_with("renders")));
    }

    #[tokio::test]
    async fn test_second_hash_pass_skips_cached_files() {
        let root: TempDir = TempDir::new().unwrap();
        let cache_dir: TempDir = TempDir::new().unwrap();
        let a: PathBuf = write(root.path(), "a.txt", b"a");

        let client: MemoryStorageClient = MemoryStorageClient::new();
        let manager = AssetManager::new(&client, "farm-1", "queue-1", settings())
            .unwrap()
            .with_hash_cache(Arc::new(HashCache::try_open(Some(cache_dir.path())).unwrap()));
        let group: AssetUploadGroup = manager
            .prepare_paths_for_upload(&[a], &[], &[], None, true)
            .unwrap();

        for expected_skipped in [0, 1] {
            let (stats, _): (SummaryStatistics, Vec<AssetRootManifest>) = manager
                .hash_assets_and_create_manifest(&group.asset_groups, 1, 1, None)
                .await
                .unwrap();
            assert_eq!(stats.skipped_files, expected_skipped);
            assert_eq!(stats.processed_files + stats.skipped_files, 1);
        }
    }

    #[tokio::test]
    async fn test_cancelled_upload_carries_statistics() {
        let root: TempDir = TempDir::new().unwrap();
        let inputs: Vec<PathBuf> = (0..10)
            .map(|i| write(root.path(), &format!("f{}.txt", i), format!("{}", i).as_bytes()))
            .collect();

        let client: MemoryStorageClient = MemoryStorageClient::new();
        let manager = AssetManager::new(&client, "farm-1", "queue-1", settings())
            .unwrap()
            .with_transfer_settings(TransferSettings::default().with_s3_max_pool_connections(1));
        let group: AssetUploadGroup = manager
            .prepare_paths_for_upload(&inputs, &[], &[], None, true)
            .unwrap();
        let (_, manifests): (SummaryStatistics, Vec<AssetRootManifest>) = manager
            .hash_assets_and_create_manifest(&group.asset_groups, 10, 10, None)
            .await
            .unwrap();

        let cancel = progress_fn(|_: &ProgressReportMetadata| false);
        let result = manager.upload_assets(&manifests, Some(Arc::new(cancel)), None).await;

        let err: SyncError = result.unwrap_err();
        let summary: &SummaryStatistics = err.cancelled_summary().unwrap();
        assert!(summary.processed_files < 10);
        let uploaded: usize = client
            .keys(BUCKET)
            .iter()
            .filter(|k| k.starts_with("DeadlineCloud/Data/"))
            .count();
        assert_eq!(uploaded as u64, summary.processed_files);
    }
}
