//! Upload orchestration for CAS storage.
//!
//! Works with any [`StorageClient`] implementation and handles:
//!
//! - Deduplication of identical content within one manifest
//! - Existence checks (S3 check cache, then HEAD or a single LIST)
//! - Small/large file queue separation
//! - Multipart uploads with abort on failure or cancellation
//! - Progress reporting and cancellation through a [`ProgressTracker`]
//!
//! # Upload Strategy
//!
//! Files up to [`TransferSettings::small_file_threshold`] are uploaded
//! concurrently. Larger files go one at a time, each with its parts uploaded
//! concurrently, so a cancel wastes as little sent data as possible.
//!
//! # Example
//!
//! ```ignore
//! let orchestrator = UploadOrchestrator::new(&client)
//!     .with_s3_check_cache(Arc::new(S3CheckCache::open(None)));
//! let (partial_key, manifest_hash) = orchestrator
//!     .upload_assets(&settings, &manifest, &prefix, root, None, &tracker, None)
//!     .await?;
//! ```

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use ja_common::{from_posix_path, ProgressTracker};
use ja_model::{AssetManifest, ManifestPath};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::cas::{needs_multipart, plan_multipart, PartInfo};
use crate::error::StorageError;
use crate::manifest_storage::{compute_root_path_hash, manifest_content_type};
use crate::s3_check_cache::S3CheckCache;
use crate::traits::{CompletedPart, StorageClient, TrackerBytes};
use crate::types::{join_s3_paths, JobAttachmentSettings, TransferSettings};

/// Name of the file that maps local manifest copies to their S3 keys.
pub const MANIFEST_S3_MAPPING_FILE: &str = "manifest_s3_mapping";

/// What happened to one manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Uploaded,
    /// Already in the CAS, either cached or confirmed by the store.
    AlreadyPresent,
    /// Missing, not a regular file, or unreadable on disk.
    Unreadable,
    /// Not started because the operation was cancelled.
    Cancelled,
}

/// High-level upload operations using any [`StorageClient`] implementation.
pub struct UploadOrchestrator<'a, C: StorageClient + ?Sized> {
    client: &'a C,
    settings: TransferSettings,
    s3_check_cache: Arc<S3CheckCache>,
}

impl<'a, C: StorageClient + ?Sized> UploadOrchestrator<'a, C> {
    /// Create an orchestrator with default transfer settings and no S3 check cache.
    pub fn new(client: &'a C) -> Self {
        Self {
            client,
            settings: TransferSettings::default(),
            s3_check_cache: Arc::new(S3CheckCache::disabled()),
        }
    }

    pub fn with_settings(mut self, settings: TransferSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the S3 check cache consulted before any existence request.
    pub fn with_s3_check_cache(mut self, cache: Arc<S3CheckCache>) -> Self {
        self.s3_check_cache = cache;
        self
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Upload the files of a manifest, then the manifest itself.
    ///
    /// The manifest is written to
    /// `<root>/Manifests/<partial_prefix>/<hash(location + root)>_input`.
    ///
    /// # Arguments
    /// * `job_settings` - Bucket and root prefix of the queue
    /// * `manifest` - Manifest describing the files under `source_root`
    /// * `partial_manifest_prefix` - e.g. `farm-1/queue-1/Inputs/<guid>`
    /// * `source_root` - Local root the manifest paths are relative to
    /// * `file_system_location_name` - Storage profile location of the root, if any
    /// * `tracker` - Upload progress and cancellation
    /// * `manifest_write_dir` - If set, keep a local copy of the manifest there
    ///
    /// # Returns
    /// The partial manifest key and the hash of the manifest bytes.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_assets(
        &self,
        job_settings: &JobAttachmentSettings,
        manifest: &AssetManifest,
        partial_manifest_prefix: &str,
        source_root: &Path,
        file_system_location_name: Option<&str>,
        tracker: &ProgressTracker,
        manifest_write_dir: Option<&Path>,
    ) -> Result<(String, String), StorageError> {
        job_settings.validate()?;

        let manifest_text: String = manifest.encode()?;
        let manifest_name: String = format!(
            "{}_input",
            compute_root_path_hash(
                file_system_location_name,
                &source_root.to_string_lossy()
            )
        );
        let partial_manifest_key: String = if partial_manifest_prefix.is_empty() {
            manifest_name.clone()
        } else {
            join_s3_paths(&[partial_manifest_prefix, manifest_name.as_str()])
        };
        let full_manifest_key: String =
            job_settings.add_root_and_manifest_folder_prefix(&partial_manifest_key)?;

        if let Some(dir) = manifest_write_dir {
            write_local_manifest(dir, &manifest_name, &full_manifest_key, &manifest_text).await?;
        }

        self.upload_input_files(
            manifest,
            &job_settings.s3_bucket_name,
            source_root,
            &job_settings.full_cas_prefix()?,
            tracker,
        )
        .await?;

        log::info!("Uploading input manifest to {}", full_manifest_key);
        self.client
            .put_object(
                &job_settings.s3_bucket_name,
                &full_manifest_key,
                manifest_text.as_bytes(),
                Some(&manifest_content_type(manifest)),
                None,
            )
            .await?;

        Ok((
            partial_manifest_key,
            manifest.hash_alg.hash_data(manifest_text.as_bytes()),
        ))
    }

    /// Upload every file in `manifest` that is not already in the CAS.
    ///
    /// Entries sharing a hash are uploaded once; the rest count as skipped.
    /// Missing or non-regular source files are logged and counted as skipped.
    ///
    /// # Errors
    /// `Cancelled` with the statistics so far if the tracker's callback
    /// asked to stop; otherwise the first storage or I/O failure.
    pub async fn upload_input_files(
        &self,
        manifest: &AssetManifest,
        bucket: &str,
        source_root: &Path,
        cas_prefix: &str,
        tracker: &ProgressTracker,
    ) -> Result<(), StorageError> {
        let mut seen_hashes: HashSet<&str> = HashSet::new();
        let mut unique: Vec<&ManifestPath> = Vec::new();
        for file in manifest.paths() {
            if seen_hashes.insert(file.hash.as_str()) {
                unique.push(file);
            } else {
                log::debug!("Skipping {}: content already queued for upload", file.path);
                tracker.increase_skipped(1, file.size);
            }
        }

        let existing: Option<HashSet<String>> = if unique.len() > self.settings.list_object_threshold
        {
            log::debug!(
                "Listing s3://{}/{} to check {} objects",
                bucket,
                cas_prefix,
                unique.len()
            );
            Some(self.list_existing_keys(bucket, cas_prefix).await?)
        } else {
            log::debug!("Checking {} objects individually", unique.len());
            None
        };

        let threshold: u64 = self.settings.small_file_threshold();
        let (small_files, large_files): (Vec<&ManifestPath>, Vec<&ManifestPath>) =
            unique.into_iter().partition(|f| f.size <= threshold);

        let mut small_results = stream::iter(small_files)
            .map(|file| {
                self.upload_object_to_cas(
                    file,
                    bucket,
                    source_root,
                    cas_prefix,
                    existing.as_ref(),
                    tracker,
                )
            })
            .buffer_unordered(self.settings.num_upload_workers());
        while let Some(result) = small_results.next().await {
            let (outcome, size): (FileOutcome, u64) = result?;
            record_outcome(tracker, outcome, size);
        }
        drop(small_results);

        for file in large_files {
            let (outcome, size): (FileOutcome, u64) = self
                .upload_object_to_cas(
                    file,
                    bucket,
                    source_root,
                    cas_prefix,
                    existing.as_ref(),
                    tracker,
                )
                .await?;
            record_outcome(tracker, outcome, size);
        }

        tracker.report_progress();
        if !tracker.continue_reporting() {
            return Err(StorageError::upload_cancelled(
                tracker.get_summary_statistics(),
            ));
        }
        Ok(())
    }

    async fn list_existing_keys(
        &self,
        bucket: &str,
        cas_prefix: &str,
    ) -> Result<HashSet<String>, StorageError> {
        let prefix: String = format!("{}/", cas_prefix.trim_end_matches('/'));
        Ok(self
            .client
            .list_objects(bucket, &prefix)
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect())
    }

    async fn upload_object_to_cas(
        &self,
        file: &ManifestPath,
        bucket: &str,
        source_root: &Path,
        cas_prefix: &str,
        existing: Option<&HashSet<String>>,
        tracker: &ProgressTracker,
    ) -> Result<(FileOutcome, u64), StorageError> {
        if !tracker.continue_reporting() {
            return Ok((FileOutcome::Cancelled, file.size));
        }

        let key: String = join_s3_paths(&[cas_prefix, file.hash.as_str()]);
        let local_path: PathBuf = from_posix_path(&file.path, source_root);

        if self.cache_contains(bucket, &key).await {
            log::debug!(
                "Skipping {} because {}/{} exists in the cache",
                local_path.display(),
                bucket,
                key
            );
            return Ok((FileOutcome::AlreadyPresent, file.size));
        }

        let present: bool = match existing {
            Some(keys) => keys.contains(&key),
            None => self.client.head_object(bucket, &key).await?.is_some(),
        };
        if present {
            log::debug!(
                "Skipping {} because it has already been uploaded to s3://{}/{}",
                local_path.display(),
                bucket,
                key
            );
            self.mark_seen(bucket, &key).await;
            return Ok((FileOutcome::AlreadyPresent, file.size));
        }

        let size: u64 = match tokio::fs::symlink_metadata(&local_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                log::warn!(
                    "Skipping {}: not a regular file",
                    local_path.display()
                );
                return Ok((FileOutcome::Unreadable, file.size));
            }
            Err(e) => {
                log::warn!("Skipping {}: {}", local_path.display(), e);
                return Ok((FileOutcome::Unreadable, file.size));
            }
        };

        if needs_multipart(size, self.settings.multipart_chunk_size) {
            let completed: bool = self
                .upload_multipart(bucket, &key, &local_path, size, tracker)
                .await
                .map_err(|e| with_local_path(e, &local_path))?;
            if !completed {
                return Ok((FileOutcome::Cancelled, file.size));
            }
        } else {
            let progress: TrackerBytes<'_> = TrackerBytes(tracker);
            self.client
                .put_object_from_file(bucket, &key, &local_path, Some(&progress))
                .await
                .map_err(|e| with_local_path(e, &local_path))?;
        }

        self.mark_seen(bucket, &key).await;
        Ok((FileOutcome::Uploaded, file.size))
    }

    /// Upload one file in parts.
    ///
    /// # Returns
    /// `false` if cancelled before every part was sent. The upload is aborted
    /// server-side on cancellation and on any error. Parts sent before a
    /// cancellation stay counted in the tracker's processed bytes, while the
    /// file itself is never counted as processed.
    async fn upload_multipart(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
        size: u64,
        tracker: &ProgressTracker,
    ) -> Result<bool, StorageError> {
        let parts: Vec<PartInfo> = plan_multipart(size, self.settings.multipart_chunk_size);
        let upload_id: String = self.client.create_multipart_upload(bucket, key).await?;
        log::debug!(
            "Multipart upload {} of {} in {} parts",
            upload_id,
            key,
            parts.len()
        );

        let upload_id_ref: &str = upload_id.as_str();
        let result: Result<Vec<Option<CompletedPart>>, StorageError> = stream::iter(parts)
            .map(|part| async move {
                if !tracker.continue_reporting() {
                    return Ok::<Option<CompletedPart>, StorageError>(None);
                }
                let data: Vec<u8> = read_part(local_path, &part).await?;
                let completed: CompletedPart = self
                    .client
                    .upload_part(bucket, key, upload_id_ref, part.part_number, data)
                    .await?;
                tracker.track_progress_callback(part.length, false);
                Ok(Some(completed))
            })
            .buffer_unordered(self.settings.multipart_max_workers.max(1))
            .try_collect()
            .await;

        let parts: Vec<Option<CompletedPart>> = match result {
            Ok(parts) => parts,
            Err(e) => {
                self.abort(bucket, key, &upload_id).await;
                return Err(e);
            }
        };
        if parts.iter().any(Option::is_none) {
            log::debug!("Aborting multipart upload of {} after cancellation", key);
            self.abort(bucket, key, &upload_id).await;
            return Ok(false);
        }

        let mut completed: Vec<CompletedPart> = parts.into_iter().flatten().collect();
        completed.sort_by_key(|p| p.part_number);
        if let Err(e) = self
            .client
            .complete_multipart_upload(bucket, key, &upload_id, completed)
            .await
        {
            self.abort(bucket, key, &upload_id).await;
            return Err(e);
        }
        Ok(true)
    }

    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload(bucket, key, upload_id)
            .await
        {
            log::warn!(
                "Failed to abort multipart upload {} of s3://{}/{}: {}",
                upload_id,
                bucket,
                key,
                e
            );
        }
    }

    async fn cache_contains(&self, bucket: &str, key: &str) -> bool {
        if !self.s3_check_cache.is_enabled() {
            return false;
        }
        let cache: Arc<S3CheckCache> = Arc::clone(&self.s3_check_cache);
        let (bucket, key): (String, String) = (bucket.to_string(), key.to_string());
        tokio::task::spawn_blocking(move || cache.contains(&bucket, &key))
            .await
            .unwrap_or_else(|e| {
                log::warn!("S3 check cache lookup task failed: {}", e);
                false
            })
    }

    async fn mark_seen(&self, bucket: &str, key: &str) {
        if !self.s3_check_cache.is_enabled() {
            return;
        }
        let cache: Arc<S3CheckCache> = Arc::clone(&self.s3_check_cache);
        let (bucket, key): (String, String) = (bucket.to_string(), key.to_string());
        if let Err(e) = tokio::task::spawn_blocking(move || cache.mark_seen(&bucket, &key)).await {
            log::warn!("S3 check cache update task failed: {}", e);
        }
    }
}

fn record_outcome(tracker: &ProgressTracker, outcome: FileOutcome, size: u64) {
    match outcome {
        FileOutcome::Uploaded => tracker.increase_processed(1, 0),
        FileOutcome::AlreadyPresent | FileOutcome::Unreadable => {
            tracker.increase_skipped(1, size);
            tracker.report_progress();
        }
        FileOutcome::Cancelled => {}
    }
}

fn with_local_path(err: StorageError, path: &Path) -> StorageError {
    match err {
        StorageError::Client(e) => StorageError::Client(e.with_local_path("upload", path)),
        other => other,
    }
}

async fn read_part(path: &Path, part: &PartInfo) -> Result<Vec<u8>, StorageError> {
    let mut file: tokio::fs::File = tokio::fs::File::open(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    file.seek(SeekFrom::Start(part.offset))
        .await
        .map_err(|e| StorageError::io(path, e))?;
    let mut buffer: Vec<u8> = vec![0; part.length as usize];
    file.read_exact(&mut buffer)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    Ok(buffer)
}

/// Write `<dir>/manifests/<name>` and append `<name>, <s3 key>` to the mapping file.
async fn write_local_manifest(
    manifest_write_dir: &Path,
    manifest_name: &str,
    full_manifest_key: &str,
    manifest_text: &str,
) -> Result<(), StorageError> {
    let manifests_dir: PathBuf = manifest_write_dir.join("manifests");
    tokio::fs::create_dir_all(&manifests_dir)
        .await
        .map_err(|e| StorageError::io(&manifests_dir, e))?;

    let local_manifest: PathBuf = manifests_dir.join(manifest_name);
    log::info!("Creating local manifest file: {}", local_manifest.display());
    tokio::fs::write(&local_manifest, manifest_text)
        .await
        .map_err(|e| StorageError::io(&local_manifest, e))?;

    let mapping_path: PathBuf = manifests_dir.join(MANIFEST_S3_MAPPING_FILE);
    let mut mapping: tokio::fs::File = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&mapping_path)
        .await
        .map_err(|e| StorageError::io(&mapping_path, e))?;
    mapping
        .write_all(format!("{}, {}\n", manifest_name, full_manifest_key).as_bytes())
        .await
        .map_err(|e| StorageError::io(&mapping_path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::S3Action;
    use crate::memory::MemoryStorageClient;
    use ja_common::{hash_bytes, progress_fn, ProgressReportMetadata, ProgressStatus, SummaryStatistics};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    const BUCKET: &str = "bucket";
    const CAS: &str = "Root/Data";
    const MIB: u64 = 1024 * 1024;

    fn write_files(dir: &Path, files: &[(&str, &[u8])]) -> AssetManifest {
        let paths: Vec<ManifestPath> = files
            .iter()
            .map(|(name, data)| {
                let path: PathBuf = dir.join(name);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).unwrap();
                }
                std::fs::write(&path, data).unwrap();
                ManifestPath::new(*name, hash_bytes(data), data.len() as u64, 1)
            })
            .collect();
        AssetManifest::new(paths)
    }

    fn tracker_for(manifest: &AssetManifest) -> ProgressTracker {
        let tracker: ProgressTracker = ProgressTracker::new(ProgressStatus::UploadInProgress, None);
        tracker.set_total_files(manifest.file_count() as u64, manifest.total_size());
        tracker
    }

    #[tokio::test]
    async fn test_uploads_every_file_under_its_hash() {
        let dir: TempDir = TempDir::new().unwrap();
        let manifest: AssetManifest = write_files(dir.path(), &[("a.txt", b"aaa"), ("sub/b.txt", b"bb")]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let tracker: ProgressTracker = tracker_for(&manifest);

        UploadOrchestrator::new(&client)
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap();

        assert_eq!(client.object(BUCKET, &format!("{}/{}", CAS, hash_bytes(b"aaa"))).unwrap(), b"aaa");
        assert_eq!(client.object(BUCKET, &format!("{}/{}", CAS, hash_bytes(b"bb"))).unwrap(), b"bb");

        let stats: SummaryStatistics = tracker.get_summary_statistics();
        assert_eq!(stats.processed_files, 2);
        assert_eq!(stats.processed_bytes, 5);
        assert_eq!(stats.skipped_files, 0);
    }

    #[tokio::test]
    async fn test_identical_content_is_uploaded_once() {
        let dir: TempDir = TempDir::new().unwrap();
        let manifest: AssetManifest =
            write_files(dir.path(), &[("one.txt", b"same"), ("two.txt", b"same"), ("three.txt", b"diff")]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let tracker: ProgressTracker = tracker_for(&manifest);

        UploadOrchestrator::new(&client)
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap();

        assert_eq!(client.stats().put_requests, 2);
        let stats: SummaryStatistics = tracker.get_summary_statistics();
        assert_eq!(stats.processed_files + stats.skipped_files, 3);
        assert_eq!(stats.skipped_files, 1);
        assert_eq!(stats.processed_bytes + stats.skipped_bytes, 12);
    }

    #[tokio::test]
    async fn test_existing_objects_are_skipped() {
        let dir: TempDir = TempDir::new().unwrap();
        let manifest: AssetManifest = write_files(dir.path(), &[("a.txt", b"aaa"), ("b.txt", b"bbb")]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        client.insert_object(BUCKET, &format!("{}/{}", CAS, hash_bytes(b"aaa")), b"aaa".to_vec());
        let tracker: ProgressTracker = tracker_for(&manifest);

        UploadOrchestrator::new(&client)
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap();

        assert_eq!(client.stats().head_requests, 2);
        assert_eq!(client.stats().put_requests, 1);
        let stats: SummaryStatistics = tracker.get_summary_statistics();
        assert_eq!(stats.skipped_files, 1);
        assert_eq!(stats.skipped_bytes, 3);
    }

    #[tokio::test]
    async fn test_lists_prefix_above_threshold() {
        let dir: TempDir = TempDir::new().unwrap();
        let manifest: AssetManifest =
            write_files(dir.path(), &[("a", b"1"), ("b", b"2"), ("c", b"3")]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        client.insert_object(BUCKET, &format!("{}/{}", CAS, hash_bytes(b"2")), b"2".to_vec());
        let tracker: ProgressTracker = tracker_for(&manifest);

        UploadOrchestrator::new(&client)
            .with_settings(TransferSettings::default().with_list_object_threshold(1))
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap();

        assert_eq!(client.stats().list_requests, 1);
        assert_eq!(client.stats().head_requests, 0);
        assert_eq!(client.stats().put_requests, 2);
    }

    #[tokio::test]
    async fn test_check_cache_avoids_requests() {
        let dir: TempDir = TempDir::new().unwrap();
        let cache_dir: TempDir = TempDir::new().unwrap();
        let manifest: AssetManifest = write_files(dir.path(), &[("a.txt", b"aaa")]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let cache: Arc<S3CheckCache> = Arc::new(S3CheckCache::try_open(Some(cache_dir.path())).unwrap());

        let orchestrator = UploadOrchestrator::new(&client).with_s3_check_cache(Arc::clone(&cache));
        orchestrator
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker_for(&manifest))
            .await
            .unwrap();
        assert!(cache.contains(BUCKET, &format!("{}/{}", CAS, hash_bytes(b"aaa"))));

        let second: ProgressTracker = tracker_for(&manifest);
        orchestrator
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &second)
            .await
            .unwrap();

        assert_eq!(client.stats().head_requests, 1);
        assert_eq!(client.stats().put_requests, 1);
        assert_eq!(second.get_summary_statistics().skipped_files, 1);
    }

    #[tokio::test]
    async fn test_missing_source_file_is_skipped() {
        let dir: TempDir = TempDir::new().unwrap();
        let mut paths: Vec<ManifestPath> = write_files(dir.path(), &[("a.txt", b"aaa")]).into_paths();
        paths.push(ManifestPath::new("gone.txt", hash_bytes(b"gone"), 4, 1));
        let manifest: AssetManifest = AssetManifest::new(paths);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let tracker: ProgressTracker = tracker_for(&manifest);

        UploadOrchestrator::new(&client)
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap();

        let stats: SummaryStatistics = tracker.get_summary_statistics();
        assert_eq!(stats.processed_files, 1);
        assert_eq!(stats.skipped_files, 1);
        assert_eq!(client.stats().put_requests, 1);
    }

    #[tokio::test]
    async fn test_large_file_uses_multipart() {
        let dir: TempDir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..(11 * MIB)).map(|i| (i % 251) as u8).collect();
        let manifest: AssetManifest = write_files(dir.path(), &[("big.bin", data.as_slice())]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let tracker: ProgressTracker = tracker_for(&manifest);

        UploadOrchestrator::new(&client)
            .with_settings(
                TransferSettings::default()
                    .with_multipart_chunk_size(5 * MIB)
                    .with_small_file_threshold_multiplier(1),
            )
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap();

        assert_eq!(client.stats().parts_uploaded, 3);
        assert_eq!(client.stats().completed_multipart_uploads, 1);
        assert_eq!(client.object(BUCKET, &format!("{}/{}", CAS, hash_bytes(&data))).unwrap(), data);
        assert_eq!(tracker.get_summary_statistics().processed_bytes, 11 * MIB);
    }

    #[tokio::test]
    async fn test_failed_part_aborts_upload() {
        let dir: TempDir = TempDir::new().unwrap();
        let data: Vec<u8> = vec![7u8; (11 * MIB) as usize];
        let manifest: AssetManifest = write_files(dir.path(), &[("big.bin", data.as_slice())]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        client.fail_part(2, 500);
        let tracker: ProgressTracker = tracker_for(&manifest);

        let err: StorageError = UploadOrchestrator::new(&client)
            .with_settings(TransferSettings::default().with_multipart_chunk_size(5 * MIB))
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(err.to_string().contains("Failed to upload"));
        assert_eq!(client.pending_multipart_uploads(), 0);
        assert_eq!(client.stats().aborted_multipart_uploads, 1);
        assert!(client.keys(BUCKET).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_stops_new_uploads() {
        let dir: TempDir = TempDir::new().unwrap();
        let files: Vec<(String, Vec<u8>)> =
            (0..10).map(|i| (format!("f{}.txt", i), vec![i as u8; 4])).collect();
        let refs: Vec<(&str, &[u8])> = files.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();
        let manifest: AssetManifest = write_files(dir.path(), &refs);

        let calls: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
        let counter: Arc<AtomicU64> = Arc::clone(&calls);
        let tracker: ProgressTracker = ProgressTracker::new(
            ProgressStatus::UploadInProgress,
            Some(Arc::new(progress_fn(move |_: &ProgressReportMetadata| {
                counter.fetch_add(1, Ordering::SeqCst) < 2
            }))),
        );
        tracker.set_total_files(10, 40);
        let client: MemoryStorageClient = MemoryStorageClient::new();

        let err: StorageError = UploadOrchestrator::new(&client)
            .with_settings(TransferSettings::default().with_s3_max_pool_connections(1))
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap_err();

        let summary: &SummaryStatistics = err.cancelled_summary().unwrap();
        assert!(summary.processed_files < 10);
        assert_eq!(summary.processed_files, client.stats().put_requests);
        assert!(err.to_string().starts_with("File upload cancelled."));
    }

    #[tokio::test]
    async fn test_cancelled_multipart_keeps_sent_bytes_only() {
        let dir: TempDir = TempDir::new().unwrap();
        let data: Vec<u8> = vec![3u8; (11 * MIB) as usize];
        let manifest: AssetManifest = write_files(dir.path(), &[("big.bin", data.as_slice())]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let tracker: ProgressTracker = ProgressTracker::new(
            ProgressStatus::UploadInProgress,
            Some(Arc::new(progress_fn(|_: &ProgressReportMetadata| false))),
        );
        tracker.set_total_files(1, 11 * MIB);

        let err: StorageError = UploadOrchestrator::new(&client)
            .with_settings(
                TransferSettings::default()
                    .with_multipart_chunk_size(5 * MIB)
                    .with_multipart_max_workers(1),
            )
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap_err();

        let summary: &SummaryStatistics = err.cancelled_summary().unwrap();
        assert_eq!(summary.processed_files, 0);
        assert_eq!(summary.processed_bytes, 5 * MIB);
        assert_eq!(client.stats().parts_uploaded, 1);
        assert_eq!(client.stats().aborted_multipart_uploads, 1);
        assert!(client.keys(BUCKET).is_empty());
    }

    #[tokio::test]
    async fn test_skipped_files_report_progress() {
        let dir: TempDir = TempDir::new().unwrap();
        let manifest: AssetManifest =
            write_files(dir.path(), &[("a.txt", b"aaa"), ("b.txt", b"bbb"), ("c.txt", b"ccc")]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        for data in [b"aaa", b"bbb", b"ccc"] {
            client.insert_object(BUCKET, &format!("{}/{}", CAS, hash_bytes(data)), data.to_vec());
        }

        let calls: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
        let counter: Arc<AtomicU64> = Arc::clone(&calls);
        let tracker: ProgressTracker = ProgressTracker::new(
            ProgressStatus::UploadInProgress,
            Some(Arc::new(progress_fn(move |_: &ProgressReportMetadata| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }))),
        );
        tracker.set_total_files(3, 9);

        UploadOrchestrator::new(&client)
            .with_settings(TransferSettings::default().with_s3_max_pool_connections(1))
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap();

        // One report per skipped file plus the closing report.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(tracker.get_summary_statistics().skipped_files, 3);
        assert_eq!(client.stats().put_requests, 0);
    }

    #[tokio::test]
    async fn test_all_cached_batch_can_be_cancelled() {
        let dir: TempDir = TempDir::new().unwrap();
        let manifest: AssetManifest = write_files(dir.path(), &[("a.txt", b"aaa"), ("b.txt", b"bbb")]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        for data in [b"aaa", b"bbb"] {
            client.insert_object(BUCKET, &format!("{}/{}", CAS, hash_bytes(data)), data.to_vec());
        }
        let tracker: ProgressTracker = ProgressTracker::new(
            ProgressStatus::UploadInProgress,
            Some(Arc::new(progress_fn(|_: &ProgressReportMetadata| false))),
        );
        tracker.set_total_files(2, 6);

        let err: StorageError = UploadOrchestrator::new(&client)
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker)
            .await
            .unwrap_err();

        assert!(err.cancelled_summary().is_some());
    }

    #[tokio::test]
    async fn test_upload_assets_writes_manifest() {
        let dir: TempDir = TempDir::new().unwrap();
        let write_dir: TempDir = TempDir::new().unwrap();
        let manifest: AssetManifest = write_files(dir.path(), &[("a.txt", b"aaa")]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        let settings: JobAttachmentSettings = JobAttachmentSettings::new(BUCKET, "Root");
        let tracker: ProgressTracker = tracker_for(&manifest);

        let (partial_key, manifest_hash): (String, String) = UploadOrchestrator::new(&client)
            .upload_assets(
                &settings,
                &manifest,
                "farm-1/queue-1/Inputs/guid",
                dir.path(),
                Some("Location"),
                &tracker,
                Some(write_dir.path()),
            )
            .await
            .unwrap();

        let expected_name: String = format!(
            "{}_input",
            hash_bytes(format!("Location{}", dir.path().display()).as_bytes())
        );
        assert_eq!(partial_key, format!("farm-1/queue-1/Inputs/guid/{}", expected_name));

        let stored: Vec<u8> = client
            .object(BUCKET, &format!("Root/Manifests/{}", partial_key))
            .unwrap();
        assert_eq!(stored, manifest.encode().unwrap().as_bytes());
        assert_eq!(manifest_hash, hash_bytes(&stored));
        assert!(client.object(BUCKET, &format!("Root/Data/{}", hash_bytes(b"aaa"))).is_some());

        let mapping: String =
            std::fs::read_to_string(write_dir.path().join("manifests").join(MANIFEST_S3_MAPPING_FILE)).unwrap();
        assert_eq!(mapping, format!("{}, Root/Manifests/{}\n", expected_name, partial_key));
    }

    #[tokio::test]
    async fn test_forbidden_head_propagates() {
        let dir: TempDir = TempDir::new().unwrap();
        let manifest: AssetManifest = write_files(dir.path(), &[("a.txt", b"aaa")]);
        let client: MemoryStorageClient = MemoryStorageClient::new();
        client.fail_on(S3Action::HeadObject, "Data/", 403);

        let err: StorageError = UploadOrchestrator::new(&client)
            .upload_input_files(&manifest, BUCKET, dir.path(), CAS, &tracker_for(&manifest))
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(client.stats().put_requests, 0);
    }
}
