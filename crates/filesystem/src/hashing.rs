//! Hash-cache backed manifest building.
//!
//! Each input file is looked up in the [`HashCache`] by absolute path. A hit
//! whose recorded modification time still matches the file is reused and
//! counted as skipped; anything else is hashed, stored back in the cache and
//! counted as processed. Either way the file ends up in the manifest.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::stream::{self, StreamExt, TryStreamExt};
use ja_common::{normalize_for_manifest, to_absolute, ProgressTracker, DEFAULT_HASH_MAX_CONCURRENCY};
use ja_model::{
    manifest_model, AssetManifest, HashAlgorithm, ManifestModel, ManifestPath, ManifestVersion,
};
use ja_profiles::{AssetRootGroup, AssetRootManifest};
use ja_storage::{HashCache, HashCacheEntry};

use crate::error::FileSystemError;

/// Modification time in microseconds since the epoch.
///
/// Times before the epoch come back negative.
pub fn modified_time_us(metadata: &Metadata) -> std::io::Result<i64> {
    let modified: SystemTime = metadata.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_micros() as i64,
        Err(before) => -(before.duration().as_micros() as i64),
    })
}

/// Result of hashing one file.
#[derive(Debug, Clone)]
struct HashedFile {
    hash: String,
    size: u64,
    mtime_us: i64,
    /// Whether the hash came from a fresh cache entry.
    cached: bool,
}

/// Builds asset manifests from files on disk.
///
/// # Example
///
/// ```ignore
/// let builder = ManifestBuilder::new(Arc::new(HashCache::open(None)));
/// let tracker = ProgressTracker::new(ProgressStatus::PreparingInProgress, None);
/// let manifests = builder.hash_asset_groups(&upload_group.asset_groups, &tracker).await?;
/// ```
pub struct ManifestBuilder {
    hash_cache: Arc<HashCache>,
    manifest_version: ManifestVersion,
    max_concurrency: usize,
}

impl ManifestBuilder {
    pub fn new(hash_cache: Arc<HashCache>) -> Self {
        Self {
            hash_cache,
            manifest_version: ManifestVersion::V2023_03_03,
            max_concurrency: DEFAULT_HASH_MAX_CONCURRENCY,
        }
    }

    pub fn with_manifest_version(mut self, manifest_version: ManifestVersion) -> Self {
        self.manifest_version = manifest_version;
        self
    }

    /// Number of files hashed at once.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn manifest_version(&self) -> ManifestVersion {
        self.manifest_version
    }

    /// Build one manifest per group.
    ///
    /// Groups without inputs yield an [`AssetRootManifest`] with no manifest
    /// so their output directories are still tracked.
    ///
    /// # Arguments
    /// * `groups` - Groups produced by [`ja_profiles::group_asset_paths`]
    /// * `tracker` - Hashing progress and cancellation; totals are set by the caller
    ///
    /// # Errors
    /// `Cancelled` with the partial statistics once the tracker latches,
    /// or the first IO or cache error.
    pub async fn hash_asset_groups(
        &self,
        groups: &[AssetRootGroup],
        tracker: &ProgressTracker,
    ) -> Result<Vec<AssetRootManifest>, FileSystemError> {
        let mut asset_root_manifests: Vec<AssetRootManifest> = Vec::with_capacity(groups.len());

        for group in groups {
            let asset_manifest: Option<AssetManifest> = if group.inputs.is_empty() {
                None
            } else {
                let inputs: Vec<PathBuf> = group.inputs.iter().cloned().collect();
                Some(
                    self.create_manifest(&inputs, Path::new(&group.root_path), tracker)
                        .await?,
                )
            };

            asset_root_manifests.push(AssetRootManifest {
                root_path: group.root_path.clone(),
                file_system_location_name: group.file_system_location_name.clone(),
                asset_manifest,
                outputs: group.outputs.iter().cloned().collect(),
            });
        }

        Ok(asset_root_manifests)
    }

    /// Hash `input_paths` and build a manifest relative to `root`.
    ///
    /// # Errors
    /// `PathOutsideDirectory` if an input is not under `root`, `Cancelled`
    /// once the tracker latches, or the first IO or cache error.
    pub async fn create_manifest(
        &self,
        input_paths: &[PathBuf],
        root: &Path,
        tracker: &ProgressTracker,
    ) -> Result<AssetManifest, FileSystemError> {
        let model: &ManifestModel = manifest_model(self.manifest_version)?;
        let hash_alg: HashAlgorithm = model.default_hash_alg;

        let paths: Vec<ManifestPath> = stream::iter(input_paths.iter())
            .map(|input| self.process_input_path(input, root, hash_alg, model, tracker))
            .buffer_unordered(self.max_concurrency)
            .try_collect()
            .await?;

        Ok((model.new_manifest)(hash_alg, paths))
    }

    async fn process_input_path(
        &self,
        input: &Path,
        root: &Path,
        hash_alg: HashAlgorithm,
        model: &ManifestModel,
        tracker: &ProgressTracker,
    ) -> Result<ManifestPath, FileSystemError> {
        if !tracker.continue_reporting() {
            return Err(FileSystemError::Cancelled {
                summary: tracker.get_summary_statistics(),
            });
        }

        let relative_path: String = normalize_for_manifest(input, root)?;
        let absolute: PathBuf = to_absolute(input)?;
        let cache: Arc<HashCache> = Arc::clone(&self.hash_cache);
        let hashed: HashedFile =
            tokio::task::spawn_blocking(move || hash_with_cache(&cache, &absolute, hash_alg))
                .await??;

        if hashed.cached {
            tracker.increase_skipped(1, hashed.size);
        } else {
            tracker.increase_processed(1, hashed.size);
        }
        tracker.report_progress();

        Ok((model.new_path)(
            relative_path,
            hashed.hash,
            hashed.size,
            hashed.mtime_us,
        ))
    }
}

/// Hash one file, reusing the cached hash while the file is unmodified.
fn hash_with_cache(
    cache: &HashCache,
    path: &Path,
    hash_alg: HashAlgorithm,
) -> Result<HashedFile, FileSystemError> {
    let metadata: Metadata = std::fs::metadata(path).map_err(|e| FileSystemError::io(path, e))?;
    let mtime_us: i64 = modified_time_us(&metadata).map_err(|e| FileSystemError::io(path, e))?;
    let size: u64 = metadata.len();
    let key: String = path.to_string_lossy().into_owned();

    if let Some(entry) = cache.get_entry(&key, hash_alg) {
        if entry.is_fresh(mtime_us) {
            return Ok(HashedFile {
                hash: entry.file_hash,
                size,
                mtime_us,
                cached: true,
            });
        }
    }

    let hash: String = hash_alg
        .hash_file(path)
        .map_err(|e| FileSystemError::io(path, e))?;
    cache.put_entry(&HashCacheEntry::new(key, hash_alg, hash.as_str(), mtime_us))?;

    Ok(HashedFile {
        hash,
        size,
        mtime_us,
        cached: false,
    })
}
