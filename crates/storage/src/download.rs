//! Download orchestration for CAS storage.
//!
//! Materializes manifests onto local disk:
//!
//! - Path containment is validated for a whole root before any file is written
//! - Files download concurrently with a fixed bound
//! - Existing files are handled by a [`ConflictResolution`] policy
//! - Every written file gets the mtime recorded in the manifest
//! - Optional POSIX group/mode adjustments, reported as warnings on failure
//!
//! [`OutputDownloader`] builds on this to fetch a job's outputs, optionally
//! redirecting an output root to a different local directory first.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use ja_common::{
    from_posix_path, is_within_root, lexical_normalize, resolve_existing_prefix, to_absolute,
    DownloadSummaryStatistics, PathError, ProgressCallback, ProgressReportMetadata, ProgressStatus,
    ProgressTracker,
};
use ja_model::{merge_manifests, AssetManifest, ManifestPath};
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::manifest_storage::{get_output_manifests_by_asset_root, OutputManifestScope};
use crate::traits::{StorageClient, TrackerBytes};
use crate::types::{
    join_s3_paths, ConflictResolution, FileSystemPermissionSettings, FileSystemPermissionWarning,
    JobAttachmentSettings, TransferSettings,
};

/// Result of downloading one or more manifests.
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    pub statistics: DownloadSummaryStatistics,
    /// Permission adjustments that failed. The files themselves were written.
    pub permission_warnings: Vec<FileSystemPermissionWarning>,
}

enum FileOutcome {
    Downloaded(PathBuf),
    /// Kept the existing file under [`ConflictResolution::Skip`].
    Skipped,
    Cancelled,
}

/// High-level download operations using any [`StorageClient`] implementation.
pub struct DownloadOrchestrator<'a, C: StorageClient + ?Sized> {
    client: &'a C,
    settings: TransferSettings,
}

impl<'a, C: StorageClient + ?Sized> DownloadOrchestrator<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self {
            client,
            settings: TransferSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TransferSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Download every manifest to its root and report combined statistics.
    ///
    /// All roots are validated before the first write, so a manifest that
    /// would escape its root leaves the disk untouched.
    ///
    /// # Arguments
    /// * `bucket` - Bucket holding the CAS
    /// * `manifests_by_root` - Absolute local root to the manifest materialized there
    /// * `cas_prefix` - e.g. `Root/Data`
    /// * `conflict_resolution` - What to do when a destination file exists
    /// * `fs_permission_settings` - Group and mode bits to apply after download
    /// * `on_progress` - Optional progress callback; returning `false` cancels
    pub async fn download_files_from_manifests(
        &self,
        bucket: &str,
        manifests_by_root: &BTreeMap<String, AssetManifest>,
        cas_prefix: &str,
        conflict_resolution: ConflictResolution,
        fs_permission_settings: Option<&FileSystemPermissionSettings>,
        on_progress: Option<Arc<dyn ProgressCallback<ProgressReportMetadata>>>,
    ) -> Result<DownloadResult, StorageError> {
        let tracker: ProgressTracker =
            ProgressTracker::new(ProgressStatus::DownloadInProgress, on_progress);
        tracker.set_total_files(
            manifests_by_root.values().map(|m| m.file_count() as u64).sum(),
            manifests_by_root.values().map(AssetManifest::total_size).sum(),
        );

        for (root, manifest) in manifests_by_root {
            ensure_paths_within_directory(
                Path::new(root),
                manifest.paths().iter().map(|p| p.path.as_str()),
            )?;
        }

        let mut downloaded_by_root: HashMap<String, Vec<String>> = HashMap::new();
        let mut permission_warnings: Vec<FileSystemPermissionWarning> = Vec::new();
        for (root, manifest) in manifests_by_root {
            let downloaded: Vec<String> = self
                .download_files(
                    manifest.paths(),
                    bucket,
                    cas_prefix,
                    Path::new(root),
                    conflict_resolution,
                    &tracker,
                )
                .await?;

            if let Some(permissions) = fs_permission_settings {
                permission_warnings.extend(apply_fs_permission_settings(
                    &downloaded,
                    Path::new(root),
                    permissions,
                )?);
            }
            downloaded_by_root.insert(root.clone(), downloaded);
        }

        tracker.stop_timer();
        Ok(DownloadResult {
            statistics: tracker.get_download_summary_statistics(&downloaded_by_root),
            permission_warnings,
        })
    }

    /// Download `files` under `local_root`.
    ///
    /// # Returns
    /// Absolute paths of the files written, including renamed copies.
    ///
    /// # Errors
    /// `PathOutsideDirectory` before any write if a path escapes the root,
    /// `Cancelled` if the tracker's callback asked to stop, otherwise the
    /// first storage or I/O failure.
    pub async fn download_files(
        &self,
        files: &[ManifestPath],
        bucket: &str,
        cas_prefix: &str,
        local_root: &Path,
        conflict_resolution: ConflictResolution,
        tracker: &ProgressTracker,
    ) -> Result<Vec<String>, StorageError> {
        ensure_paths_within_directory(local_root, files.iter().map(|f| f.path.as_str()))?;

        let reserved: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
        let reserved_ref: &Mutex<HashSet<PathBuf>> = &reserved;
        let mut results = stream::iter(files)
            .map(|file| {
                self.download_file(
                    file,
                    bucket,
                    cas_prefix,
                    local_root,
                    conflict_resolution,
                    reserved_ref,
                    tracker,
                )
            })
            .buffer_unordered(self.settings.max_download_concurrency.max(1));

        let mut downloaded: Vec<String> = Vec::new();
        while let Some(result) = results.next().await {
            match result? {
                FileOutcome::Downloaded(path) => {
                    tracker.increase_processed(1, 0);
                    tracker.report_progress();
                    downloaded.push(path.to_string_lossy().into_owned());
                }
                FileOutcome::Skipped => {
                    tracker.report_progress();
                }
                FileOutcome::Cancelled => {}
            }
        }
        drop(results);

        if !tracker.continue_reporting() {
            return Err(StorageError::download_cancelled(
                tracker.get_summary_statistics(),
            ));
        }
        Ok(downloaded)
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_file(
        &self,
        file: &ManifestPath,
        bucket: &str,
        cas_prefix: &str,
        local_root: &Path,
        conflict_resolution: ConflictResolution,
        reserved: &Mutex<HashSet<PathBuf>>,
        tracker: &ProgressTracker,
    ) -> Result<FileOutcome, StorageError> {
        if !tracker.continue_reporting() {
            return Ok(FileOutcome::Cancelled);
        }

        let destination: PathBuf = from_posix_path(&file.path, local_root);
        let destination: PathBuf =
            match resolve_destination(destination, conflict_resolution, reserved) {
                Some(path) => path,
                None => {
                    log::debug!("Skipping {}: file already exists", file.path);
                    tracker.increase_skipped(1, file.size);
                    return Ok(FileOutcome::Skipped);
                }
            };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        let key: String = join_s3_paths(&[cas_prefix, file.hash.as_str()]);
        let progress: TrackerBytes<'_> = TrackerBytes(tracker);
        self.client
            .get_object_to_file(bucket, &key, &destination, Some(&progress))
            .await
            .map_err(|e| match e {
                StorageError::Client(e) => {
                    StorageError::Client(e.with_local_path("download the file to", &destination))
                }
                other => other,
            })?;

        set_file_mtime(&destination, file.mtime)?;
        Ok(FileOutcome::Downloaded(destination))
    }
}

/// Pick where a file goes given what already exists on disk.
///
/// # Returns
/// `None` when the file must be skipped.
fn resolve_destination(
    destination: PathBuf,
    conflict_resolution: ConflictResolution,
    reserved: &Mutex<HashSet<PathBuf>>,
) -> Option<PathBuf> {
    if !destination.is_file() {
        return Some(destination);
    }
    match conflict_resolution {
        ConflictResolution::Skip => None,
        ConflictResolution::Overwrite => {
            log::debug!("Overwriting existing file {}", destination.display());
            Some(destination)
        }
        ConflictResolution::CreateCopy => {
            // Concurrent downloads into one directory must not pick the same copy name.
            let mut reserved = reserved.lock();
            let mut candidate: PathBuf = destination;
            while candidate.is_file() || reserved.contains(&candidate) {
                candidate = copy_path(&candidate);
            }
            log::debug!("Writing a copy to {}", candidate.display());
            reserved.insert(candidate.clone());
            Some(candidate)
        }
    }
}

/// `dir/name.ext` becomes `dir/name (1).ext`.
pub fn copy_path(path: &Path) -> PathBuf {
    let stem: String = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension: String = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{} (1){}", stem, extension))
}

/// Fail unless every manifest path, joined onto `root`, stays within it.
///
/// Containment is checked lexically and again after following symlinks in
/// the parts of each path that already exist, so a directory link inside
/// the root cannot redirect writes elsewhere.
///
/// # Errors
/// `RelativeRoot` if `root` is not absolute, `PathOutsideDirectory` for the
/// first escaping path.
pub fn ensure_paths_within_directory<'p>(
    root: &Path,
    paths: impl IntoIterator<Item = &'p str>,
) -> Result<(), PathError> {
    if !root.is_absolute() {
        return Err(PathError::RelativeRoot {
            path: root.display().to_string(),
        });
    }
    let resolved_root: PathBuf =
        resolve_existing_prefix(root).unwrap_or_else(|| lexical_normalize(root));
    for path in paths {
        let joined: PathBuf = from_posix_path(path, root);
        let contained: bool = is_within_root(&joined, root)
            && resolve_existing_prefix(&joined)
                .is_some_and(|resolved| resolved.starts_with(&resolved_root));
        if !contained {
            return Err(PathError::PathOutsideDirectory {
                path: lexical_normalize(&joined).display().to_string(),
                directory: root.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Set a file's modification time from a manifest mtime.
///
/// # Arguments
/// * `path` - Path to the downloaded file
/// * `mtime_us` - Modification time in microseconds since the Unix epoch
pub fn set_file_mtime(path: &Path, mtime_us: i64) -> Result<(), StorageError> {
    let secs: i64 = mtime_us.div_euclid(1_000_000);
    let nanos: u32 = (mtime_us.rem_euclid(1_000_000) * 1000) as u32;
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(secs, nanos)).map_err(
        |e| StorageError::Io {
            path: path.display().to_string(),
            message: format!("failed to set mtime: {}", e),
        },
    )
}

/// Give the configured group ownership and OR in mode bits for downloaded
/// files and every directory between them and `local_root`, root included.
///
/// # Returns
/// One warning per adjustment that failed.
///
/// # Errors
/// `PathOutsideDirectory` if a file is not under `local_root`.
#[cfg(unix)]
pub fn apply_fs_permission_settings(
    file_paths: &[String],
    local_root: &Path,
    settings: &FileSystemPermissionSettings,
) -> Result<Vec<FileSystemPermissionWarning>, StorageError> {
    use nix::unistd::{Gid, Group};

    let mut warnings: Vec<FileSystemPermissionWarning> = Vec::new();
    let gid: Option<Gid> = match Group::from_name(&settings.os_group) {
        Ok(Some(group)) => Some(group.gid),
        Ok(None) => {
            warnings.push(FileSystemPermissionWarning {
                path: local_root.display().to_string(),
                message: format!("Group '{}' does not exist", settings.os_group),
            });
            None
        }
        Err(e) => {
            warnings.push(FileSystemPermissionWarning {
                path: local_root.display().to_string(),
                message: format!("Failed to look up group '{}': {}", settings.os_group, e),
            });
            None
        }
    };

    let mut directories: BTreeSet<PathBuf> = BTreeSet::new();
    for file_path in file_paths {
        let path: &Path = Path::new(file_path);
        if !is_within_root(path, local_root) {
            return Err(PathError::PathOutsideDirectory {
                path: file_path.clone(),
                directory: local_root.display().to_string(),
            }
            .into());
        }
        change_permission(path, gid, settings.file_mode, &mut warnings);

        let mut parent: Option<&Path> = path.parent();
        while let Some(dir) = parent {
            if !dir.starts_with(local_root) {
                break;
            }
            directories.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }

    for dir in &directories {
        change_permission(dir, gid, settings.dir_mode, &mut warnings);
    }
    Ok(warnings)
}

#[cfg(unix)]
fn change_permission(
    path: &Path,
    gid: Option<nix::unistd::Gid>,
    mode: u32,
    warnings: &mut Vec<FileSystemPermissionWarning>,
) {
    use std::os::unix::fs::PermissionsExt;

    let mut warn = |message: String| {
        log::warn!("{}: {}", path.display(), message);
        warnings.push(FileSystemPermissionWarning {
            path: path.display().to_string(),
            message,
        });
    };

    if let Some(gid) = gid {
        if let Err(e) = nix::unistd::chown(path, None, Some(gid)) {
            warn(format!("Failed to change group: {}", e));
        }
    }

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mut permissions: std::fs::Permissions = meta.permissions();
            permissions.set_mode(permissions.mode() | mode);
            if let Err(e) = std::fs::set_permissions(path, permissions) {
                warn(format!("Failed to change mode: {}", e));
            }
        }
        Err(e) => warn(format!("Failed to read permissions: {}", e)),
    }
}

/// Group ownership is a POSIX concept; elsewhere this only reports that nothing was done.
#[cfg(not(unix))]
pub fn apply_fs_permission_settings(
    file_paths: &[String],
    local_root: &Path,
    settings: &FileSystemPermissionSettings,
) -> Result<Vec<FileSystemPermissionWarning>, StorageError> {
    if file_paths.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![FileSystemPermissionWarning {
        path: local_root.display().to_string(),
        message: format!(
            "Group '{}' not applied: unsupported on this platform",
            settings.os_group
        ),
    }])
}

/// Downloads the outputs of a job, step, task or session action.
///
/// Output manifests are fetched once at construction and merged per root.
pub struct OutputDownloader<'a, C: StorageClient + ?Sized> {
    client: &'a C,
    job_settings: JobAttachmentSettings,
    transfer_settings: TransferSettings,
    outputs_by_root: BTreeMap<String, AssetManifest>,
}

impl<'a, C: StorageClient + ?Sized> OutputDownloader<'a, C> {
    /// Discover and merge the output manifests for `scope`.
    pub async fn new(
        client: &'a C,
        job_settings: JobAttachmentSettings,
        scope: &OutputManifestScope,
    ) -> Result<Self, StorageError> {
        let grouped: BTreeMap<String, Vec<AssetManifest>> =
            get_output_manifests_by_asset_root(client, &job_settings, scope).await?;

        let mut outputs_by_root: BTreeMap<String, AssetManifest> = BTreeMap::new();
        for (root, manifests) in grouped {
            if let Some(merged) = merge_manifests(&manifests)? {
                outputs_by_root.insert(root, merged);
            }
        }

        Ok(Self {
            client,
            job_settings,
            transfer_settings: TransferSettings::default(),
            outputs_by_root,
        })
    }

    pub fn with_transfer_settings(mut self, settings: TransferSettings) -> Self {
        self.transfer_settings = settings;
        self
    }

    /// Manifest paths to be downloaded, per local root.
    pub fn get_output_paths_by_root(&self) -> BTreeMap<String, Vec<String>> {
        self.outputs_by_root
            .iter()
            .map(|(root, manifest)| {
                (
                    root.clone(),
                    manifest.paths().iter().map(|p| p.path.clone()).collect(),
                )
            })
            .collect()
    }

    /// Download the files of `original_root` under `new_root` instead.
    ///
    /// `new_root` is made absolute without resolving symlinks. If it is
    /// already an output root, paths present in both are renamed by
    /// prefixing the file name with the original root, e.g.
    /// `_tmp_job_out.png`, and the two manifests are merged.
    ///
    /// # Errors
    /// `UnknownRoot` if `original_root` is not an output root.
    pub fn set_root_path(&mut self, original_root: &str, new_root: &str) -> Result<(), StorageError> {
        let new_root: String = lexical_normalize(&to_absolute(Path::new(new_root))?)
            .to_string_lossy()
            .into_owned();

        if !self.outputs_by_root.contains_key(original_root) {
            return Err(StorageError::UnknownRoot {
                root: original_root.to_string(),
            });
        }
        if new_root == original_root {
            return Ok(());
        }

        let moved: AssetManifest = match self.outputs_by_root.remove(original_root) {
            Some(manifest) => manifest,
            None => return Ok(()),
        };

        let combined: AssetManifest = match self.outputs_by_root.remove(&new_root) {
            Some(existing) => {
                let existing_paths: HashSet<String> =
                    existing.paths().iter().map(|p| p.path.clone()).collect();
                let name_prefix: String = original_root.replace(['/', '\\', ':'], "_");
                let renamed: AssetManifest = moved.map_paths(|path| {
                    if existing_paths.contains(path) {
                        prefix_file_name(path, &name_prefix)
                    } else {
                        path.to_string()
                    }
                });
                merge_manifests(&[existing, renamed])?.ok_or_else(|| StorageError::Other {
                    message: format!("Failed to combine outputs for {}", new_root),
                })?
            }
            None => moved,
        };

        self.outputs_by_root.insert(new_root, combined);
        Ok(())
    }

    /// Download every output file to its root.
    ///
    /// # Arguments
    /// * `conflict_resolution` - What to do when a destination file exists
    /// * `on_progress` - Optional progress callback; returning `false` cancels
    pub async fn download_job_output(
        &self,
        conflict_resolution: ConflictResolution,
        on_progress: Option<Arc<dyn ProgressCallback<ProgressReportMetadata>>>,
    ) -> Result<DownloadSummaryStatistics, StorageError> {
        let result: DownloadResult = DownloadOrchestrator::new(self.client)
            .with_settings(self.transfer_settings.clone())
            .download_files_from_manifests(
                &self.job_settings.s3_bucket_name,
                &self.outputs_by_root,
                &self.job_settings.full_cas_prefix()?,
                conflict_resolution,
                None,
                on_progress,
            )
            .await?;
        Ok(result.statistics)
    }
}

fn prefix_file_name(path: &str, prefix: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{}/{}_{}", dir, prefix, name),
        None => format!("{}_{}", prefix, path),
    }
}
