//! Worker-side synchronization of job attachments.
//!
//! Before a session action runs, [`AssetSync::sync_inputs`] materializes
//! the job's input manifests (and the outputs of any steps it depends on)
//! under the session directory, either by copy-download or through a
//! virtual filesystem mount. Afterwards [`AssetSync::sync_outputs`] uploads
//! the files the action wrote to its output directories together with one
//! output manifest per asset root.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ja_common::{
    from_posix_path, human_readable_file_size, short_hash, ProgressCallback,
    ProgressReportMetadata, ProgressStatus, ProgressTracker, SummaryStatistics,
};
use ja_filesystem::{
    find_output_files, modified_time_us, ManifestBuilder, OutputFile, OutputScanOptions,
};
use ja_model::{
    merge_manifests, AssetManifest, Attachments, FileSystemAccessMode, ManifestProperties,
    ManifestVersion,
};
use ja_profiles::PathMappingRule;
use ja_storage::{
    download_manifest, float_to_iso_datetime_string, get_output_manifests_by_asset_root,
    upload_output_manifest, ConflictResolution, DownloadOrchestrator, DownloadResult,
    FileSystemPermissionSettings, HashCache, JobAttachmentSettings, OutputManifestScope,
    S3CheckCache, StorageClient, StorageClientError, StorageError, TransferSettings,
    UploadOrchestrator,
};
use ja_vfs::{VfsError, VfsInstallation};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::vfs_mount::mount_vfs_from_manifests;

/// Hex characters of the root path hash used in local root directory names.
const ROOT_DIR_HASH_LEN: usize = 20;

/// Environment variable whose presence lets the VFS authenticate as the queue.
const AWS_PROFILE_ENV_VAR: &str = "AWS_PROFILE";

const MISSING_INPUT_OBJECT_ADVICE: &str = "This can happen if the S3 check cache on the \
    submitting machine is out of date. Please delete the cache file from the submitting \
    machine, usually located in the home directory (~/.deadline/cache/s3_check_cache.db) \
    and try submitting again.";

/// Name of the session subdirectory an unmapped root is synced into.
///
/// e.g. `assetroot-0123456789abcdef0123`
pub fn unique_dest_dir_name(root_path: &str) -> String {
    format!("assetroot-{}", short_hash(root_path, ROOT_DIR_HASH_LEN))
}

/// Host-specific inputs to [`AssetSync::sync_inputs`].
#[derive(Debug, Clone, Default)]
pub struct SyncInputsOptions {
    /// Group and mode bits applied to downloaded files; also names the job user.
    pub fs_permission_settings: Option<FileSystemPermissionSettings>,
    /// Submitted root path to local path, when the host's storage profile
    /// differs from the submitter's.
    pub storage_profiles_path_mapping_rules: HashMap<String, String>,
    /// Steps whose outputs are laid over the job inputs, in order.
    pub step_dependencies: Vec<String>,
    /// Environment for launched subprocesses.
    pub os_env_vars: Option<HashMap<String, String>>,
}

/// The session action whose outputs are being synced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAction {
    pub queue_id: String,
    pub job_id: String,
    pub step_id: String,
    pub task_id: String,
    pub session_action_id: String,
    /// When the action started, in seconds since the epoch.
    pub start_time: f64,
}

impl SessionAction {
    fn start_time_us(&self) -> i64 {
        (self.start_time * 1_000_000.0) as i64
    }

    /// `<ISO start time>_<session action id>`
    fn output_folder(&self) -> String {
        format!(
            "{}_{}",
            float_to_iso_datetime_string(self.start_time),
            self.session_action_id
        )
    }
}

/// Outputs found under one asset root.
struct RootOutputs<'p> {
    properties: &'p ManifestProperties,
    local_root: PathBuf,
    files: Vec<OutputFile>,
    manifest: AssetManifest,
}

/// Syncs the attachments of one farm's jobs on a worker.
///
/// Holds the modification times of everything it synced so that later
/// output scans can tell modified inputs from untouched ones.
pub struct AssetSync<'a, C: StorageClient + ?Sized> {
    client: &'a C,
    farm_id: String,
    region: String,
    transfer_settings: TransferSettings,
    hash_cache: Arc<HashCache>,
    s3_check_cache: Arc<S3CheckCache>,
    manifest_version: ManifestVersion,
    /// Absolute local path to modification time (microseconds) when synced.
    synced_assets_mtime: HashMap<String, i64>,
    /// Job user of the mounts started by `sync_inputs`, if any.
    vfs_os_user: Option<String>,
}

impl<'a, C: StorageClient + ?Sized> AssetSync<'a, C> {
    /// # Arguments
    /// * `client` - Object storage client
    /// * `farm_id` - Farm the jobs belong to
    /// * `region` - Region of the job attachments bucket, passed to the VFS
    pub fn new(client: &'a C, farm_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            client,
            farm_id: farm_id.into(),
            region: region.into(),
            transfer_settings: TransferSettings::default(),
            hash_cache: Arc::new(HashCache::disabled()),
            s3_check_cache: Arc::new(S3CheckCache::disabled()),
            manifest_version: ManifestVersion::V2023_03_03,
            synced_assets_mtime: HashMap::new(),
            vfs_os_user: None,
        }
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

    pub fn synced_assets_mtime(&self) -> &HashMap<String, i64> {
        &self.synced_assets_mtime
    }

    /// Bring the job's inputs into `session_dir`.
    ///
    /// Each root is placed at its path mapping destination when the host
    /// has storage profile rules and the root belongs to a location,
    /// otherwise at `session_dir/assetroot-<hash>`. Outputs of
    /// `step_dependencies` are merged over the inputs of the same root,
    /// later manifests winning. Under [`FileSystemAccessMode::Virtual`] the
    /// roots are mounted instead of downloaded when the VFS can run here.
    ///
    /// # Returns
    /// Download statistics (empty when mounted) and the path mapping rules
    /// for roots placed under the session directory.
    ///
    /// # Errors
    /// `NoPathMappingRule` for a located root without a rule,
    /// `InsufficientDiskSpace` before any download that would not fit,
    /// `Cancelled` if the callback asked to stop, or the first storage,
    /// path or VFS failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn sync_inputs(
        &mut self,
        settings: Option<&JobAttachmentSettings>,
        attachments: Option<&Attachments>,
        queue_id: &str,
        job_id: &str,
        session_dir: &Path,
        options: &SyncInputsOptions,
        on_downloading: Option<Arc<dyn ProgressCallback<ProgressReportMetadata>>>,
    ) -> Result<(SummaryStatistics, Vec<PathMappingRule>), SyncError> {
        let Some(settings) = settings else {
            log::info!(
                "No Job Attachment settings configured for Queue {}, no inputs to sync.",
                queue_id
            );
            return Ok((SummaryStatistics::default(), Vec::new()));
        };
        let Some(attachments) = attachments else {
            log::info!("No attachments configured for Job {}, no inputs to sync.", job_id);
            return Ok((SummaryStatistics::default(), Vec::new()));
        };
        settings.validate()?;
        let bucket: &str = &settings.s3_bucket_name;

        let mut grouped: BTreeMap<String, Vec<AssetManifest>> = BTreeMap::new();
        let mut path_mapping_rules: Vec<PathMappingRule> = Vec::new();

        for properties in &attachments.manifests {
            let local_root: PathBuf = match mapped_root(
                properties,
                &options.storage_profiles_path_mapping_rules,
                "input",
            )? {
                Some(mapped) => mapped,
                None => {
                    let local_root: PathBuf =
                        session_dir.join(unique_dest_dir_name(&properties.root_path));
                    let destination: String = local_root.display().to_string();
                    if !path_mapping_rules
                        .iter()
                        .any(|rule| rule.destination_path == destination)
                    {
                        path_mapping_rules.push(PathMappingRule::new(
                            properties.root_path_format,
                            properties.root_path.as_str(),
                            destination,
                        ));
                    }
                    local_root
                }
            };

            if let Some(partial_key) = &properties.input_manifest_path {
                let key: String = settings.add_root_and_manifest_folder_prefix(partial_key)?;
                let manifest: AssetManifest = download_manifest(self.client, bucket, &key).await?;
                grouped
                    .entry(local_root.display().to_string())
                    .or_default()
                    .push(manifest);
            }
        }

        for step_id in &options.step_dependencies {
            let scope: OutputManifestScope =
                OutputManifestScope::job(self.farm_id.as_str(), queue_id, job_id).with_step(step_id);
            let outputs: BTreeMap<String, Vec<AssetManifest>> =
                get_output_manifests_by_asset_root(self.client, settings, &scope).await?;
            for (root, manifests) in outputs {
                let local_root: PathBuf = session_dir.join(unique_dest_dir_name(&root));
                grouped
                    .entry(local_root.display().to_string())
                    .or_default()
                    .extend(manifests);
            }
        }

        let mut merged_by_root: BTreeMap<String, AssetManifest> = BTreeMap::new();
        let mut total_input_size: u64 = 0;
        for (root, manifests) in grouped {
            if let Some(merged) = merge_manifests(&manifests)? {
                total_input_size += merged.total_size();
                merged_by_root.insert(root, merged);
            }
        }

        let cas_prefix: String = settings.full_cas_prefix()?;

        if attachments.file_system == FileSystemAccessMode::Virtual {
            if let Some((fs_permission_settings, os_env_vars)) = vfs_prerequisites(options) {
                match VfsInstallation::locate() {
                    Ok(installation) => {
                        mount_vfs_from_manifests(
                            &installation,
                            bucket,
                            &self.region,
                            &merged_by_root,
                            session_dir,
                            os_env_vars,
                            fs_permission_settings,
                            Some(&cas_prefix),
                        )
                        .await?;
                        self.vfs_os_user = Some(fs_permission_settings.os_user.clone());
                        self.record_attachment_mtimes(&merged_by_root);
                        return Ok((SummaryStatistics::default(), path_mapping_rules));
                    }
                    Err(VfsError::ExecutableMissing) => log::error!(
                        "Virtual File System not found, falling back to COPIED for \
                         JobAttachmentsFileSystem."
                    ),
                    Err(e) => return Err(e.into()),
                }
            }
        }

        ensure_disk_capacity(session_dir, total_input_size)?;
        let result: DownloadResult = DownloadOrchestrator::new(self.client)
            .with_settings(self.transfer_settings.clone())
            .download_files_from_manifests(
                bucket,
                &merged_by_root,
                &cas_prefix,
                ConflictResolution::CreateCopy,
                options.fs_permission_settings.as_ref(),
                on_downloading,
            )
            .await
            .map_err(explain_missing_input_object)?;

        for warning in &result.permission_warnings {
            log::warn!("{}: {}", warning.path, warning.message);
        }
        self.record_attachment_mtimes(&merged_by_root);

        Ok((
            result.statistics.convert_to_summary_statistics(),
            path_mapping_rules,
        ))
    }

    /// Upload what the session action wrote to its output directories.
    ///
    /// A file is an output if it was modified at or after the action's
    /// start time, or if its modification time differs from when it was
    /// synced as an input. File contents go to the CAS first; then one
    /// output manifest per root is written under
    /// `<job>/<step>/<task>/<ISO start>_<session action>/`. If this sync
    /// mounted a VFS, the session's mounts are torn down afterwards whether
    /// or not the upload succeeded.
    ///
    /// # Errors
    /// `NoPathMappingRule` for a located root without a rule, `Cancelled`
    /// if the callback asked to stop, or the first hashing or storage
    /// failure.
    pub async fn sync_outputs(
        &mut self,
        settings: Option<&JobAttachmentSettings>,
        attachments: Option<&Attachments>,
        session_action: &SessionAction,
        session_dir: &Path,
        storage_profiles_path_mapping_rules: &HashMap<String, String>,
        on_uploading: Option<Arc<dyn ProgressCallback<ProgressReportMetadata>>>,
    ) -> Result<SummaryStatistics, SyncError> {
        let Some(settings) = settings else {
            log::info!(
                "No Job Attachment settings configured for Queue {}, no outputs to sync.",
                session_action.queue_id
            );
            return Ok(SummaryStatistics::default());
        };
        let Some(attachments) = attachments else {
            log::info!(
                "No attachments configured for Job {}, no outputs to sync.",
                session_action.job_id
            );
            return Ok(SummaryStatistics::default());
        };

        let result: Result<SummaryStatistics, SyncError> = self
            .upload_outputs(
                settings,
                attachments,
                session_action,
                session_dir,
                storage_profiles_path_mapping_rules,
                on_uploading,
            )
            .await;

        if attachments.file_system == FileSystemAccessMode::Virtual {
            if let Some(os_user) = self.vfs_os_user.take() {
                if let Err(e) = self
                    .cleanup_session(session_dir, FileSystemAccessMode::Virtual, Some(&os_user))
                    .await
                {
                    log::warn!(
                        "Failed to stop VFS processes for session {}: {}",
                        session_dir.display(),
                        e
                    );
                }
            }
        }
        result
    }

    /// Stop every VFS mount recorded for the session.
    ///
    /// Does nothing for [`FileSystemAccessMode::Copied`]. A missing VFS
    /// executable is logged, since there is nothing it could have mounted.
    ///
    /// # Errors
    /// `OsUserNotSet` under VFS mode without a user.
    pub async fn cleanup_session(
        &self,
        session_dir: &Path,
        file_system: FileSystemAccessMode,
        os_user: Option<&str>,
    ) -> Result<(), SyncError> {
        if file_system == FileSystemAccessMode::Copied {
            return Ok(());
        }
        let os_user: &str = os_user
            .filter(|user| !user.is_empty())
            .ok_or(SyncError::OsUserNotSet)?;

        match VfsInstallation::locate() {
            Ok(installation) => installation.kill_all_processes(session_dir, os_user).await?,
            Err(VfsError::ExecutableMissing) => {
                log::error!("Virtual File System not found, no processes to kill.")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn upload_outputs(
        &mut self,
        settings: &JobAttachmentSettings,
        attachments: &Attachments,
        session_action: &SessionAction,
        session_dir: &Path,
        storage_profiles_path_mapping_rules: &HashMap<String, String>,
        on_uploading: Option<Arc<dyn ProgressCallback<ProgressReportMetadata>>>,
    ) -> Result<SummaryStatistics, SyncError> {
        settings.validate()?;
        let builder: ManifestBuilder = ManifestBuilder::new(Arc::clone(&self.hash_cache))
            .with_manifest_version(self.manifest_version);
        let hash_tracker: ProgressTracker =
            ProgressTracker::new(ProgressStatus::PreparingInProgress, None);

        let mut outputs: Vec<RootOutputs<'_>> = Vec::new();
        for properties in &attachments.manifests {
            let output_dirs: &[String] = properties
                .output_relative_directories
                .as_deref()
                .unwrap_or_default();
            if output_dirs.is_empty() {
                continue;
            }

            let local_root: PathBuf =
                match mapped_root(properties, storage_profiles_path_mapping_rules, "output")? {
                    Some(mapped) => mapped,
                    None => session_dir.join(unique_dest_dir_name(&properties.root_path)),
                };
            if !local_root.is_dir() {
                for dir in output_dirs {
                    log::info!(
                        "Found 0 files (Output directory {} does not exist.)",
                        local_root.join(dir).display()
                    );
                }
                continue;
            }

            let files: Vec<OutputFile> = find_output_files(
                &OutputScanOptions {
                    root: local_root.clone(),
                    output_relative_directories: output_dirs.to_vec(),
                    source_path_format: properties.root_path_format,
                    start_time_us: session_action.start_time_us(),
                },
                &self.synced_assets_mtime,
            )?;
            if files.is_empty() {
                continue;
            }

            let paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
            let manifest: AssetManifest = builder
                .create_manifest(&paths, &local_root, &hash_tracker)
                .await?;
            outputs.push(RootOutputs {
                properties,
                local_root,
                files,
                manifest,
            });
        }

        if outputs.is_empty() {
            return Ok(SummaryStatistics::default());
        }

        let bucket: &str = &settings.s3_bucket_name;
        let cas_prefix: String = settings.full_cas_prefix()?;
        let total_files: u64 = outputs.iter().map(|o| o.manifest.file_count() as u64).sum();
        let total_bytes: u64 = outputs.iter().map(|o| o.manifest.total_size()).sum();
        log::info!(
            "Uploading {} output file{} ({}) to S3: {}/{}",
            total_files,
            if total_files == 1 { "" } else { "s" },
            human_readable_file_size(total_bytes),
            bucket,
            cas_prefix
        );

        let tracker: ProgressTracker =
            ProgressTracker::new(ProgressStatus::UploadInProgress, on_uploading);
        tracker.set_total_files(total_files, total_bytes);
        let uploader: UploadOrchestrator<'_, C> = UploadOrchestrator::new(self.client)
            .with_settings(self.transfer_settings.clone())
            .with_s3_check_cache(Arc::clone(&self.s3_check_cache));
        for output in &outputs {
            uploader
                .upload_input_files(&output.manifest, bucket, &output.local_root, &cas_prefix, &tracker)
                .await?;
        }

        let full_output_prefix: String = settings.full_output_prefix(
            &self.farm_id,
            &session_action.queue_id,
            &session_action.job_id,
            &session_action.step_id,
            &session_action.task_id,
            &session_action.output_folder(),
        )?;
        for output in &outputs {
            upload_output_manifest(
                self.client,
                bucket,
                &full_output_prefix,
                &output.manifest,
                &output.properties.root_path,
                output.properties.file_system_location_name.as_deref(),
            )
            .await?;
        }

        for file in outputs.iter().flat_map(|o| o.files.iter()) {
            self.synced_assets_mtime
                .insert(file.path.to_string_lossy().into_owned(), file.mtime_us);
        }

        tracker.stop_timer();
        Ok(tracker.get_summary_statistics())
    }

    fn record_attachment_mtimes(&mut self, manifests_by_root: &BTreeMap<String, AssetManifest>) {
        for (root, manifest) in manifests_by_root {
            for path in manifest.paths() {
                let local_path: PathBuf = from_posix_path(&path.path, Path::new(root));
                let mtime_us: i64 = std::fs::metadata(&local_path)
                    .and_then(|meta| modified_time_us(&meta))
                    .unwrap_or(path.mtime);
                self.synced_assets_mtime
                    .insert(local_path.to_string_lossy().into_owned(), mtime_us);
            }
        }
    }
}

/// Path mapping destination for a root, if one applies.
///
/// Rules apply only to roots that belong to a storage profile location,
/// and only when the host supplied any rules at all.
fn mapped_root(
    properties: &ManifestProperties,
    rules: &HashMap<String, String>,
    direction: &'static str,
) -> Result<Option<PathBuf>, SyncError> {
    if rules.is_empty() || properties.file_system_location_name.is_none() {
        return Ok(None);
    }
    match rules.get(&properties.root_path) {
        Some(destination) => Ok(Some(PathBuf::from(destination))),
        None => Err(SyncError::NoPathMappingRule {
            direction,
            source_path: properties.root_path.clone(),
        }),
    }
}

/// Permission settings and environment, when the VFS can be used here.
fn vfs_prerequisites(
    options: &SyncInputsOptions,
) -> Option<(&FileSystemPermissionSettings, &HashMap<String, String>)> {
    if !cfg!(unix) {
        return None;
    }
    let fs_permission_settings: &FileSystemPermissionSettings =
        options.fs_permission_settings.as_ref()?;
    let os_env_vars: &HashMap<String, String> = options.os_env_vars.as_ref()?;
    if !os_env_vars.contains_key(AWS_PROFILE_ENV_VAR) {
        return None;
    }
    Some((fs_permission_settings, os_env_vars))
}

/// A 404 while downloading inputs usually means the submitter skipped an
/// upload on the strength of a stale S3 check cache entry.
fn explain_missing_input_object(err: StorageError) -> SyncError {
    match err {
        StorageError::Client(client_error) if client_error.is_not_found() => {
            let message: String = format!("{} {}", client_error.message, MISSING_INPUT_OBJECT_ADVICE);
            SyncError::Storage(StorageError::Client(StorageClientError {
                message,
                ..client_error
            }))
        }
        other => other.into(),
    }
}

/// Fail if `required` bytes would not fit on the file system of `dir`.
pub fn ensure_disk_capacity(dir: &Path, required: u64) -> Result<(), SyncError> {
    let available: u64 = available_disk_space(dir)?;
    if required > available {
        return Err(SyncError::InsufficientDiskSpace {
            required,
            available,
        });
    }
    Ok(())
}

#[cfg(unix)]
fn available_disk_space(dir: &Path) -> Result<u64, SyncError> {
    let stat: nix::sys::statvfs::Statvfs = nix::sys::statvfs::statvfs(dir)
        .map_err(|e| SyncError::io(dir, std::io::Error::from(e)))?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}

#[cfg(not(unix))]
fn available_disk_space(dir: &Path) -> Result<u64, SyncError> {
    log::debug!("Free space of {} not checked on this platform", dir.display());
    Ok(u64::MAX)
}
