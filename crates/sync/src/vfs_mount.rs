//! Mounting merged input manifests through `deadline_vfs`.
//!
//! Each local root gets its own mount process serving one manifest file
//! written under the session's manifest folder. Mounting over a root that is
//! already served merges the running manifest with the new one and replaces
//! the process.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use ja_model::{decode_manifest, merge_manifests, AssetManifest};
use ja_storage::{
    apply_fs_permission_settings, ensure_paths_within_directory, generate_random_guid,
    FileSystemPermissionSettings, FileSystemPermissionWarning,
};
use ja_vfs::{
    is_mount, PidLedger, VfsInstallation, VfsLaunchOptions, VfsProcessManager,
    VFS_CACHE_REL_PATH_IN_SESSION, VFS_LOGS_FOLDER_IN_SESSION, VFS_MANIFEST_FOLDER_IN_SESSION,
};

use crate::error::SyncError;

/// Mode bits OR'ed onto the manifest folder: owner write/exec, group exec.
const VFS_MANIFEST_FOLDER_DIR_MODE: u32 = 0o31;
/// Mode bits OR'ed onto manifests in that folder: owner read/write, group read.
const VFS_MANIFEST_FOLDER_FILE_MODE: u32 = 0o64;

/// Directories a session's mounts share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsSessionDirs {
    /// Object cache root handed to every mount.
    pub cache_dir: PathBuf,
    pub manifest_dir: PathBuf,
    pub logs_dir: PathBuf,
}

/// Mount one VFS process per root in `manifests_by_root`.
///
/// # Arguments
/// * `installation` - Located `deadline_vfs` install
/// * `bucket` - Bucket holding the CAS
/// * `region` - Region of the bucket
/// * `manifests_by_root` - Absolute mount point to the manifest served there
/// * `session_dir` - Session directory holding caches, manifests, logs and the pid ledger
/// * `os_env_vars` - Environment for the mount processes
/// * `fs_permission_settings` - Job user and group
/// * `cas_prefix` - e.g. `Root/Data`
///
/// # Errors
/// `PathOutsideDirectory` if a manifest path or the CAS prefix escapes its
/// directory, or the first VFS failure.
#[allow(clippy::too_many_arguments)]
pub async fn mount_vfs_from_manifests(
    installation: &VfsInstallation,
    bucket: &str,
    region: &str,
    manifests_by_root: &BTreeMap<String, AssetManifest>,
    session_dir: &Path,
    os_env_vars: &HashMap<String, String>,
    fs_permission_settings: &FileSystemPermissionSettings,
    cas_prefix: Option<&str>,
) -> Result<(), SyncError> {
    let dirs: VfsSessionDirs =
        prepare_session_dirs(session_dir, fs_permission_settings, cas_prefix)?;

    for (mount_point, manifest) in manifests_by_root {
        let mount_path: &Path = Path::new(mount_point);
        ensure_paths_within_directory(mount_path, manifest.paths().iter().map(|p| p.path.as_str()))?;

        let final_manifest: AssetManifest = handle_existing_vfs(
            installation,
            manifest.clone(),
            session_dir,
            mount_path,
            &fs_permission_settings.os_user,
        )
        .await?;
        let manifest_path: PathBuf = write_manifest_file(&final_manifest, &dirs.manifest_dir)?;

        let options: VfsLaunchOptions = VfsLaunchOptions::new(
            bucket,
            region,
            manifest_path,
            mount_path,
            fs_permission_settings.os_user.as_str(),
        )
        .with_os_group(Some(fs_permission_settings.os_group.clone()))
        .with_env_vars(os_env_vars.clone())
        .with_cas_prefix(cas_prefix.map(str::to_string))
        .with_cache_dir(Some(dirs.cache_dir.clone()));

        VfsProcessManager::new(installation.clone(), options)
            .start(session_dir)
            .await?;
    }
    Ok(())
}

/// Create the cache, manifest and log folders and hand them to the job group.
///
/// # Errors
/// `PathOutsideDirectory` if `cas_prefix` escapes the cache folder.
pub fn prepare_session_dirs(
    session_dir: &Path,
    fs_permission_settings: &FileSystemPermissionSettings,
    cas_prefix: Option<&str>,
) -> Result<VfsSessionDirs, SyncError> {
    let cache_dir: PathBuf = session_dir.join(VFS_CACHE_REL_PATH_IN_SESSION);
    let asset_cache_dir: PathBuf = match cas_prefix {
        Some(prefix) => {
            ensure_paths_within_directory(&cache_dir, [prefix])?;
            cache_dir.join(prefix)
        }
        None => cache_dir.clone(),
    };
    create_dir(&asset_cache_dir)?;
    log_warnings(apply_fs_permission_settings(
        &[asset_cache_dir.display().to_string()],
        &cache_dir,
        fs_permission_settings,
    )?);

    let manifest_dir: PathBuf = session_dir.join(VFS_MANIFEST_FOLDER_IN_SESSION);
    create_dir(&manifest_dir)?;
    let manifest_dir_permissions: FileSystemPermissionSettings = FileSystemPermissionSettings {
        dir_mode: VFS_MANIFEST_FOLDER_DIR_MODE,
        file_mode: VFS_MANIFEST_FOLDER_FILE_MODE,
        ..fs_permission_settings.clone()
    };
    log_warnings(apply_fs_permission_settings(
        &[manifest_dir.display().to_string()],
        &manifest_dir,
        &manifest_dir_permissions,
    )?);

    let logs_dir: PathBuf = session_dir.join(VFS_LOGS_FOLDER_IN_SESSION);
    create_dir(&logs_dir)?;
    log_warnings(apply_fs_permission_settings(
        &[logs_dir.display().to_string()],
        &logs_dir,
        fs_permission_settings,
    )?);

    Ok(VfsSessionDirs {
        cache_dir,
        manifest_dir,
        logs_dir,
    })
}

/// Fold the manifest already mounted at `mount_point` into `manifest` and
/// stop the process serving it.
///
/// A root that is not mounted, or whose manifest is not in the ledger, is
/// returned unchanged.
pub async fn handle_existing_vfs(
    installation: &VfsInstallation,
    manifest: AssetManifest,
    session_dir: &Path,
    mount_point: &Path,
    os_user: &str,
) -> Result<AssetManifest, SyncError> {
    if !is_mount(mount_point).await {
        return Ok(manifest);
    }

    let ledger: PidLedger = PidLedger::for_session(session_dir);
    let Some(existing_path) = ledger.manifest_for_mount(&mount_point.to_string_lossy())? else {
        log::error!("input manifest not found for mount at {}", mount_point.display());
        return Ok(manifest);
    };
    let existing_text: String =
        std::fs::read_to_string(&existing_path).map_err(|e| SyncError::io(&existing_path, e))?;
    let existing: AssetManifest = decode_manifest(&existing_text)?;
    let merged: AssetManifest = merge_manifests(&[existing, manifest.clone()])?.unwrap_or(manifest);

    installation
        .kill_process_at_mount(session_dir, mount_point, os_user)
        .await?;
    Ok(merged)
}

/// Write `manifest` to a uniquely named file in `dir`.
pub fn write_manifest_file(manifest: &AssetManifest, dir: &Path) -> Result<PathBuf, SyncError> {
    let path: PathBuf = dir.join(format!(
        "deadline-merged-manifest-{}.json",
        generate_random_guid()
    ));
    std::fs::write(&path, manifest.encode()?).map_err(|e| SyncError::io(&path, e))?;
    Ok(path)
}

fn create_dir(path: &Path) -> Result<(), SyncError> {
    std::fs::create_dir_all(path).map_err(|e| SyncError::io(path, e))
}

fn log_warnings(warnings: Vec<FileSystemPermissionWarning>) {
    for warning in warnings {
        log::warn!("{}: {}", warning.path, warning.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ja_model::ManifestPath;
    use tempfile::TempDir;

    fn permissions() -> FileSystemPermissionSettings {
        FileSystemPermissionSettings {
            os_user: "job-user".into(),
            os_group: "nonexistent-job-group".into(),
            dir_mode: 0o20,
            file_mode: 0o20,
        }
    }

    fn manifest(paths: &[(&str, &str)]) -> AssetManifest {
        AssetManifest::new(
            paths
                .iter()
                .map(|(path, hash)| ManifestPath::new(*path, *hash, 1, 1_000_000))
                .collect(),
        )
    }

    #[test]
    fn test_prepare_session_dirs_creates_folders() {
        let session: TempDir = TempDir::new().unwrap();
        let dirs: VfsSessionDirs =
            prepare_session_dirs(session.path(), &permissions(), Some("Root/Data")).unwrap();

        assert_eq!(dirs.cache_dir, session.path().join(".vfs_object_cache"));
        assert!(dirs.cache_dir.join("Root/Data").is_dir());
        assert!(dirs.manifest_dir.is_dir());
        assert!(dirs.logs_dir.is_dir());
    }

    #[test]
    fn test_cas_prefix_cannot_escape_cache() {
        let session: TempDir = TempDir::new().unwrap();
        let result: Result<VfsSessionDirs, SyncError> =
            prepare_session_dirs(session.path(), &permissions(), Some("../../elsewhere"));

        assert!(matches!(result, Err(SyncError::Path(_))));
        assert!(!session.path().join(".vfs_manifests").exists());
    }

    #[test]
    fn test_write_manifest_file_round_trips() {
        let dir: TempDir = TempDir::new().unwrap();
        let original: AssetManifest = manifest(&[("a.txt", "aa"), ("b/c.txt", "cc")]);

        let first: PathBuf = write_manifest_file(&original, dir.path()).unwrap();
        let second: PathBuf = write_manifest_file(&original, dir.path()).unwrap();
        assert_ne!(first, second);

        let decoded: AssetManifest =
            decode_manifest(&std::fs::read_to_string(&first).unwrap()).unwrap();
        assert_eq!(decoded.file_count(), 2);
        assert_eq!(decoded.encode().unwrap(), original.encode().unwrap());
    }

    #[tokio::test]
    async fn test_unmounted_root_keeps_manifest() {
        let session: TempDir = TempDir::new().unwrap();
        let mount: PathBuf = session.path().join("assetroot-abc");
        std::fs::create_dir(&mount).unwrap();

        let installation: VfsInstallation =
            VfsInstallation::from_executable("/opt/deadline_vfs/bin/deadline_vfs");
        let result: AssetManifest = handle_existing_vfs(
            &installation,
            manifest(&[("a.txt", "aa")]),
            session.path(),
            &mount,
            "job-user",
        )
        .await
        .unwrap();
        assert_eq!(result.file_count(), 1);
    }

    #[tokio::test]
    async fn test_escaping_manifest_is_rejected_before_launch() {
        let session: TempDir = TempDir::new().unwrap();
        let mount: String = session.path().join("assetroot-abc").display().to_string();
        let manifests: BTreeMap<String, AssetManifest> =
            BTreeMap::from([(mount, manifest(&[("../../etc/passwd", "aa")]))]);

        let result: Result<(), SyncError> = mount_vfs_from_manifests(
            &VfsInstallation::from_executable(session.path().join("bin/deadline_vfs")),
            "bucket",
            "us-west-2",
            &manifests,
            session.path(),
            &HashMap::new(),
            &permissions(),
            Some("Root/Data"),
        )
        .await;

        assert!(matches!(result, Err(SyncError::Path(_))));
        assert!(!PidLedger::for_session(session.path()).exists());
    }
}
