//! Locating the `deadline_vfs` installation and tearing down its mounts.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::VfsError;
use crate::ledger::{PidLedger, PidLedgerEntry};
use crate::mount::{is_mount, wait_for_mount};
use crate::options::DEFAULT_MOUNT_WAIT;

pub const DEADLINE_VFS_ENV_VAR: &str = "DEADLINE_VFS_PATH";
pub const DEADLINE_VFS_CACHE_ENV_VAR: &str = "DEADLINE_VFS_CACHE";
pub const DEADLINE_VFS_EXECUTABLE: &str = "deadline_vfs";
pub const DEADLINE_VFS_INSTALL_PATH: &str = "/opt/deadline_vfs";

/// An installed `deadline_vfs`, laid out as `<install>/{bin,lib,link}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsInstallation {
    executable: PathBuf,
}

impl VfsInstallation {
    /// Find the executable on `PATH`, then under `$DEADLINE_VFS_PATH/bin`
    /// (or `/opt/deadline_vfs/bin`), then under `./bin`.
    ///
    /// # Errors
    /// `ExecutableMissing` if none of those exist.
    pub fn locate() -> Result<Self, VfsError> {
        let vfs_home: Option<String> = std::env::var(DEADLINE_VFS_ENV_VAR).ok();
        let cwd: Option<PathBuf> = std::env::current_dir().ok();
        locate_executable(
            which::which(DEADLINE_VFS_EXECUTABLE).ok(),
            vfs_home.as_deref(),
            cwd.as_deref(),
        )
        .map(Self::from_executable)
    }

    pub fn from_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn install_root(&self) -> PathBuf {
        self.executable
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Directory of helper executables (e.g. `fusermount3`) prepended to `PATH`.
    pub fn link_dir(&self) -> PathBuf {
        self.install_root().join("link")
    }

    pub fn library_dir(&self) -> PathBuf {
        self.install_root().join("lib")
    }

    /// Working directory for the process; holds `config/logging.ini`.
    pub fn working_dir(&self) -> PathBuf {
        self.install_root()
    }

    /// Unmount `mount_point` with `fusermount3 -u` as `os_user`.
    ///
    /// # Returns
    /// Whether the mount is gone afterwards.
    pub async fn shutdown_mount(
        &self,
        mount_point: &Path,
        os_user: &str,
        session_dir: &Path,
        wait: Duration,
    ) -> bool {
        log::info!(
            "Attempting to shut down {} as {}",
            mount_point.display(),
            os_user
        );
        let fusermount3: PathBuf = self.link_dir().join("fusermount3");
        if !fusermount3.exists() {
            log::warn!("fusermount3 not found at {}", self.link_dir().display());
            return false;
        }

        match Command::new("sudo")
            .arg("-u")
            .arg(os_user)
            .arg(&fusermount3)
            .arg("-u")
            .arg(mount_point)
            .stdin(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => log::info!("Shutdown returns {}", status),
            Ok(status) => log::warn!("Shutdown failed with {}", status),
            Err(e) => log::warn!("Shutdown failed with error {}", e),
        }

        wait_for_mount(mount_point, session_dir, wait, false).await
    }

    /// Unmount every mount recorded for the session and delete the ledger.
    pub async fn kill_all_processes(
        &self,
        session_dir: &Path,
        os_user: &str,
    ) -> Result<(), VfsError> {
        log::info!("Terminating all VFS processes.");
        let ledger: PidLedger = PidLedger::for_session(session_dir);
        if !ledger.exists() {
            log::warn!("VFS pid file not found at {}", ledger.path().display());
            return Ok(());
        }

        for entry in ledger.entries()? {
            log::info!(
                "Stopping VFS pid {} at {}",
                entry.pid,
                entry.mount_point
            );
            self.shutdown_mount(
                Path::new(&entry.mount_point),
                os_user,
                session_dir,
                DEFAULT_MOUNT_WAIT,
            )
            .await;
        }
        ledger.delete()
    }

    /// Unmount the process serving `mount_point` and drop it from the ledger.
    ///
    /// # Returns
    /// Whether a recorded mount was found there.
    pub async fn kill_process_at_mount(
        &self,
        session_dir: &Path,
        mount_point: &Path,
        os_user: &str,
    ) -> Result<bool, VfsError> {
        if !is_mount(mount_point).await {
            log::info!("{} is not a mount, returning", mount_point.display());
            return Ok(false);
        }
        log::info!(
            "Terminating deadline_vfs processes at {}.",
            mount_point.display()
        );

        let ledger: PidLedger = PidLedger::for_session(session_dir);
        let removed: Option<PidLedgerEntry> =
            ledger.remove_mount(&mount_point.to_string_lossy())?;
        if removed.is_some() {
            self.shutdown_mount(mount_point, os_user, session_dir, DEFAULT_MOUNT_WAIT)
                .await;
        }
        Ok(removed.is_some())
    }
}

fn locate_executable(
    on_path: Option<PathBuf>,
    vfs_home: Option<&str>,
    cwd: Option<&Path>,
) -> Result<PathBuf, VfsError> {
    if let Some(found) = on_path {
        log::info!("Found {} at {}", DEADLINE_VFS_EXECUTABLE, found.display());
        return Ok(found);
    }

    if vfs_home.is_none() {
        log::info!("{} env var not set", DEADLINE_VFS_ENV_VAR);
    }
    let installed: PathBuf = Path::new(vfs_home.unwrap_or(DEADLINE_VFS_INSTALL_PATH))
        .join("bin")
        .join(DEADLINE_VFS_EXECUTABLE);
    if installed.exists() {
        log::info!("Found {} at {}", DEADLINE_VFS_EXECUTABLE, installed.display());
        return Ok(installed);
    }

    if let Some(cwd) = cwd {
        let local: PathBuf = cwd.join("bin").join(DEADLINE_VFS_EXECUTABLE);
        if local.exists() {
            log::info!("Found {} at {}", DEADLINE_VFS_EXECUTABLE, local.display());
            return Ok(local);
        }
    }

    log::error!("Failed to find {}!", DEADLINE_VFS_EXECUTABLE);
    Err(VfsError::ExecutableMissing)
}
